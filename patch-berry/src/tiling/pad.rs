//! 空间轴填充与裁剪.
//!
//! 约定最后一个轴为通道轴, 其余轴为空间轴. 通道轴从不填充.

use ndarray::{Array, ArrayView, Axis, CowArray, Dimension, RemoveAxis, Slice};
use ordered_float::OrderedFloat;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 填充越界部分的取值方式.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PadMode {
    /// 以边界为轴镜像, 不重复边界元素 (`d c b | a b c d | c b a`).
    #[default]
    Reflect,

    /// 以 0 填充.
    Zero,

    /// 以整个数据的中位数填充.
    Median,
}

/// 将越界索引 `i` 以镜像方式映射回 `0..n`.
///
/// 越界距离超过 `n - 1` 时周期性地反复镜像, 周期为 `2 * (n - 1)`.
///
/// # 注意
///
/// `n` 必须大于 0, 否则程序 panic.
pub fn reflect_index(i: isize, n: usize) -> usize {
    assert!(n > 0, "长度不可为 0");
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - m) as usize
    }
}

/// 数据所有元素的中位数. 偶数个元素时取中间两个的平均值, 空数据返回 0.
pub fn median<D: Dimension>(data: ArrayView<f32, D>) -> f32 {
    let mut values: Vec<OrderedFloat<f32>> = data.iter().copied().map(OrderedFloat).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid].0
    } else {
        (values[mid - 1].0 + values[mid].0) / 2.0
    }
}

/// 沿 `axis` 在前端填充 `before` 个元素, 在后端填充 `after` 个元素.
///
/// `fill` 仅在 [`PadMode::Median`] 下使用.
pub fn pad_axis<D: Dimension + RemoveAxis>(
    data: ArrayView<f32, D>,
    axis: Axis,
    before: usize,
    after: usize,
    mode: PadMode,
    fill: f32,
) -> Array<f32, D> {
    let n = data.len_of(axis);
    let mut shape = data.raw_dim();
    shape[axis.index()] = n + before + after;
    let mut out = Array::zeros(shape);

    for j in 0..(n + before + after) {
        let src = j as isize - before as isize;
        let mut dst = out.index_axis_mut(axis, j);
        if (0..n as isize).contains(&src) {
            dst.assign(&data.index_axis(axis, src as usize));
            continue;
        }
        match mode {
            PadMode::Reflect => dst.assign(&data.index_axis(axis, reflect_index(src, n))),
            PadMode::Zero => {}
            PadMode::Median => dst.fill(fill),
        }
    }
    out
}

/// 在每个空间轴两端各填充 `padding[axis]` 个元素.
///
/// 全部填充量为 0 时直接借用原数据.
///
/// # 注意
///
/// `padding` 的长度必须等于空间维数, 否则程序 panic.
pub fn pad_symmetric<'a, D: Dimension + RemoveAxis>(
    data: ArrayView<'a, f32, D>,
    padding: &[usize],
    mode: PadMode,
) -> CowArray<'a, f32, D> {
    assert_eq!(padding.len() + 1, data.ndim(), "填充维数与空间维数不符");
    if padding.iter().all(|&p| p == 0) {
        return CowArray::from(data);
    }

    let fill = match mode {
        PadMode::Median => median(data.view()),
        _ => 0.0,
    };
    let mut cur = data.to_owned();
    for (axis, &p) in padding.iter().enumerate() {
        if p > 0 {
            cur = pad_axis(cur.view(), Axis(axis), p, p, mode, fill);
        }
    }
    CowArray::from(cur)
}

/// 去除 [`pad_symmetric`] 在每个空间轴两端添加的填充.
pub fn trim_symmetric<D: Dimension>(data: ArrayView<f32, D>, padding: &[usize]) -> Array<f32, D> {
    let last = data.ndim() - 1;
    data.slice_each_axis(|ax| {
        let i = ax.axis.index();
        if i == last {
            Slice::from(..)
        } else {
            let p = padding[i] as isize;
            Slice::from(p..(ax.len as isize - p))
        }
    })
    .to_owned()
}

/// 以镜像方式在空间轴前端填充, 使每个空间轴长度成为 `multiple[axis]` 的整数倍.
///
/// 返回填充后的数据以及每个轴在前端添加的长度.
pub fn pad_leading_to_multiple<D: Dimension + RemoveAxis>(
    data: ArrayView<f32, D>,
    multiple: &[usize],
) -> (Array<f32, D>, Vec<usize>) {
    let mut cur = data.to_owned();
    let mut added = Vec::with_capacity(multiple.len());
    for (axis, &m) in multiple.iter().enumerate() {
        let n = cur.len_of(Axis(axis));
        let before = if m == 0 { 0 } else { n.div_ceil(m) * m - n };
        if before > 0 {
            cur = pad_axis(cur.view(), Axis(axis), before, 0, PadMode::Reflect, 0.0);
        }
        added.push(before);
    }
    (cur, added)
}

/// 保留每个空间轴尾部的 `extent[axis]` 个元素, 去掉前端填充.
pub fn trim_leading<D: Dimension>(data: ArrayView<f32, D>, extent: &[usize]) -> Array<f32, D> {
    let last = data.ndim() - 1;
    data.slice_each_axis(|ax| {
        let i = ax.axis.index();
        if i == last {
            Slice::from(..)
        } else {
            Slice::from((ax.len - extent[i]) as isize..)
        }
    })
    .to_owned()
}

/// 以 0 在空间轴后端填充, 使每个空间轴长度成为 `multiple` 的整数倍.
pub fn pad_trailing_to_multiple<D: Dimension + RemoveAxis>(
    data: ArrayView<f32, D>,
    multiple: usize,
) -> Array<f32, D> {
    let mut cur = data.to_owned();
    if multiple <= 1 {
        return cur;
    }
    for axis in 0..(data.ndim() - 1) {
        let n = cur.len_of(Axis(axis));
        let after = n.div_ceil(multiple) * multiple - n;
        if after > 0 {
            cur = pad_axis(cur.view(), Axis(axis), 0, after, PadMode::Zero, 0.0);
        }
    }
    cur
}

/// 保留每个空间轴前端的 `extent[axis]` 个元素, 去掉后端填充.
pub fn trim_trailing<D: Dimension>(data: ArrayView<f32, D>, extent: &[usize]) -> Array<f32, D> {
    let last = data.ndim() - 1;
    data.slice_each_axis(|ax| {
        let i = ax.axis.index();
        if i == last {
            Slice::from(..)
        } else {
            Slice::from(..extent[i] as isize)
        }
    })
    .to_owned()
}
