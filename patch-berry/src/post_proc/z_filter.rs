//! 沿堆叠轴 (z 轴) 的中值滤波.

use super::{PostProcError, PostProcResult};
use ndarray::{Array4, ArrayView4, Axis, Zip};
use ordered_float::OrderedFloat;

/// 半采样对称镜像 (`d c b a | a b c d | d c b a`), 重复边界元素.
#[inline]
fn symmetric_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// 一维中值滤波. 窗口大小 `size` 必须为正奇数, 边界以对称镜像方式延拓.
pub fn median_filter_1d(values: &[f32], size: usize) -> PostProcResult<Vec<f32>> {
    if size == 0 || size % 2 == 0 {
        return Err(PostProcError::EvenWindow(size));
    }
    let n = values.len();
    if n == 0 {
        return Ok(vec![]);
    }
    let half = (size / 2) as isize;
    let mut window = Vec::with_capacity(size);
    let out = (0..n as isize)
        .map(|i| {
            window.clear();
            window.extend(
                (i - half..=i + half).map(|j| OrderedFloat(values[symmetric_index(j, n)])),
            );
            window.sort_unstable();
            window[size / 2].0
        })
        .collect();
    Ok(out)
}

/// 对堆叠 `(S, H, W, C)` 的每个 `(h, w, c)` 列沿 `S` 轴做中值滤波.
///
/// 孤立的前景/背景翻转被窗口内的多数值替换.
pub fn z_filter(stack: ArrayView4<f32>, size: usize) -> PostProcResult<Array4<f32>> {
    if size == 0 || size % 2 == 0 {
        return Err(PostProcError::EvenWindow(size));
    }
    if stack.is_empty() {
        return Err(PostProcError::Empty);
    }
    let mut out = stack.to_owned();

    let filter = |mut lane: ndarray::ArrayViewMut1<f32>| {
        let values = lane.to_vec();
        // 窗口大小已检查, 不会出错
        if let Ok(filtered) = median_filter_1d(&values, size) {
            for (dst, v) in lane.iter_mut().zip(filtered) {
                *dst = v;
            }
        }
    };

    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            Zip::from(out.lanes_mut(Axis(0))).par_for_each(filter);
        } else {
            Zip::from(out.lanes_mut(Axis(0))).for_each(filter);
        }
    }
    Ok(out)
}
