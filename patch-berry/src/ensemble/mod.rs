//! 测试时增强 (test-time augmentation) 的集成预测.
//!
//! 同一个推理能力作用于 patch 的 8 (2D) 或 16 (3D) 个几何变换视图上,
//! 每个输出经逆变换回到原方向后取逐元素平均.
//!
//! 几何变换只作用于空间轴, 通道轴保持不变. 对于 `(.., H, W, C)` 布局,
//! 旋转与水平翻转作用于 `(H, W)` 平面, 3D 另外沿 `Z` 轴翻转.

use crate::infer::{infer_checked, Infer, InferError, InferResult};
use log::debug;
use ndarray::{Array, Array3, Array4, ArrayView, ArrayView3, ArrayView4, ArrayViewD, Axis, Dimension};
use once_cell::sync::Lazy;

/// 一个视图的正向变换与逆变换.
pub trait Orientation: Copy + std::fmt::Debug {
    /// 对最后一个轴为通道轴的数据做正向变换.
    fn apply<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D>;

    /// [`Orientation::apply`] 的逆变换.
    fn invert<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D>;
}

/// `(H, W)` 平面上的视图: 逆时针旋转 `quarter * 90` 度, 然后可选地水平翻转.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneView {
    /// 旋转的四分之一圈数, 取值 `0..4`.
    pub quarter: u8,

    /// 旋转后是否水平翻转.
    pub flip: bool,
}

/// 平面上全部 8 个视图, 第一个为恒等变换.
pub const PLANE_VIEWS: [PlaneView; 8] = [
    PlaneView::new(0, false),
    PlaneView::new(1, false),
    PlaneView::new(2, false),
    PlaneView::new(3, false),
    PlaneView::new(0, true),
    PlaneView::new(1, true),
    PlaneView::new(2, true),
    PlaneView::new(3, true),
];

impl PlaneView {
    /// 创建视图. `quarter` 会对 4 取模.
    #[inline]
    pub const fn new(quarter: u8, flip: bool) -> Self {
        Self {
            quarter: quarter % 4,
            flip,
        }
    }

    /// 对视图做 `times` 次逆时针 90 度旋转 (与 `numpy.rot90` 一致).
    fn rotate<D: Dimension>(data: &mut ArrayView<f32, D>, times: u8) {
        let (h, w) = plane_axes(data.ndim());
        for _ in 0..times {
            data.invert_axis(Axis(w));
            data.swap_axes(h, w);
        }
    }
}

impl Orientation for PlaneView {
    fn apply<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D> {
        let mut v = data;
        Self::rotate(&mut v, self.quarter);
        if self.flip {
            v.invert_axis(Axis(plane_axes(v.ndim()).1));
        }
        v.as_standard_layout().into_owned()
    }

    fn invert<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D> {
        let mut v = data;
        if self.flip {
            v.invert_axis(Axis(plane_axes(v.ndim()).1));
        }
        Self::rotate(&mut v, (4 - self.quarter) % 4);
        v.as_standard_layout().into_owned()
    }
}

/// 立方体视图: 平面视图, 然后可选地沿 `Z` 轴翻转.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CubeView {
    /// `(H, W)` 平面上的视图.
    pub plane: PlaneView,

    /// 是否沿 `Z` 轴翻转.
    pub flip_z: bool,
}

/// 立方体上全部 16 个视图, 第一个为恒等变换.
pub static CUBE_VIEWS: Lazy<Vec<CubeView>> = Lazy::new(|| {
    [false, true]
        .into_iter()
        .flat_map(|flip_z| {
            PLANE_VIEWS
                .iter()
                .map(move |&plane| CubeView { plane, flip_z })
        })
        .collect()
});

impl Orientation for CubeView {
    fn apply<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D> {
        let mut out = self.plane.apply(data);
        if self.flip_z {
            let z = data_z_axis(out.ndim());
            out.invert_axis(Axis(z));
            out = out.as_standard_layout().into_owned();
        }
        out
    }

    fn invert<D: Dimension>(self, data: ArrayView<f32, D>) -> Array<f32, D> {
        let mut v = data;
        if self.flip_z {
            v.invert_axis(Axis(data_z_axis(v.ndim())));
        }
        self.plane.invert(v)
    }
}

/// `(.., H, W, C)` 布局中 `H` 与 `W` 轴的索引.
#[inline]
fn plane_axes(ndim: usize) -> (usize, usize) {
    (ndim - 3, ndim - 2)
}

/// `(Z, H, W, C)` 布局中 `Z` 轴的索引.
#[inline]
fn data_z_axis(ndim: usize) -> usize {
    ndim - 4
}

/// 对 2D patch `(H, W, C)` 做 8 视图集成预测.
///
/// 8 个视图作为一个批次送入推理能力. 输出通道数必须为 `n_out`.
pub fn predict_ensemble_2d<P: Infer + ?Sized>(
    patch: ArrayView3<f32>,
    n_out: usize,
    model: &mut P,
) -> InferResult<Array3<f32>> {
    predict_ensemble(patch, &PLANE_VIEWS, n_out, PLANE_VIEWS.len(), model)
}

/// 对 3D patch `(Z, H, W, C)` 做 16 视图集成预测.
///
/// 视图以 `batch_size` 为一批送入推理能力. 输出通道数必须为 `n_out`.
pub fn predict_ensemble_3d<P: Infer + ?Sized>(
    patch: ArrayView4<f32>,
    n_out: usize,
    batch_size: usize,
    model: &mut P,
) -> InferResult<Array4<f32>> {
    predict_ensemble(patch, &CUBE_VIEWS, n_out, batch_size, model)
}

/// 通用的集成预测: 变换, 分批推理, 逆变换, 求平均.
///
/// 形状不同的视图 (非正方形 patch 旋转 90 度) 不会被放入同一批.
pub fn predict_ensemble<D, O, P>(
    patch: ArrayView<f32, D>,
    views: &[O],
    n_out: usize,
    batch_size: usize,
    model: &mut P,
) -> InferResult<Array<f32, D>>
where
    D: Dimension,
    O: Orientation,
    P: Infer + ?Sized,
{
    let batch_size = batch_size.max(1);
    let inputs: Vec<Array<f32, D>> = views.iter().map(|v| v.apply(patch.view())).collect();

    let mut sum: Option<Array<f32, D>> = None;
    let mut start = 0;
    while start < inputs.len() {
        let shape = inputs[start].shape();
        let mut end = start + 1;
        while end < inputs.len() && end - start < batch_size && inputs[end].shape() == shape {
            end += 1;
        }

        let batch_views: Vec<ArrayViewD<f32>> =
            inputs[start..end].iter().map(|a| a.view().into_dyn()).collect();
        let batch = ndarray::stack(Axis(0), &batch_views).map_err(|_| InferError::OutputShape {
            expected: "同形状视图".to_owned(),
            found: shape.to_vec(),
        })?;
        let pred = infer_checked(model, batch.view())?;

        for (view, item) in views[start..end].iter().zip(pred.axis_iter(Axis(0))) {
            let found = item.shape().to_vec();
            let item = item
                .into_dimensionality::<D>()
                .map_err(|_| InferError::OutputShape {
                    expected: "与输入同维数".to_owned(),
                    found: found.clone(),
                })?;
            let restored = view.invert(item);
            if restored.shape().last() != Some(&n_out) {
                return Err(InferError::OutputShape {
                    expected: format!("{n_out} 个输出通道"),
                    found,
                });
            }
            if let Some(acc) = sum.as_mut() {
                if acc.shape() != restored.shape() {
                    return Err(InferError::OutputShape {
                        expected: format!("{:?}", acc.shape()),
                        found: restored.shape().to_vec(),
                    });
                }
                *acc += &restored;
            } else {
                sum = Some(restored);
            }
        }
        start = end;
    }

    debug!("Averaged {} ensemble views", views.len());
    let mut out = sum.ok_or(InferError::OutputShape {
        expected: "至少一个视图".to_owned(),
        found: vec![],
    })?;
    out /= views.len() as f32;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::{from_fn, Identity};
    use ndarray::{s, Array3, Array4, ArrayD};
    use std::collections::HashSet;

    fn ramp3(h: usize, w: usize, c: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, c), |(y, x, k)| (y * 100 + x * 10 + k) as f32)
    }

    #[test]
    fn test_views_are_distinct() {
        let a = ramp3(3, 3, 1);
        let images: HashSet<Vec<u32>> = PLANE_VIEWS
            .iter()
            .map(|v| v.apply(a.view()).iter().map(|x| *x as u32).collect())
            .collect();
        assert_eq!(images.len(), 8);
        assert_eq!(CUBE_VIEWS.len(), 16);
    }

    #[test]
    fn test_rotation_matches_rot90() {
        // numpy.rot90([[0, 1], [2, 3]]) == [[1, 3], [0, 2]]
        let a = Array3::from_shape_vec((2, 2, 1), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let r = PlaneView::new(1, false).apply(a.view());
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![1.0, 3.0, 0.0, 2.0]);
    }

    #[test]
    fn test_invert_restores() {
        let a = ramp3(3, 5, 2);
        for v in PLANE_VIEWS {
            assert_eq!(v.invert(v.apply(a.view()).view()), a, "{v:?}");
        }
        let vol = Array4::from_shape_fn((2, 3, 4, 1), |(z, h, w, _)| (z * 100 + h * 10 + w) as f32);
        for v in CUBE_VIEWS.iter() {
            assert_eq!(v.invert(v.apply(vol.view()).view()), vol, "{v:?}");
        }
    }

    #[test]
    fn test_constant_fields() {
        let zeros = Array3::<f32>::zeros((4, 4, 1));
        let ones = Array3::<f32>::ones((4, 4, 1));
        assert_eq!(predict_ensemble_2d(zeros.view(), 1, &mut Identity).unwrap(), zeros);
        assert_eq!(predict_ensemble_2d(ones.view(), 1, &mut Identity).unwrap(), ones);
    }

    #[test]
    fn test_identity_non_square() {
        let a = ramp3(3, 5, 1);
        let mut calls = 0;
        let mut model = from_fn(|b| {
            calls += 1;
            Ok(b.to_owned())
        });
        assert_eq!(predict_ensemble_2d(a.view(), 1, &mut model).unwrap(), a);
        drop(model);
        // 旋转 90 度的视图形状不同, 需单独成批
        assert!(calls > 1);
    }

    #[test]
    fn test_multichannel_output() {
        let a = ramp3(4, 4, 1);
        let mut model = from_fn(|b| {
            let mut shape = b.shape().to_vec();
            *shape.last_mut().unwrap() = 2;
            let mut out = ArrayD::zeros(shape);
            out.index_axis_mut(Axis(3), 0).assign(&b.index_axis(Axis(3), 0));
            out.index_axis_mut(Axis(3), 1).fill(1.0);
            Ok(out)
        });
        let out = predict_ensemble_2d(a.view(), 2, &mut model).unwrap();
        assert_eq!(out.slice(s![.., .., 0]), a.slice(s![.., .., 0]));
        assert!(out.slice(s![.., .., 1]).iter().all(|&v| v == 1.0));

        assert!(matches!(
            predict_ensemble_2d(a.view(), 3, &mut model),
            Err(InferError::OutputShape { .. })
        ));
    }

    #[test]
    fn test_3d_identity_batches() {
        let vol = Array4::from_shape_fn((4, 4, 4, 1), |(z, h, w, _)| (z * 16 + h * 4 + w) as f32);
        let mut sizes = vec![];
        let mut model = from_fn(|b| {
            sizes.push(b.shape()[0]);
            Ok(b.to_owned())
        });
        assert_eq!(predict_ensemble_3d(vol.view(), 1, 5, &mut model).unwrap(), vol);
        drop(model);
        assert_eq!(sizes, vec![5, 5, 5, 1]);
    }

    #[test]
    fn test_deterministic_and_order_free() {
        // 非等变模型: 输出与宽方向位置相关
        let weight = |b: ArrayViewD<f32>| {
            let mut out = b.to_owned();
            for (idx, v) in out.indexed_iter_mut() {
                *v += idx[2] as f32 * 0.25;
            }
            out
        };
        let a = ramp3(4, 4, 1);
        let mut m1 = from_fn(|b| Ok(weight(b)));
        let first = predict_ensemble_2d(a.view(), 1, &mut m1).unwrap();
        let second = predict_ensemble_2d(a.view(), 1, &mut m1).unwrap();
        assert_eq!(first, second);

        let mut reversed = PLANE_VIEWS;
        reversed.reverse();
        let mut m2 = from_fn(|b| Ok(weight(b)));
        let other = predict_ensemble(a.view(), &reversed, 1, 1, &mut m2).unwrap();
        for (x, y) in first.iter().zip(other.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }
}
