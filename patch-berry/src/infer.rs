//! 外部推理能力.
//!
//! 神经网络被视为不透明的协作者: 接受一批 `(N, *patch_shape)` 输入, 同步返回
//! `(N, *patch_shape_out)` 输出. 本模块只负责分批调用与输出形状的检查.

use log::debug;
use ndarray::{Array, ArrayD, ArrayView, ArrayViewD, Axis, Dimension};
use thiserror::Error;

/// 推理后端返回的任意错误.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 推理运行时错误.
#[derive(Debug, Error)]
pub enum InferError {
    /// 推理后端自身失败.
    #[error("推理后端失败: {0}")]
    Backend(#[source] BoxError),

    /// 推理输出的形状不符合约定.
    #[error("推理输出形状 {found:?} 不符合期望 {expected}")]
    OutputShape {
        /// 期望形状的描述.
        expected: String,
        /// 实际形状.
        found: Vec<usize>,
    },
}

/// 推理运行时结果.
pub type InferResult<T> = Result<T, InferError>;

/// 同步、确定性的推理能力.
///
/// `batch` 的第 0 轴为批次轴, 输出的第 0 轴长度必须与之相等.
pub trait Infer {
    /// 对一批输入做推理.
    fn infer(&mut self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError>;
}

impl<T: Infer + ?Sized> Infer for &mut T {
    #[inline]
    fn infer(&mut self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (**self).infer(batch)
    }
}

impl<T: Infer + ?Sized> Infer for Box<T> {
    #[inline]
    fn infer(&mut self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (**self).infer(batch)
    }
}

/// 由闭包构造的推理能力. 见 [`from_fn`].
pub struct FnInfer<F>(F);

impl<F> Infer for FnInfer<F>
where
    F: FnMut(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError>,
{
    #[inline]
    fn infer(&mut self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (self.0)(batch)
    }
}

/// 将闭包包装为推理能力.
///
/// ```
/// use patch_berry::infer::{from_fn, Infer};
/// use ndarray::ArrayD;
///
/// let mut double = from_fn(|b| Ok(b.mapv(|v| v * 2.0)));
/// let x = ArrayD::<f32>::ones(vec![1, 2, 2, 1]);
/// assert_eq!(double.infer(x.view()).unwrap()[[0, 1, 1, 0]], 2.0);
/// ```
pub fn from_fn<F>(f: F) -> FnInfer<F>
where
    F: FnMut(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError>,
{
    FnInfer(f)
}

/// 原样返回输入的推理能力.
///
/// 用于评估已预先计算好的概率图, 以及测试.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Infer for Identity {
    #[inline]
    fn infer(&mut self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        Ok(batch.to_owned())
    }
}

/// 调用一次推理并检查批次大小.
pub fn infer_checked<P: Infer + ?Sized>(
    model: &mut P,
    batch: ArrayViewD<'_, f32>,
) -> InferResult<ArrayD<f32>> {
    let n = batch.len_of(Axis(0));
    let out = model.infer(batch).map_err(InferError::Backend)?;
    if out.ndim() == 0 || out.len_of(Axis(0)) != n {
        return Err(InferError::OutputShape {
            expected: format!("({n}, ..)"),
            found: out.shape().to_vec(),
        });
    }
    Ok(out)
}

/// 以 `batch_size` 为一批, 按顺序对所有 patch 推理, 输出顺序与输入一致.
///
/// 所有 patch 的形状必须相同. 每个输出 patch 的维数必须与输入相同,
/// 空间形状与通道数可以不同 (例如超分辨率或多类别输出).
pub fn infer_batched<D: Dimension, P: Infer + ?Sized>(
    patches: &[Array<f32, D>],
    batch_size: usize,
    model: &mut P,
) -> InferResult<Vec<Array<f32, D>>> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(patches.len());
    for chunk in patches.chunks(batch_size) {
        let views: Vec<ArrayViewD<f32>> = chunk.iter().map(|p| p.view().into_dyn()).collect();
        let batch = ndarray::stack(Axis(0), &views).map_err(|_| InferError::OutputShape {
            expected: "patch 形状一致".to_owned(),
            found: chunk.iter().flat_map(|p| p.shape().to_vec()).collect(),
        })?;
        let pred = infer_checked(model, batch.view())?;
        debug!("Inferred batch of {} patches -> {:?}", chunk.len(), pred.shape());

        for item in pred.axis_iter(Axis(0)) {
            let item = item
                .to_owned()
                .into_dimensionality::<D>()
                .map_err(|_| InferError::OutputShape {
                    expected: format!("{} 维 patch", D::NDIM.unwrap_or(item.ndim())),
                    found: item.shape().to_vec(),
                })?;
            out.push(item);
        }
    }
    Ok(out)
}

/// 对单个样本 (不含批次轴) 推理, 返回去掉批次轴的输出.
pub fn infer_single<D: Dimension, P: Infer + ?Sized>(
    sample: ArrayView<'_, f32, D>,
    model: &mut P,
) -> InferResult<Array<f32, D>> {
    let batch = sample.into_dyn().insert_axis(Axis(0));
    let pred = infer_checked(model, batch)?;
    let shape = pred.shape().to_vec();
    pred.index_axis_move(Axis(0), 0)
        .into_dimensionality::<D>()
        .map_err(|_| InferError::OutputShape {
            expected: format!("{} 维输出", D::NDIM.map_or(0, |n| n + 1)),
            found: shape,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_batched_preserves_order() {
        let patches: Vec<Array3<f32>> = (0..7)
            .map(|i| Array3::from_elem((2, 2, 1), i as f32))
            .collect();
        let mut calls = 0;
        let mut model = from_fn(|b| {
            calls += 1;
            Ok(b.mapv(|v| v + 0.5))
        });
        let out = infer_batched(&patches, 3, &mut model).unwrap();
        drop(model);
        assert_eq!(calls, 3);
        for (i, p) in out.iter().enumerate() {
            assert!(p.iter().all(|&v| v == i as f32 + 0.5));
        }
    }

    #[test]
    fn test_output_channel_change() {
        let patches = vec![Array3::<f32>::zeros((4, 4, 1)); 2];
        let mut model = from_fn(|b| {
            let mut shape = b.shape().to_vec();
            *shape.last_mut().unwrap() = 3;
            Ok(ArrayD::ones(shape))
        });
        let out = infer_batched(&patches, 8, &mut model).unwrap();
        assert_eq!(out[1].shape(), &[4, 4, 3]);
    }

    #[test]
    fn test_bad_batch_len() {
        let patches = vec![Array3::<f32>::zeros((2, 2, 1)); 2];
        let mut model = from_fn(|b| Ok(b.index_axis(Axis(0), 0).insert_axis(Axis(0)).to_owned()));
        assert!(matches!(
            infer_batched(&patches, 2, &mut model),
            Err(InferError::OutputShape { .. })
        ));
    }

    #[test]
    fn test_backend_error() {
        let mut model = from_fn(|_| Err("boom".into()));
        let x = Array3::<f32>::zeros((2, 2, 1));
        let err = infer_single(x.view(), &mut model).unwrap_err();
        assert!(matches!(err, InferError::Backend(_)));
    }

    #[test]
    fn test_identity_single() {
        let x = Array3::from_shape_fn((3, 2, 1), |(h, w, _)| (h * 2 + w) as f32);
        assert_eq!(infer_single(x.view(), &mut Identity).unwrap(), x);
    }
}
