//! 重叠度量: Jaccard (IoU), VOC 风格的双类平均 IoU, 多类别与实例通道 IoU, PSNR.
//!
//! 约定最后一个轴为通道轴. 二值输入中, 非零元素为前景.

mod stats;

pub use stats::{FinalStats, RunningStats};

use crate::consts::{BINARY_THRESHOLD, MASKED_LABEL};
use ndarray::{Array, ArrayView, Axis, Dimension, RemoveAxis, Zip};
use num::Zero;
use thiserror::Error;

/// 度量计算的运行时错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    /// 真值与预测形状不一致. 通常意味着分块参数有误.
    #[error("真值形状 {truth:?} 与预测形状 {pred:?} 不一致")]
    ShapeMismatch {
        /// 真值形状.
        truth: Vec<usize>,
        /// 预测形状.
        pred: Vec<usize>,
    },

    /// 真值取值范围为 0, PSNR 的峰值无定义.
    #[error("真值取值范围为 0, 无法计算 PSNR")]
    FlatRange,

    /// 输入为空.
    #[error("输入为空")]
    Empty,
}

/// 度量计算结果.
pub type MetricResult<T> = Result<T, MetricError>;

fn check_shape(truth: &[usize], pred: &[usize]) -> MetricResult<()> {
    if truth != pred {
        return Err(MetricError::ShapeMismatch {
            truth: truth.to_vec(),
            pred: pred.to_vec(),
        });
    }
    Ok(())
}

/// 以 `threshold` 二值化: 大于阈值为 1, 否则为 0.
pub fn binarize<D: Dimension>(data: ArrayView<f32, D>, threshold: f32) -> Array<u8, D> {
    data.mapv(|v| u8::from(v > threshold))
}

/// 以 [`BINARY_THRESHOLD`] 二值化.
#[inline]
pub fn binarize_default<D: Dimension>(data: ArrayView<f32, D>) -> Array<u8, D> {
    binarize(data, BINARY_THRESHOLD)
}

/// 交集与并集大小. 前景由 `fg` 判断.
fn intersection_union<A, D, F>(truth: ArrayView<A, D>, pred: ArrayView<A, D>, fg: F) -> (u64, u64)
where
    A: Copy,
    D: Dimension,
    F: Fn(A) -> bool,
{
    let mut inter = 0u64;
    let mut union = 0u64;
    Zip::from(&truth).and(&pred).for_each(|&t, &p| {
        let (t, p) = (fg(t), fg(p));
        inter += u64::from(t && p);
        union += u64::from(t || p);
    });
    (inter, union)
}

#[inline]
fn ratio(inter: u64, union: u64) -> f64 {
    if union == 0 {
        1.0
    } else {
        inter as f64 / union as f64
    }
}

/// 二值 Jaccard 指数 `|A ∩ B| / |A ∪ B|`.
///
/// 并集为空 (两者均无前景) 时定义为 1.0.
pub fn jaccard<A, D>(truth: ArrayView<A, D>, pred: ArrayView<A, D>) -> MetricResult<f64>
where
    A: Copy + Zero + PartialEq,
    D: Dimension,
{
    check_shape(truth.shape(), pred.shape())?;
    let (i, u) = intersection_union(truth, pred, |v: A| !v.is_zero());
    Ok(ratio(i, u))
}

/// VOC 风格的重叠度: 前景 IoU (`known`) 与背景 IoU 的平均值.
pub fn voc_overlap<A, D>(truth: ArrayView<A, D>, pred: ArrayView<A, D>, known: f64) -> MetricResult<f64>
where
    A: Copy + Zero + PartialEq,
    D: Dimension,
{
    check_shape(truth.shape(), pred.shape())?;
    let (i, u) = intersection_union(truth, pred, |v: A| v.is_zero());
    Ok((known + ratio(i, u)) / 2.0)
}

/// 逐类别 Jaccard 指数. `truth` 与 `pred` 的元素为类别编号.
pub fn jaccard_per_class<D: Dimension>(
    truth: ArrayView<u8, D>,
    pred: ArrayView<u8, D>,
    n_classes: usize,
) -> MetricResult<Vec<f64>> {
    check_shape(truth.shape(), pred.shape())?;
    let mut inter = vec![0u64; n_classes];
    let mut union = vec![0u64; n_classes];
    Zip::from(&truth).and(&pred).for_each(|&t, &p| {
        let (t, p) = (t as usize, p as usize);
        if t == p {
            if t < n_classes {
                inter[t] += 1;
                union[t] += 1;
            }
        } else {
            if t < n_classes {
                union[t] += 1;
            }
            if p < n_classes {
                union[p] += 1;
            }
        }
    });
    Ok(inter
        .into_iter()
        .zip(union)
        .map(|(i, u)| ratio(i, u))
        .collect())
}

/// 算术平均. 空输入返回 `None`.
pub fn macro_average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 沿通道轴取最大值所在的通道编号, 结果保留长度为 1 的通道轴.
///
/// 并列时取编号最小者.
pub fn argmax_channels<D: Dimension + RemoveAxis>(data: ArrayView<f32, D>) -> Array<f32, D> {
    let axis = Axis(data.ndim() - 1);
    let mut dim = data.raw_dim();
    dim[axis.index()] = 1;
    let mut out = Array::zeros(dim);
    Zip::from(out.lanes_mut(axis))
        .and(data.lanes(axis))
        .for_each(|mut o, lane| {
            let (best, _) = lane.iter().enumerate().fold(
                (0usize, f32::NEG_INFINITY),
                |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) },
            );
            o[0] = best as f32;
        });
    out
}

/// 将被掩盖的体素 (取值不小于 [`MASKED_LABEL`]) 置 0.
pub fn exclude_masked<D: Dimension>(data: ArrayView<f32, D>) -> Array<f32, D> {
    data.mapv(|v| if v >= MASKED_LABEL { 0.0 } else { v })
}

/// 将单通道类别编号或多通道 one-hot 数据转换为类别编号.
fn class_labels<D: Dimension + RemoveAxis>(data: ArrayView<f32, D>) -> Array<u8, D> {
    let channels = data.shape()[data.ndim() - 1];
    if channels > 1 {
        argmax_channels(data).mapv(|v| v as u8)
    } else {
        data.mapv(|v| v.round().max(0.0) as u8)
    }
}

/// 语义分割的 IoU.
///
/// 单通道预测时二值化后计算 Jaccard; 多通道预测时以 argmax 得到类别编号,
/// 对 `n_classes` 个类别取宏平均. 真值可以是类别编号或 one-hot.
pub fn segmentation_iou<D: Dimension + RemoveAxis>(
    truth: ArrayView<f32, D>,
    pred: ArrayView<f32, D>,
    n_classes: usize,
) -> MetricResult<f64> {
    let last = pred.ndim() - 1;
    check_shape(&truth.shape()[..last], &pred.shape()[..last])?;
    let channels = pred.shape()[last];
    if channels == 1 {
        check_shape(truth.shape(), pred.shape())?;
        return jaccard(
            binarize_default(truth).view(),
            binarize_default(pred).view(),
        );
    }
    let t = class_labels(truth);
    let p = class_labels(pred);
    let per_class = jaccard_per_class(t.view(), p.view(), n_classes.max(channels))?;
    macro_average(&per_class).ok_or(MetricError::Empty)
}

/// 语义分割的 VOC 重叠度. 仅对单通道 (二值) 预测有意义.
pub fn segmentation_voc<D: Dimension>(
    truth: ArrayView<f32, D>,
    pred: ArrayView<f32, D>,
    known: f64,
) -> MetricResult<f64> {
    voc_overlap(
        binarize_default(truth).view(),
        binarize_default(pred).view(),
        known,
    )
}

/// 实例分割输出的逐通道 IoU, 只计算前 `binary_channels` 个 (二值) 通道.
pub fn iou_instance_channels<D: Dimension + RemoveAxis>(
    truth: ArrayView<f32, D>,
    pred: ArrayView<f32, D>,
    binary_channels: usize,
) -> MetricResult<Vec<f64>> {
    let last = Axis(pred.ndim() - 1);
    let n = binary_channels
        .min(pred.len_of(last))
        .min(truth.len_of(last));
    (0..n)
        .map(|c| {
            let t = binarize_default(truth.index_axis(last, c));
            let p = binarize_default(pred.index_axis(last, c));
            jaccard(t.view(), p.view())
        })
        .collect()
}

/// 峰值信噪比 `10 * log10(max^2 / mse)`.
///
/// 两者完全相同时返回正无穷.
pub fn psnr<D: Dimension>(
    truth: ArrayView<f32, D>,
    pred: ArrayView<f32, D>,
    max_value: f64,
) -> MetricResult<f64> {
    check_shape(truth.shape(), pred.shape())?;
    if truth.is_empty() {
        return Err(MetricError::Empty);
    }
    let mut se = 0f64;
    Zip::from(&truth).and(&pred).for_each(|&t, &p| {
        let d = t as f64 - p as f64;
        se += d * d;
    });
    let mse = se / truth.len() as f64;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (max_value * max_value / mse).log10())
}
