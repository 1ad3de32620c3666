//! 各任务类型的差异部分.
//!
//! 分块、推理、重建、掩码与保存由 [`super::Workflow`] 统一完成,
//! 任务类型只决定输出通道数, 输出的后处理方式, 以及如何计算度量.

use crate::config::{Config, LossKind, Normalization, ProblemKind};
use crate::consts::keys;
use crate::metrics::{
    exclude_masked, iou_instance_channels, psnr, segmentation_iou, segmentation_voc, MetricError,
    MetricResult, RunningStats,
};
use log::warn;
use ndarray::{Array, ArrayD, ArrayView, ArrayViewD, Axis, CowArray, Dimension, IxDyn};

/// 任务类型.
///
/// 除 [`WorkflowKind::name`] 与 [`WorkflowKind::output_channels`] 外都有默认实现:
/// 不放大, 不做后处理, 不计算任何度量.
pub trait WorkflowKind: Send + Sync {
    /// 名称, 用于日志.
    fn name(&self) -> &'static str;

    /// 模型输出的通道数.
    fn output_channels(&self, cfg: &Config) -> usize;

    /// 模型输出相对输入的放大倍数.
    fn upscaling(&self, _cfg: &Config) -> usize {
        1
    }

    /// 是否对重建后的预测执行后处理链.
    fn supports_post_processing(&self) -> bool {
        false
    }

    /// 真值与预测是否应具有相同的空间形状.
    fn spatial_truth(&self) -> bool {
        true
    }

    /// 单个 patch 的度量. `None` 表示该任务不计算逐 patch 度量.
    fn score_patch(
        &self,
        _cfg: &Config,
        _pred: ArrayViewD<f32>,
        _truth: ArrayViewD<f32>,
    ) -> Option<MetricResult<f64>> {
        None
    }

    /// 在保存与评估之前变换重建后的预测.
    fn prepare_output(&self, _cfg: &Config, pred: ArrayD<f32>) -> ArrayD<f32> {
        pred
    }

    /// 在拼接后的整幅预测上累加度量.
    fn after_merge_patches(
        &self,
        _cfg: &Config,
        _pred: ArrayViewD<f32>,
        _truth: ArrayViewD<f32>,
        _stats: &mut RunningStats,
    ) -> MetricResult<()> {
        Ok(())
    }

    /// 在整图推理的预测上累加度量.
    fn after_full_image(
        &self,
        _cfg: &Config,
        _pred: ArrayViewD<f32>,
        _truth: ArrayViewD<f32>,
        _stats: &mut RunningStats,
    ) -> MetricResult<()> {
        Ok(())
    }
}

/// 根据配置选择任务类型.
pub fn kind_for(cfg: &Config) -> Box<dyn WorkflowKind> {
    match cfg.problem.kind {
        ProblemKind::SemanticSeg => Box::new(SemanticSeg),
        ProblemKind::InstanceSeg => Box::new(InstanceSeg),
        ProblemKind::Denoising => Box::new(Denoising),
        ProblemKind::SuperResolution => Box::new(SuperResolution),
        ProblemKind::Classification => Box::new(Classification),
    }
}

/// 输入通道数, 即 patch 形状的最后一项.
fn input_channels(cfg: &Config) -> usize {
    cfg.data.patch_size.last().copied().unwrap_or(1)
}

/// masked BCE 时去掉被掩盖的真值体素.
fn effective_truth<'a>(cfg: &Config, truth: ArrayViewD<'a, f32>) -> CowArray<'a, f32, IxDyn> {
    match cfg.loss.kind {
        LossKind::MaskedBce => exclude_masked(truth).into(),
        LossKind::Ce => truth.into(),
    }
}

/// 语义分割.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticSeg;

impl SemanticSeg {
    fn overlap(
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
    ) -> MetricResult<(f64, Option<f64>)> {
        let truth = effective_truth(cfg, truth);
        let iou = segmentation_iou(truth.view(), pred.view(), cfg.model.n_classes)?;
        let ov = if pred.shape().last() == Some(&1) {
            Some(segmentation_voc(truth.view(), pred, iou)?)
        } else {
            None
        };
        Ok((iou, ov))
    }
}

impl WorkflowKind for SemanticSeg {
    fn name(&self) -> &'static str {
        "semantic segmentation"
    }

    fn output_channels(&self, cfg: &Config) -> usize {
        cfg.model.n_classes
    }

    fn supports_post_processing(&self) -> bool {
        true
    }

    fn score_patch(
        &self,
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
    ) -> Option<MetricResult<f64>> {
        let truth = effective_truth(cfg, truth);
        Some(segmentation_iou(truth.view(), pred, cfg.model.n_classes))
    }

    fn after_merge_patches(
        &self,
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
        stats: &mut RunningStats,
    ) -> MetricResult<()> {
        let (iou, ov) = Self::overlap(cfg, pred, truth)?;
        stats.add(keys::IOU_PER_IMAGE, iou);
        match ov {
            Some(ov) => stats.add(keys::OV_IOU_PER_IMAGE, ov),
            None => stats.mark_unavailable(keys::OV_IOU_PER_IMAGE),
        }
        Ok(())
    }

    fn after_full_image(
        &self,
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
        stats: &mut RunningStats,
    ) -> MetricResult<()> {
        let (iou, ov) = Self::overlap(cfg, pred, truth)?;
        stats.add(keys::IOU_FULL, iou);
        match ov {
            Some(ov) => stats.add(keys::OV_IOU_FULL, ov),
            None => stats.mark_unavailable(keys::OV_IOU_FULL),
        }
        Ok(())
    }
}

/// 实例分割. 只评估二值通道.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceSeg;

impl WorkflowKind for InstanceSeg {
    fn name(&self) -> &'static str {
        "instance segmentation"
    }

    fn output_channels(&self, cfg: &Config) -> usize {
        cfg.problem.instance_channels.channels()
    }

    fn after_merge_patches(
        &self,
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
        stats: &mut RunningStats,
    ) -> MetricResult<()> {
        let n = cfg.problem.instance_channels.binary_channels();
        let ious = iou_instance_channels(truth, pred, n)?;
        for (c, iou) in ious.into_iter().enumerate() {
            stats.add(&format!("{}_{c}", keys::IOU_INSTANCES), iou);
        }
        Ok(())
    }
}

/// 去噪. 只保存结果.
#[derive(Debug, Clone, Copy, Default)]
pub struct Denoising;

impl WorkflowKind for Denoising {
    fn name(&self) -> &'static str {
        "denoising"
    }

    fn output_channels(&self, cfg: &Config) -> usize {
        input_channels(cfg)
    }
}

/// 超分辨率.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperResolution;

impl WorkflowKind for SuperResolution {
    fn name(&self) -> &'static str {
        "super-resolution"
    }

    fn output_channels(&self, cfg: &Config) -> usize {
        input_channels(cfg)
    }

    fn upscaling(&self, cfg: &Config) -> usize {
        cfg.problem.upscaling.max(1)
    }

    fn prepare_output(&self, cfg: &Config, pred: ArrayD<f32>) -> ArrayD<f32> {
        denormalize(pred.view(), &cfg.data.norm)
    }

    fn after_merge_patches(
        &self,
        cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
        stats: &mut RunningStats,
    ) -> MetricResult<()> {
        match denormalized_psnr(truth, pred, &cfg.data.norm) {
            Ok(v) => stats.add(keys::PSNR_PER_IMAGE, v),
            Err(e @ MetricError::FlatRange) => {
                warn!("PSNR is unavailable: {e}");
                stats.mark_unavailable(keys::PSNR_PER_IMAGE);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// 分类. 预测与真值均取空间平均后的 argmax 作为类别.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classification;

impl WorkflowKind for Classification {
    fn name(&self) -> &'static str {
        "classification"
    }

    fn output_channels(&self, cfg: &Config) -> usize {
        cfg.model.n_classes
    }

    fn spatial_truth(&self) -> bool {
        false
    }

    fn after_merge_patches(
        &self,
        _cfg: &Config,
        pred: ArrayViewD<f32>,
        truth: ArrayViewD<f32>,
        stats: &mut RunningStats,
    ) -> MetricResult<()> {
        let hit = predicted_class(pred) == predicted_class(truth);
        stats.add(keys::ACCURACY, if hit { 1.0 } else { 0.0 });
        Ok(())
    }
}

/// 单通道时为平均值四舍五入后的类别编号, 多通道时为空间平均后取值最大的通道.
/// 并列时取编号最小者.
pub fn predicted_class<D: Dimension + ndarray::RemoveAxis>(data: ArrayView<f32, D>) -> usize {
    if data.ndim() == 0 {
        return 0;
    }
    let last = Axis(data.ndim() - 1);
    let means: Vec<f32> = data
        .axis_iter(last)
        .map(|c| c.mean().unwrap_or(0.0))
        .collect();
    match means.as_slice() {
        [single] => single.round().max(0.0) as usize,
        _ => {
            means
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                    if v > bv {
                        (i, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0
        }
    }
}

/// 将模型输出还原到原始数据的取值范围.
///
/// 1. `Div`: 乘以 `max`, 截断到 `[0, max]` 并取整;
/// 2. `Custom`: 乘以标准差加均值. 原始数据为整数时取整,
///   并整体平移使最小值不为负.
pub fn denormalize<D: Dimension>(pred: ArrayView<f32, D>, norm: &Normalization) -> Array<f32, D> {
    match *norm {
        Normalization::Div { max } => pred.mapv(|v| (v * max).clamp(0.0, max).round()),
        Normalization::Custom { mean, std, integer } => {
            let mut out = pred.mapv(|v| v * std + mean);
            if integer {
                out.mapv_inplace(f32::round);
                let min = out.iter().copied().fold(f32::INFINITY, f32::min);
                if min.is_finite() {
                    let shift = min.abs();
                    out.mapv_inplace(|v| v + shift);
                }
            }
            out
        }
    }
}

/// 反归一化后的预测与原始真值之间的 PSNR.
///
/// `Div` 归一化时峰值取 `max`; `Custom` 归一化时峰值取真值的取值范围
/// (最大值减最小值), 范围为 0 时返回 [`MetricError::FlatRange`].
pub fn denormalized_psnr<D: Dimension>(
    truth: ArrayView<f32, D>,
    pred: ArrayView<f32, D>,
    norm: &Normalization,
) -> MetricResult<f64> {
    match *norm {
        Normalization::Div { max } => psnr(truth, pred, max as f64),
        Normalization::Custom { .. } => {
            let (lo, hi) = truth
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let range = hi as f64 - lo as f64;
            if !range.is_finite() || range <= 0.0 {
                return Err(MetricError::FlatRange);
            }
            psnr(truth, pred, range)
        }
    }
}
