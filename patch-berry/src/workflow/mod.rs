//! 逐样本的推理与评估流程.
//!
//! 对每个样本依次执行: (镜像补全) -> (分块) -> 推理 -> 重建 -> (argmax) ->
//! (二值掩码) -> 保存 -> (评估) -> (后处理). 括号中的步骤由配置决定是否跳过.
//! 2D 数据还可以在整幅图像上直接推理.
//!
//! 累加状态 [`Tally`] 由调用者持有并显式传入, 因此多个工作线程可以各自累加后再合并.

mod kind;
mod report;

pub use kind::{
    denormalize, denormalized_psnr, kind_for, predicted_class, Classification, Denoising,
    InstanceSeg, SemanticSeg, SuperResolution, WorkflowKind,
};
pub use report::{Report, Tally};

use crate::config::{Config, Ndim};
use crate::consts::keys;
use crate::data::{save_or_warn, ImageWriter, Sample};
use crate::dataset::DatasetResult;
use crate::ensemble::{predict_ensemble, predict_ensemble_2d, CUBE_VIEWS, PLANE_VIEWS};
use crate::error::{PipelineError, PipelineResult};
use crate::infer::{infer_batched, infer_single, Infer, InferResult};
use crate::metrics::argmax_channels;
use crate::post_proc::{apply_post_processing, PostRow};
use crate::tiling::{
    crop_with_overlap, pad_leading_to_multiple, pad_trailing_to_multiple, trim_leading,
    trim_trailing, TileError,
};
use log::{debug, info, warn};
use ndarray::{
    Array, ArrayD, ArrayView, Axis, CowArray, Dimension, Ix3, Ix4, IxDyn, RemoveAxis, Zip,
};
use report::Buffered;

/// 推理与评估流程.
///
/// `P` 为推理能力, `W` 为预测结果的写入器.
pub struct Workflow<P, W> {
    cfg: Config,
    kind: Box<dyn WorkflowKind>,
    model: P,
    writer: W,
    binary_mask: Option<ArrayD<f32>>,
}

impl<P: Infer, W: ImageWriter> Workflow<P, W> {
    /// 检查配置并创建流程. 配置不合法时立即返回错误, 不处理任何样本.
    pub fn new(cfg: Config, model: P, writer: W) -> PipelineResult<Self> {
        cfg.validate()?;
        let kind = kind_for(&cfg);
        debug!("Created {} workflow", kind.name());
        Ok(Self {
            cfg,
            kind,
            model,
            writer,
            binary_mask: None,
        })
    }

    /// 设置二值掩码. 开启 `test.apply_mask` 时, 掩码为 0 处的预测被清零.
    ///
    /// 掩码的空间形状必须与重建后的预测一致, 可以没有通道轴或只有一个通道.
    pub fn with_binary_mask(mut self, mask: ArrayD<f32>) -> Self {
        self.binary_mask = Some(mask);
        self
    }

    /// 运行配置.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// 处理一个样本, 将度量累加到 `tally`.
    pub fn process_sample(
        &mut self,
        sample: Sample<IxDyn>,
        tally: &mut Tally,
    ) -> PipelineResult<()> {
        info!("Processing `{}` {:?}", sample.name, sample.image.shape());
        if self.cfg.data.test.load_gt && sample.mask.is_none() {
            return Err(PipelineError::MissingGroundTruth(sample.name));
        }

        match self.cfg.problem.ndim {
            Ndim::Two => {
                let sample = sample.conform::<Ix3>()?;
                if self.cfg.test.stats.per_patch {
                    self.per_patch(&sample, tally)?;
                }
                if self.cfg.test.stats.full_img {
                    self.full_image(&sample, tally)?;
                }
            }
            Ndim::Three => {
                let sample = sample.conform::<Ix4>()?;
                self.per_patch(&sample, tally)?;
                if self.cfg.test.stats.full_img {
                    debug!("Full-image inference is skipped for 3D data");
                }
            }
        }
        tally.images.bump(1);
        Ok(())
    }

    /// 分块推理, 重建, 评估, 以及 3D 数据的逐图像后处理.
    fn per_patch<D: Dimension + RemoveAxis>(
        &mut self,
        sample: &Sample<D>,
        tally: &mut Tally,
    ) -> PipelineResult<()> {
        let Self {
            cfg,
            kind,
            model,
            writer,
            binary_mask,
        } = self;
        let ndim = sample.image.ndim();
        let patch_spatial = cfg.patch_spatial();
        let up = kind.upscaling(cfg);
        let scoring = cfg.scoring();
        let truth_in = sample.mask.as_ref().filter(|_| cfg.data.test.load_gt);
        // 超分辨率的真值为高分辨率, 不随输入分块
        let crop_truth = up == 1;
        let extent = sample.spatial_shape().to_vec();

        let reflected = cfg.data.reflect_to_complete_shape;
        let x: CowArray<f32, D> = if reflected {
            pad_leading_to_multiple(sample.image.view(), patch_spatial).0.into()
        } else {
            sample.image.view().into()
        };
        let y: Option<CowArray<f32, D>> = match truth_in {
            Some(m) if crop_truth && reflected => {
                Some(pad_leading_to_multiple(m.view(), patch_spatial).0.into())
            }
            Some(m) if crop_truth => Some(m.view().into()),
            _ => None,
        };

        let (grid, patches, truth_patches) = if &x.shape()[..ndim - 1] != patch_spatial {
            let cropped = crop_with_overlap(
                x.view(),
                y.as_ref().map(|a| a.view()),
                &cfg.data.patch_size,
                &cfg.data.test.overlap,
                &cfg.data.test.padding,
                cfg.data.test.pad_mode,
            )?;
            (Some(cropped.grid), cropped.patches, cropped.masks)
        } else {
            (None, vec![x.to_owned()], y.as_ref().map(|a| vec![a.to_owned()]))
        };

        let preds = if cfg.test.augmentation {
            let n_out = kind.output_channels(cfg);
            let batch_size = cfg.train.batch_size;
            patches
                .iter()
                .map(|p| ensemble_patch(p.view(), n_out, batch_size, &mut *model))
                .collect::<InferResult<Vec<_>>>()?
        } else {
            infer_batched(&patches, cfg.train.batch_size, &mut *model)?
        };
        debug!("`{}`: predicted {} patches", sample.name, preds.len());

        if scoring {
            if let Some(tp) = truth_patches.as_ref() {
                for (p, t) in preds.iter().zip(tp.iter()) {
                    let iou = kind.score_patch(cfg, p.view().into_dyn(), t.view().into_dyn());
                    if let Some(iou) = iou {
                        tally.crops.add(keys::IOU_PER_CROP, iou?);
                    }
                }
            }
        }
        tally.crops.bump(preds.len());

        let (pred, y) = match grid {
            Some(grid) => {
                let pred = if up > 1 {
                    grid.scaled(up).merge(&preds)?
                } else {
                    grid.merge(&preds)?
                };
                let y = truth_patches.map(|t| grid.merge(&t)).transpose()?;
                (pred, y)
            }
            None => {
                let pred = preds.into_iter().next().ok_or(TileError::PatchCountMismatch {
                    expected: 1,
                    found: 0,
                })?;
                (pred, truth_patches.and_then(|t| t.into_iter().next()))
            }
        };

        let (pred, y) = if reflected {
            let out_extent: Vec<usize> = extent.iter().map(|&e| e * up).collect();
            (
                trim_leading(pred.view(), &out_extent),
                y.map(|t| trim_leading(t.view(), &extent)),
            )
        } else {
            (pred, y)
        };
        let truth = if crop_truth { y } else { truth_in.cloned() };

        let (mut pred, truth) = argmax_if_needed(cfg, pred, truth);
        if cfg.test.apply_mask {
            if let Some(mask) = binary_mask.as_ref() {
                apply_binary_mask(&mut pred, mask)?;
            }
        }

        let pred = kind.prepare_output(cfg, pred.into_dyn());
        save_or_warn(
            &mut *writer,
            pred.view(),
            cfg.paths.result_dir.per_image.as_ref(),
            &sample.name,
        );

        if !cfg.test.stats.merge_patches {
            return Ok(());
        }
        let truth = truth.map(|t| t.into_dyn());
        if scoring {
            if let Some(t) = truth.as_ref() {
                if kind.spatial_truth() {
                    check_spatial(&sample.name, pred.shape(), t.shape())?;
                }
                kind.after_merge_patches(cfg, pred.view(), t.view(), &mut tally.images)?;
            }
        }

        let pp = &cfg.test.post_processing;
        if cfg.problem.ndim == Ndim::Three && pp.is_enabled() && kind.supports_post_processing() {
            let stack = pred.view().into_dimensionality::<Ix4>()?;
            let truth = match truth.as_ref().filter(|_| scoring) {
                Some(t) => Some(t.view().into_dimensionality::<Ix4>()?),
                None => None,
            };
            let outcome = apply_post_processing(pp, stack, truth, cfg.model.n_classes);
            for row in outcome.rows.iter() {
                tally.add_post_row(row);
            }
            if let Some(last) = outcome.last {
                save_or_warn(
                    &mut *writer,
                    last.view().into_dyn(),
                    cfg.paths.result_dir.per_image_post.as_ref(),
                    &sample.name,
                );
            }
        }
        Ok(())
    }

    /// 2D 整图推理. 尾部补 0 使各轴长度整除模型的下采样倍数, 推理后裁回.
    fn full_image(&mut self, sample: &Sample<Ix3>, tally: &mut Tally) -> PipelineResult<()> {
        let Self {
            cfg,
            kind,
            model,
            writer,
            ..
        } = self;
        let up = kind.upscaling(cfg);
        let extent: Vec<usize> = sample.spatial_shape().iter().map(|&e| e * up).collect();
        let x = pad_trailing_to_multiple(sample.image.view(), cfg.model.downsample_factor());

        let pred = if cfg.test.augmentation {
            predict_ensemble_2d(x.view(), kind.output_channels(cfg), &mut *model)?
        } else {
            infer_single(x.view(), &mut *model)?
        };
        let pred = trim_trailing(pred.view(), &extent);
        let truth = sample.mask.clone().filter(|_| cfg.data.test.load_gt);

        let (pred, truth) = argmax_if_needed(cfg, pred, truth);
        let pred = kind.prepare_output(cfg, pred.into_dyn());
        save_or_warn(
            &mut *writer,
            pred.view(),
            cfg.paths.result_dir.full_image.as_ref(),
            &sample.name,
        );

        if cfg.scoring() {
            if let Some(t) = truth.as_ref() {
                let t = t.view().into_dyn();
                if kind.spatial_truth() {
                    check_spatial(&sample.name, pred.shape(), t.shape())?;
                }
                kind.after_full_image(cfg, pred.view(), t, &mut tally.images)?;
            }
        }

        if cfg.test.post_processing.is_enabled() && kind.supports_post_processing() {
            tally.buffered.push(Buffered {
                name: sample.name.clone(),
                pred: pred.into_dimensionality::<Ix3>()?,
                truth: truth.filter(|_| cfg.scoring()),
            });
        }
        Ok(())
    }

    /// 所有样本处理完毕后调用: 对缓存的 2D 整图预测做数据集级后处理, 并归一化所有度量.
    ///
    /// 缓存的预测按文件名的自然顺序堆叠为 `(S, H, W, C)`.
    pub fn after_all_images(&mut self, mut tally: Tally) -> Report {
        if tally.buffered.is_empty() {
            return tally.finalize(None);
        }
        let mut buffered = std::mem::take(&mut tally.buffered);
        buffered.sort_by(|a, b| natord::compare(&a.name, &b.name));
        info!("Post-processing {} full images as one stack", buffered.len());

        let pp = &self.cfg.test.post_processing;
        let preds: Vec<_> = buffered.iter().map(|b| b.pred.view()).collect();
        let stack = match ndarray::stack(Axis(0), &preds) {
            Ok(s) => s,
            Err(e) => {
                warn!("Full images can not be stacked for post-processing: {e}");
                let rows = unavailable_rows(pp.step_names());
                return tally.finalize(Some(rows));
            }
        };
        let truths: Option<Vec<_>> = buffered
            .iter()
            .map(|b| b.truth.as_ref().map(|t| t.view()))
            .collect();
        let truth = truths.and_then(|t| ndarray::stack(Axis(0), &t).ok());

        let outcome = apply_post_processing(
            pp,
            stack.view(),
            truth.as_ref().map(|t| t.view()),
            self.cfg.model.n_classes,
        );
        if let Some(last) = outcome.last.as_ref() {
            save_or_warn(
                &mut self.writer,
                last.view().into_dyn(),
                self.cfg.paths.result_dir.full_post.as_ref(),
                "full_post",
            );
        }
        tally.finalize(Some(outcome.rows))
    }

    /// 依次处理 `samples` 中的所有样本并生成报告. 任何致命错误都会中止评估.
    pub fn run<I>(&mut self, samples: I) -> PipelineResult<Report>
    where
        I: IntoIterator<Item = DatasetResult<Sample<IxDyn>>>,
    {
        let mut tally = Tally::new();
        for sample in samples {
            self.process_sample(sample?, &mut tally)?;
        }
        info!("Processed {} images ({} patches)", tally.images(), tally.patches());
        Ok(self.after_all_images(tally))
    }
}

impl<P: Clone, W: Clone> Clone for Workflow<P, W> {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            kind: kind_for(&self.cfg),
            model: self.model.clone(),
            writer: self.writer.clone(),
            binary_mask: self.binary_mask.clone(),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        /// 多线程评估. 每个工作线程克隆一份 `proto` 并持有自己的累加状态, 最后合并.
        ///
        /// `proto` 在创建时已检查过配置, 因此工作线程中不会出现配置错误.
        /// 结果与 [`Workflow::run`] 一致 (浮点求和顺序除外).
        pub fn par_evaluate<P, W>(
            samples: Vec<Sample<IxDyn>>,
            proto: &Workflow<P, W>,
        ) -> PipelineResult<Report>
        where
            P: Infer + Clone + Sync,
            W: ImageWriter + Clone + Sync,
        {
            use rayon::prelude::*;

            let tally = samples
                .into_par_iter()
                .map_init(
                    || proto.clone(),
                    |wf, sample| {
                        let mut t = Tally::new();
                        wf.process_sample(sample, &mut t).map(|_| t)
                    },
                )
                .try_reduce(Tally::new, |mut a, b| {
                    a.merge(b);
                    Ok(a)
                })?;
            info!("Processed {} images ({} patches)", tally.images(), tally.patches());
            Ok(proto.clone().after_all_images(tally))
        }
    }
}

/// 按 patch 维数选择 8 视图 (2D) 或 16 视图 (3D) 集成预测.
fn ensemble_patch<D: Dimension, P: Infer + ?Sized>(
    patch: ArrayView<f32, D>,
    n_out: usize,
    batch_size: usize,
    model: &mut P,
) -> InferResult<Array<f32, D>> {
    if patch.ndim() <= 3 {
        predict_ensemble(patch, &PLANE_VIEWS, n_out, PLANE_VIEWS.len(), model)
    } else {
        predict_ensemble(patch, CUBE_VIEWS.as_slice(), n_out, batch_size, model)
    }
}

/// 多类别输出且开启 `argmax_to_output` 时, 将预测与真值转为类别编号.
fn argmax_if_needed<D: Dimension + RemoveAxis>(
    cfg: &Config,
    pred: Array<f32, D>,
    truth: Option<Array<f32, D>>,
) -> (Array<f32, D>, Option<Array<f32, D>>) {
    if cfg.model.n_classes <= 1 || !cfg.data.test.argmax_to_output {
        return (pred, truth);
    }
    let to_labels = |a: Array<f32, D>| {
        if a.shape().last().copied().unwrap_or(0) > 1 {
            argmax_channels(a.view())
        } else {
            a
        }
    };
    (to_labels(pred), truth.map(to_labels))
}

/// 检查预测与真值的空间形状 (最后一个轴为通道轴). 不一致说明分块参数有误, 不做任何修补.
fn check_spatial(name: &str, pred: &[usize], truth: &[usize]) -> PipelineResult<()> {
    let p = &pred[..pred.len().saturating_sub(1)];
    let t = &truth[..truth.len().saturating_sub(1)];
    if p != t {
        return Err(PipelineError::ShapeMismatch {
            name: name.to_owned(),
            pred: pred.to_vec(),
            truth: truth.to_vec(),
        });
    }
    Ok(())
}

/// 将 `mask` 为 0 处的预测清零.
fn apply_binary_mask<D: Dimension>(
    pred: &mut Array<f32, D>,
    mask: &ArrayD<f32>,
) -> PipelineResult<()> {
    let ndim = pred.ndim();
    let mask = if mask.ndim() + 1 == ndim {
        mask.view().insert_axis(Axis(mask.ndim()))
    } else {
        mask.view()
    };
    let mismatch = || PipelineError::MaskShape {
        expected: pred.shape().to_vec(),
        found: mask.shape().to_vec(),
    };
    if mask.ndim() != ndim
        || mask.shape()[..ndim - 1] != pred.shape()[..ndim - 1]
        || mask.shape()[ndim - 1] != 1
    {
        return Err(mismatch());
    }
    let mask = mask.clone().into_dimensionality::<D>().map_err(|_| mismatch())?;
    Zip::from(pred).and_broadcast(&mask).for_each(|p, &m| {
        if m == 0.0 {
            *p = 0.0;
        }
    });
    Ok(())
}

fn unavailable_rows(names: Vec<&'static str>) -> Vec<PostRow> {
    names
        .into_iter()
        .map(|name| PostRow {
            name: name.to_owned(),
            iou: None,
            ov_iou: None,
        })
        .collect()
}
