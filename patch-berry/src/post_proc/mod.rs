//! 后处理流程集合.
//!
//! 所有滤波器作用于堆叠 `(S, H, W, C)`: 单张 2D 预测为长度 1 的堆叠,
//! 3D 体数据本身即为堆叠. 各滤波器相互独立地开关, 按固定顺序执行,
//! 每一步之后都对同一真值重新计算度量.

mod label;
mod spurious;
mod watershed;
mod z_filter;

pub use label::{label_components, Components};
pub use spurious::remove_spurious;
pub use watershed::{flood, markers, sobel, watershed, watershed_slice, BACKGROUND_MARKER};
pub use z_filter::{median_filter_1d, z_filter};

use crate::consts::{BINARY_THRESHOLD, DEFAULT_Z_FILTER_SIZE};
use crate::metrics::{segmentation_iou, segmentation_voc};
use crate::Idx2d;
use log::{info, warn};
use ndarray::{Array4, ArrayView4};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 后处理运行时错误. 均在本地恢复: 对应的度量行记为不可用.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PostProcError {
    /// 中值滤波窗口不是正奇数.
    #[error("中值滤波窗口 {0} 不是正奇数")]
    EvenWindow(usize),

    /// 输入为空.
    #[error("输入为空")]
    Empty,

    /// 标记结果无法还原为输入形状.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// 后处理运行时结果.
pub type PostProcResult<T> = Result<T, PostProcError>;

/// 获得 `(h, w)` 的 4-邻居索引. 不检查越界.
#[inline]
pub(crate) fn neighbour4((h, w): Idx2d) -> [Idx2d; 4] {
    [
        (h.wrapping_sub(1), w),
        (h.saturating_add(1), w),
        (h, w.wrapping_sub(1)),
        (h, w.saturating_add(1)),
    ]
}

/// 获得 `(h, w)` 的 8-邻居索引. 不检查越界.
#[inline]
pub(crate) fn neighbour8((h, w): Idx2d) -> [Idx2d; 8] {
    [
        (h.wrapping_sub(1), w.wrapping_sub(1)),
        (h.wrapping_sub(1), w),
        (h.wrapping_sub(1), w.saturating_add(1)),
        (h, w.wrapping_sub(1)),
        (h, w.saturating_add(1)),
        (h.saturating_add(1), w.wrapping_sub(1)),
        (h.saturating_add(1), w),
        (h.saturating_add(1), w.saturating_add(1)),
    ]
}

/// z 轴中值滤波配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ZFilterConfig {
    /// 窗口大小, 必须为正奇数.
    pub size: usize,
}

impl Default for ZFilterConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_Z_FILTER_SIZE,
        }
    }
}

/// 伪检测去除配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpuriousConfig {
    /// 小于该体素数的区域被删除.
    pub min_size: usize,

    /// 二值化阈值.
    pub threshold: f32,

    /// 平均概率低于该值的区域被删除.
    pub low_score: f64,
}

impl Default for SpuriousConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            threshold: BINARY_THRESHOLD,
            low_score: 0.0,
        }
    }
}

/// watershed 配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WatershedConfig {
    /// 种子二值化阈值.
    pub threshold: f32,

    /// 标记图的输出目录.
    pub debug_dir: Option<PathBuf>,
}

impl Default for WatershedConfig {
    fn default() -> Self {
        Self {
            threshold: BINARY_THRESHOLD,
            debug_dir: None,
        }
    }
}

/// 后处理链配置. `None` 表示不启用对应滤波器.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PostProcessConfig {
    /// z 轴中值滤波.
    pub z_filtering: Option<ZFilterConfig>,

    /// 伪检测去除.
    pub spurious: Option<SpuriousConfig>,

    /// watershed 精化.
    pub watershed: Option<WatershedConfig>,

    /// 三者均启用时, 额外执行 spurious -> watershed -> z_filtering 组合.
    pub combined: bool,
}

impl PostProcessConfig {
    /// 是否启用了任何后处理.
    pub fn is_enabled(&self) -> bool {
        self.z_filtering.is_some() || self.spurious.is_some() || self.watershed.is_some()
    }

    /// 按执行顺序列出将产生度量行的步骤名称.
    pub fn step_names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(4);
        if self.z_filtering.is_some() {
            names.push("z_filtering");
        }
        if self.spurious.is_some() {
            names.push("spurious");
        }
        if self.watershed.is_some() {
            names.push("watershed");
        }
        if self.combined && names.len() == 3 {
            names.push(COMBINED_NAME);
        }
        names
    }
}

/// 一个后处理步骤的度量行.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PostRow {
    /// 步骤名称.
    pub name: String,

    /// IoU. 不可用时为 `None`.
    pub iou: Option<f64>,

    /// VOC 重叠度. 不可用时为 `None`.
    pub ov_iou: Option<f64>,
}

/// 后处理链的结果.
#[derive(Debug, Clone)]
pub struct PostOutcome {
    /// 按执行顺序排列的度量行.
    pub rows: Vec<PostRow>,

    /// 最后一个成功步骤的输出.
    pub last: Option<Array4<f32>>,
}

/// 组合步骤的名称.
pub const COMBINED_NAME: &str = "spurious+watershed+z_filtering";

/// 按 z_filtering, spurious, watershed, 组合的顺序执行已启用的后处理,
/// 每一步都从 `pred` 出发, 并对 `truth` (若有) 计算度量.
///
/// 任何一步失败都只会使该行的度量不可用, 不会中断其余步骤.
pub fn apply_post_processing(
    cfg: &PostProcessConfig,
    pred: ArrayView4<f32>,
    truth: Option<ArrayView4<f32>>,
    n_classes: usize,
) -> PostOutcome {
    let mut rows = Vec::with_capacity(4);
    let mut last = None;

    let mut record = |name: &str, res: PostProcResult<Array4<f32>>| {
        let row = match res {
            Ok(out) => {
                let row = score(name, truth, &out, n_classes);
                last = Some(out);
                row
            }
            Err(e) => {
                warn!("Post-processing `{name}` failed: {e}");
                PostRow {
                    name: name.to_owned(),
                    iou: None,
                    ov_iou: None,
                }
            }
        };
        rows.push(row);
    };

    if let Some(z) = &cfg.z_filtering {
        record("z_filtering", z_filter(pred, z.size));
    }
    if let Some(sp) = &cfg.spurious {
        record("spurious", remove_spurious(pred, sp));
    }
    if let Some(ws) = &cfg.watershed {
        record("watershed", watershed(pred, ws));
    }
    if cfg.combined {
        if let (Some(z), Some(sp), Some(ws)) = (&cfg.z_filtering, &cfg.spurious, &cfg.watershed) {
            let res = remove_spurious(pred, sp)
                .and_then(|a| watershed(a.view(), ws))
                .and_then(|a| z_filter(a.view(), z.size));
            record(COMBINED_NAME, res);
        }
    }
    info!("Applied {} post-processing steps", rows.len());

    PostOutcome { rows, last }
}

/// 对单个步骤的输出计算度量. 无真值或形状不符时度量不可用.
fn score(name: &str, truth: Option<ArrayView4<f32>>, out: &Array4<f32>, n_classes: usize) -> PostRow {
    let (iou, ov_iou) = match truth {
        Some(t) => match segmentation_iou(t, out.view(), n_classes) {
            Ok(iou) => {
                let ov = if out.shape()[3] == 1 {
                    segmentation_voc(t, out.view(), iou).ok()
                } else {
                    None
                };
                (Some(iou), ov)
            }
            Err(e) => {
                warn!("Post-processing `{name}` could not be scored: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };
    PostRow {
        name: name.to_owned(),
        iou,
        ov_iou,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_cfg() -> PostProcessConfig {
        PostProcessConfig {
            z_filtering: Some(ZFilterConfig { size: 3 }),
            spurious: Some(SpuriousConfig::default()),
            watershed: Some(WatershedConfig::default()),
            combined: true,
        }
    }

    fn column_stack() -> Array4<f32> {
        let mut s = Array4::<f32>::zeros((5, 8, 8, 1));
        for z in 0..5 {
            for h in 2..6 {
                for w in 2..6 {
                    s[[z, h, w, 0]] = 0.9;
                }
            }
        }
        s
    }

    #[test]
    fn test_neighbours() {
        assert_eq!(neighbour4((1, 1)), [(0, 1), (2, 1), (1, 0), (1, 2)]);
        assert_eq!(neighbour8((0, 0))[0], (usize::MAX, usize::MAX));
    }

    #[test]
    fn test_row_order() {
        let pred = column_stack();
        let truth = pred.mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });
        let out = apply_post_processing(&full_cfg(), pred.view(), Some(truth.view()), 1);
        let names: Vec<&str> = out.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["z_filtering", "spurious", "watershed", COMBINED_NAME]);
        assert_eq!(names, full_cfg().step_names());
        // 完美预测经 z 滤波不变
        assert_eq!(out.rows[0].iou, Some(1.0));
        assert_eq!(out.rows[0].ov_iou, Some(1.0));
        assert!(out.last.is_some());
    }

    #[test]
    fn test_failure_is_local() {
        let cfg = PostProcessConfig {
            z_filtering: Some(ZFilterConfig { size: 4 }),
            spurious: Some(SpuriousConfig::default()),
            ..Default::default()
        };
        let pred = column_stack();
        let out = apply_post_processing(&cfg, pred.view(), Some(pred.view()), 1);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].iou, None);
        assert!(out.rows[1].iou.is_some());
    }

    #[test]
    fn test_without_truth() {
        let pred = column_stack();
        let out = apply_post_processing(&full_cfg(), pred.view(), None, 1);
        assert!(out.rows.iter().all(|r| r.iou.is_none()));
        assert_eq!(out.rows.len(), 4);
    }

    #[test]
    fn test_shape_mismatch_unavailable() {
        let pred = column_stack();
        let truth = Array4::<f32>::zeros((5, 8, 7, 1));
        let out = apply_post_processing(&full_cfg(), pred.view(), Some(truth.view()), 1);
        assert!(out.rows.iter().all(|r| r.iou.is_none()));
    }

    #[test]
    fn test_disabled() {
        let cfg = PostProcessConfig::default();
        assert!(!cfg.is_enabled());
        let pred = column_stack();
        let out = apply_post_processing(&cfg, pred.view(), None, 1);
        assert!(out.rows.is_empty());
        assert!(out.last.is_none());
    }
}
