//! 评估过程中的累加状态与最终报告.

use crate::consts::keys;
use crate::metrics::{FinalStats, RunningStats};
use crate::post_proc::PostRow;
use ndarray::Array3;
use std::io::{self, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 等待数据集级后处理的 2D 整图预测.
#[derive(Debug, Clone)]
pub(crate) struct Buffered {
    pub(crate) name: String,
    pub(crate) pred: Array3<f32>,
    pub(crate) truth: Option<Array3<f32>>,
}

/// 一次评估的累加状态.
///
/// 每个工作线程持有自己的 `Tally`, 结束时用 [`Tally::merge`] 合并.
/// 合并满足交换律与结合律, 与样本的处理顺序无关.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    /// 逐 patch 的度量, 以 patch 数归一化.
    pub(crate) crops: RunningStats,

    /// 逐图像的度量, 以图像数归一化.
    pub(crate) images: RunningStats,

    /// 逐图像 (3D) 后处理的度量, 以图像数归一化.
    pub(crate) post: RunningStats,
    post_names: Vec<String>,

    pub(crate) buffered: Vec<Buffered>,
}

impl Tally {
    /// 空的累加状态.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 已处理的图像数.
    #[inline]
    pub fn images(&self) -> usize {
        self.images.count()
    }

    /// 已推理的 patch 数.
    #[inline]
    pub fn patches(&self) -> usize {
        self.crops.count()
    }

    /// 累加一行逐图像后处理度量. 不可用的度量会使该项最终不可用.
    pub(crate) fn add_post_row(&mut self, row: &PostRow) {
        if !self.post_names.contains(&row.name) {
            self.post_names.push(row.name.clone());
        }
        for (suffix, value) in [("iou", row.iou), ("ov_iou", row.ov_iou)] {
            let key = post_key(&row.name, suffix);
            match value {
                Some(v) => self.post.add(&key, v),
                None => self.post.mark_unavailable(&key),
            }
        }
    }

    /// 合并另一份累加状态.
    pub fn merge(&mut self, other: Tally) {
        self.crops.merge(other.crops);
        self.images.merge(other.images);
        self.post.merge(other.post);
        for name in other.post_names {
            if !self.post_names.contains(&name) {
                self.post_names.push(name);
            }
        }
        self.buffered.extend(other.buffered);
    }

    /// 归一化所有度量. `dataset_post` 为数据集级后处理的度量行, 存在时取代逐图像的行.
    pub fn finalize(self, dataset_post: Option<Vec<PostRow>>) -> Report {
        let patches = self.crops.count();
        let images = self.images.count();
        let per_crop = self.crops.finalize(patches);
        let per_image = self.images.finalize(images);

        let post = match dataset_post {
            Some(rows) => rows,
            None => {
                let stats = self.post.finalize(images);
                self.post_names
                    .into_iter()
                    .map(|name| PostRow {
                        iou: stats.get(&post_key(&name, "iou")),
                        ov_iou: stats.get(&post_key(&name, "ov_iou")),
                        name,
                    })
                    .collect()
            }
        };

        Report {
            per_crop,
            per_image,
            post,
        }
    }
}

#[inline]
fn post_key(name: &str, suffix: &str) -> String {
    format!("{name}:{suffix}")
}

/// 一次评估的最终报告.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Report {
    /// 逐 patch 的度量.
    pub per_crop: FinalStats,

    /// 逐图像的度量.
    pub per_image: FinalStats,

    /// 后处理各步骤的度量.
    pub post: Vec<PostRow>,
}

impl Report {
    /// 以人类可读的形式写入 `w`. 不可用的值显示为 `/`.
    pub fn describe_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        const S4: &str = "    ";

        #[inline]
        fn f64_to_display(f: Option<f64>) -> String {
            match f {
                Some(f) => format!("{f:.6}"),
                None => "/".to_string(),
            }
        }

        writeln!(w, "Patches: {}", self.per_crop.count())?;
        for (k, v) in self.per_crop.iter() {
            writeln!(w, "{S4}{k}: {}", f64_to_display(v))?;
        }

        writeln!(w, "Images: {}", self.per_image.count())?;
        for (k, v) in self.per_image.iter() {
            writeln!(w, "{S4}{k}: {}", f64_to_display(v))?;
        }

        if !self.post.is_empty() {
            writeln!(w, "Post-processing:")?;
            for row in self.post.iter() {
                writeln!(
                    w,
                    "{S4}{}: {} = {}, {} = {}",
                    row.name,
                    keys::IOU_PER_IMAGE,
                    f64_to_display(row.iou),
                    keys::OV_IOU_PER_IMAGE,
                    f64_to_display(row.ov_iou)
                )?;
            }
        }
        Ok(())
    }

    /// 逐图像度量 `key` 的值.
    #[inline]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.per_image.get(key)
    }
}
