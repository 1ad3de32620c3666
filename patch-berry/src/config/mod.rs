//! 运行配置.
//!
//! 每个选项都是显式的字段. 开启 `serde` 特性后可从 TOML 加载,
//! 缺省的字段取默认值. 加载后需调用 [`Config::validate`] 做运行前检查.

mod validate;

pub use validate::{ConfigError, ConfigResult};

use crate::post_proc::PostProcessConfig;
use crate::tiling::PadMode;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 数据维数.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Ndim {
    /// 2D 图像 `(H, W, C)`.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "2D"))]
    Two,

    /// 3D 体数据 `(Z, H, W, C)`.
    #[cfg_attr(feature = "serde", serde(rename = "3D"))]
    Three,
}

impl Ndim {
    /// 空间维数.
    #[inline]
    pub const fn spatial(self) -> usize {
        match self {
            Ndim::Two => 2,
            Ndim::Three => 3,
        }
    }
}

/// 任务类型.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ProblemKind {
    /// 语义分割.
    #[default]
    SemanticSeg,

    /// 实例分割.
    InstanceSeg,

    /// 去噪.
    Denoising,

    /// 超分辨率.
    SuperResolution,

    /// 分类.
    Classification,
}

/// 实例分割的输出通道组合.
///
/// `B` 为前景, `C` 为轮廓, `M` 为前景掩码, `D` 为距离图. 前两个字母为二值通道.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[allow(clippy::upper_case_acronyms)]
pub enum InstanceChannels {
    /// 前景 + 轮廓.
    BC,
    /// 前景 + 轮廓 + 前景掩码.
    BCM,
    /// 前景 + 轮廓 + 距离图.
    BCD,
    /// 前景 + 轮廓 + 距离图 (第二版距离变换).
    #[default]
    BCDv2,
    /// 前景 + 距离图 (第二版). 只有前景为二值通道.
    BDv2,
    /// 仅距离图 (第二版). 没有二值通道, 不计算 IoU.
    Dv2,
}

impl InstanceChannels {
    /// 输出通道数.
    pub const fn channels(self) -> usize {
        match self {
            Self::BC | Self::BDv2 => 2,
            Self::BCM | Self::BCD | Self::BCDv2 => 3,
            Self::Dv2 => 1,
        }
    }

    /// 参与 IoU 计算的二值通道数.
    pub const fn binary_channels(self) -> usize {
        match self {
            Self::BC | Self::BCM | Self::BCD | Self::BCDv2 => 2,
            Self::BDv2 => 1,
            Self::Dv2 => 0,
        }
    }
}

/// 损失函数类型. 只影响真值的解释方式.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum LossKind {
    /// 交叉熵.
    #[default]
    Ce,

    /// 带掩码的二值交叉熵: 真值中不小于 2 的体素不参与评估.
    MaskedBce,
}

/// 输入数据的归一化方式, 超分辨率输出据此反归一化.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "lowercase"))]
pub enum Normalization {
    /// 除以 `max` 归一化到 `[0, 1]`.
    Div {
        /// 原始数据的最大值, 8 位数据为 255, 16 位数据为 65535.
        max: f32,
    },

    /// 减均值除标准差.
    Custom {
        /// 原始数据的均值.
        mean: f32,
        /// 原始数据的标准差.
        std: f32,
        /// 原始数据是否为整数类型.
        integer: bool,
    },
}

impl Default for Normalization {
    fn default() -> Self {
        Self::Div { max: 255.0 }
    }
}

/// `problem` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProblemConfig {
    /// 数据维数.
    pub ndim: Ndim,

    /// 任务类型.
    pub kind: ProblemKind,

    /// 实例分割的输出通道组合.
    pub instance_channels: InstanceChannels,

    /// 超分辨率的放大倍数.
    pub upscaling: usize,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            ndim: Ndim::Two,
            kind: ProblemKind::SemanticSeg,
            instance_channels: InstanceChannels::default(),
            upscaling: 1,
        }
    }
}

/// `data.test` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DataTestConfig {
    /// 每个空间轴的重叠比例, 位于 `[0, 1)`.
    pub overlap: Vec<f64>,

    /// 每个空间轴两端的填充量.
    pub padding: Vec<usize>,

    /// 填充方式.
    pub pad_mode: PadMode,

    /// 是否加载真值.
    pub load_gt: bool,

    /// 多类别输出是否以 argmax 转为类别编号.
    pub argmax_to_output: bool,

    /// 二值掩码 (`.npy`) 路径, `test.apply_mask` 开启时使用.
    pub binary_mask: Option<PathBuf>,
}

impl Default for DataTestConfig {
    fn default() -> Self {
        Self {
            overlap: vec![0.0, 0.0],
            padding: vec![0, 0],
            pad_mode: PadMode::Reflect,
            load_gt: true,
            argmax_to_output: false,
            binary_mask: None,
        }
    }
}

/// `data` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DataConfig {
    /// patch 形状, 含通道轴.
    pub patch_size: Vec<usize>,

    /// 是否在前端镜像填充到 patch 形状的整数倍.
    pub reflect_to_complete_shape: bool,

    /// 输入归一化方式.
    pub norm: Normalization,

    /// `data.test` 组.
    pub test: DataTestConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            patch_size: vec![256, 256, 1],
            reflect_to_complete_shape: false,
            norm: Normalization::default(),
            test: DataTestConfig::default(),
        }
    }
}

/// `model` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ModelConfig {
    /// 类别数. 1 表示二值分割.
    pub n_classes: usize,

    /// 每层特征图数. 层数决定下采样倍数.
    pub feature_maps: Vec<usize>,
}

impl ModelConfig {
    /// 模型总下采样倍数 `2^(depth - 1)`.
    pub fn downsample_factor(&self) -> usize {
        1 << self.feature_maps.len().saturating_sub(1)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_classes: 1,
            feature_maps: vec![16, 32, 64, 128, 256],
        }
    }
}

/// `train` 组. 推理只用到批大小.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrainConfig {
    /// 每次推理调用送入的 patch 数.
    pub batch_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}

/// `loss` 组.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LossConfig {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: LossKind,
}

/// `test.stats` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StatsConfig {
    /// 分块推理.
    pub per_patch: bool,

    /// 在拼接后的整幅预测上计算度量.
    pub merge_patches: bool,

    /// 整图推理 (仅 2D).
    pub full_img: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            per_patch: true,
            merge_patches: true,
            full_img: false,
        }
    }
}

/// `test` 组.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TestConfig {
    /// 是否计算度量.
    pub evaluate: bool,

    /// 是否做 8/16 视图集成预测.
    pub augmentation: bool,

    /// 是否以二值掩码清除预测.
    pub apply_mask: bool,

    /// `test.stats` 组.
    pub stats: StatsConfig,

    /// `test.post_processing` 组.
    pub post_processing: PostProcessConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            evaluate: true,
            augmentation: false,
            apply_mask: false,
            stats: StatsConfig::default(),
            post_processing: PostProcessConfig::default(),
        }
    }
}

/// `paths.result_dir` 组. `None` 表示不保存.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResultDirs {
    /// 分块重建后的预测.
    pub per_image: Option<PathBuf>,

    /// 整图推理的预测.
    pub full_image: Option<PathBuf>,

    /// 3D 分块预测经后处理的结果.
    pub per_image_post: Option<PathBuf>,

    /// 整图预测堆叠经后处理的结果.
    pub full_post: Option<PathBuf>,
}

/// `paths` 组.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PathsConfig {
    /// 各类结果的输出目录.
    pub result_dir: ResultDirs,
}

/// 完整的运行配置.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// 任务定义.
    pub problem: ProblemConfig,
    /// 数据形状与归一化.
    pub data: DataConfig,
    /// 模型结构中影响推理的部分.
    pub model: ModelConfig,
    /// 批大小.
    pub train: TrainConfig,
    /// 损失类型, 决定真值的处理方式.
    pub loss: LossConfig,
    /// 测试期开关.
    pub test: TestConfig,
    /// 输出路径.
    pub paths: PathsConfig,
}

impl Config {
    /// patch 的空间形状.
    pub fn patch_spatial(&self) -> &[usize] {
        let p = &self.data.patch_size;
        &p[..p.len().saturating_sub(1)]
    }

    /// 是否需要 (并且能够) 计算度量.
    #[inline]
    pub fn scoring(&self) -> bool {
        self.test.evaluate && self.data.test.load_gt
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "serde")] {
        impl Config {
            /// 从 TOML 文本加载配置. 不做检查.
            pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
                Ok(toml::from_str(s)?)
            }

            /// 从 TOML 文件加载配置. 不做检查.
            pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> ConfigResult<Self> {
                let s = std::fs::read_to_string(path)?;
                Self::from_toml_str(&s)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_factor() {
        let mut m = ModelConfig::default();
        assert_eq!(m.downsample_factor(), 16);
        m.feature_maps = vec![8];
        assert_eq!(m.downsample_factor(), 1);
    }

    #[test]
    fn test_instance_channels() {
        assert_eq!(InstanceChannels::BCDv2.binary_channels(), 2);
        assert_eq!(InstanceChannels::BDv2.binary_channels(), 1);
        assert_eq!(InstanceChannels::Dv2.binary_channels(), 0);
        assert_eq!(InstanceChannels::BCM.channels(), 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_toml() {
        let text = r#"
            [problem]
            ndim = "3D"
            kind = "INSTANCE_SEG"
            instance_channels = "BC"

            [data]
            patch_size = [16, 64, 64, 1]

            [data.norm]
            type = "custom"
            mean = 10.0
            std = 2.0
            integer = true

            [data.test]
            overlap = [0.0, 0.5, 0.5]
            padding = [0, 8, 8]
            pad_mode = "Median"

            [loss]
            type = "MASKED_BCE"

            [test.post_processing]
            combined = true
            [test.post_processing.z_filtering]
            size = 3
        "#;
        let cfg = Config::from_toml_str(text).unwrap();
        assert_eq!(cfg.problem.ndim, Ndim::Three);
        assert_eq!(cfg.problem.kind, ProblemKind::InstanceSeg);
        assert_eq!(cfg.problem.instance_channels, InstanceChannels::BC);
        assert_eq!(cfg.patch_spatial(), &[16, 64, 64]);
        assert_eq!(cfg.data.test.pad_mode, PadMode::Median);
        assert_eq!(cfg.loss.kind, LossKind::MaskedBce);
        assert!(matches!(cfg.data.norm, Normalization::Custom { integer: true, .. }));
        assert_eq!(cfg.test.post_processing.z_filtering.as_ref().map(|z| z.size), Some(3));
        assert!(cfg.test.post_processing.spurious.is_none());
        assert_eq!(cfg.train.batch_size, 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            Config::from_toml_str("[problem]\nndim = \"4D\""),
            Err(ConfigError::Toml(_))
        ));
    }
}
