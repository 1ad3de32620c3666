//! 流水线的顶层错误.

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::infer::InferError;
use crate::metrics::MetricError;
use crate::tiling::TileError;
use thiserror::Error;

/// 处理样本时的致命错误. 出现即中止整个评估.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 配置不合法.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 分块或重建失败.
    #[error(transparent)]
    Tile(#[from] TileError),

    /// 推理失败或输出形状不符.
    #[error(transparent)]
    Infer(#[from] InferError),

    /// 度量计算失败.
    #[error(transparent)]
    Metric(#[from] MetricError),

    /// 样本读取失败.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// 数组形状转换失败.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// 开启了真值加载, 但样本没有真值.
    #[error("样本 `{0}` 缺少真值")]
    MissingGroundTruth(String),

    /// 重建后的预测与真值空间形状不一致.
    #[error("样本 `{name}` 的预测形状 {pred:?} 与真值形状 {truth:?} 不一致")]
    ShapeMismatch {
        /// 样本名称.
        name: String,
        /// 预测的空间形状.
        pred: Vec<usize>,
        /// 真值的空间形状.
        truth: Vec<usize>,
    },

    /// 二值掩码与预测的空间形状不一致, 或掩码有多个通道.
    #[error("二值掩码形状 {found:?} 与预测形状 {expected:?} 不匹配")]
    MaskShape {
        /// 预测的形状.
        expected: Vec<usize>,
        /// 掩码的形状.
        found: Vec<usize>,
    },
}

/// 流水线运行结果.
pub type PipelineResult<T> = Result<T, PipelineError>;
