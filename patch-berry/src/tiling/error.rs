//! 分块引擎运行时错误.

use thiserror::Error;

/// 构建 patch 网格, 切分或重建时的形状/契约错误.
///
/// 这些错误均意味着分块参数与数据不一致, 调用方不应尝试静默修复.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum TileError {
    /// 参数的维数与数据的空间维数不一致.
    #[error("`{what}` 的维数应为 {expected}, 实际为 {found}")]
    RankMismatch {
        /// 出错的参数名.
        what: &'static str,
        /// 期望的维数.
        expected: usize,
        /// 实际的维数.
        found: usize,
    },

    /// 某个空间轴长度为 0.
    #[error("第 {axis} 轴长度为 0")]
    EmptyAxis {
        /// 轴索引.
        axis: usize,
    },

    /// patch 在某个轴上的长度为 0.
    #[error("第 {axis} 轴的 patch 长度为 0")]
    ZeroPatch {
        /// 轴索引.
        axis: usize,
    },

    /// 重叠比例不在 `[0, 1)` 范围内.
    #[error("第 {axis} 轴的重叠比例 {value} 不在 [0, 1) 范围内")]
    BadOverlap {
        /// 轴索引.
        axis: usize,
        /// 非法的重叠比例.
        value: f64,
    },

    /// patch 超出了 (填充后) 数据的范围.
    #[error("第 {axis} 轴的 patch 长度 {patch} 超出了填充后的数据长度 {extent}")]
    PatchExceedsExtent {
        /// 轴索引.
        axis: usize,
        /// patch 长度.
        patch: usize,
        /// 填充后的数据长度.
        extent: usize,
    },

    /// 数据通道数与 patch 通道数不一致.
    #[error("数据通道数 {data} 与 patch 通道数 {patch} 不一致")]
    ChannelMismatch {
        /// 数据通道数.
        data: usize,
        /// patch 通道数.
        patch: usize,
    },

    /// 数据 (或掩码) 的空间形状与期望不一致.
    #[error("空间形状 {found:?} 与期望 {expected:?} 不一致")]
    SpatialShape {
        /// 期望的空间形状.
        expected: Vec<usize>,
        /// 实际的空间形状.
        found: Vec<usize>,
    },

    /// 重建时 patch 个数与网格不符.
    #[error("网格需要 {expected} 个 patch, 实际收到 {found} 个")]
    PatchCountMismatch {
        /// 网格的 patch 个数.
        expected: usize,
        /// 实际个数.
        found: usize,
    },

    /// 重建时某个 patch 的形状与网格不符.
    #[error("第 {index} 个 patch 的形状 {found:?} 与期望 {expected:?} 不符")]
    PatchShape {
        /// patch 序号.
        index: usize,
        /// 期望形状 (含通道).
        expected: Vec<usize>,
        /// 实际形状.
        found: Vec<usize>,
    },
}

/// 分块引擎运行时结果.
pub type TileResult<T> = Result<T, TileError>;
