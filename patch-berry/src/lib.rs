#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供显微图像 2D/3D 数据的分块推理、重建、集成预测、后处理与评估流水线.
//!
//! 神经网络被视为外部的推理能力 ([`infer::Infer`]), 本 crate 只负责其周围的数值流程.
//!
//! # 注意
//!
//! 1. 数据均为 `f32`, 通道轴在最后: 2D 为 `(H, W, C)`, 3D 为 `(Z, H, W, C)`.
//! 2. 配置错误与形状错误是致命的, 会中止评估; 后处理失败与写入失败只记录警告.
//!
//! # 开发计划
//!
//! ### 重叠分块与重叠平均重建 ✅
//!
//! 支持镜像、0 与中值三种填充方式. 重建时重叠区域取平均值.
//!
//! 实现位于 `patch-berry/src/tiling`.
//!
//! ### 测试时增强 (8 视图 / 16 视图集成预测) ✅
//!
//! 实现位于 `patch-berry/src/ensemble`.
//!
//! ### 度量与数据集级累加 ✅
//!
//! Jaccard, VOC 重叠度, 多类别宏平均, 实例通道 IoU, PSNR.
//! 累加器只能归一化一次, 多线程部分和可以合并.
//!
//! 实现位于 `patch-berry/src/metrics`.
//!
//! ### 后处理 ✅
//!
//! z 轴中值滤波, 伪检测去除, watershed 边界精化, 以及三者的组合.
//!
//! 实现位于 `patch-berry/src/post_proc`.
//!
//! ### 逐样本流程 ✅
//!
//! 语义分割, 实例分割, 去噪, 超分辨率, 分类.
//!
//! 实现位于 `patch-berry/src/workflow`.
//!
//! ### 检测任务 ⌛️
//!
//! 需要独立的点匹配度量, 尚未实现.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

pub mod consts;

pub mod tiling;

pub mod infer;

pub mod ensemble;

pub mod metrics;

pub mod post_proc;

pub mod data;

pub mod dataset;

pub mod config;

pub mod error;

pub mod workflow;

pub mod prelude;
