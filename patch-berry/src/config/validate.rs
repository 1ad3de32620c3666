//! 运行前的配置检查.
//!
//! 每条检查都是一个纯函数, 失败时给出违规的选项名.

use super::{Config, LossKind, Ndim, ProblemKind};
use thiserror::Error;

/// 配置错误.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 选项取值或组合不合法.
    #[error("配置项 `{option}` 不合法: {reason}")]
    Invalid {
        /// 违规的选项名.
        option: &'static str,
        /// 原因.
        reason: String,
    },

    /// 要求计算度量但未加载真值.
    #[error("`TEST.EVALUATE` 需要真值, 但 `DATA.TEST.LOAD_GT` 未开启")]
    MissingGroundTruth,

    /// 读取配置文件失败.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 配置文件解析失败.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// 配置检查结果.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[inline]
fn invalid(option: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        option,
        reason: reason.into(),
    }
}

type Check = fn(&Config) -> ConfigResult<()>;

/// 按顺序执行的所有检查.
const CHECKS: &[Check] = &[
    check_ground_truth,
    check_stats,
    check_shapes,
    check_overlap,
    check_batch,
    check_model,
    check_loss,
    check_problem,
    check_mask,
    check_post_processing,
];

impl Config {
    /// 运行前检查配置, 返回第一个违规项.
    pub fn validate(&self) -> ConfigResult<()> {
        CHECKS.iter().try_for_each(|check| check(self))
    }
}

fn check_ground_truth(cfg: &Config) -> ConfigResult<()> {
    match cfg.problem.kind {
        ProblemKind::Denoising if cfg.data.test.load_gt => Err(invalid(
            "DATA.TEST.LOAD_GT",
            "去噪任务不使用真值",
        )),
        ProblemKind::Denoising => Ok(()),
        _ if cfg.test.evaluate && !cfg.data.test.load_gt => Err(ConfigError::MissingGroundTruth),
        _ => Ok(()),
    }
}

fn check_stats(cfg: &Config) -> ConfigResult<()> {
    let stats = &cfg.test.stats;
    if !stats.per_patch && !stats.full_img {
        return Err(invalid(
            "TEST.STATS.PER_PATCH",
            "`TEST.STATS.PER_PATCH` 与 `TEST.STATS.FULL_IMG` 至少开启一个",
        ));
    }
    if cfg.problem.ndim == Ndim::Three && !stats.per_patch {
        return Err(invalid("TEST.STATS.PER_PATCH", "3D 数据只支持分块推理"));
    }
    Ok(())
}

fn check_shapes(cfg: &Config) -> ConfigResult<()> {
    let n = cfg.problem.ndim.spatial();
    let patch = &cfg.data.patch_size;
    if patch.len() != n + 1 {
        return Err(invalid(
            "DATA.PATCH_SIZE",
            format!("应包含 {} 个空间轴与 1 个通道轴, 实际长度为 {}", n, patch.len()),
        ));
    }
    if patch.contains(&0) {
        return Err(invalid("DATA.PATCH_SIZE", "各轴长度必须为正"));
    }
    if cfg.data.test.padding.len() != n {
        return Err(invalid(
            "DATA.TEST.PADDING",
            format!("长度应为 {n}, 实际为 {}", cfg.data.test.padding.len()),
        ));
    }
    Ok(())
}

fn check_overlap(cfg: &Config) -> ConfigResult<()> {
    let n = cfg.problem.ndim.spatial();
    let overlap = &cfg.data.test.overlap;
    if overlap.len() != n {
        return Err(invalid(
            "DATA.TEST.OVERLAP",
            format!("长度应为 {n}, 实际为 {}", overlap.len()),
        ));
    }
    if let Some(o) = overlap.iter().find(|o| !(0.0..1.0).contains(*o)) {
        return Err(invalid("DATA.TEST.OVERLAP", format!("{o} 不在 [0, 1) 内")));
    }
    Ok(())
}

fn check_batch(cfg: &Config) -> ConfigResult<()> {
    if cfg.train.batch_size == 0 {
        return Err(invalid("TRAIN.BATCH_SIZE", "必须为正"));
    }
    Ok(())
}

fn check_model(cfg: &Config) -> ConfigResult<()> {
    if cfg.model.feature_maps.is_empty() {
        return Err(invalid("MODEL.FEATURE_MAPS", "至少包含一层"));
    }
    match cfg.problem.kind {
        ProblemKind::SemanticSeg | ProblemKind::Classification if cfg.model.n_classes == 0 => {
            Err(invalid("MODEL.N_CLASSES", "不能为 0"))
        }
        ProblemKind::InstanceSeg if cfg.model.n_classes > 1 => {
            Err(invalid("MODEL.N_CLASSES", "实例分割只支持 1 个类别"))
        }
        _ => Ok(()),
    }
}

fn check_loss(cfg: &Config) -> ConfigResult<()> {
    if cfg.loss.kind != LossKind::MaskedBce {
        return Ok(());
    }
    if cfg.problem.kind != ProblemKind::SemanticSeg {
        return Err(invalid("LOSS.TYPE", "`MASKED_BCE` 只用于语义分割"));
    }
    if cfg.model.n_classes > 1 {
        return Err(invalid("LOSS.TYPE", "`MASKED_BCE` 只支持 1 个类别"));
    }
    Ok(())
}

fn check_problem(cfg: &Config) -> ConfigResult<()> {
    if cfg.problem.kind != ProblemKind::SuperResolution {
        return Ok(());
    }
    if cfg.problem.ndim == Ndim::Three {
        return Err(invalid("PROBLEM.NDIM", "超分辨率只支持 2D"));
    }
    if cfg.problem.upscaling == 0 {
        return Err(invalid("PROBLEM.SUPER_RESOLUTION.UPSCALING", "必须为正"));
    }
    Ok(())
}

fn check_mask(cfg: &Config) -> ConfigResult<()> {
    if cfg.test.apply_mask && cfg.data.test.binary_mask.is_none() {
        return Err(invalid(
            "DATA.TEST.BINARY_MASK",
            "`TEST.APPLY_MASK` 开启时必须给出二值掩码",
        ));
    }
    Ok(())
}

fn check_post_processing(cfg: &Config) -> ConfigResult<()> {
    let pp = &cfg.test.post_processing;
    if let Some(z) = &pp.z_filtering {
        if z.size == 0 || z.size % 2 == 0 {
            return Err(invalid(
                "TEST.POST_PROCESSING.Z_FILTERING_SIZE",
                format!("{} 不是正奇数", z.size),
            ));
        }
    }
    if let Some(ws) = &pp.watershed {
        if !(0.0..=1.0).contains(&ws.threshold) {
            return Err(invalid(
                "TEST.POST_PROCESSING.WATERSHED_THRESHOLD",
                format!("{} 不在 [0, 1] 内", ws.threshold),
            ));
        }
    }
    Ok(())
}
