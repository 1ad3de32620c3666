//! 程序运行函数.

use crate::result::EvalResult;
use log::info;
use ndarray::ArrayD;
use patch_berry::prelude::*;
use std::path::Path;
use thiserror::Error;
use utils::loader;

/// 评估中止的原因.
#[derive(Debug, Error)]
pub enum RunError {
    /// 配置文件无法读取或不合法.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 数据集无法读取.
    #[error(transparent)]
    Dataset(#[from] dataset::DatasetError),

    /// 二值掩码无法读取.
    #[error("failed to read binary mask: {0}")]
    Mask(#[from] ndarray_npy::ReadNpyError),

    /// 线程池无法创建.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// 流程中的致命错误.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

fn read_mask(path: &Path) -> Result<ArrayD<f32>, RunError> {
    info!("Loading binary mask from {}", path.display());
    Ok(ndarray_npy::read_npy(path)?)
}

/// 实际运行.
pub fn run() -> Result<EvalResult, RunError> {
    let cfg = loader::config_from_env_or_home()?;
    let samples = loader::npy_loader_from_env_or_home(&cfg)?;
    let threads = utils::worker_threads();
    info!("Evaluating {} images with {threads} threads", samples.len());
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    let mask_path = cfg.data.test.binary_mask.clone();
    let mut proto = Workflow::new(cfg, Identity, NpyWriter)?;
    if let Some(p) = mask_path {
        proto = proto.with_binary_mask(read_mask(&p)?);
    }

    let samples = samples.collect::<Result<Vec<_>, _>>()?;
    let report = par_evaluate(samples, &proto)?;
    Ok(EvalResult::new(report))
}
