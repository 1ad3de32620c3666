//! 对 `patch-berry::dataset` 的更一层封装. 从环境变量或用户主目录定位配置与数据集.

use patch_berry::config::{Config, ConfigResult};
use patch_berry::dataset::{self, DatasetResult, NpyLoader};
use std::env;
use std::path::{Path, PathBuf};

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 环境变量 `key` 非空时返回其值, 否则返回主目录数据集下的 `rest`.
fn env_or_home(key: &str, rest: &[&str]) -> Option<PathBuf> {
    match env::var(key) {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dataset_dir_with(rest),
    }
}

/// 获取配置文件路径.
///
/// 1. 若环境变量 `$PATCH_BERRY_CONFIG` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/patch-berry.toml`.
pub fn config_path_from_env_or_home() -> Option<PathBuf> {
    env_or_home("PATCH_BERRY_CONFIG", &["patch-berry.toml"])
}

/// 获取测试图像目录.
///
/// 1. 若环境变量 `$PATCH_BERRY_IMAGE_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/test/x`.
pub fn image_dir_from_env_or_home() -> Option<PathBuf> {
    env_or_home("PATCH_BERRY_IMAGE_DIR", &["test", "x"])
}

/// 获取测试真值目录.
///
/// 1. 若环境变量 `$PATCH_BERRY_MASK_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/test/y`.
pub fn mask_dir_from_env_or_home() -> Option<PathBuf> {
    env_or_home("PATCH_BERRY_MASK_DIR", &["test", "y"])
}

/// 读取配置文件. 不检查配置是否合法, 合法性由流程创建时检查.
pub fn config_from_env_or_home() -> ConfigResult<Config> {
    let path = config_path_from_env_or_home().unwrap_or_else(|| PathBuf::from("patch-berry.toml"));
    Config::from_toml_file(path)
}

/// 按配置决定是否加载真值, 返回 `.npy` 测试集加载器.
pub fn npy_loader_from_env_or_home(cfg: &Config) -> DatasetResult<NpyLoader> {
    let image_dir = image_dir_from_env_or_home().unwrap_or_else(|| PathBuf::from("x"));
    let mask_dir = if cfg.data.test.load_gt {
        mask_dir_from_env_or_home()
    } else {
        None
    };
    dataset::npy_loader(image_dir, mask_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_dataset_dir_with() {
        if let Some(p) = home_dataset_dir_with(["test", "x"]) {
            assert!(p.ends_with("dataset/test/x"));
        }
    }
}
