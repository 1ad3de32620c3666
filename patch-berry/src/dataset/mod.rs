//! 数据集操作.
//!
//! 提供迭代器风格的样本加载器. 每个加载器按文件名的自然顺序逐个读取样本,
//! 并在掩码目录中寻找同名文件作为真值.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod generic;
pub mod nii;

pub use generic::{npy_loader, NpyLoader};
pub use nii::{nifti_loader, NiftiLoader};

/// 加载数据集的运行时错误.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// 文件系统错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// npy 解码错误.
    #[error(transparent)]
    Npy(#[from] ndarray_npy::ReadNpyError),

    /// nifti 解码错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 掩码目录中没有与样本同名的文件.
    #[error("掩码目录 {} 中缺少 `{name}`", dir.display())]
    MissingMask {
        /// 样本文件名.
        name: String,
        /// 掩码目录.
        dir: PathBuf,
    },

    /// 数据维数与期望不符.
    #[error("`{name}` 的维数应为 {expected}, 实际为 {found}")]
    Rank {
        /// 样本文件名.
        name: String,
        /// 期望维数.
        expected: usize,
        /// 实际维数.
        found: usize,
    },
}

/// 加载数据集的运行时结果.
pub type DatasetResult<T> = Result<T, DatasetError>;

/// 列出 `dir` 下所有以 `exts` 之一结尾的文件名, 按自然顺序排列
/// (`img2` 在 `img10` 之前).
pub fn list_files<P: AsRef<Path>>(dir: P, exts: &[&str]) -> DatasetResult<Vec<String>> {
    let mut names = Vec::with_capacity(16);
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if exts.iter().any(|e| name.ends_with(e)) {
            names.push(name);
        }
    }
    names.sort_by(|a, b| natord::compare(a, b));
    Ok(names)
}

/// 在掩码目录中寻找与 `name` 同名的文件.
pub(crate) fn mask_path(mask_dir: &Path, name: &str) -> DatasetResult<PathBuf> {
    let path = mask_dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(DatasetError::MissingMask {
            name: name.to_owned(),
            dir: mask_dir.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_files_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["img10.npy", "img2.npy", "img1.npy", "notes.txt"] {
            std::fs::write(dir.path().join(n), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.npy")).unwrap();
        let names = list_files(dir.path(), &[".npy"]).unwrap();
        assert_eq!(names, vec!["img1.npy", "img2.npy", "img10.npy"]);
    }

    #[test]
    fn test_missing_mask() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            mask_path(dir.path(), "a.npy"),
            Err(DatasetError::MissingMask { .. })
        ));
    }
}
