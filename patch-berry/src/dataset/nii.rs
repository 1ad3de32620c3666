//! nifti 体数据加载器.

use super::{list_files, mask_path, DatasetResult};
use crate::data::Sample;
use ndarray::{ArrayD, Axis};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};

/// 读取 nifti 体数据, 转换为 `(Z, H, W, 1)` 布局.
///
/// nifti 的体素顺序为 `[W, H, Z]`, 读取后将所有轴倒序.
pub fn read_volume<P: AsRef<Path>>(path: P) -> DatasetResult<ArrayD<f32>> {
    let obj = ReaderOptions::new().read_file(path.as_ref())?;
    let data = obj.into_volume().into_ndarray::<f32>()?;
    let axes: Vec<usize> = (0..data.ndim()).rev().collect();
    let data = data.permuted_axes(axes);
    let data = if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    };
    let n = data.ndim();
    Ok(data.insert_axis(Axis(n)))
}

/// 从图像目录与可选的掩码目录创建 nifti 加载器. 只读取 `.nii` 与 `.nii.gz` 文件.
pub fn nifti_loader<P: AsRef<Path>>(image_dir: P, mask_dir: Option<P>) -> DatasetResult<NiftiLoader> {
    let image_dir = image_dir.as_ref().to_owned();
    let mut names = list_files(&image_dir, &[".nii", ".nii.gz"])?;
    names.reverse();

    Ok(NiftiLoader {
        image_dir,
        mask_dir: mask_dir.map(|p| p.as_ref().to_owned()),
        names_rev: names,
    })
}

/// nifti 体数据样本加载器.
#[derive(Debug)]
pub struct NiftiLoader {
    image_dir: PathBuf,
    mask_dir: Option<PathBuf>,
    names_rev: Vec<String>,
}

impl Iterator for NiftiLoader {
    type Item = DatasetResult<Sample<ndarray::IxDyn>>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names_rev.pop()?;
        let load = || {
            let image = read_volume(self.image_dir.join(&name))?;
            let mask = match &self.mask_dir {
                Some(dir) => Some(read_volume(mask_path(dir, &name)?)?),
                None => None,
            };
            Ok(Sample::new(name.clone(), image, mask))
        };
        Some(load())
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.names_rev.len(), Some(self.names_rev.len()))
    }
}

impl ExactSizeIterator for NiftiLoader {
    #[inline]
    fn len(&self) -> usize {
        self.names_rev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_nifti_files() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a.nii.gz", "b.nii", "c.npy"] {
            std::fs::write(dir.path().join(n), b"").unwrap();
        }
        let loader = nifti_loader(dir.path(), None).unwrap();
        assert_eq!(loader.len(), 2);
    }

    #[test]
    fn test_broken_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.nii"), b"not a nifti file").unwrap();
        let mut loader = nifti_loader(dir.path(), None).unwrap();
        assert!(loader.next().unwrap().is_err());
    }
}
