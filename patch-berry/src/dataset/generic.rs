//! 通用 `.npy` 数据加载器.

use super::{list_files, mask_path, DatasetResult};
use crate::data::Sample;
use ndarray::ArrayD;
use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};

/// 从图像目录与可选的掩码目录创建 `.npy` 加载器.
///
/// # 注意
///
/// 1. 数据必须以 `f32` 保存.
/// 2. 指定了 `mask_dir` 时, 每个样本都必须在其中有同名文件,
///   否则加载器在迭代到该样本时会返回 `Err`.
pub fn npy_loader<P: AsRef<Path>>(image_dir: P, mask_dir: Option<P>) -> DatasetResult<NpyLoader> {
    let image_dir = image_dir.as_ref().to_owned();
    let mut names = list_files(&image_dir, &[".npy"])?;
    names.reverse();

    Ok(NpyLoader {
        image_dir,
        mask_dir: mask_dir.map(|p| p.as_ref().to_owned()),
        names_rev: names,
    })
}

/// `.npy` 样本加载器, 产出动态维数的样本.
#[derive(Debug)]
pub struct NpyLoader {
    image_dir: PathBuf,
    mask_dir: Option<PathBuf>,
    names_rev: Vec<String>,
}

impl NpyLoader {
    fn load(&self, name: String) -> DatasetResult<Sample<ndarray::IxDyn>> {
        let image: ArrayD<f32> = read_npy(self.image_dir.join(&name))?;
        let mask = match &self.mask_dir {
            Some(dir) => {
                let m: ArrayD<f32> = read_npy(mask_path(dir, &name)?)?;
                Some(m)
            }
            None => None,
        };
        Ok(Sample::new(name, image, mask))
    }
}

impl Iterator for NpyLoader {
    type Item = DatasetResult<Sample<ndarray::IxDyn>>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names_rev.pop()?;
        Some(self.load(name))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.names_rev.len(), Some(self.names_rev.len()))
    }
}

impl ExactSizeIterator for NpyLoader {
    #[inline]
    fn len(&self) -> usize {
        self.names_rev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetError;
    use ndarray::Array3;
    use ndarray_npy::write_npy;

    #[test]
    fn test_npy_loader() {
        let root = tempfile::tempdir().unwrap();
        let img = root.path().join("img");
        let msk = root.path().join("mask");
        std::fs::create_dir_all(&img).unwrap();
        std::fs::create_dir_all(&msk).unwrap();

        for i in [1, 2] {
            let a = Array3::<f32>::from_elem((4, 4, 1), i as f32);
            write_npy(img.join(format!("s{i}.npy")), &a).unwrap();
        }
        write_npy(msk.join("s1.npy"), &Array3::<f32>::ones((4, 4, 1))).unwrap();

        let mut loader = npy_loader(&img, Some(&msk)).unwrap();
        assert_eq!(loader.len(), 2);
        let first = loader.next().unwrap().unwrap();
        assert_eq!(first.name, "s1.npy");
        assert_eq!(first.image[[0, 0, 0]], 1.0);
        assert!(first.mask.is_some());
        assert!(matches!(
            loader.next(),
            Some(Err(DatasetError::MissingMask { .. }))
        ));
        assert!(loader.next().is_none());

        let loader = npy_loader(&img, None).unwrap();
        assert!(loader.map(|s| s.unwrap()).all(|s| s.mask.is_none()));
    }
}
