//! 预测结果的持久化存储.
//!
//! 对流水线而言写入是 "发出即忘" 的: 写入失败只记录警告, 不会中断评估.

use log::{debug, warn};
use ndarray::{ArrayView4, ArrayViewD, Axis, Ix4};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 写入运行时错误.
#[derive(Debug, Error)]
pub enum WriteError {
    /// 文件系统错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// npy 编码错误.
    #[error(transparent)]
    Npy(#[from] ndarray_npy::WriteNpyError),

    /// 图像编码错误.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// 数据维数无法保存为图像.
    #[error("无法将 {0} 维数据保存为图像")]
    Rank(usize),
}

/// 图像写入器: 将 `data` 以 `name` 为名保存到 `dir` 目录下.
pub trait ImageWriter {
    /// 保存数据. `name` 的扩展名会被替换.
    fn save(&mut self, data: ArrayViewD<f32>, dir: &Path, name: &str) -> Result<(), WriteError>;
}

/// 去掉扩展名 (包括 `.nii.gz` 这类双扩展名).
fn stem(name: &str) -> &str {
    let base = name.strip_suffix(".gz").unwrap_or(name);
    Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base)
}

/// 以 `.npy` 格式按原样保存.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyWriter;

impl ImageWriter for NpyWriter {
    fn save(&mut self, data: ArrayViewD<f32>, dir: &Path, name: &str) -> Result<(), WriteError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.npy", stem(name)));
        ndarray_npy::write_npy(&path, &data)?;
        debug!("Saved {:?} to {}", data.shape(), path.display());
        Ok(())
    }
}

/// 以单通道 PNG 保存, 每个切片与通道一张图.
///
/// 取值先截断到 `[0, 1]` 再映射到 `0..=255`. 2D `(H, W, C)` 数据的文件名为
/// `{stem}_c{c}.png`, 3D `(Z, H, W, C)` 数据为 `{stem}_s{z:04}_c{c}.png`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngWriter;

impl PngWriter {
    fn file_name(stem: &str, slice: Option<usize>, c: usize) -> String {
        match slice {
            Some(s) => format!("{stem}_s{s:04}_c{c}.png"),
            None => format!("{stem}_c{c}.png"),
        }
    }
}

impl ImageWriter for PngWriter {
    fn save(&mut self, data: ArrayViewD<f32>, dir: &Path, name: &str) -> Result<(), WriteError> {
        let is_volume = match data.ndim() {
            3 => false,
            4 => true,
            n => return Err(WriteError::Rank(n)),
        };
        let stack = if is_volume {
            data.into_dimensionality::<Ix4>()
        } else {
            data.insert_axis(Axis(0)).into_dimensionality::<Ix4>()
        };
        let stack: ArrayView4<f32> = stack.map_err(|_| WriteError::Rank(0))?;

        std::fs::create_dir_all(dir)?;
        let stem = stem(name);
        for (s, slice) in stack.axis_iter(Axis(0)).enumerate() {
            for (c, img) in slice.axis_iter(Axis(2)).enumerate() {
                let (height, width) = img.dim();
                let mut buf = image::GrayImage::new(width as u32, height as u32);
                for ((h, w), &v) in img.indexed_iter() {
                    let gray = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                    buf.put_pixel(w as u32, h as u32, image::Luma([gray]));
                }
                let file = Self::file_name(stem, is_volume.then_some(s), c);
                buf.save(dir.join(file))?;
            }
        }
        Ok(())
    }
}

/// 什么也不做的写入器.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWriter;

impl ImageWriter for NullWriter {
    #[inline]
    fn save(&mut self, _: ArrayViewD<f32>, _: &Path, _: &str) -> Result<(), WriteError> {
        Ok(())
    }
}

/// 若配置了输出目录则保存, 失败时只记录警告.
pub fn save_or_warn<W: ImageWriter + ?Sized>(
    writer: &mut W,
    data: ArrayViewD<f32>,
    dir: Option<&PathBuf>,
    name: &str,
) {
    let Some(dir) = dir else {
        return;
    };
    if let Err(e) = writer.save(data, dir, name) {
        warn!("Failed to save `{name}` to {}: {e}", dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4, ArrayD};

    #[test]
    fn test_stem() {
        assert_eq!(stem("a.npy"), "a");
        assert_eq!(stem("vol-1.nii.gz"), "vol-1");
        assert_eq!(stem("plain"), "plain");
    }

    #[test]
    fn test_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((2, 3, 1), |(h, w, _)| (h * 3 + w) as f32).into_dyn();
        NpyWriter.save(data.view(), dir.path(), "x.tif").unwrap();
        let back: ArrayD<f32> = ndarray_npy::read_npy(dir.path().join("x.npy")).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_png_files() {
        let dir = tempfile::tempdir().unwrap();
        let img = Array3::<f32>::from_elem((4, 5, 2), 0.5).into_dyn();
        PngWriter.save(img.view(), dir.path(), "a.npy").unwrap();
        let decoded = image::open(dir.path().join("a_c1.png")).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (5, 4));
        assert_eq!(decoded.get_pixel(0, 0).0, [128]);

        let vol = Array4::<f32>::ones((2, 3, 3, 1)).into_dyn();
        PngWriter.save(vol.view(), dir.path(), "v").unwrap();
        assert!(dir.path().join("v_s0001_c0.png").exists());

        let flat = ArrayD::<f32>::zeros(vec![3, 3]);
        assert!(matches!(
            PngWriter.save(flat.view(), dir.path(), "f"),
            Err(WriteError::Rank(2))
        ));
    }

    #[test]
    fn test_save_or_warn_swallows() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // 目录实际上是一个文件, 写入必然失败
        let dir = file.path().to_path_buf();
        let data = ArrayD::<f32>::zeros(vec![2, 2, 1]);
        save_or_warn(&mut NpyWriter, data.view(), Some(&dir), "x");
        save_or_warn(&mut NpyWriter, data.view(), None, "x");
    }
}
