//! 样本数据结构与预测结果写入.

mod save;

pub use save::{save_or_warn, ImageWriter, NpyWriter, NullWriter, PngWriter, WriteError};

use crate::dataset::{DatasetError, DatasetResult};
use ndarray::{Array, Axis, Dimension, IxDyn};

/// 一个输入样本: 2D 图像或 3D 体数据, 可选的真值掩码, 以及文件名.
///
/// 数据布局为通道在最后: 2D 为 `(H, W, C)`, 3D 为 `(Z, H, W, C)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<D: Dimension> {
    /// 文件名 (含扩展名).
    pub name: String,

    /// 输入数据.
    pub image: Array<f32, D>,

    /// 与 `image` 空间形状一致的真值掩码.
    pub mask: Option<Array<f32, D>>,
}

impl<D: Dimension> Sample<D> {
    /// 创建样本.
    pub fn new(name: impl Into<String>, image: Array<f32, D>, mask: Option<Array<f32, D>>) -> Self {
        Self {
            name: name.into(),
            image,
            mask,
        }
    }

    /// 空间形状 (不含通道轴).
    pub fn spatial_shape(&self) -> &[usize] {
        let s = self.image.shape();
        &s[..s.len() - 1]
    }
}

/// 将动态维数数据转换为 `D` 维. 缺少通道轴时补一个长度为 1 的通道轴.
fn conform_array<D: Dimension>(name: &str, a: Array<f32, IxDyn>) -> DatasetResult<Array<f32, D>> {
    let expected = D::NDIM.unwrap_or(a.ndim());
    let found = a.ndim();
    let a = if found + 1 == expected {
        a.insert_axis(Axis(found))
    } else {
        a
    };
    a.into_dimensionality::<D>()
        .map_err(|_| DatasetError::Rank {
            name: name.to_owned(),
            expected,
            found,
        })
}

impl Sample<IxDyn> {
    /// 转换为固定维数的样本. 缺少通道轴的数据与掩码会补上通道轴.
    pub fn conform<D: Dimension>(self) -> DatasetResult<Sample<D>> {
        let image = conform_array(&self.name, self.image)?;
        let mask = self
            .mask
            .map(|m| conform_array(&self.name, m))
            .transpose()?;
        Ok(Sample {
            name: self.name,
            image,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, Ix3, Ix4};

    #[test]
    fn test_conform_adds_channel() {
        let s = Sample::new("a.npy", ArrayD::<f32>::zeros(vec![4, 5]), Some(ArrayD::zeros(vec![4, 5, 1])));
        let s = s.conform::<Ix3>().unwrap();
        assert_eq!(s.image.shape(), &[4, 5, 1]);
        assert_eq!(s.mask.unwrap().shape(), &[4, 5, 1]);
    }

    #[test]
    fn test_conform_rank_error() {
        let s = Sample::new("v.npy", ArrayD::<f32>::zeros(vec![4, 5]), None);
        assert!(matches!(
            s.conform::<Ix4>(),
            Err(DatasetError::Rank { expected: 4, found: 2, .. })
        ));
    }

    #[test]
    fn test_spatial_shape() {
        let s = Sample::new("x", ndarray::Array4::<f32>::zeros((2, 3, 4, 1)), None);
        assert_eq!(s.spatial_shape(), &[2, 3, 4]);
    }
}
