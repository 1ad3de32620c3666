//! patch 网格: 步长、个数与每个 patch 的起点.

use super::error::{TileError, TileResult};
use super::pad::{pad_symmetric, trim_symmetric, PadMode};
use itertools::Itertools;
use ndarray::{Array, ArrayView, Dimension, RemoveAxis, Slice, Zip};

/// 步长取整时容许的浮点误差, 使 `32 * (1 - 0.75)` 之类的乘积不被截断为 7.
const STRIDE_EPS: f64 = 1e-9;

/// 由数据空间形状、patch 空间形状、重叠比例与填充量确定的 patch 网格.
///
/// 所有长度均不含通道轴. `shape` 为填充后的空间形状.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchGrid {
    shape: Vec<usize>,
    patch: Vec<usize>,
    overlap: Vec<f64>,
    padding: Vec<usize>,
    stride: Vec<usize>,
    counts: Vec<usize>,
}

impl PatchGrid {
    /// 构建 patch 网格.
    ///
    /// 每个轴的步长为 `floor(patch * (1 - overlap))` (至少为 1), 个数为
    /// `ceil((extent - patch) / stride) + 1`, 最后一个 patch 向内收缩至
    /// `extent - patch`, 不会越界也不会被丢弃.
    ///
    /// `shape` 为未填充的空间形状, 网格内部记录的是填充后的形状.
    pub fn new(
        shape: &[usize],
        patch: &[usize],
        overlap: &[f64],
        padding: &[usize],
    ) -> TileResult<Self> {
        let rank = shape.len();
        for (what, found) in [
            ("patch", patch.len()),
            ("overlap", overlap.len()),
            ("padding", padding.len()),
        ] {
            if found != rank {
                return Err(TileError::RankMismatch {
                    what,
                    expected: rank,
                    found,
                });
            }
        }

        let mut padded = Vec::with_capacity(rank);
        let mut stride = Vec::with_capacity(rank);
        let mut counts = Vec::with_capacity(rank);
        for axis in 0..rank {
            let ov = overlap[axis];
            if !(0.0..1.0).contains(&ov) {
                return Err(TileError::BadOverlap { axis, value: ov });
            }
            if shape[axis] == 0 {
                return Err(TileError::EmptyAxis { axis });
            }
            let p = patch[axis];
            if p == 0 {
                return Err(TileError::ZeroPatch { axis });
            }
            let extent = shape[axis] + 2 * padding[axis];
            if p > extent {
                return Err(TileError::PatchExceedsExtent {
                    axis,
                    patch: p,
                    extent,
                });
            }

            let s = ((p as f64 * (1.0 - ov) + STRIDE_EPS).floor() as usize).max(1);
            padded.push(extent);
            stride.push(s);
            counts.push((extent - p).div_ceil(s) + 1);
        }

        Ok(Self {
            shape: padded,
            patch: patch.to_vec(),
            overlap: overlap.to_vec(),
            padding: padding.to_vec(),
            stride,
            counts,
        })
    }

    /// 空间维数.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// 填充后的空间形状.
    #[inline]
    pub fn padded_shape(&self) -> &[usize] {
        &self.shape
    }

    /// 未填充的空间形状.
    pub fn original_shape(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(self.padding.iter())
            .map(|(&s, &p)| s - 2 * p)
            .collect()
    }

    /// patch 空间形状.
    #[inline]
    pub fn patch(&self) -> &[usize] {
        &self.patch
    }

    /// 每个轴的重叠比例.
    #[inline]
    pub fn overlap(&self) -> &[f64] {
        &self.overlap
    }

    /// 每个轴两端的填充量.
    #[inline]
    pub fn padding(&self) -> &[usize] {
        &self.padding
    }

    /// 每个轴的步长.
    #[inline]
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    /// 每个轴的 patch 个数.
    #[inline]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// patch 总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.counts.iter().product()
    }

    /// 网格总是至少包含一个 patch.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// 第 `axis` 轴上所有 patch 的起点.
    pub fn axis_origins(&self, axis: usize) -> Vec<usize> {
        let last = self.shape[axis] - self.patch[axis];
        (0..self.counts[axis])
            .map(|k| (k * self.stride[axis]).min(last))
            .collect()
    }

    /// 按行优先顺序 (第 0 轴变化最慢) 列出所有 patch 在填充后数据中的起点.
    pub fn origins(&self) -> Vec<Vec<usize>> {
        (0..self.rank())
            .map(|axis| self.axis_origins(axis))
            .multi_cartesian_product()
            .collect()
    }

    /// 第 `index` 个 patch 的起点. 越界时返回 `None`.
    pub fn origin(&self, index: usize) -> Option<Vec<usize>> {
        if index >= self.len() {
            return None;
        }
        let mut rest = index;
        let mut out = vec![0; self.rank()];
        for axis in (0..self.rank()).rev() {
            let k = rest % self.counts[axis];
            rest /= self.counts[axis];
            let last = self.shape[axis] - self.patch[axis];
            out[axis] = (k * self.stride[axis]).min(last);
        }
        Some(out)
    }

    /// 所有长度放大 `factor` 倍后的网格, patch 个数与顺序不变.
    ///
    /// 用于重建经超分辨率模型放大后的 patch.
    pub fn scaled(&self, factor: usize) -> Self {
        let mul = |v: &[usize]| v.iter().map(|&x| x * factor).collect::<Vec<_>>();
        Self {
            shape: mul(&self.shape),
            patch: mul(&self.patch),
            overlap: self.overlap.clone(),
            padding: mul(&self.padding),
            stride: mul(&self.stride),
            counts: self.counts.clone(),
        }
    }

    /// 填充 `data` 并按网格切出所有 patch. `data` 的最后一个轴为通道轴.
    pub fn crop<D: Dimension + RemoveAxis>(
        &self,
        data: ArrayView<f32, D>,
        mode: PadMode,
    ) -> TileResult<Vec<Array<f32, D>>> {
        self.check_spatial(data.shape(), false)?;
        let padded = pad_symmetric(data, &self.padding, mode);
        let last = padded.ndim() - 1;

        let patches = self
            .origins()
            .into_iter()
            .map(|origin| {
                padded
                    .slice_each_axis(|ax| {
                        let i = ax.axis.index();
                        if i == last {
                            Slice::from(..)
                        } else {
                            let o = origin[i] as isize;
                            Slice::from(o..o + self.patch[i] as isize)
                        }
                    })
                    .to_owned()
            })
            .collect();
        Ok(patches)
    }

    /// 以重叠平均的方式由 patch 重建完整数据, 并去掉填充.
    ///
    /// 每个体素的取值为覆盖它的所有 patch 取值之和除以覆盖次数.
    pub fn merge<D: Dimension + RemoveAxis>(
        &self,
        patches: &[Array<f32, D>],
    ) -> TileResult<Array<f32, D>> {
        if patches.len() != self.len() {
            return Err(TileError::PatchCountMismatch {
                expected: self.len(),
                found: patches.len(),
            });
        }
        let ndim = self.rank() + 1;
        let channels = patches[0].shape().get(self.rank()).copied().unwrap_or(0);
        let mut expected = self.patch.clone();
        expected.push(channels);
        for (index, p) in patches.iter().enumerate() {
            if p.shape() != expected.as_slice() {
                return Err(TileError::PatchShape {
                    index,
                    expected: expected.clone(),
                    found: p.shape().to_vec(),
                });
            }
        }

        let mut sum_dim = D::zeros(ndim);
        let mut weight_dim = D::zeros(ndim);
        for (axis, &len) in self.shape.iter().enumerate() {
            sum_dim[axis] = len;
            weight_dim[axis] = len;
        }
        sum_dim[ndim - 1] = channels;
        weight_dim[ndim - 1] = 1;
        let mut sum = Array::<f32, D>::zeros(sum_dim);
        let mut weight = Array::<f32, D>::zeros(weight_dim);

        for (origin, patch) in self.origins().into_iter().zip(patches.iter()) {
            let window = |ax: ndarray::AxisDescription| {
                let i = ax.axis.index();
                if i == ndim - 1 {
                    Slice::from(..)
                } else {
                    let o = origin[i] as isize;
                    Slice::from(o..o + self.patch[i] as isize)
                }
            };
            let mut s = sum.slice_each_axis_mut(window);
            s += patch;
            let mut w = weight.slice_each_axis_mut(window);
            w += 1.0;
        }

        Zip::from(&mut sum)
            .and_broadcast(&weight)
            .for_each(|s, &w| {
                if w > 0.0 {
                    *s /= w;
                }
            });

        Ok(trim_symmetric(sum.view(), &self.padding))
    }

    /// 检查数据 (含通道轴) 的空间形状是否与网格一致.
    pub(crate) fn check_spatial(&self, shape: &[usize], padded: bool) -> TileResult<()> {
        if shape.len() != self.rank() + 1 {
            return Err(TileError::RankMismatch {
                what: "data",
                expected: self.rank() + 1,
                found: shape.len(),
            });
        }
        let expected = if padded {
            self.shape.clone()
        } else {
            self.original_shape()
        };
        if shape[..self.rank()] != expected[..] {
            return Err(TileError::SpatialShape {
                expected,
                found: shape[..self.rank()].to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    #[test]
    fn test_stride_and_count() {
        let g = PatchGrid::new(&[100, 100], &[32, 32], &[0.5, 0.5], &[0, 0]).unwrap();
        assert_eq!(g.stride(), &[16, 16]);
        assert_eq!(g.counts(), &[6, 6]);
        assert_eq!(g.len(), 36);
        assert_eq!(g.axis_origins(0), vec![0, 16, 32, 48, 64, 68]);

        let g = PatchGrid::new(&[100, 100], &[32, 32], &[0.0, 0.0], &[0, 0]).unwrap();
        assert_eq!(g.len(), 16);
        assert_eq!(g.axis_origins(1), vec![0, 32, 64, 68]);

        let g = PatchGrid::new(&[32], &[32], &[0.75], &[0]).unwrap();
        assert_eq!(g.stride(), &[8]);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_padding_counts() {
        let g = PatchGrid::new(&[20, 10], &[16, 16], &[0.0, 0.0], &[4, 3]).unwrap();
        assert_eq!(g.padded_shape(), &[28, 16]);
        assert_eq!(g.original_shape(), vec![20, 10]);
        assert_eq!(g.counts(), &[2, 1]);
    }

    #[test]
    fn test_invalid_grid() {
        assert_eq!(
            PatchGrid::new(&[20, 10], &[16, 16], &[0.0, 0.0], &[0, 0]),
            Err(TileError::PatchExceedsExtent {
                axis: 1,
                patch: 16,
                extent: 10
            })
        );
        assert!(matches!(
            PatchGrid::new(&[20, 20], &[16, 16], &[0.0, 1.0], &[0, 0]),
            Err(TileError::BadOverlap { axis: 1, .. })
        ));
        assert!(matches!(
            PatchGrid::new(&[20, 20], &[16], &[0.0, 0.0], &[0, 0]),
            Err(TileError::RankMismatch { what: "patch", .. })
        ));
        assert!(matches!(
            PatchGrid::new(&[20, 0], &[16, 16], &[0.0, 0.0], &[0, 0]),
            Err(TileError::EmptyAxis { axis: 1 })
        ));
    }

    #[test]
    fn test_origin_matches_origins() {
        let g = PatchGrid::new(&[9, 13, 7], &[4, 5, 3], &[0.5, 0.2, 0.0], &[1, 0, 2]).unwrap();
        let all = g.origins();
        assert_eq!(all.len(), g.len());
        for (i, o) in all.iter().enumerate() {
            assert_eq!(g.origin(i).as_ref(), Some(o));
        }
        assert_eq!(g.origin(g.len()), None);
        // 行优先: 最后一轴变化最快
        assert_eq!(all[1][2], g.axis_origins(2)[1]);
    }

    #[test]
    fn test_crop_merge_exact() {
        let data = Array3::from_shape_fn((37, 29, 2), |(h, w, c)| (h * 1000 + w * 10 + c) as f32);
        let g = PatchGrid::new(&[37, 29], &[16, 16], &[0.0, 0.0], &[0, 0]).unwrap();
        let patches = g.crop(data.view(), PadMode::Reflect).unwrap();
        assert_eq!(patches.len(), g.len());
        assert!(patches.iter().all(|p| p.shape() == [16, 16, 2]));
        assert_eq!(g.merge(&patches).unwrap(), data);
    }

    #[test]
    fn test_merge_averages_overlap() {
        let g = PatchGrid::new(&[3, 1], &[2, 1], &[0.5, 0.0], &[0, 0]).unwrap();
        assert_eq!(g.len(), 2);
        let a = Array3::from_elem((2, 1, 1), 1.0f32);
        let b = Array3::from_elem((2, 1, 1), 3.0f32);
        let merged = g.merge(&[a, b]).unwrap();
        assert_eq!(merged.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_merge_contract_errors() {
        let g = PatchGrid::new(&[8, 8], &[4, 4], &[0.0, 0.0], &[0, 0]).unwrap();
        let p = Array3::<f32>::zeros((4, 4, 1));
        assert!(matches!(
            g.merge(&vec![p.clone(); 3]),
            Err(TileError::PatchCountMismatch { expected: 4, found: 3 })
        ));
        let mut bad = vec![p; 4];
        bad[2] = Array3::zeros((4, 3, 1));
        assert!(matches!(
            g.merge(&bad),
            Err(TileError::PatchShape { index: 2, .. })
        ));
    }

    #[test]
    fn test_scaled_merge() {
        let g = PatchGrid::new(&[6, 6], &[4, 4], &[0.5, 0.5], &[0, 0]).unwrap();
        let up = g.scaled(2);
        assert_eq!(up.original_shape(), vec![12, 12]);
        assert_eq!(up.len(), g.len());
        let data = Array3::from_shape_fn((12, 12, 1), |(h, w, _)| ((h + w) % 2) as f32);
        let patches = up.crop(data.view(), PadMode::Zero).unwrap();
        assert_eq!(up.merge(&patches).unwrap(), data);
    }

    #[test]
    fn test_volume_with_padding() {
        let data = Array4::from_shape_fn((6, 10, 10, 1), |(z, h, w, _)| ((z + h * w) % 5) as f32);
        let g = PatchGrid::new(&[6, 10, 10], &[4, 8, 8], &[0.0, 0.5, 0.5], &[1, 2, 2]).unwrap();
        let patches = g.crop(data.view(), PadMode::Zero).unwrap();
        let merged = g.merge(&patches).unwrap();
        assert_eq!(merged.shape(), data.shape());
        for (a, b) in merged.iter().zip(data.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
