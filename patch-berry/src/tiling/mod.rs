//! 分块引擎.
//!
//! 将 2D `(H, W, C)` 或 3D `(Z, H, W, C)` 数据切分为相互重叠的定长 patch,
//! 并将 patch 上的预测以重叠平均的方式拼回完整数据.
//!
//! patch 的顺序为空间轴上的行优先顺序 (第 0 轴变化最慢), 重建依赖这一顺序.

mod error;
mod grid;
mod pad;

pub use error::{TileError, TileResult};
pub use grid::PatchGrid;
pub use pad::{
    median, pad_axis, pad_leading_to_multiple, pad_symmetric, pad_trailing_to_multiple,
    reflect_index, trim_leading, trim_symmetric, trim_trailing, PadMode,
};

use log::debug;
use ndarray::{Array, ArrayView, Dimension, RemoveAxis};

/// [`crop_with_overlap`] 的结果.
#[derive(Debug, Clone)]
pub struct Cropped<D: Dimension> {
    /// 切分所用的网格, 重建时原样使用.
    pub grid: PatchGrid,

    /// 按行优先顺序排列的数据 patch.
    pub patches: Vec<Array<f32, D>>,

    /// 与 `patches` 一一对应的掩码 patch.
    pub masks: Option<Vec<Array<f32, D>>>,
}

/// 将 `data` (以及可选的 `mask`) 切分为形状为 `patch_shape` 的重叠 patch.
///
/// `patch_shape` 包含通道轴, 其通道数必须与 `data` 一致; `overlap` 与 `padding`
/// 只针对空间轴. 填充量非零时, 数据按 `mode` 填充, 掩码按镜像或 0 填充.
pub fn crop_with_overlap<D: Dimension + RemoveAxis>(
    data: ArrayView<f32, D>,
    mask: Option<ArrayView<f32, D>>,
    patch_shape: &[usize],
    overlap: &[f64],
    padding: &[usize],
    mode: PadMode,
) -> TileResult<Cropped<D>> {
    let ndim = data.ndim();
    if patch_shape.len() != ndim {
        return Err(TileError::RankMismatch {
            what: "patch_shape",
            expected: ndim,
            found: patch_shape.len(),
        });
    }
    let (spatial, channels) = patch_shape.split_at(ndim - 1);
    if channels[0] != data.shape()[ndim - 1] {
        return Err(TileError::ChannelMismatch {
            data: data.shape()[ndim - 1],
            patch: channels[0],
        });
    }

    let grid = PatchGrid::new(&data.shape()[..ndim - 1], spatial, overlap, padding)?;
    debug!(
        "Cropping {:?} into {} patches of {:?} (stride {:?})",
        data.shape(),
        grid.len(),
        patch_shape,
        grid.stride()
    );

    let patches = grid.crop(data, mode)?;
    let masks = match mask {
        Some(m) => {
            let mask_mode = match mode {
                PadMode::Reflect => PadMode::Reflect,
                _ => PadMode::Zero,
            };
            Some(grid.crop(m, mask_mode)?)
        }
        None => None,
    };

    Ok(Cropped {
        grid,
        patches,
        masks,
    })
}

/// [`crop_with_overlap`] 的逆操作.
///
/// 由 patch 形状、原始空间形状、重叠比例与填充量重新确定网格, 以重叠平均的方式
/// 重建数据与可选的掩码, 并去掉填充. `original_shape` 不含通道轴.
pub fn merge_with_overlap<D: Dimension + RemoveAxis>(
    patches: &[Array<f32, D>],
    masks: Option<&[Array<f32, D>]>,
    original_shape: &[usize],
    overlap: &[f64],
    padding: &[usize],
) -> TileResult<(Array<f32, D>, Option<Array<f32, D>>)> {
    let first = patches.first().ok_or(TileError::PatchCountMismatch {
        expected: 1,
        found: 0,
    })?;
    let rank = first.ndim() - 1;
    let grid = PatchGrid::new(original_shape, &first.shape()[..rank], overlap, padding)?;
    debug!("Merging {} patches into {:?}", patches.len(), original_shape);

    let data = grid.merge(patches)?;
    let mask = masks.map(|m| grid.merge(m)).transpose()?;
    Ok((data, mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use proptest::prelude::*;

    fn checkerboard(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 1), |(y, x, _)| ((y + x) % 2) as f32)
    }

    #[test]
    fn test_checkerboard_scenario() {
        let board = checkerboard(100, 100);
        let out = crop_with_overlap(
            board.view(),
            Some(board.view()),
            &[32, 32, 1],
            &[0.5, 0.5],
            &[0, 0],
            PadMode::Reflect,
        )
        .unwrap();
        // ceil((100 - 32) / 16) + 1 = 6 个 / 轴
        assert_eq!(out.patches.len(), 36);
        assert_eq!(out.masks.as_ref().map(Vec::len), Some(36));

        let (merged, mask) = merge_with_overlap(
            &out.patches,
            out.masks.as_deref(),
            &[100, 100],
            &[0.5, 0.5],
            &[0, 0],
        )
        .unwrap();
        assert_eq!(merged, board);
        assert_eq!(mask, Some(board.clone()));

        let zero_overlap =
            crop_with_overlap(board.view(), None, &[32, 32, 1], &[0.0, 0.0], &[0, 0], PadMode::Zero)
                .unwrap();
        assert_eq!(zero_overlap.patches.len(), 16);
        assert!(zero_overlap.masks.is_none());
    }

    #[test]
    fn test_channel_mismatch() {
        let data = Array3::<f32>::zeros((8, 8, 3));
        let res = crop_with_overlap(data.view(), None, &[4, 4, 1], &[0.0, 0.0], &[0, 0], PadMode::Zero);
        assert!(matches!(
            res,
            Err(TileError::ChannelMismatch { data: 3, patch: 1 })
        ));
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let data = Array3::<f32>::zeros((8, 8, 1));
        let mask = Array3::<f32>::zeros((8, 7, 1));
        let res = crop_with_overlap(
            data.view(),
            Some(mask.view()),
            &[4, 4, 1],
            &[0.0, 0.0],
            &[0, 0],
            PadMode::Zero,
        );
        assert!(matches!(res, Err(TileError::SpatialShape { .. })));
    }

    #[test]
    fn test_merge_without_patches() {
        let res = merge_with_overlap::<ndarray::Ix3>(&[], None, &[4, 4], &[0.0, 0.0], &[0, 0]);
        assert!(matches!(res, Err(TileError::PatchCountMismatch { .. })));
    }

    #[test]
    fn test_volume_round_trip() {
        let vol = Array4::from_shape_fn((10, 12, 12, 2), |(z, h, w, c)| (z * 7 + h * 3 + w + c) as f32);
        let out = crop_with_overlap(
            vol.view(),
            None,
            &[4, 8, 8, 2],
            &[0.25, 0.5, 0.5],
            &[0, 2, 2],
            PadMode::Median,
        )
        .unwrap();
        let (merged, _) =
            merge_with_overlap(&out.patches, None, &[10, 12, 12], &[0.25, 0.5, 0.5], &[0, 2, 2])
                .unwrap();
        for (a, b) in merged.iter().zip(vol.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            h in 4usize..40,
            w in 4usize..40,
            ph in 1usize..5,
            pw in 1usize..5,
            oh in 0.0f64..0.9,
            ow in 0.0f64..0.9,
            pad in 0usize..3,
            seed in 0u32..1000,
        ) {
            let data = Array3::from_shape_fn((h, w, 1), |(y, x, _)| {
                ((y as u32 * 31 + x as u32 * 17 + seed) % 97) as f32 / 97.0
            });
            let patch = [ph.min(h), pw.min(w), 1];
            let out = crop_with_overlap(
                data.view(), None, &patch, &[oh, ow], &[pad, pad], PadMode::Reflect,
            ).unwrap();
            let counts = out.grid.counts().to_vec();
            prop_assert_eq!(out.patches.len(), counts.iter().product::<usize>());
            for (axis, &c) in counts.iter().enumerate() {
                let extent = out.grid.padded_shape()[axis];
                let stride = out.grid.stride()[axis];
                prop_assert_eq!(c, (extent - patch[axis]).div_ceil(stride) + 1);
            }

            let (merged, _) = merge_with_overlap(
                &out.patches, None, &[h, w], &[oh, ow], &[pad, pad],
            ).unwrap();
            prop_assert_eq!(merged.shape(), data.shape());
            for (a, b) in merged.iter().zip(data.iter()) {
                prop_assert!((a - b).abs() < 1e-5);
            }
        }
    }
}
