//! 基于标记的 watershed 边界精化.

use super::label::label_components;
use super::{neighbour4, neighbour8, PostProcError, PostProcResult, WatershedConfig};
use crate::consts::gray;
use crate::Idx2d;
use binary_heap_plus::BinaryHeap;
use log::{debug, warn};
use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis, Zip};
use std::path::Path;

/// 背景标记.
pub const BACKGROUND_MARKER: u32 = 1;

/// Sobel 梯度幅值, 边界以最近邻方式延拓.
pub fn sobel(img: ArrayView2<f32>) -> Array2<f32> {
    let (height, width) = img.dim();
    let at = |h: isize, w: isize| {
        let h = h.clamp(0, height as isize - 1) as usize;
        let w = w.clamp(0, width as isize - 1) as usize;
        img[(h, w)]
    };
    Array2::from_shape_fn((height, width), |(h, w)| {
        let (h, w) = (h as isize, w as isize);
        let gx = (at(h - 1, w + 1) + 2.0 * at(h, w + 1) + at(h + 1, w + 1))
            - (at(h - 1, w - 1) + 2.0 * at(h, w - 1) + at(h + 1, w - 1));
        let gy = (at(h + 1, w - 1) + 2.0 * at(h + 1, w) + at(h + 1, w + 1))
            - (at(h - 1, w - 1) + 2.0 * at(h - 1, w) + at(h - 1, w + 1));
        (gx * gx + gy * gy).sqrt()
    })
}

/// 3x3 腐蚀. 越界邻居不参与判断.
fn erode(seed: &Array2<u8>) -> Array2<u8> {
    Array2::from_shape_fn(seed.dim(), |pos| {
        let keep = seed[pos] != 0
            && neighbour8(pos)
                .into_iter()
                .all(|nb| seed.get(nb).map_or(true, |&v| v != 0));
        u8::from(keep)
    })
}

/// 3x3 膨胀.
fn dilate(seed: &Array2<u8>) -> Array2<u8> {
    Array2::from_shape_fn(seed.dim(), |pos| {
        let hit = seed[pos] != 0
            || neighbour8(pos)
                .into_iter()
                .any(|nb| seed.get(nb).map_or(false, |&v| v != 0));
        u8::from(hit)
    })
}

/// 由概率图构造 watershed 标记.
///
/// 膨胀后的种子之外为背景标记 [`BACKGROUND_MARKER`]; 腐蚀后种子的每个连通区域
/// 为一个前景标记, 从 2 开始编号. 腐蚀后种子为空时直接使用种子本身.
pub fn markers(prob: ArrayView2<f32>, threshold: f32) -> PostProcResult<Array2<u32>> {
    let seed = prob.mapv(|v| u8::from(v > threshold));
    let mut core = erode(&seed);
    if core.iter().all(|&v| v == 0) {
        core = seed.clone();
    }
    let comps = label_components(core.view())?;
    let grown = dilate(&seed);

    let mut out = Array2::<u32>::zeros(seed.dim());
    Zip::from(&mut out)
        .and(&grown)
        .and(&comps.labels)
        .for_each(|m, &g, &l| {
            if l > 0 {
                *m = l + 1;
            } else if g == 0 {
                *m = BACKGROUND_MARKER;
            }
        });
    Ok(out)
}

/// 以 Sobel 梯度为高程, 从 `markers` 出发做优先级泛洪.
///
/// 返回每个像素的标记编号. 若没有任何标记, 返回全 0.
pub fn flood(elevation: ArrayView2<f32>, markers: ArrayView2<u32>) -> Array2<u32> {
    let mut labels = markers.to_owned();

    // 堆顶高程最低; 同高程时先入堆者先出
    let mut heap: BinaryHeap<(f32, u64, Idx2d), _> = BinaryHeap::new_by(|a: &(f32, u64, Idx2d), b: &(f32, u64, Idx2d)| {
        b.0.total_cmp(&a.0).then_with(|| b.1.cmp(&a.1))
    });
    let mut seq = 0u64;
    for (pos, &l) in labels.indexed_iter() {
        if l > 0 {
            heap.push((elevation[pos], seq, pos));
            seq += 1;
        }
    }

    while let Some((_, _, pos)) = heap.pop() {
        let cur = labels[pos];
        for nb in neighbour4(pos) {
            if let Some(l) = labels.get_mut(nb) {
                if *l == 0 {
                    *l = cur;
                    heap.push((elevation[nb], seq, nb));
                    seq += 1;
                }
            }
        }
    }
    labels
}

/// 单张 2D 概率图的 watershed 实例标记. 前景实例编号不小于 2.
pub fn watershed_slice(prob: ArrayView2<f32>, threshold: f32) -> PostProcResult<Array2<u32>> {
    let m = markers(prob, threshold)?;
    if m.iter().all(|&v| v <= BACKGROUND_MARKER) {
        return Ok(Array2::zeros(prob.dim()));
    }
    Ok(flood(sobel(prob).view(), m.view()))
}

/// 对堆叠 `(S, H, W, C)` 的每个切片与通道做 watershed, 返回二值前景 (实例编号不小于 2).
///
/// 配置了 `debug_dir` 时, 每个切片与通道的标记图以 PNG 写入该目录. 写入失败只记录警告.
pub fn watershed(stack: ArrayView4<f32>, cfg: &WatershedConfig) -> PostProcResult<Array4<f32>> {
    if stack.is_empty() {
        return Err(PostProcError::Empty);
    }
    let mut out = Array4::<f32>::zeros(stack.raw_dim());

    for (s, (slice, mut out_slice)) in stack
        .axis_iter(Axis(0))
        .zip(out.axis_iter_mut(Axis(0)))
        .enumerate()
    {
        for (c, (prob, mut dst)) in slice
            .axis_iter(Axis(2))
            .zip(out_slice.axis_iter_mut(Axis(2)))
            .enumerate()
        {
            if let Some(dir) = cfg.debug_dir.as_deref() {
                let m = markers(prob, cfg.threshold)?;
                if let Err(e) = save_markers(m.view(), dir, s, c) {
                    warn!("Failed to save watershed markers to {}: {e}", dir.display());
                }
            }
            let labels = watershed_slice(prob, cfg.threshold)?;
            Zip::from(&mut dst).and(&labels).for_each(|d, &l| {
                *d = if l > BACKGROUND_MARKER { 1.0 } else { 0.0 };
            });
        }
    }
    debug!("Watershed done on {} slices", stack.len_of(Axis(0)));
    Ok(out)
}

/// 以可视化友好的灰度保存标记图.
fn save_markers(markers: ArrayView2<u32>, dir: &Path, s: usize, c: usize) -> image::ImageResult<()> {
    std::fs::create_dir_all(dir)?;
    let (height, width) = markers.dim();
    let mut buf = image::GrayImage::new(width as u32, height as u32);
    for ((h, w), &l) in markers.indexed_iter() {
        buf.put_pixel(w as u32, h as u32, image::Luma([gray::marker(l)]));
    }
    buf.save(dir.join(format!("markers_s{s:04}_c{c}.png")))
}
