//! 去除伪检测: 删除过小或平均概率过低的前景连通区域.

use super::label::label_components;
use super::{PostProcError, PostProcResult, SpuriousConfig};
use crate::metrics::binarize;
use log::debug;
use ndarray::{Array4, ArrayView4, Axis, Zip};

/// 对堆叠 `(S, H, W, C)` 的每个通道, 以 `threshold` 二值化后标记 3D 连通区域,
/// 删除体素数小于 `min_size` 或平均概率低于 `low_score` 的区域.
///
/// 保留区域内的体素保持原概率, 其余体素置 0.
pub fn remove_spurious(stack: ArrayView4<f32>, cfg: &SpuriousConfig) -> PostProcResult<Array4<f32>> {
    if stack.is_empty() {
        return Err(PostProcError::Empty);
    }
    let mut out = Array4::<f32>::zeros(stack.raw_dim());

    for (c, prob) in stack.axis_iter(Axis(3)).enumerate() {
        let comps = label_components(binarize(prob, cfg.threshold).view())?;
        let mut sums = vec![0f64; comps.len()];
        Zip::from(&comps.labels).and(&prob).for_each(|&l, &p| {
            if l > 0 {
                sums[l as usize - 1] += p as f64;
            }
        });
        let keep: Vec<bool> = comps
            .sizes
            .iter()
            .zip(sums.iter())
            .map(|(&size, &sum)| size >= cfg.min_size && sum / size as f64 >= cfg.low_score)
            .collect();
        debug!(
            "Channel {c}: kept {} of {} components",
            keep.iter().filter(|&&k| k).count(),
            keep.len()
        );

        Zip::from(out.index_axis_mut(Axis(3), c))
            .and(&comps.labels)
            .and(&prob)
            .for_each(|o, &l, &p| {
                if l > 0 && keep[l as usize - 1] {
                    *o = p;
                }
            });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min_size: usize, low_score: f64) -> SpuriousConfig {
        SpuriousConfig {
            min_size,
            threshold: 0.5,
            low_score,
        }
    }

    #[test]
    fn test_small_component_removed() {
        let mut s = Array4::<f32>::zeros((2, 6, 6, 1));
        // 8 体素的块
        for z in 0..2 {
            for h in 0..2 {
                for w in 0..2 {
                    s[[z, h, w, 0]] = 0.9;
                }
            }
        }
        // 孤立体素
        s[[1, 5, 5, 0]] = 0.8;

        let out = remove_spurious(s.view(), &cfg(4, 0.0)).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 0.9);
        assert_eq!(out[[1, 5, 5, 0]], 0.0);
        assert_eq!(out.iter().filter(|&&v| v > 0.0).count(), 8);
    }

    #[test]
    fn test_low_score_removed() {
        let mut s = Array4::<f32>::zeros((1, 4, 4, 2));
        s[[0, 0, 0, 0]] = 0.55;
        s[[0, 0, 1, 0]] = 0.6;
        s[[0, 3, 3, 1]] = 0.99;
        let out = remove_spurious(s.view(), &cfg(1, 0.7)).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[0, 3, 3, 1]], 0.99);
    }

    #[test]
    fn test_empty_input() {
        let s = Array4::<f32>::zeros((0, 4, 4, 1));
        assert_eq!(
            remove_spurious(s.view(), &cfg(1, 0.0)),
            Err(PostProcError::Empty)
        );
    }
}
