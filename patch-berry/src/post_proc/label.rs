//! N 维二值数据的连通区域标记.

use super::PostProcResult;
use ndarray::{Array, ArrayView, Dimension};
use std::collections::VecDeque;

/// 连通区域标记结果.
#[derive(Debug, Clone, PartialEq)]
pub struct Components<D: Dimension> {
    /// 每个元素所属区域的编号. 背景为 0, 区域从 1 开始编号.
    pub labels: Array<u32, D>,

    /// 第 `k` 个元素为编号 `k + 1` 的区域的大小.
    pub sizes: Vec<usize>,
}

impl<D: Dimension> Components<D> {
    /// 区域个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// 是否没有任何前景区域.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// 按照面相邻 (2D 为 4-相邻, 3D 为 6-相邻) 规则标记所有非零元素的连通区域.
///
/// 区域按其第一个元素在行优先顺序中出现的先后编号.
pub fn label_components<D: Dimension>(mask: ArrayView<u8, D>) -> PostProcResult<Components<D>> {
    let shape = mask.shape().to_vec();
    let ndim = shape.len();
    let n = mask.len();
    let fg: Vec<bool> = mask.iter().map(|&v| v != 0).collect();

    let mut strides = vec![1usize; ndim];
    for axis in (0..ndim.saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }

    let mut labels = vec![0u32; n];
    let mut sizes = Vec::with_capacity(4);
    let mut bfs_q = VecDeque::with_capacity(16);

    for start in 0..n {
        if !fg[start] || labels[start] != 0 {
            continue;
        }
        let id = sizes.len() as u32 + 1;
        labels[start] = id;
        bfs_q.push_back(start);
        let mut size = 0;

        while let Some(cur) = bfs_q.pop_front() {
            size += 1;
            for axis in 0..ndim {
                let coord = (cur / strides[axis]) % shape[axis];
                if coord > 0 {
                    let nb = cur - strides[axis];
                    if fg[nb] && labels[nb] == 0 {
                        labels[nb] = id;
                        bfs_q.push_back(nb);
                    }
                }
                if coord + 1 < shape[axis] {
                    let nb = cur + strides[axis];
                    if fg[nb] && labels[nb] == 0 {
                        labels[nb] = id;
                        bfs_q.push_back(nb);
                    }
                }
            }
        }
        sizes.push(size);
    }

    let labels = Array::from_shape_vec(mask.raw_dim(), labels)?;
    Ok(Components { labels, sizes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_label_2d() {
        let m = array![
            [1u8, 1, 0, 0],
            [0, 1, 0, 1],
            [0, 0, 0, 1],
            [1, 0, 1, 1],
        ];
        let c = label_components(m.view()).unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.sizes, vec![3, 4, 1]);
        assert_eq!(c.labels[[0, 0]], 1);
        assert_eq!(c.labels[[3, 2]], 2);
        assert_eq!(c.labels[[3, 0]], 3);
        assert_eq!(c.labels[[2, 0]], 0);
    }

    #[test]
    fn test_transposed_view() {
        let m = array![[1u8, 1, 0], [0, 0, 1]];
        let c = label_components(m.t()).unwrap();
        assert_eq!(c.labels.dim(), (3, 2));
        assert_eq!(c.labels, array![[1u32, 0], [1, 0], [0, 2]]);
    }

    #[test]
    fn test_diagonal_is_not_connected() {
        let m = array![[1u8, 0], [0, 1]];
        assert_eq!(label_components(m.view()).unwrap().len(), 2);
    }

    #[test]
    fn test_label_3d() {
        let mut m = Array3::<u8>::zeros((3, 3, 3));
        m[[0, 1, 1]] = 1;
        m[[1, 1, 1]] = 1;
        m[[2, 1, 1]] = 1;
        m[[2, 2, 2]] = 1;
        let c = label_components(m.view()).unwrap();
        assert_eq!(c.sizes, vec![3, 1]);

        let empty = Array3::<u8>::zeros((2, 2, 2));
        assert!(label_components(empty.view()).unwrap().is_empty());
    }
}
