//! 数据集级别的度量累加.

use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 按名称累加的度量和, 以及样本计数.
///
/// 在一次评估中创建, 只能通过 [`RunningStats::finalize`] 结束.
/// `finalize` 消费自身, 因此不可能重复归一化, 也不可能在归一化后继续累加.
///
/// 多个工作线程可以各自持有一份部分和, 最后用 [`RunningStats::merge`] 合并.
/// 合并是逐项求和, 满足交换律与结合律.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    sums: BTreeMap<String, f64>,
    unavailable: BTreeSet<String>,
    count: usize,
}

impl RunningStats {
    /// 空的累加器.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 将 `value` 累加到度量 `key` 上.
    pub fn add(&mut self, key: &str, value: f64) {
        *self.sums.entry(key.to_owned()).or_insert(0.0) += value;
    }

    /// 将度量 `key` 标记为不可用. 最终结果中该度量为 `None`.
    pub fn mark_unavailable(&mut self, key: &str) {
        self.unavailable.insert(key.to_owned());
    }

    /// 样本计数加 `n`.
    #[inline]
    pub fn bump(&mut self, n: usize) {
        self.count += n;
    }

    /// 当前样本计数.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// 度量 `key` 的当前累加和.
    pub fn sum(&self, key: &str) -> Option<f64> {
        self.sums.get(key).copied()
    }

    /// 合并另一份部分和.
    pub fn merge(&mut self, other: RunningStats) {
        for (k, v) in other.sums {
            *self.sums.entry(k).or_insert(0.0) += v;
        }
        self.unavailable.extend(other.unavailable);
        self.count += other.count;
    }

    /// 将所有累加和除以 `count`.
    ///
    /// `count` 为 0 时所有度量均不可用.
    pub fn finalize(self, count: usize) -> FinalStats {
        let mut values: BTreeMap<String, Option<f64>> = self
            .sums
            .into_iter()
            .map(|(k, v)| {
                let v = if count == 0 {
                    None
                } else {
                    Some(v / count as f64)
                };
                (k, v)
            })
            .collect();
        for k in self.unavailable {
            values.insert(k, None);
        }
        FinalStats { values, count }
    }
}

/// 归一化后的度量.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinalStats {
    values: BTreeMap<String, Option<f64>>,
    count: usize,
}

impl FinalStats {
    /// 度量 `key` 的最终值. 不存在或不可用时返回 `None`.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().flatten()
    }

    /// 是否记录过度量 `key` (无论可用与否).
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// 归一化所用的样本数.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// 按名称顺序遍历所有度量.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.values.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// 度量个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否没有任何度量.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-8
    }

    #[test]
    fn test_mean_of_three() {
        let mut s = RunningStats::new();
        for v in [1.0, 0.5, 0.0] {
            s.add("iou", v);
            s.bump(1);
        }
        let n = s.count();
        let f = s.finalize(n);
        assert!(f64_eq(f.get("iou").unwrap(), 0.5));
        assert_eq!(f.count(), 3);
    }

    #[test]
    fn test_merge_is_order_free() {
        let mut a = RunningStats::new();
        a.add("x", 1.0);
        a.bump(1);
        let mut b = RunningStats::new();
        b.add("x", 2.0);
        b.add("y", 4.0);
        b.bump(2);
        let mut c = RunningStats::new();
        c.mark_unavailable("z");
        c.bump(1);

        let mut left = a.clone();
        left.merge(b.clone());
        left.merge(c.clone());
        let mut right = c;
        right.merge(b);
        right.merge(a);
        assert_eq!(left, right);

        let f = left.finalize(4);
        assert!(f64_eq(f.get("x").unwrap(), 0.75));
        assert!(f64_eq(f.get("y").unwrap(), 1.0));
        assert!(f.contains("z"));
        assert_eq!(f.get("z"), None);
    }

    #[test]
    fn test_zero_count() {
        let mut s = RunningStats::new();
        s.add("iou", 1.0);
        let f = s.finalize(0);
        assert_eq!(f.get("iou"), None);
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn test_unavailable_wins() {
        let mut s = RunningStats::new();
        s.add("psnr", 30.0);
        s.mark_unavailable("psnr");
        s.bump(2);
        assert_eq!(s.finalize(2).get("psnr"), None);
    }
}
