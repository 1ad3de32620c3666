//! 评估工具依赖的通用组件.

use std::io::{self, Write};

pub mod loader;

/// 报告各节之间的分隔线.
const RULE: &str = "========================================================";

/// 将分隔线写入 `w`.
#[inline]
pub fn rule_to<W: Write>(w: &mut W) -> io::Result<()> {
    writeln!(w, "{RULE}")
}

/// 评估使用的工作线程数.
///
/// 1. 若环境变量 `$PATCH_BERRY_THREADS` 为正整数, 则返回其值;
/// 2. 否则, 返回可并行核心数.
pub fn worker_threads() -> usize {
    std::env::var("PATCH_BERRY_THREADS")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_to() {
        let mut buf = Vec::new();
        rule_to(&mut buf).unwrap();
        assert_eq!(buf.len(), RULE.len() + 1);
    }

    #[test]
    fn test_worker_threads() {
        assert!(worker_threads() >= 1);
    }
}
