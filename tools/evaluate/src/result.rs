//! 评估结果.

use patch_berry::workflow::Report;
use std::io::{self, Write};

/// 评估最终结果.
pub struct EvalResult {
    report: Report,
}

impl EvalResult {
    pub fn new(report: Report) -> Self {
        Self { report }
    }

    /// 将报告连同首尾分隔线写入 `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        utils::rule_to(w)?;
        self.report.describe_into(w)?;
        utils::rule_to(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patch_berry::metrics::RunningStats;

    #[test]
    fn test_write_to() {
        let mut images = RunningStats::new();
        images.add("iou_per_image", 0.5);
        images.bump(1);
        let report = Report {
            per_crop: RunningStats::new().finalize(0),
            per_image: images.finalize(1),
            post: vec![],
        };
        let mut buf = Vec::new();
        EvalResult::new(report).write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("====="));
        assert!(text.contains("iou_per_image: 0.500000"));
        assert!(text.trim_end().ends_with("====="));
    }
}
