//! 离线评估: 将测试集中的 `.npy` 图像视为模型输出的概率图, 走完整的分块、重建、
//! 评估与后处理流程, 并打印最终报告.
//!
//! 配置、图像与真值的位置见 [`utils::loader`].

mod result;
mod runner;

use std::io::Write;

fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();

    match runner::run() {
        Ok(r) => {
            let mut out = std::io::stdout().lock();
            if let Err(e) = r.write_to(&mut out).and_then(|_| out.flush()) {
                log::error!("Failed to print report: {e}");
            }
        }
        Err(e) => {
            log::error!("Evaluation aborted: {e}");
            std::process::exit(1);
        }
    }
}
