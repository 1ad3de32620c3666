//! 通用常量.

/// 单通道颜色.
pub mod gray {
    /// 单通道黑色.
    pub const BLACK: u8 = 0b_0000_0000;

    /// 单通道暗灰色.
    pub const DARK_GRAY: u8 = 0b_0100_0000;

    /// 单通道灰色.
    pub const GRAY: u8 = 0b_1000_0000;

    /// 单通道亮灰色.
    pub const LIGHT_GRAY: u8 = 0b_1100_0000;

    /// 单通道白色.
    pub const WHITE: u8 = 0b_1111_1111;

    /// 将 watershed 标记映射为肉眼易区分的灰度.
    ///
    /// 0 (未标记) 为黑色, 1 (背景标记) 为暗灰色, 其余前景标记在灰色与白色之间循环.
    #[inline]
    pub const fn marker(label: u32) -> u8 {
        match label {
            0 => BLACK,
            1 => DARK_GRAY,
            l if l % 3 == 2 => GRAY,
            l if l % 3 == 0 => LIGHT_GRAY,
            _ => WHITE,
        }
    }
}

/// 概率图二值化的默认阈值.
pub const BINARY_THRESHOLD: f32 = 0.5;

/// masked BCE 真值中, 不小于该值的体素不参与评估.
pub const MASKED_LABEL: f32 = 2.0;

/// z 轴中值滤波的默认窗口大小.
pub const DEFAULT_Z_FILTER_SIZE: usize = 5;

/// 统计量名称.
pub mod keys {
    /// 逐 patch 的 IoU, 以 patch 总数归一化.
    pub const IOU_PER_CROP: &str = "iou_per_crop";

    /// 拼接后整幅图像的 IoU.
    pub const IOU_PER_IMAGE: &str = "iou_per_image";

    /// 拼接后整幅图像的 VOC 重叠度.
    pub const OV_IOU_PER_IMAGE: &str = "ov_iou_per_image";

    /// 整图推理的 IoU.
    pub const IOU_FULL: &str = "iou_full";

    /// 整图推理的 VOC 重叠度.
    pub const OV_IOU_FULL: &str = "ov_iou_full";

    /// 超分辨率的 PSNR.
    pub const PSNR_PER_IMAGE: &str = "psnr_per_image";

    /// 实例分割逐通道 IoU 的前缀, 实际名称为 `iou_instances_<channel>`.
    pub const IOU_INSTANCES: &str = "iou_instances";

    /// 分类准确率.
    pub const ACCURACY: &str = "accuracy";
}
