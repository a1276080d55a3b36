// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/frame.rs - 帧定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::RgbImage;

/// 解码后的一帧，仅在处理单个片段期间存在
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据（HWC 排列）
  pub image: RgbImage,
  /// 采样后的帧索引
  pub index: u64,
  /// 时间戳（毫秒），同一片段内严格递增
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  /// 水平镜像（翻转列）
  pub fn mirror(&mut self) {
    image::imageops::flip_horizontal_in_place(&mut self.image);
  }

  pub fn mirrored(mut self) -> Self {
    self.mirror();
    self
  }
}
