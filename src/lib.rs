// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/lib.rs - 库主文件
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

//! # Shouyu
//!
//! 将一段手势视频转换为定长描述子，并在参考词表中做最近邻检索：
//!
//! 帧加载（[`input`]）→ 手部关键点提取与槽位分配（[`landmark`]）
//! → 序列归一化（[`sequence`]）→ 重采样与描述子（[`embed`]）
//! → 向量索引（[`index`]）与带置信度/间隔门控的检索（[`matcher`]）。

pub mod config;
pub mod embed;
pub mod frame;
pub mod index;
pub mod input;
pub mod landmark;
pub mod matcher;
pub mod model;
#[cfg(feature = "landmark_record")]
pub mod output;
pub mod sequence;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
