// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/input/read_image_file.rs - 动图/图像文件输入
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

use std::{fs::File, io::BufReader, path::PathBuf};

use image::{AnimationDecoder, DynamicImage, ImageFormat, ImageReader, codecs::gif::GifDecoder};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::{DEFAULT_FRAME_DURATION_MS, DurationSampler, Sampling, decode_url_path};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("URI 路径无效: {0}")]
  InvalidPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 图像文件输入
///
/// GIF 动图逐帧解码，时间戳由每帧的显示时长累加；其他格式作为单帧片段。
pub struct ImageFileInput {
  path: PathBuf,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let path =
      decode_url_path(url).map_err(|e| ImageFileInputError::InvalidPath(e.to_string()))?;
    Ok(ImageFileInput { path })
  }
}

impl ImageFileInput {
  pub fn read_frames(self, sampling: &Sampling) -> Result<Vec<Frame>, ImageFileInputError> {
    let reader = ImageReader::open(&self.path)?.with_guessed_format()?;
    let mut sampler = DurationSampler::new(sampling);
    let mut frames = Vec::new();

    if reader.format() == Some(ImageFormat::Gif) {
      let decoder = GifDecoder::new(BufReader::new(File::open(&self.path)?))?;
      for gif_frame in decoder.into_frames() {
        if sampler.is_full() {
          break;
        }
        let gif_frame = gif_frame?;
        let (numer, denom) = gif_frame.delay().numer_denom_ms();
        let duration_ms = if denom == 0 {
          DEFAULT_FRAME_DURATION_MS as f64
        } else {
          numer as f64 / denom as f64
        };
        if let Some(timestamp_ms) = sampler.offer(duration_ms) {
          let image = DynamicImage::ImageRgba8(gif_frame.into_buffer()).into_rgb8();
          frames.push(Frame::new(image, frames.len() as u64, timestamp_ms));
        }
      }
    } else {
      let image = reader.decode()?.into_rgb8();
      if let Some(timestamp_ms) = sampler.offer(DEFAULT_FRAME_DURATION_MS as f64) {
        frames.push(Frame::new(image, 0, timestamp_ms));
      }
    }

    debug!("从 {} 读取 {} 帧", self.path.display(), frames.len());
    Ok(frames)
  }
}
