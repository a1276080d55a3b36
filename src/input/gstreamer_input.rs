// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频输入
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

//! # GStreamer 视频输入模块
//!
//! 使用 GStreamer 解码视频文件（MP4/WebM 等），按源帧率抽帧后输出 RGB 帧。
//!
//! ## 系统依赖
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## URI 格式
//!
//! ```text
//! gst://file/path/to/clip.mp4?rotate=90
//! ```
//!
//! `rotate` 可选 `0`、`90`、`180`、`270`。
//!
//! ## 基本用法
//!
//! ```no_run
//! use shouyu::{FromUrl, input::{GStreamerInputPipelineBuilder, Sampling}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/data/hello.mp4")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//! let frames = input.read_frames(&Sampling::default())?;
//! println!("采样得到 {} 帧", frames.len());
//! # Ok(())
//! # }
//! ```

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Sampling, StrideSampler, decode_url_path};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配，应为 gst://file/<路径>")]
  SchemeMismatch,
  #[error("无效的旋转角度: {0}")]
  InvalidRotation(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 调用失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("管道状态切换失败: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("找不到 appsink")]
  AppSinkNotFound,
  #[error("无法从 caps 解析视频信息")]
  VideoInfoError,
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("解码失败: {0}")]
  DecodeError(String),
  #[error("解码超时: {0}ms 内没有新帧")]
  Stalled(u64),
  #[error("缓冲区过小: 需要 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
}

/// 画面顺时针旋转角度，对应 `videoflip` 的 method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  None,
  Clockwise90,
  Rotate180,
  Clockwise270,
}

impl std::str::FromStr for Rotation {
  type Err = GStreamerInputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "0" => Ok(Rotation::None),
      "90" => Ok(Rotation::Clockwise90),
      "180" => Ok(Rotation::Rotate180),
      "270" => Ok(Rotation::Clockwise270),
      other => Err(GStreamerInputError::InvalidRotation(other.to_string())),
    }
  }
}

impl Rotation {
  fn flip_method(self) -> u32 {
    match self {
      Rotation::None => 0,
      Rotation::Clockwise90 => 1,
      Rotation::Rotate180 => 2,
      Rotation::Clockwise270 => 3,
    }
  }
}

/// 解码管道的各个阶段，按顺序以 ` ! ` 连接
enum PipelineStage {
  Decode(String),
  Rotate(Rotation),
  ToRgb,
  Sink,
}

impl PipelineStage {
  fn describe(&self) -> String {
    match self {
      PipelineStage::Decode(path) => format!("filesrc location=\"{}\" ! decodebin", path),
      PipelineStage::Rotate(rotation) => format!("videoflip method={}", rotation.flip_method()),
      PipelineStage::ToRgb => "videoconvert ! video/x-raw,format=RGB".to_string(),
      // 离线解码不丢帧，抽帧由 StrideSampler 完成
      PipelineStage::Sink => format!("appsink max-buffers=4 sync=false name={}", SINK_NAME),
    }
  }
}

const SINK_NAME: &str = "sink";
/// 每次等待 appsink 的时长（毫秒）
const PULL_INTERVAL_MS: u64 = 100;
/// 连续没有新帧的最长等待（毫秒）
const STALL_TIMEOUT_MS: u64 = 10_000;

/// 视频文件解码管道构建器
pub struct GStreamerInputPipelineBuilder {
  path: String,
  rotation: Rotation,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: &str) -> Self {
    Self {
      path: path.to_string(),
      rotation: Rotation::None,
    }
  }

  pub fn rotate(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  fn description(&self) -> String {
    let mut stages = vec![PipelineStage::Decode(self.path.clone())];
    if self.rotation != Rotation::None {
      stages.push(PipelineStage::Rotate(self.rotation));
    }
    stages.push(PipelineStage::ToRgb);
    stages.push(PipelineStage::Sink);
    stages
      .iter()
      .map(PipelineStage::describe)
      .collect::<Vec<_>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let description = self.description();
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::DecodeError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name(SINK_NAME)
      .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
      .ok_or(GStreamerInputError::AppSinkNotFound)?;

    let input = GStreamerInput { pipeline, appsink };
    input.pipeline.set_state(gst::State::Playing)?;
    Ok(input)
  }
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME || url.host_str() != Some("file") {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let path =
      decode_url_path(url).map_err(|e| GStreamerInputError::DecodeError(e.to_string()))?;
    let rotation = match url.query_pairs().find(|(k, _)| k == "rotate") {
      Some((_, v)) => v.parse()?,
      None => Rotation::None,
    };

    Ok(Self::file(&path.to_string_lossy()).rotate(rotation))
  }
}

/// GStreamer 视频输入
///
/// 持有管道与 appsink，析构时停止管道。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止 GStreamer 管道: {}", e);
    }
  }
}

impl GStreamerInput {
  /// 等待下一帧：`Ok(None)` 表示流已结束，总线上的错误立即返回
  ///
  /// 解码器在状态切换后才可能失败，此时 appsink 既不会收到帧也不会收到 EOS，
  /// 所以按固定间隔轮询总线，连续等待超过 [`STALL_TIMEOUT_MS`] 视为解码卡死。
  fn next_sample(&self) -> Result<Option<gst::Sample>, GStreamerInputError> {
    let mut waited_ms = 0;
    loop {
      if let Some(e) = self.pipeline_error() {
        return Err(e);
      }
      if self.appsink.is_eos() {
        return Ok(None);
      }
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_INTERVAL_MS))
      {
        return Ok(Some(sample));
      }
      waited_ms += PULL_INTERVAL_MS;
      if waited_ms >= STALL_TIMEOUT_MS {
        return Err(GStreamerInputError::Stalled(waited_ms));
      }
      debug!("等待解码帧: {}ms", waited_ms);
    }
  }

  fn pipeline_error(&self) -> Option<GStreamerInputError> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => {
        error!("GStreamer 管道错误: {}", err.error());
        Some(GStreamerInputError::DecodeError(err.error().to_string()))
      }
      _ => None,
    }
  }

  /// 读取并抽帧，帧数不超过 `sampling.max_frames()`
  ///
  /// 还没有得到任何帧时出错则返回错误；已经有帧时截断并保留已读取的部分。
  pub fn read_frames(self, sampling: &Sampling) -> Result<Vec<Frame>, GStreamerInputError> {
    let mut sampler: Option<StrideSampler> = None;
    let mut frames = Vec::new();

    loop {
      let sample = match self.next_sample() {
        Ok(Some(sample)) => sample,
        Ok(None) => break,
        Err(e) if frames.is_empty() => return Err(e),
        Err(e) => {
          warn!("解码在 {} 帧后中断: {}", frames.len(), e);
          break;
        }
      };

      let caps = sample
        .caps()
        .ok_or_else(|| GStreamerInputError::DecodeError("帧缺少 caps".to_string()))?;
      let video_info =
        gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

      let sampler = sampler.get_or_insert_with(|| {
        let fps = video_info.fps();
        let source_fps = (fps.numer() > 0 && fps.denom() > 0)
          .then(|| fps.numer() as f64 / fps.denom() as f64);
        StrideSampler::new(source_fps, sampling)
      });

      if let Some(timestamp_ms) = sampler.offer() {
        let image = convert_sample_to_rgb(&sample, &video_info)?;
        frames.push(Frame::new(image, frames.len() as u64, timestamp_ms));
      }
      if sampler.is_full() {
        break;
      }
    }

    Ok(frames)
  }
}

fn convert_sample_to_rgb(
  sample: &gst::Sample,
  video_info: &gst_video::VideoInfo,
) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::DecodeError("帧缺少缓冲区".to_string()))?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::DecodeError(format!("无法映射缓冲区: {}", e))
  })?;
  let data = map.as_slice();

  let expected_size = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut rgb = Vec::with_capacity(width * height * 3);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for h in 0..height {
        let row = h * stride;
        rgb.extend_from_slice(&data[row..row + width * 3]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for h in 0..height {
        let row = h * stride;
        for pixel in data[row..row + width * 3].chunks_exact(3) {
          rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
      }
    }
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  }

  RgbImage::from_raw(width as u32, height as u32, rgb).ok_or(GStreamerInputError::BufferSizeMismatch {
    expected: width * height * 3,
    actual: 0,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_description_from_url() {
    let url = Url::parse("gst://file/data/hello%20world.mp4?rotate=90").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(builder.rotation, Rotation::Clockwise90);
    assert_eq!(
      builder.description(),
      "filesrc location=\"/data/hello world.mp4\" ! decodebin ! videoflip method=1 \
       ! videoconvert ! video/x-raw,format=RGB ! appsink max-buffers=4 sync=false name=sink"
    );
  }

  #[test]
  fn rejects_bad_urls() {
    let url = Url::parse("gst://camera/dev/video0").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
    let url = Url::parse("gst://file/a.mp4?rotate=45").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::InvalidRotation(_))
    ));
  }

  #[test]
  fn corrupt_file_fails_instead_of_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.mp4");
    std::fs::write(&path, b"this is not a video container").unwrap();

    let started = std::time::Instant::now();
    let result = GStreamerInputPipelineBuilder::file(&path.to_string_lossy())
      .build()
      .and_then(|input| input.read_frames(&Sampling::default()));
    assert!(result.is_err());
    assert!(started.elapsed().as_millis() < (STALL_TIMEOUT_MS + 5_000) as u128);
  }
}
