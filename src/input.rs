// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/input.rs - 视频/图像片段输入
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

//! # 帧加载
//!
//! 片段以 URI 描述，按方案分派到具体输入：
//!
//! - `image:///path/clip.gif` - 动图（按每帧显示时长累计时间戳）或静态图片
//! - `gst://file/path/clip.mp4` - GStreamer 可解码的视频（恒定帧率，按步长抽帧，
//!   需启用 `gstreamer_input` 特性）
//!
//! 另外 [`MemoryClip`] 提供内存中的片段，走与动图相同的按时长采样路径。
//!
//! 所有输入都受 [`Sampling`] 约束：输出帧数不超过 `sample_fps × max_seconds`，
//! 时间戳严格递增。

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

mod read_image_file;
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder, Rotation,
};

/// 源帧率未知时的回退值
const FALLBACK_SOURCE_FPS: f64 = 30.0;
/// 单帧最短显示时长（毫秒）
const MIN_FRAME_DURATION_MS: f64 = 1.0;
/// 采样帧率上限，超过后毫秒时间戳无法区分相邻帧
pub const MAX_SAMPLE_FPS: f32 = 1000.0;
/// 容器未给出显示时长时的默认值（毫秒）
pub const DEFAULT_FRAME_DURATION_MS: u32 = 100;

const IMAGE_EXTENSIONS: [&str; 6] = ["gif", "png", "jpg", "jpeg", "bmp", "webp"];
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "webm", "mov", "avi", "mkv", "m4v"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无法识别的片段路径: {0}")]
  UnsupportedPath(String),
  #[error("URI 路径解码失败: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  #[error("URI 解析错误: {0}")]
  UrlError(#[from] url::ParseError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 采样参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
  /// 目标采样帧率
  pub sample_fps: f32,
  /// 最长时长（秒）
  pub max_seconds: f32,
}

impl Default for Sampling {
  fn default() -> Self {
    Self {
      sample_fps: 15.0,
      max_seconds: 4.0,
    }
  }
}

impl Sampling {
  pub fn max_frames(&self) -> usize {
    (self.sample_fps * self.max_seconds).floor().max(0.0) as usize
  }

  fn interval_ms(&self) -> f64 {
    1000.0 / self.sample_fps as f64
  }
}

/// 恒定帧率源的抽帧器：每 `round(source_fps / sample_fps)` 帧保留一帧
#[derive(Debug)]
pub struct StrideSampler {
  stride: u64,
  interval_ms: f64,
  max_frames: usize,
  seen: u64,
  kept: usize,
  last_timestamp_ms: Option<u64>,
}

impl StrideSampler {
  pub fn new(source_fps: Option<f64>, sampling: &Sampling) -> Self {
    let source_fps = source_fps
      .filter(|fps| fps.is_finite() && *fps > 1e-3)
      .unwrap_or(FALLBACK_SOURCE_FPS);
    let stride = ((source_fps / sampling.sample_fps as f64).round() as u64).max(1);
    debug!("源帧率 {:.2}, 抽帧步长 {}", source_fps, stride);

    Self {
      stride,
      interval_ms: sampling.interval_ms(),
      max_frames: sampling.max_frames(),
      seen: 0,
      kept: 0,
      last_timestamp_ms: None,
    }
  }

  pub fn stride(&self) -> u64 {
    self.stride
  }

  pub fn is_full(&self) -> bool {
    self.kept >= self.max_frames
  }

  /// 送入下一源帧，返回 `Some(timestamp_ms)` 表示该帧被保留
  pub fn offer(&mut self) -> Option<u64> {
    if self.is_full() {
      return None;
    }
    let position = self.seen;
    self.seen += 1;
    if position % self.stride != 0 {
      return None;
    }
    let mut timestamp_ms = (self.kept as f64 * self.interval_ms) as u64;
    // 时间戳必须严格递增
    if let Some(last) = self.last_timestamp_ms {
      timestamp_ms = timestamp_ms.max(last + 1);
    }
    self.last_timestamp_ms = Some(timestamp_ms);
    self.kept += 1;
    Some(timestamp_ms)
  }
}

/// 带每帧显示时长的源的采样器
///
/// 时间戳直接由显示时长累加得到；当某帧的显示区间覆盖下一个采样时刻时保留该帧。
#[derive(Debug)]
pub struct DurationSampler {
  interval_ms: f64,
  max_frames: usize,
  max_ms: f64,
  elapsed_ms: f64,
  next_due_ms: f64,
  kept: usize,
}

impl DurationSampler {
  pub fn new(sampling: &Sampling) -> Self {
    Self {
      interval_ms: sampling.interval_ms(),
      max_frames: sampling.max_frames(),
      max_ms: sampling.max_seconds as f64 * 1000.0,
      elapsed_ms: 0.0,
      next_due_ms: 0.0,
      kept: 0,
    }
  }

  pub fn is_full(&self) -> bool {
    self.kept >= self.max_frames || self.elapsed_ms >= self.max_ms
  }

  /// 送入下一源帧及其显示时长，返回 `Some(timestamp_ms)` 表示该帧被保留
  pub fn offer(&mut self, duration_ms: f64) -> Option<u64> {
    if self.is_full() {
      return None;
    }
    let start = self.elapsed_ms;
    let end = start + duration_ms.max(MIN_FRAME_DURATION_MS);
    self.elapsed_ms = end;

    if end <= self.next_due_ms {
      return None;
    }
    while self.next_due_ms < end {
      self.next_due_ms += self.interval_ms;
    }
    self.kept += 1;
    Some(start as u64)
  }
}

/// 内存中的片段：每帧图像及其显示时长（毫秒）
#[derive(Debug, Clone, Default)]
pub struct MemoryClip {
  frames: Vec<(RgbImage, u32)>,
}

impl MemoryClip {
  pub fn new() -> Self {
    Self::default()
  }

  /// 以恒定帧率构造
  pub fn from_images(images: Vec<RgbImage>, fps: f32) -> Self {
    let duration = (1000.0 / fps).round().max(1.0) as u32;
    Self {
      frames: images.into_iter().map(|image| (image, duration)).collect(),
    }
  }

  pub fn push(&mut self, image: RgbImage, duration_ms: u32) {
    self.frames.push((image, duration_ms));
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  fn sample(&self, sampling: &Sampling) -> Vec<Frame> {
    let mut sampler = DurationSampler::new(sampling);
    let mut frames = Vec::new();
    for (image, duration_ms) in &self.frames {
      if sampler.is_full() {
        break;
      }
      if let Some(timestamp_ms) = sampler.offer(*duration_ms as f64) {
        frames.push(Frame::new(image.clone(), frames.len() as u64, timestamp_ms));
      }
    }
    frames
  }
}

/// 待处理片段
#[derive(Debug, Clone)]
pub enum Clip {
  Url(Url),
  Memory(MemoryClip),
}

impl From<Url> for Clip {
  fn from(url: Url) -> Self {
    Clip::Url(url)
  }
}

impl From<MemoryClip> for Clip {
  fn from(clip: MemoryClip) -> Self {
    Clip::Memory(clip)
  }
}

impl std::fmt::Display for Clip {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Clip::Url(url) => write!(f, "{}", url),
      Clip::Memory(clip) => write!(f, "<内存片段: {} 帧>", clip.len()),
    }
  }
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }

    if url.scheme() == ImageFileInput::SCHEME {
      let input = ImageFileInput::from_url(url)?;
      return Ok(InputWrapper::ReadImageFile(input));
    }

    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl InputWrapper {
  pub fn read_frames(self, sampling: &Sampling) -> Result<Vec<Frame>, InputError> {
    match self {
      InputWrapper::ReadImageFile(input) => Ok(input.read_frames(sampling)?),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => Ok(input.read_frames(sampling)?),
    }
  }
}

/// 帧加载器
///
/// 无法读取的源返回空序列（并记录告警），由调用方视为 "no frames" 错误。
#[derive(Debug, Clone, Default)]
pub struct FrameLoader {
  sampling: Sampling,
}

impl FrameLoader {
  pub fn new(sampling: Sampling) -> Self {
    Self { sampling }
  }

  pub fn sampling(&self) -> &Sampling {
    &self.sampling
  }

  pub fn load(&self, clip: &Clip, mirror: bool) -> Vec<Frame> {
    let frames = match clip {
      Clip::Url(url) => {
        match InputWrapper::from_url(url).and_then(|input| input.read_frames(&self.sampling)) {
          Ok(frames) => frames,
          Err(e) => {
            warn!("无法读取片段 {}: {}", url, e);
            Vec::new()
          }
        }
      }
      Clip::Memory(clip) => clip.sample(&self.sampling),
    };
    debug!("片段 {} 采样得到 {} 帧", clip, frames.len());

    if mirror {
      frames.into_iter().map(Frame::mirrored).collect()
    } else {
      frames
    }
  }
}

fn extension_of(path: &Path) -> Option<String> {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.to_ascii_lowercase())
}

/// 是否为可处理的片段文件
pub fn is_clip_path(path: &Path) -> bool {
  extension_of(path).is_some_and(|ext| {
    IMAGE_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str())
  })
}

/// 根据文件扩展名为本地文件构造片段 URI
pub fn clip_url_for_path(path: &Path) -> Result<Url, InputError> {
  let ext = extension_of(path)
    .ok_or_else(|| InputError::UnsupportedPath(path.display().to_string()))?;
  let absolute = std::path::absolute(path)?;
  let encoded = absolute
    .to_string_lossy()
    .split('/')
    .map(|part| urlencoding::encode(part).into_owned())
    .collect::<Vec<_>>()
    .join("/");

  if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
    Ok(Url::parse(&format!("{}://{}", ImageFileInput::SCHEME, encoded))?)
  } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
    Ok(Url::parse(&format!("gst://file{}", encoded))?)
  } else {
    Err(InputError::UnsupportedPath(path.display().to_string()))
  }
}

/// 命令行参数中的片段：合法 URI 原样使用，否则视为本地路径
pub fn parse_clip_arg(arg: &str) -> Result<Url, InputError> {
  match Url::parse(arg) {
    Ok(url) if url.scheme().len() > 1 => Ok(url),
    _ => clip_url_for_path(Path::new(arg)),
  }
}

/// 解码 URI 中的百分号编码路径
pub(crate) fn decode_url_path(url: &Url) -> Result<PathBuf, InputError> {
  let decoded = urlencoding::decode(url.path())?;
  Ok(PathBuf::from(decoded.into_owned()))
}
