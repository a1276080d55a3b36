// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/output.rs - 关键点可视化输出
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

use std::{
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use chrono::{Datelike, Utc};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  landmark::{SLOTS, SlotFrame},
  model::{HAND_SKELETON, Keypoints},
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum RecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("路径解码失败: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

// 槽位 0 为橙色，槽位 1 为青色
const SLOT_COLORS: [[u8; 3]; SLOTS] = [[255, 128, 0], [0, 200, 255]];
const JOINT_RADIUS: i32 = 3;

/// 在图像上绘制两个槽位的手部骨架
#[derive(Debug, Clone)]
pub struct LandmarkDraw {
  colors: [[u8; 3]; SLOTS],
  joint_radius: i32,
}

impl Default for LandmarkDraw {
  fn default() -> Self {
    Self {
      colors: SLOT_COLORS,
      joint_radius: JOINT_RADIUS,
    }
  }
}

impl LandmarkDraw {
  pub fn draw_on_image(&self, image: &mut RgbImage, result: &SlotFrame) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    for slot in 0..SLOTS {
      if !result.present[slot] {
        continue;
      }
      let color = Rgb(self.colors[slot]);
      let points: Vec<(f32, f32)> = result.keypoints[slot]
        .iter()
        .map(|p| (p[0] * w, p[1] * h))
        .collect();

      for (a, b) in HAND_SKELETON {
        draw_line_segment_mut(image, points[a], points[b], color);
      }
      for (x, y) in &points {
        draw_filled_circle_mut(
          image,
          (x.round() as i32, y.round() as i32),
          self.joint_radius,
          color,
        );
      }
    }
  }

  pub fn draw(&self, frame: &Frame, result: &SlotFrame) -> RgbImage {
    let mut image = frame.image.clone();
    self.draw_on_image(&mut image, result);
    image
  }
}

/// 与图像同名的 JSON 关键点记录
#[derive(Debug, Serialize)]
struct LandmarkRecord<'a> {
  frame_index: u64,
  timestamp_ms: u64,
  present: [bool; SLOTS],
  keypoints: [Option<&'a Keypoints>; SLOTS],
}

impl<'a> LandmarkRecord<'a> {
  fn new(frame: &Frame, result: &'a SlotFrame) -> Self {
    let mut keypoints = [None; SLOTS];
    for (slot, item) in keypoints.iter_mut().enumerate() {
      if result.present[slot] {
        *item = Some(&result.keypoints[slot]);
      }
    }
    Self {
      frame_index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      present: result.present,
      keypoints,
    }
  }
}

/// 按日期分目录保存可视化结果：`<dir>/<YYYY>/<MM>/<DD>/<HH-MM-SS>-<NNNN>.png`
///
/// URL 形如 `record:///tmp/inspect?record&always`；`record` 时额外写出 JSON，
/// 未指定 `always` 时跳过没有手的帧。
pub struct LandmarkRecordOutput {
  directory: PathBuf,
  draw: LandmarkDraw,
  record: bool,
  always: bool,
  frame_counters: Arc<Mutex<u16>>,
}

impl FromUrlWithScheme for LandmarkRecordOutput {
  const SCHEME: &'static str = "record";
}

impl FromUrl for LandmarkRecordOutput {
  type Error = RecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(RecordOutputError::SchemeMismatch);
    }

    let record = uri.query_pairs().any(|(k, _)| k == "record");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(LandmarkRecordOutput {
      directory: PathBuf::from(urlencoding::decode(uri.path())?.into_owned()),
      draw: LandmarkDraw::default(),
      record,
      always,
      frame_counters: Arc::new(Mutex::new(0)),
    })
  }
}

impl LandmarkRecordOutput {
  pub fn new<P: AsRef<Path>>(directory: P) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      draw: LandmarkDraw::default(),
      record: false,
      always: true,
      frame_counters: Arc::new(Mutex::new(0)),
    }
  }

  pub fn with_record(mut self, record: bool) -> Self {
    self.record = record;
    self
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counters
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  fn frame_path(&self) -> Result<PathBuf, RecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<Frame, SlotFrame> for LandmarkRecordOutput {
  type Error = RecordOutputError;

  fn render_result(&self, frame: &Frame, result: &SlotFrame) -> Result<(), Self::Error> {
    if !self.always && !result.any_present() {
      return Ok(());
    }

    let path = self.frame_path()?;
    self.draw.draw(frame, result).save(&path)?;
    if self.record {
      let record = LandmarkRecord::new(frame, result);
      std::fs::write(path.with_extension("json"), serde_json::to_vec(&record)?)?;
    }
    debug!("第 {} 帧可视化已保存到 {}", frame.index, path.display());
    Ok(())
  }
}
