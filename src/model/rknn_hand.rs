// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/model/rknn_hand.rs - RKNN 手部关键点模型
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

use std::sync::Arc;

use image::{RgbImage, imageops};
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::decode_url_path,
  model::{HandDetection, HandModel, HandSession, Keypoints, NUM_LANDMARKS},
};

const HAND_NUM_INPUTS: u32 = 1;
const HAND_MIN_OUTPUTS: u32 = 3;
const HAND_INPUT_SIZE: u32 = 224;
const HAND_LANDMARK_LEN: usize = NUM_LANDMARKS * 3;
const HAND_PRESENCE_THRESH: f32 = 0.5;
/// 跟踪区域相对关键点包围盒的放大倍数
const ROI_SCALE: f32 = 1.5;
const ROI_MIN_SIDE: u32 = 16;
/// 两个跟踪区域锁定同一只手的判定距离（归一化坐标）
const DUPLICATE_WRIST_DISTANCE: f32 = 0.05;
const TRACKS: usize = 2;

#[derive(Error, Debug)]
pub enum RknnHandError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("模型输出错误: {0}")]
  OutputError(String),
}

impl RknnHandError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnHandError::ModelInvalid(msg.to_string(), e)
  }
}

/// 单手关键点网络（224×224 RGB NHWC u8 输入；输出 63 个关键点坐标、存在分数、左右手分数）
///
/// 模型文件只读取一次，每个会话创建独立的推理上下文。
pub struct RknnHandModel {
  model_data: Arc<[u8]>,
  presence_threshold: f32,
}

pub struct RknnHandModelBuilder {
  model_path: String,
  presence_threshold: f32,
}

impl FromUrlWithScheme for RknnHandModelBuilder {
  const SCHEME: &'static str = "rknn-hand";
}

impl FromUrl for RknnHandModelBuilder {
  type Error = RknnHandError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnHandError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let model_path = decode_url_path(url)
      .map_err(|e| RknnHandError::ModelPathError(e.to_string()))?
      .to_string_lossy()
      .into_owned();
    let presence_threshold = url
      .query_pairs()
      .find(|(k, _)| k == "presence")
      .and_then(|(_, v)| v.parse::<f32>().ok())
      .unwrap_or(HAND_PRESENCE_THRESH);

    Ok(RknnHandModelBuilder {
      model_path,
      presence_threshold,
    })
  }
}

impl RknnHandModelBuilder {
  pub fn presence_threshold(mut self, threshold: f32) -> Self {
    self.presence_threshold = threshold;
    self
  }

  pub fn build(self) -> Result<RknnHandModel, RknnHandError> {
    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let model = RknnHandModel {
      model_data: model_data.into(),
      presence_threshold: self.presence_threshold,
    };
    // 先创建一次上下文，尽早暴露模型格式问题
    let probe = model.create_context()?;
    drop(probe);
    info!("模型加载完成");

    Ok(model)
  }
}

impl RknnHandModel {
  fn create_context(&self) -> Result<(Context, u32), RknnHandError> {
    let context = Context::new(&self.model_data, InitFlags::default())?;

    if let Ok(version) = context.sdk_version() {
      if let Ok(api_ver) = version.api_version() {
        debug!("模型 API 版本: {}", api_ver);
      }
      if let Ok(drv_ver) = version.driver_version() {
        debug!("模型驱动版本: {}", drv_ver);
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnHandError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnHandError::invalid("无法获取输出数量", e))?;

    if num_inputs != HAND_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        HAND_NUM_INPUTS, num_inputs
      );
      return Err(RknnHandError::invalid(
        &format!(
          "预期模型输入数量为 {}, 实际为 {}",
          HAND_NUM_INPUTS, num_inputs
        ),
        rknpu::Error::InvalidModel,
      ));
    }

    if num_outputs < HAND_MIN_OUTPUTS {
      error!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        HAND_MIN_OUTPUTS, num_outputs
      );
      return Err(RknnHandError::invalid(
        &format!(
          "预期模型输出数量至少为 {}, 实际为 {}",
          HAND_MIN_OUTPUTS, num_outputs
        ),
        rknpu::Error::InvalidModel,
      ));
    }

    Ok((context, num_outputs))
  }
}

impl HandModel for RknnHandModel {
  type Session = RknnHandSession;
  type Error = RknnHandError;

  fn open_session(&self) -> Result<Self::Session, Self::Error> {
    let (context, num_outputs) = self.create_context()?;
    debug!("创建检测会话");
    Ok(RknnHandSession {
      context,
      num_outputs,
      presence_threshold: self.presence_threshold,
      tracks: [None; TRACKS],
    })
  }
}

/// 像素坐标下的正方形（或半幅）裁剪区域
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
  x: u32,
  y: u32,
  width: u32,
  height: u32,
}

impl Roi {
  /// 无跟踪历史时扫描左右半幅
  fn half(track: usize, frame_w: u32, frame_h: u32) -> Self {
    let half_w = (frame_w / 2).max(1);
    Roi {
      x: if track == 0 { 0 } else { frame_w - half_w },
      y: 0,
      width: half_w,
      height: frame_h,
    }
  }

  /// 以关键点包围盒为中心放大得到下一帧的跟踪区域
  fn around(keypoints: &Keypoints, frame_w: u32, frame_h: u32) -> Self {
    let (w, h) = (frame_w as f32, frame_h as f32);
    let (mut x_min, mut y_min, mut x_max, mut y_max) = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
    for [x, y, _] in keypoints {
      x_min = x_min.min(x * w);
      y_min = y_min.min(y * h);
      x_max = x_max.max(x * w);
      y_max = y_max.max(y * h);
    }

    let limit = frame_w.min(frame_h);
    let side = ((x_max - x_min).max(y_max - y_min) * ROI_SCALE) as u32;
    let side = side.clamp(ROI_MIN_SIDE.min(limit), limit).max(1);
    let cx = (x_min + x_max) / 2.0;
    let cy = (y_min + y_max) / 2.0;
    let x = (cx - side as f32 / 2.0).clamp(0.0, (frame_w - side) as f32) as u32;
    let y = (cy - side as f32 / 2.0).clamp(0.0, (frame_h - side) as f32) as u32;

    Roi {
      x,
      y,
      width: side,
      height: side,
    }
  }
}

/// RKNN 检测会话，持有独立的推理上下文与两个跟踪区域
pub struct RknnHandSession {
  context: Context,
  num_outputs: u32,
  presence_threshold: f32,
  tracks: [Option<Roi>; TRACKS],
}

struct HandInference {
  landmarks: Vec<f32>,
  presence: f32,
  handedness: f32,
}

impl RknnHandSession {
  fn infer(&self, input: &RgbImage) -> Result<HandInference, RknnHandError> {
    self
      .context
      .set_input(0, input.as_raw(), TensorFormat::NHWC, TensorType::UInt8)?;
    self.context.run()?;
    let output = self.context.get_outputs()?;

    // 按张量大小识别输出：63 为关键点，长度 1 的依次为存在分数与左右手分数
    let mut landmarks = None;
    let mut scalars = Vec::with_capacity(2);
    for idx in 0..self.num_outputs as usize {
      let tensor = output
        .get_f32(idx)
        .map_err(|e| RknnHandError::OutputError(format!("获取第 {} 个输出失败: {}", idx, e)))?;
      if tensor.len() == HAND_LANDMARK_LEN && landmarks.is_none() {
        landmarks = Some(tensor.to_vec());
      } else if tensor.len() == 1 {
        scalars.push(tensor[0]);
      }
    }

    let landmarks =
      landmarks.ok_or_else(|| RknnHandError::OutputError("缺少关键点输出".to_string()))?;
    let presence = scalars
      .first()
      .copied()
      .map(to_probability)
      .ok_or_else(|| RknnHandError::OutputError("缺少存在分数输出".to_string()))?;
    let handedness = scalars.get(1).copied().map(to_probability).unwrap_or(0.5);

    Ok(HandInference {
      landmarks,
      presence,
      handedness,
    })
  }
}

impl HandSession for RknnHandSession {
  type Error = RknnHandError;

  fn detect(&mut self, frame: &Frame) -> Result<Vec<HandDetection>, Self::Error> {
    let (frame_w, frame_h) = (frame.width(), frame.height());
    if frame_w < 2 || frame_h < 2 {
      return Ok(Vec::new());
    }

    let mut found: Vec<(usize, HandDetection, f32)> = Vec::with_capacity(TRACKS);
    for track in 0..TRACKS {
      let roi = self.tracks[track].unwrap_or_else(|| Roi::half(track, frame_w, frame_h));
      let crop = imageops::crop_imm(&frame.image, roi.x, roi.y, roi.width, roi.height).to_image();
      let input = imageops::resize(
        &crop,
        HAND_INPUT_SIZE,
        HAND_INPUT_SIZE,
        imageops::FilterType::Triangle,
      );

      let inference = self.infer(&input)?;
      if inference.presence < self.presence_threshold {
        self.tracks[track] = None;
        continue;
      }

      let sx = roi.width as f32 / HAND_INPUT_SIZE as f32;
      let sy = roi.height as f32 / HAND_INPUT_SIZE as f32;
      let mut keypoints: Keypoints = [[0.0; 3]; NUM_LANDMARKS];
      for (j, point) in keypoints.iter_mut().enumerate() {
        let lx = inference.landmarks[j * 3];
        let ly = inference.landmarks[j * 3 + 1];
        let lz = inference.landmarks[j * 3 + 2];
        *point = [
          (roi.x as f32 + lx * sx) / frame_w as f32,
          (roi.y as f32 + ly * sy) / frame_h as f32,
          lz * sx / frame_w as f32,
        ];
      }

      self.tracks[track] = Some(Roi::around(&keypoints, frame_w, frame_h));
      found.push((
        track,
        HandDetection::new(keypoints, inference.handedness),
        inference.presence,
      ));
    }

    if let [(track_a, a, score_a), (track_b, b, score_b)] = found.as_slice() {
      let [ax, ay] = a.wrist();
      let [bx, by] = b.wrist();
      if ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt() < DUPLICATE_WRIST_DISTANCE {
        let (drop_track, keep) = if score_a >= score_b {
          (*track_b, a.clone())
        } else {
          (*track_a, b.clone())
        };
        debug!("跟踪区域 {} 与另一区域重复，丢弃", drop_track);
        self.tracks[drop_track] = None;
        return Ok(vec![keep]);
      }
    }

    Ok(found.into_iter().map(|(_, detection, _)| detection).collect())
  }
}

/// 输出可能是 logit 也可能已经过 sigmoid
fn to_probability(value: f32) -> f32 {
  if (0.0..=1.0).contains(&value) {
    value
  } else {
    1.0 / (1.0 + (-value).exp())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roi_stays_inside_frame() {
    let mut keypoints: Keypoints = [[0.95, 0.95, 0.0]; NUM_LANDMARKS];
    keypoints[4] = [0.99, 0.99, 0.0];
    let roi = Roi::around(&keypoints, 100, 80);
    assert!(roi.x + roi.width <= 100);
    assert!(roi.y + roi.height <= 80);
    assert_eq!(roi.width, roi.height);
  }

  #[test]
  fn half_rois_cover_both_sides() {
    assert_eq!(Roi::half(0, 101, 50).x, 0);
    let right = Roi::half(1, 101, 50);
    assert_eq!(right.x + right.width, 101);
  }

  #[test]
  fn probability_passthrough_and_sigmoid() {
    assert_eq!(to_probability(0.7), 0.7);
    assert!((to_probability(0.0) - 0.0).abs() < 1e-6);
    assert!(to_probability(4.0) > 0.98);
    assert!(to_probability(-4.0) < 0.02);
  }
}
