// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/embed.rs - 时间重采样与描述子
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

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::EmbedderConfig,
  frame::Frame,
  input::{Clip, FrameLoader},
  landmark::{ExtractError, LandmarkSequence, SLOTS, extract_landmarks},
  model::HandModel,
  sequence::{Normalizer, POSE_DIM, PoseRow, SequenceError},
};

/// 时间统计部分的维度：均值、标准差、一阶差分均值
pub const TEMPORAL_DIM: usize = 3 * POSE_DIM;
/// 手腕位置统计的维度
pub const WRIST_DIM: usize = 10;
/// 默认的手部覆盖率下限
pub const DEFAULT_COVERAGE_THRESHOLD: f32 = 0.3;

/// 描述子维度
pub const fn descriptor_dim(wrist_features: bool) -> usize {
  if wrist_features {
    TEMPORAL_DIM + WRIST_DIM
  } else {
    TEMPORAL_DIM
  }
}

#[derive(Error, Debug)]
pub enum EmbedError {
  #[error("no frames: 无法从 {0} 读取任何帧")]
  NoFrames(String),
  #[error("no detection: 片段中没有检测到任何手")]
  NoDetection,
  #[error("关键点提取失败: {0}")]
  Extract(#[from] ExtractError),
}

impl From<SequenceError> for EmbedError {
  fn from(e: SequenceError) -> Self {
    match e {
      SequenceError::NoDetection => EmbedError::NoDetection,
    }
  }
}

/// 逐维线性插值，把 L 帧重采样到 `target` 帧
///
/// 源与目标都均匀分布在 [0, 1] 上。L == target 时原样返回，
/// L == 0 时返回全零，L == 1 时复制。
pub fn resample<const D: usize>(rows: &[[f32; D]], target: usize) -> Vec<[f32; D]> {
  let len = rows.len();
  if len == target {
    return rows.to_vec();
  }
  match len {
    0 => return vec![[0.0; D]; target],
    1 => return vec![rows[0]; target],
    _ => {}
  }

  let last = (len - 1) as f64;
  (0..target)
    .map(|i| {
      let x = if target > 1 {
        i as f64 / (target - 1) as f64
      } else {
        0.0
      };
      let position = x * last;
      let lo = (position.floor() as usize).min(len - 1);
      let hi = (lo + 1).min(len - 1);
      let frac = position - lo as f64;

      let mut row = [0.0; D];
      for (d, value) in row.iter_mut().enumerate() {
        let (a, b) = (rows[lo][d] as f64, rows[hi][d] as f64);
        *value = (a + (b - a) * frac) as f32;
      }
      row
    })
    .collect()
}

/// 每维的均值、总体标准差与一阶差分均值，依次拼接
pub fn temporal_stats(rows: &[PoseRow]) -> Vec<f32> {
  let mut stats = vec![0.0f32; TEMPORAL_DIM];
  if rows.is_empty() {
    return stats;
  }
  let n = rows.len() as f64;

  for d in 0..POSE_DIM {
    let mean = rows.iter().map(|r| r[d] as f64).sum::<f64>() / n;
    let variance = rows
      .iter()
      .map(|r| (r[d] as f64 - mean).powi(2))
      .sum::<f64>()
      / n;
    let velocity = if rows.len() > 1 {
      rows
        .windows(2)
        .map(|pair| (pair[1][d] - pair[0][d]) as f64)
        .sum::<f64>()
        / (rows.len() - 1) as f64
    } else {
      0.0
    };

    stats[d] = mean as f32;
    stats[POSE_DIM + d] = variance.sqrt() as f32;
    stats[2 * POSE_DIM + d] = velocity as f32;
  }
  stats
}

fn mean_std(values: &[f64]) -> (f64, f64) {
  if values.is_empty() {
    return (0.0, 0.0);
  }
  let n = values.len() as f64;
  let mean = values.iter().sum::<f64>() / n;
  let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
  (mean, variance.sqrt())
}

/// 手腕位置统计
///
/// 每个槽位依次为 mean(x, y)、std(x, y)，只统计观测到手腕的帧；
/// 最后两维是两只手同时出现时手腕间距的均值与标准差。
pub fn wrist_stats(wrists: &[[Option<[f32; 2]>; SLOTS]]) -> [f32; WRIST_DIM] {
  let mut stats = [0.0f32; WRIST_DIM];

  for slot in 0..SLOTS {
    let observed: Vec<[f32; 2]> = wrists.iter().filter_map(|w| w[slot]).collect();
    if observed.is_empty() {
      continue;
    }
    let xs: Vec<f64> = observed.iter().map(|w| w[0] as f64).collect();
    let ys: Vec<f64> = observed.iter().map(|w| w[1] as f64).collect();
    let (mx, sx) = mean_std(&xs);
    let (my, sy) = mean_std(&ys);
    stats[slot * 4..slot * 4 + 4].copy_from_slice(&[mx as f32, my as f32, sx as f32, sy as f32]);
  }

  let distances: Vec<f64> = wrists
    .iter()
    .filter_map(|w| match (w[0], w[1]) {
      (Some(a), Some(b)) => {
        Some((((a[0] - b[0]) as f64).powi(2) + ((a[1] - b[1]) as f64).powi(2)).sqrt())
      }
      _ => None,
    })
    .collect();
  let (mean, std) = mean_std(&distances);
  stats[8] = mean as f32;
  stats[9] = std as f32;

  stats
}

/// 片段 → 定长描述子
///
/// 模型可在多个嵌入调用间共享，每次调用都会打开独立的检测会话。
pub struct Embedder<M: HandModel> {
  model: M,
  loader: FrameLoader,
  normalizer: Normalizer,
  target_frames: usize,
  wrist_features: bool,
}

impl<M: HandModel> Embedder<M> {
  pub fn new(model: M, config: &EmbedderConfig) -> Self {
    Self {
      model,
      loader: FrameLoader::new(config.sampling()),
      normalizer: config.normalizer(),
      target_frames: config.target_frames,
      wrist_features: config.wrist_features,
    }
  }

  pub fn dim(&self) -> usize {
    descriptor_dim(self.wrist_features)
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn loader(&self) -> &FrameLoader {
    &self.loader
  }

  /// 读取片段并提取逐帧关键点
  pub fn landmarks(&self, clip: &Clip, mirror: bool) -> Result<(Vec<Frame>, LandmarkSequence), EmbedError> {
    let frames = self.loader.load(clip, mirror);
    if frames.is_empty() {
      return Err(EmbedError::NoFrames(clip.to_string()));
    }
    let sequence = extract_landmarks(&self.model, &frames)?;
    Ok((frames, sequence))
  }

  pub fn embed(&self, clip: &Clip, mirror: bool) -> Result<Vec<f32>, EmbedError> {
    self
      .landmarks(clip, mirror)
      .and_then(|(_, sequence)| self.embed_sequence(&sequence))
      .inspect_err(|e| {
        warn!("片段 {} (镜像: {}) 无法生成描述子: {}", clip, mirror, e);
      })
  }

  /// 直接对已经解码的帧生成描述子
  pub fn embed_frames(&self, frames: &[Frame]) -> Result<Vec<f32>, EmbedError> {
    if frames.is_empty() {
      return Err(EmbedError::NoFrames("<帧序列>".to_string()));
    }
    let sequence = extract_landmarks(&self.model, frames)?;
    self.embed_sequence(&sequence)
  }

  pub fn embed_sequence(&self, sequence: &LandmarkSequence) -> Result<Vec<f32>, EmbedError> {
    let normalized = self.normalizer.normalize(sequence)?;
    let resampled = resample(&normalized.poses, self.target_frames);

    let mut descriptor = temporal_stats(&resampled);
    if self.wrist_features {
      descriptor.extend_from_slice(&wrist_stats(&normalized.wrists));
    }
    debug!(
      "描述子: {} 帧 → {} 帧, {} 维",
      normalized.poses.len(),
      resampled.len(),
      descriptor.len()
    );
    Ok(descriptor)
  }

  /// 手部覆盖率是否达到 `threshold`；无法读取或提取失败时为 false
  pub fn has_sufficient_coverage(&self, clip: &Clip, threshold: f32) -> bool {
    match self.landmarks(clip, false) {
      Ok((_, sequence)) => {
        let coverage = sequence.hand_coverage();
        debug!("片段 {} 手部覆盖率 {:.2}", clip, coverage);
        coverage >= threshold
      }
      Err(e) => {
        warn!("片段 {} 覆盖率检查失败: {}", clip, e);
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resample_identity_and_degenerate_lengths() {
    let rows: Vec<[f32; 2]> = (0..5).map(|i| [i as f32, -(i as f32)]).collect();
    assert_eq!(resample(&rows, 5), rows);

    let single = resample(&[[3.0f32, 4.0]], 4);
    assert_eq!(single, vec![[3.0, 4.0]; 4]);

    let empty: Vec<[f32; 2]> = resample(&[], 3);
    assert_eq!(empty, vec![[0.0, 0.0]; 3]);
  }

  #[test]
  fn resample_interpolates_linearly() {
    let rows = [[0.0f32], [1.0], [4.0]];
    let out = resample(&rows, 5);
    let expected = [0.0, 0.5, 1.0, 2.5, 4.0];
    for (row, e) in out.iter().zip(expected.iter()) {
      assert!((row[0] - e).abs() < 1e-6, "{} vs {}", row[0], e);
    }

    let down = resample(&[[0.0f32], [1.0], [2.0], [3.0], [4.0]], 3);
    assert!((down[1][0] - 2.0).abs() < 1e-6);
    assert!((down[2][0] - 4.0).abs() < 1e-6);
  }

  #[test]
  fn temporal_stats_layout() {
    let mut rows = vec![[0.0; POSE_DIM]; 3];
    rows[0][0] = 1.0;
    rows[1][0] = 2.0;
    rows[2][0] = 6.0;
    let stats = temporal_stats(&rows);
    assert_eq!(stats.len(), TEMPORAL_DIM);
    assert!((stats[0] - 3.0).abs() < 1e-6);
    // 总体标准差：sqrt(((1-3)^2 + (2-3)^2 + (6-3)^2) / 3)
    assert!((stats[POSE_DIM] - (14.0f32 / 3.0).sqrt()).abs() < 1e-5);
    assert!((stats[2 * POSE_DIM] - 2.5).abs() < 1e-6);
    assert!(stats[1..POSE_DIM].iter().all(|v| *v == 0.0));
  }

  #[test]
  fn single_frame_has_zero_velocity() {
    let stats = temporal_stats(&[[0.7; POSE_DIM]]);
    assert!(stats[2 * POSE_DIM..].iter().all(|v| *v == 0.0));
    assert!(stats[POSE_DIM..2 * POSE_DIM].iter().all(|v| *v == 0.0));
  }

  #[test]
  fn wrist_stats_per_slot_and_distance() {
    let wrists = vec![
      [Some([0.2, 0.5]), None],
      [Some([0.4, 0.5]), Some([0.8, 0.5])],
      [None, Some([0.8, 0.5])],
    ];
    let stats = wrist_stats(&wrists);
    assert!((stats[0] - 0.3).abs() < 1e-6);
    assert!((stats[1] - 0.5).abs() < 1e-6);
    assert!((stats[2] - 0.1).abs() < 1e-6);
    assert!(stats[3].abs() < 1e-6);
    assert!((stats[4] - 0.8).abs() < 1e-6);
    assert!(stats[6].abs() < 1e-6);
    // 只有第 1 帧两只手同时出现
    assert!((stats[8] - 0.4).abs() < 1e-6);
    assert!(stats[9].abs() < 1e-6);
  }

  #[test]
  fn wrist_stats_without_observations_is_zero() {
    assert_eq!(wrist_stats(&[[None, None]; 4]), [0.0; WRIST_DIM]);
    assert_eq!(wrist_stats(&[]), [0.0; WRIST_DIM]);
  }

  #[test]
  fn descriptor_dimensions() {
    assert_eq!(descriptor_dim(false), 378);
    assert_eq!(descriptor_dim(true), 388);
  }
}
