// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/sequence.rs - 关键点序列归一化
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

use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use crate::{
  landmark::{LandmarkSequence, SLOTS, SlotFrame},
  model::{MIDDLE_MCP, NUM_LANDMARKS, WRIST},
};

/// 单只手展平后的维度 (21 × 3)
pub const HAND_DIM: usize = NUM_LANDMARKS * 3;
/// 单帧展平后的维度 (2 × 21 × 3)
pub const POSE_DIM: usize = SLOTS * HAND_DIM;
/// 手掌尺度过小时不缩放
const MIN_HAND_SCALE: f32 = 1e-6;

/// 展平的单帧：`slot * 63 + joint * 3 + axis`
pub type PoseRow = [f32; POSE_DIM];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SequenceError {
  #[error("no detection: 片段中没有检测到任何手")]
  NoDetection,
}

/// 归一化后的序列
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSequence {
  pub poses: Vec<PoseRow>,
  /// 裁剪后（未插值）的原始手腕观测
  pub wrists: Vec<[Option<[f32; 2]>; SLOTS]>,
}

/// 有手出现的帧区间，两侧各扩展 `margin` 帧
pub fn activity_span(frames: &[SlotFrame], margin: usize) -> Option<Range<usize>> {
  let first = frames.iter().position(SlotFrame::any_present)?;
  let last = frames.iter().rposition(SlotFrame::any_present)?;
  let start = first.saturating_sub(margin);
  let end = (last + margin + 1).min(frames.len());
  Some(start..end)
}

fn flatten(frame: &SlotFrame) -> PoseRow {
  let mut row = [0.0; POSE_DIM];
  for slot in 0..SLOTS {
    for (joint, point) in frame.keypoints[slot].iter().enumerate() {
      let offset = slot * HAND_DIM + joint * 3;
      row[offset..offset + 3].copy_from_slice(point);
    }
  }
  row
}

/// 逐槽位补齐缺失帧：首次检测前向前填充，末次检测后向后填充，中间缺口线性插值
pub fn interpolate_missing(frames: &[SlotFrame]) -> Vec<PoseRow> {
  let mut rows: Vec<PoseRow> = frames.iter().map(flatten).collect();

  for slot in 0..SLOTS {
    let hand = slot * HAND_DIM..(slot + 1) * HAND_DIM;
    let observed: Vec<usize> = frames
      .iter()
      .enumerate()
      .filter(|(_, f)| f.present[slot])
      .map(|(t, _)| t)
      .collect();
    let (Some(&first), Some(&last)) = (observed.first(), observed.last()) else {
      continue;
    };

    let head = rows[first];
    for row in rows[..first].iter_mut() {
      row[hand.clone()].copy_from_slice(&head[hand.clone()]);
    }
    let tail = rows[last];
    for row in rows[last + 1..].iter_mut() {
      row[hand.clone()].copy_from_slice(&tail[hand.clone()]);
    }

    for pair in observed.windows(2) {
      let (t1, t2) = (pair[0], pair[1]);
      if t2 - t1 < 2 {
        continue;
      }
      let (left, right) = (rows[t1], rows[t2]);
      for t in t1 + 1..t2 {
        let a = (t - t1) as f32 / (t2 - t1) as f32;
        for d in hand.clone() {
          rows[t][d] = (1.0 - a) * left[d] + a * right[d];
        }
      }
    }
  }

  rows
}

/// 指数滑动平均：`y[t] = α·x[t] + (1−α)·y[t−1]`，`y[0] = x[0]`
pub fn ema_smooth(rows: &mut [PoseRow], alpha: f32) {
  for t in 1..rows.len() {
    let previous = rows[t - 1];
    for (value, prev) in rows[t].iter_mut().zip(previous.iter()) {
      *value = alpha * *value + (1.0 - alpha) * prev;
    }
  }
}

/// 以手腕为原点平移，并按手腕到中指根部的距离缩放；全零的槽位保持为零
pub fn normalize_hands(rows: &mut [PoseRow]) {
  for row in rows.iter_mut() {
    for slot in 0..SLOTS {
      let hand = &mut row[slot * HAND_DIM..(slot + 1) * HAND_DIM];
      if hand.iter().all(|v| *v == 0.0) {
        continue;
      }

      let wrist = [
        hand[WRIST * 3],
        hand[WRIST * 3 + 1],
        hand[WRIST * 3 + 2],
      ];
      let middle = &hand[MIDDLE_MCP * 3..MIDDLE_MCP * 3 + 3];
      let dist = middle
        .iter()
        .zip(wrist.iter())
        .map(|(m, w)| (m - w).powi(2))
        .sum::<f32>()
        .sqrt();
      let scale = if dist > MIN_HAND_SCALE { dist } else { 1.0 };

      for point in hand.chunks_exact_mut(3) {
        for (value, origin) in point.iter_mut().zip(wrist.iter()) {
          *value = (*value - origin) / scale;
        }
      }
    }
  }
}

/// 序列归一化：裁剪 → 插值 → 平滑 → 空间归一化
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
  pub trim_margin: usize,
  pub ema_alpha: f32,
}

impl Default for Normalizer {
  fn default() -> Self {
    Self {
      trim_margin: 2,
      ema_alpha: 0.65,
    }
  }
}

impl Normalizer {
  pub fn normalize(&self, sequence: &LandmarkSequence) -> Result<NormalizedSequence, SequenceError> {
    let span =
      activity_span(&sequence.frames, self.trim_margin).ok_or(SequenceError::NoDetection)?;
    let frames = &sequence.frames[span.clone()];
    debug!(
      "活动区间 [{}, {}) / {} 帧",
      span.start,
      span.end,
      sequence.len()
    );

    let mut poses = interpolate_missing(frames);
    ema_smooth(&mut poses, self.ema_alpha);
    normalize_hands(&mut poses);

    Ok(NormalizedSequence {
      poses,
      wrists: frames.iter().map(|f| f.wrists).collect(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Keypoints;

  fn hand(offset: [f32; 2], scale: f32) -> Keypoints {
    let mut keypoints = [[0.0; 3]; NUM_LANDMARKS];
    for (j, point) in keypoints.iter_mut().enumerate() {
      let angle = j as f32 * 0.37;
      let radius = 0.02 + 0.01 * (j % 5) as f32;
      *point = [
        offset[0] + scale * radius * angle.cos(),
        offset[1] + scale * radius * angle.sin(),
        scale * 0.001 * j as f32,
      ];
    }
    keypoints
  }

  fn frame_with(slot0: Option<Keypoints>, slot1: Option<Keypoints>) -> SlotFrame {
    let mut frame = SlotFrame::default();
    for (slot, keypoints) in [slot0, slot1].into_iter().enumerate() {
      if let Some(keypoints) = keypoints {
        frame.keypoints[slot] = keypoints;
        frame.present[slot] = true;
        frame.wrists[slot] = Some([keypoints[0][0], keypoints[0][1]]);
      }
    }
    frame
  }

  fn assert_rows_close(a: &[PoseRow], b: &[PoseRow], eps: f32) {
    assert_eq!(a.len(), b.len());
    for (ra, rb) in a.iter().zip(b.iter()) {
      for (x, y) in ra.iter().zip(rb.iter()) {
        assert!((x - y).abs() < eps, "{} vs {}", x, y);
      }
    }
  }

  #[test]
  fn span_is_padded_and_clamped() {
    let mut frames = vec![SlotFrame::default(); 10];
    frames[1] = frame_with(Some(hand([0.5, 0.5], 1.0)), None);
    frames[6] = frame_with(None, Some(hand([0.5, 0.5], 1.0)));
    assert_eq!(activity_span(&frames, 2), Some(0..9));
    assert_eq!(activity_span(&frames, 0), Some(1..7));
  }

  #[test]
  fn no_detection_is_reported() {
    let sequence = LandmarkSequence {
      frames: vec![SlotFrame::default(); 5],
    };
    assert_eq!(
      Normalizer::default().normalize(&sequence),
      Err(SequenceError::NoDetection)
    );
    assert_eq!(
      Normalizer::default().normalize(&LandmarkSequence::default()),
      Err(SequenceError::NoDetection)
    );
  }

  #[test]
  fn gaps_are_filled_and_interpolated() {
    let a = hand([0.2, 0.2], 1.0);
    let b = hand([0.6, 0.2], 1.0);
    let frames = vec![
      SlotFrame::default(),
      frame_with(Some(a), None),
      SlotFrame::default(),
      SlotFrame::default(),
      frame_with(Some(b), None),
      SlotFrame::default(),
    ];
    let rows = interpolate_missing(&frames);

    // 前向/后向填充
    assert_eq!(rows[0][..HAND_DIM], rows[1][..HAND_DIM]);
    assert_eq!(rows[5][..HAND_DIM], rows[4][..HAND_DIM]);
    // 线性插值：1/3 与 2/3 处
    let x1 = a[0][0] + (b[0][0] - a[0][0]) / 3.0;
    let x2 = a[0][0] + 2.0 * (b[0][0] - a[0][0]) / 3.0;
    assert!((rows[2][0] - x1).abs() < 1e-6);
    assert!((rows[3][0] - x2).abs() < 1e-6);
    // 从未出现的槽位保持为零
    assert!(rows.iter().all(|r| r[HAND_DIM..].iter().all(|v| *v == 0.0)));
  }

  #[test]
  fn ema_follows_recurrence() {
    let mut rows = vec![[0.0; POSE_DIM], [1.0; POSE_DIM], [1.0; POSE_DIM]];
    ema_smooth(&mut rows, 0.65);
    assert_eq!(rows[0][0], 0.0);
    assert!((rows[1][0] - 0.65).abs() < 1e-6);
    assert!((rows[2][0] - (0.65 + 0.35 * 0.65)).abs() < 1e-6);
  }

  #[test]
  fn normalization_is_translation_and_scale_invariant() {
    let mut base = vec![flatten(&frame_with(
      Some(hand([0.3, 0.4], 1.0)),
      Some(hand([0.7, 0.5], 0.8)),
    ))];
    let mut moved = vec![flatten(&frame_with(
      Some(hand([0.55, 0.1], 2.5)),
      Some(hand([0.2, 0.9], 0.3)),
    ))];
    normalize_hands(&mut base);
    normalize_hands(&mut moved);
    assert_rows_close(&base, &moved, 1e-4);

    // 手腕位于原点，中指根部距离为 1
    let m = &base[0][MIDDLE_MCP * 3..MIDDLE_MCP * 3 + 3];
    assert!(base[0][..3].iter().all(|v| v.abs() < 1e-6));
    assert!(((m[0].powi(2) + m[1].powi(2) + m[2].powi(2)).sqrt() - 1.0).abs() < 1e-4);
  }

  #[test]
  fn full_pipeline_is_invariant_to_uniform_transform() {
    let build = |offset: [f32; 2], scale: f32| LandmarkSequence {
      frames: (0..8)
        .map(|t| {
          let dx = 0.01 * t as f32 * scale;
          if t == 3 {
            SlotFrame::default()
          } else {
            frame_with(Some(hand([offset[0] + dx, offset[1]], scale)), None)
          }
        })
        .collect(),
    };
    let normalizer = Normalizer::default();
    let a = normalizer.normalize(&build([0.3, 0.3], 1.0)).unwrap();
    let b = normalizer.normalize(&build([0.1, 0.6], 1.7)).unwrap();
    assert_rows_close(&a.poses, &b.poses, 1e-4);
  }

  #[test]
  fn zero_slot_skips_normalization() {
    let mut rows = vec![[0.0; POSE_DIM]];
    normalize_hands(&mut rows);
    assert!(rows[0].iter().all(|v| *v == 0.0));
  }
}
