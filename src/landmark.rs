// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/landmark.rs - 手部关键点提取与槽位分配
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

//! 检测模型不保证跨帧的手部身份稳定，这里把每帧的检测结果分配到两个稳定槽位（0/1）。
//! 分配是 (当前检测, 上一次各槽位手腕位置) 的纯函数，状态由调用方显式传递。

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::Frame,
  model::{HandDetection, HandModel, HandSession, Keypoints, NUM_LANDMARKS},
};

/// 槽位数量
pub const SLOTS: usize = 2;

/// 各槽位上一次观测到的手腕位置
pub type WristHistory = [Option<[f32; 2]>; SLOTS];

#[derive(Error, Debug)]
pub enum ExtractError {
  #[error("无法创建检测会话: {0}")]
  Session(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("第 {index} 帧检测失败: {source}")]
  Detect {
    index: u64,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
  #[error("时间戳未严格递增: 上一帧 {previous}ms, 当前帧 {current}ms")]
  NonIncreasingTimestamp { previous: u64, current: u64 },
}

/// 槽位 → 检测结果下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotAssignment(pub [Option<usize>; SLOTS]);

impl SlotAssignment {
  pub fn detection_for(&self, slot: usize) -> Option<usize> {
    self.0[slot]
  }
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
  ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// 单只手：选择手腕距离更近的槽位
fn best_slot_for_single(wrist: [f32; 2], previous: &WristHistory) -> usize {
  match previous {
    [None, None] => {
      if wrist[0] <= 0.5 {
        0
      } else {
        1
      }
    }
    [None, Some(_)] => 1,
    [Some(_), None] => 0,
    [Some(p0), Some(p1)] => {
      if distance(wrist, *p0) <= distance(wrist, *p1) {
        0
      } else {
        1
      }
    }
  }
}

/// 为当前帧的手腕位置分配槽位
///
/// - 一只手：有历史时取手腕位移最小的槽位；无历史时 x ≤ 0.5 进入槽位 0。
/// - 两只手：两个槽位都有历史时选择总位移最小的排列；否则 x 较小者进入槽位 0。
/// - 超过两只手时只取前两只。
pub fn assign_slots(wrists: &[[f32; 2]], previous: &WristHistory) -> SlotAssignment {
  match wrists {
    [] => SlotAssignment::default(),
    [wrist] => {
      let mut assignment = SlotAssignment::default();
      assignment.0[best_slot_for_single(*wrist, previous)] = Some(0);
      assignment
    }
    [w0, w1, ..] => {
      let keep_order = match previous {
        [Some(p0), Some(p1)] => {
          let cost_same = distance(*w0, *p0) + distance(*w1, *p1);
          let cost_swap = distance(*w0, *p1) + distance(*w1, *p0);
          cost_same <= cost_swap
        }
        _ => w0[0] <= w1[0],
      };
      if keep_order {
        SlotAssignment([Some(0), Some(1)])
      } else {
        SlotAssignment([Some(1), Some(0)])
      }
    }
  }
}

/// 用本帧分配结果更新手腕历史，未分配的槽位保持原值
pub fn update_history(history: &mut WristHistory, assignment: &SlotAssignment, wrists: &[[f32; 2]]) {
  for (slot, entry) in history.iter_mut().enumerate() {
    if let Some(idx) = assignment.detection_for(slot) {
      *entry = Some(wrists[idx]);
    }
  }
}

/// 单帧两个槽位的关键点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotFrame {
  /// 缺失槽位为全零
  pub keypoints: [Keypoints; SLOTS],
  pub present: [bool; SLOTS],
  /// 原始手腕位置（图像归一化坐标），缺失为 `None`
  pub wrists: [Option<[f32; 2]>; SLOTS],
}

impl Default for SlotFrame {
  fn default() -> Self {
    Self {
      keypoints: [[[0.0; 3]; NUM_LANDMARKS]; SLOTS],
      present: [false; SLOTS],
      wrists: [None; SLOTS],
    }
  }
}

impl SlotFrame {
  pub fn from_detections(detections: &[HandDetection], assignment: &SlotAssignment) -> Self {
    let mut frame = SlotFrame::default();
    for slot in 0..SLOTS {
      if let Some(detection) = assignment.detection_for(slot).and_then(|i| detections.get(i)) {
        frame.keypoints[slot] = detection.keypoints;
        frame.present[slot] = true;
        frame.wrists[slot] = Some(detection.wrist());
      }
    }
    frame
  }

  pub fn any_present(&self) -> bool {
    self.present.iter().any(|p| *p)
  }
}

/// 一个片段的逐帧槽位序列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSequence {
  pub frames: Vec<SlotFrame>,
}

impl LandmarkSequence {
  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  /// 有任意一只手的帧所占比例
  pub fn hand_coverage(&self) -> f32 {
    if self.frames.is_empty() {
      return 0.0;
    }
    let active = self.frames.iter().filter(|f| f.any_present()).count();
    active as f32 / self.frames.len() as f32
  }
}

/// 逐帧槽位跟踪器，显式持有手腕历史
#[derive(Debug, Clone, Default)]
pub struct SlotTracker {
  history: WristHistory,
}

impl SlotTracker {
  pub fn history(&self) -> &WristHistory {
    &self.history
  }

  pub fn track(&mut self, detections: &[HandDetection]) -> SlotFrame {
    let detections = &detections[..detections.len().min(SLOTS)];
    let wrists: Vec<[f32; 2]> = detections.iter().map(HandDetection::wrist).collect();
    let assignment = assign_slots(&wrists, &self.history);
    update_history(&mut self.history, &assignment, &wrists);
    SlotFrame::from_detections(detections, &assignment)
  }
}

/// 使用一个新会话处理片段的全部帧
///
/// 会话在函数返回时（包括出错路径）释放。
pub fn extract_landmarks<M: HandModel>(
  model: &M,
  frames: &[Frame],
) -> Result<LandmarkSequence, ExtractError> {
  let mut session = model
    .open_session()
    .map_err(|e| ExtractError::Session(Box::new(e)))?;
  let mut tracker = SlotTracker::default();
  let mut sequence = LandmarkSequence {
    frames: Vec::with_capacity(frames.len()),
  };
  let mut previous_timestamp: Option<u64> = None;

  for frame in frames {
    if let Some(previous) = previous_timestamp
      && frame.timestamp_ms <= previous
    {
      warn!(
        "时间戳未严格递增: {}ms -> {}ms",
        previous, frame.timestamp_ms
      );
      return Err(ExtractError::NonIncreasingTimestamp {
        previous,
        current: frame.timestamp_ms,
      });
    }
    previous_timestamp = Some(frame.timestamp_ms);

    let detections = session.detect(frame).map_err(|e| ExtractError::Detect {
      index: frame.index,
      source: Box::new(e),
    })?;
    if detections.len() > SLOTS {
      debug!(
        "第 {} 帧检测到 {} 只手，仅保留前 {} 只",
        frame.index,
        detections.len(),
        SLOTS
      );
    }
    sequence.frames.push(tracker.track(&detections));
  }

  debug!(
    "提取 {} 帧关键点，手部覆盖率 {:.2}",
    sequence.len(),
    sequence.hand_coverage()
  );
  Ok(sequence)
}
