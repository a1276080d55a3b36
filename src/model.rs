// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/model.rs - 手部关键点检测模型
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

use crate::frame::Frame;

/// 每只手的关键点数量
pub const NUM_LANDMARKS: usize = 21;
/// 手腕关键点索引
pub const WRIST: usize = 0;
/// 中指根部关键点索引
pub const MIDDLE_MCP: usize = 9;

/// 21 个关键点的 (x, y, z)，x/y 为归一化图像坐标
pub type Keypoints = [[f32; 3]; NUM_LANDMARKS];

/// 手部骨架连线，用于可视化
pub const HAND_SKELETON: [(usize, usize); 21] = [
  (0, 1),
  (1, 2),
  (2, 3),
  (3, 4),
  (0, 5),
  (5, 6),
  (6, 7),
  (7, 8),
  (0, 9),
  (9, 10),
  (10, 11),
  (11, 12),
  (0, 13),
  (13, 14),
  (14, 15),
  (15, 16),
  (0, 17),
  (17, 18),
  (18, 19),
  (19, 20),
  (5, 9),
];

/// 模型对单只手的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct HandDetection {
  pub keypoints: Keypoints,
  /// 模型估计的左右手概率（右手）
  pub handedness: f32,
}

impl HandDetection {
  pub fn new(keypoints: Keypoints, handedness: f32) -> Self {
    Self {
      keypoints,
      handedness,
    }
  }

  /// 手腕在图像中的 (x, y)
  pub fn wrist(&self) -> [f32; 2] {
    let [x, y, _] = self.keypoints[WRIST];
    [x, y]
  }
}

/// 手部关键点检测模型
///
/// 模型本身可在多个查询间共享，每个片段通过 [`HandModel::open_session`]
/// 获得独立的流式会话；会话在析构时释放。
pub trait HandModel {
  type Session: HandSession;
  type Error: std::error::Error + Send + Sync + 'static;

  fn open_session(&self) -> Result<Self::Session, Self::Error>;
}

/// 单个片段的流式检测会话
///
/// 会话跨帧保持跟踪状态，调用方必须按时间戳严格递增的顺序送入同一片段的所有帧，
/// 不得在多个片段之间复用或交错。
pub trait HandSession {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(&mut self, frame: &Frame) -> Result<Vec<HandDetection>, Self::Error>;
}

impl<M: HandModel> HandModel for &M {
  type Session = M::Session;
  type Error = M::Error;

  fn open_session(&self) -> Result<Self::Session, Self::Error> {
    (**self).open_session()
  }
}

#[cfg(feature = "model_rknn_hand")]
mod rknn_hand;
#[cfg(feature = "model_rknn_hand")]
pub use self::rknn_hand::{RknnHandError, RknnHandModel, RknnHandModelBuilder, RknnHandSession};
