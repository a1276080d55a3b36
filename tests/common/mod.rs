// 该文件是 Shouyu （手语检索） 项目的一部分。
// tests/common/mod.rs - 集成测试用的标记模型与合成手势
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

#![allow(dead_code)]

use std::{
  convert::Infallible,
  f32::consts::{FRAC_PI_2, PI},
};

use image::{Rgb, RgbImage};
use shouyu::{
  frame::Frame,
  input::MemoryClip,
  model::{HandDetection, HandModel, HandSession, Keypoints, NUM_LANDMARKS},
};

pub const WIDTH: u32 = 200;
pub const HEIGHT: u32 = 200;
pub const CLIP_FRAMES: usize = 30;
pub const FRAME_MS: u32 = 66;

/// 两只手的标记绿色通道
const HAND_GREEN: [u8; 2] = [255, 128];

fn marker(hand: usize, joint: usize) -> Rgb<u8> {
  Rgb([10 + 10 * joint as u8, HAND_GREEN[hand], 0])
}

/// 通过标记颜色恢复关键点的合成模型
///
/// 每个关节在图像中画成一个像素，红色通道编码关节序号，绿色通道编码是哪只手；
/// 模型按手的编号顺序返回所有关节都找到的手。
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerModel;

pub struct MarkerSession;

impl HandModel for MarkerModel {
  type Session = MarkerSession;
  type Error = Infallible;

  fn open_session(&self) -> Result<Self::Session, Self::Error> {
    Ok(MarkerSession)
  }
}

impl HandSession for MarkerSession {
  type Error = Infallible;

  fn detect(&mut self, frame: &Frame) -> Result<Vec<HandDetection>, Self::Error> {
    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let mut sums = [[[0.0f32; 3]; NUM_LANDMARKS]; 2];

    for (x, y, pixel) in frame.image.enumerate_pixels() {
      let [r, g, b] = pixel.0;
      if b != 0 || r < 10 || (r - 10) % 10 != 0 {
        continue;
      }
      let joint = ((r - 10) / 10) as usize;
      let Some(hand) = HAND_GREEN.iter().position(|v| *v == g) else {
        continue;
      };
      if joint >= NUM_LANDMARKS {
        continue;
      }
      let sum = &mut sums[hand][joint];
      sum[0] += x as f32 + 0.5;
      sum[1] += y as f32 + 0.5;
      sum[2] += 1.0;
    }

    let mut detections = Vec::new();
    for hand in sums.iter() {
      if hand.iter().any(|s| s[2] == 0.0) {
        continue;
      }
      let mut keypoints: Keypoints = [[0.0; 3]; NUM_LANDMARKS];
      for (point, sum) in keypoints.iter_mut().zip(hand.iter()) {
        *point = [sum[0] / sum[2] / w, sum[1] / sum[2] / h, 0.0];
      }
      detections.push(HandDetection::new(keypoints, 0.5));
    }
    Ok(detections)
  }
}

/// 一只手的姿态：手腕像素位置、整体旋转（0 为指尖朝上）、尺度与弯曲程度
#[derive(Debug, Clone, Copy)]
pub struct HandPose {
  pub wrist: [f32; 2],
  pub rotation: f32,
  pub scale: f32,
  pub curl: f32,
}

impl HandPose {
  pub fn upright(wrist: [f32; 2]) -> Self {
    Self {
      wrist,
      rotation: 0.0,
      scale: 1.0,
      curl: 1.0,
    }
  }

  /// 关节像素坐标：五根手指呈扇形，每根四个关节
  pub fn joints(&self) -> [[f32; 2]; NUM_LANDMARKS] {
    let mut joints = [[0.0; 2]; NUM_LANDMARKS];
    joints[0] = self.wrist;
    for finger in 0..5 {
      let angle = -FRAC_PI_2 + (finger as f32 - 2.0) * 0.35 + self.rotation;
      for k in 0..4 {
        let radius = (12.0 + 10.0 * k as f32 * self.curl) * self.scale;
        joints[1 + finger * 4 + k] = [
          self.wrist[0] + radius * angle.cos(),
          self.wrist[1] + radius * angle.sin(),
        ];
      }
    }
    joints
  }
}

pub fn render(hands: &[HandPose]) -> RgbImage {
  let mut image = RgbImage::new(WIDTH, HEIGHT);
  for (hand, pose) in hands.iter().enumerate() {
    for (joint, [x, y]) in pose.joints().iter().enumerate() {
      let (px, py) = (x.round(), y.round());
      if px >= 0.0 && py >= 0.0 && (px as u32) < WIDTH && (py as u32) < HEIGHT {
        image.put_pixel(px as u32, py as u32, marker(hand, joint));
      }
    }
  }
  image
}

pub fn clip_from_poses<F>(frames: usize, pose_at: F) -> MemoryClip
where
  F: Fn(f32) -> Vec<HandPose>,
{
  let mut clip = MemoryClip::new();
  for i in 0..frames {
    let phase = i as f32 / frames as f32;
    clip.push(render(&pose_at(phase)), FRAME_MS);
  }
  clip
}

/// 手势 A：竖直张开的单手左右摆动
pub fn gesture_a(offset: [f32; 2], scale: f32, sway: f32) -> MemoryClip {
  clip_from_poses(CLIP_FRAMES, |phase| {
    let s = (2.0 * PI * phase).sin();
    vec![HandPose {
      wrist: [100.0 + offset[0] + 25.0 * s, 150.0 + offset[1]],
      rotation: sway * s,
      scale,
      curl: 1.0,
    }]
  })
}

/// 手势 B：横向的单手反复握拳
pub fn gesture_b() -> MemoryClip {
  clip_from_poses(CLIP_FRAMES, |phase| {
    vec![HandPose {
      wrist: [50.0, 100.0],
      rotation: FRAC_PI_2,
      scale: 1.0,
      curl: 0.75 + 0.25 * (2.0 * PI * phase).cos(),
    }]
  })
}

/// 手势 C：双手同时上抬
pub fn gesture_c() -> MemoryClip {
  clip_from_poses(CLIP_FRAMES, |phase| {
    let lift = 30.0 * phase;
    vec![
      HandPose {
        rotation: -0.3,
        ..HandPose::upright([55.0, 170.0 - lift])
      },
      HandPose {
        rotation: 0.3,
        ..HandPose::upright([145.0, 170.0 - lift])
      },
    ]
  })
}

/// 全黑片段
pub fn empty_clip(frames: usize) -> MemoryClip {
  clip_from_poses(frames, |_| Vec::new())
}
