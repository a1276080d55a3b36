// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/config.rs - 配置
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

//! TOML 配置文件，所有字段均有默认值：
//!
//! ```toml
//! [embedder]
//! target_frames = 30
//! sample_fps = 15.0
//! max_seconds = 4.0
//! ema_alpha = 0.65
//! trim_margin = 2
//! wrist_features = true
//!
//! [matcher]
//! top_k = 20
//! confidence_threshold = 0.55
//! margin_threshold = 0.03
//! max_results = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  embed::descriptor_dim,
  input::{MAX_SAMPLE_FPS, Sampling},
  sequence::Normalizer,
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub embedder: EmbedderConfig,
  #[serde(default)]
  pub matcher: MatcherConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderConfig {
  /// 重采样后的固定帧数
  #[serde(default = "default_target_frames")]
  pub target_frames: usize,
  /// 采样帧率
  #[serde(default = "default_sample_fps")]
  pub sample_fps: f32,
  /// 最长处理时长（秒）
  #[serde(default = "default_max_seconds")]
  pub max_seconds: f32,
  /// 平滑系数
  #[serde(default = "default_ema_alpha")]
  pub ema_alpha: f32,
  /// 活动裁剪两侧保留的帧数
  #[serde(default = "default_trim_margin")]
  pub trim_margin: usize,
  /// 是否附加 10 维手腕位置统计
  #[serde(default = "default_wrist_features")]
  pub wrist_features: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
  /// 每个方向检索的候选数
  #[serde(default = "default_top_k")]
  pub top_k: usize,
  /// 最佳相似度低于该值时拒绝
  #[serde(default = "default_confidence_threshold")]
  pub confidence_threshold: f32,
  /// 第一与第二候选的相似度差低于该值时拒绝
  #[serde(default = "default_margin_threshold")]
  pub margin_threshold: f32,
  /// 返回结果上限
  #[serde(default = "default_max_results")]
  pub max_results: usize,
}

fn default_target_frames() -> usize { 30 }
fn default_sample_fps() -> f32 { 15.0 }
fn default_max_seconds() -> f32 { 4.0 }
fn default_ema_alpha() -> f32 { 0.65 }
fn default_trim_margin() -> usize { 2 }
fn default_wrist_features() -> bool { true }
fn default_top_k() -> usize { 20 }
fn default_confidence_threshold() -> f32 { 0.55 }
fn default_margin_threshold() -> f32 { 0.03 }
fn default_max_results() -> usize { 5 }

impl Default for EmbedderConfig {
  fn default() -> Self {
    Self {
      target_frames: default_target_frames(),
      sample_fps: default_sample_fps(),
      max_seconds: default_max_seconds(),
      ema_alpha: default_ema_alpha(),
      trim_margin: default_trim_margin(),
      wrist_features: default_wrist_features(),
    }
  }
}

impl Default for MatcherConfig {
  fn default() -> Self {
    Self {
      top_k: default_top_k(),
      confidence_threshold: default_confidence_threshold(),
      margin_threshold: default_margin_threshold(),
      max_results: default_max_results(),
    }
  }
}

impl EmbedderConfig {
  pub fn sampling(&self) -> Sampling {
    Sampling {
      sample_fps: self.sample_fps,
      max_seconds: self.max_seconds,
    }
  }

  pub fn normalizer(&self) -> Normalizer {
    Normalizer {
      trim_margin: self.trim_margin,
      ema_alpha: self.ema_alpha,
    }
  }

  /// 该配置产生的描述子维度（378 或 388）
  pub fn descriptor_dim(&self) -> usize {
    descriptor_dim(self.wrist_features)
  }

  /// 选择与索引维度一致的描述子形式，返回是否发生了改变
  ///
  /// 索引维度不属于任何一种形式时保持原样，由检索时的维度校验报告错误。
  pub fn follow_index_dim(&mut self, index_dim: usize) -> bool {
    for wrist_features in [true, false] {
      if descriptor_dim(wrist_features) == index_dim && self.wrist_features != wrist_features {
        self.wrist_features = wrist_features;
        return true;
      }
    }
    false
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.target_frames == 0 {
      return Err(ConfigError::Invalid("target_frames 必须大于 0".to_string()));
    }
    if !(self.sample_fps > 0.0 && self.sample_fps <= MAX_SAMPLE_FPS) {
      return Err(ConfigError::Invalid(format!(
        "sample_fps 必须位于 (0, {}]",
        MAX_SAMPLE_FPS
      )));
    }
    if !(self.max_seconds > 0.0) {
      return Err(ConfigError::Invalid("max_seconds 必须大于 0".to_string()));
    }
    if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
      return Err(ConfigError::Invalid("ema_alpha 必须位于 (0, 1]".to_string()));
    }
    Ok(())
  }
}

impl MatcherConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.top_k == 0 || self.max_results == 0 {
      return Err(ConfigError::Invalid(
        "top_k 与 max_results 必须大于 0".to_string(),
      ));
    }
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(ConfigError::Invalid(
        "confidence_threshold 必须位于 [0, 1]".to_string(),
      ));
    }
    if !(self.margin_threshold >= 0.0) {
      return Err(ConfigError::Invalid("margin_threshold 不能为负".to_string()));
    }
    Ok(())
  }
}

impl Config {
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.embedder.validate()?;
    config.matcher.validate()?;
    Ok(config)
  }
}
