// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/matcher.rs - 检索与置信度门控
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

use std::{collections::HashMap, time::Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::MatcherConfig,
  embed::{EmbedError, Embedder},
  index::{IndexError, VectorIndex, is_finite, l2_normalize},
  input::Clip,
  model::HandModel,
};

/// 调试输出的候选数
const DEBUG_DUMP: usize = 10;

#[derive(Error, Debug)]
pub enum MatchError {
  #[error("查询描述子维度不匹配: 索引 {expected}, 查询 {actual}")]
  DimensionMismatch { expected: usize, actual: usize },
  #[error("索引错误: {0}")]
  Index(IndexError),
}

impl From<IndexError> for MatchError {
  fn from(e: IndexError) -> Self {
    match e {
      IndexError::DimensionMismatch { expected, actual } => {
        MatchError::DimensionMismatch { expected, actual }
      }
      other => MatchError::Index(other),
    }
  }
}

/// 按标签聚合后的候选
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub label: String,
  pub similarity: f32,
  pub source_reference: String,
}

/// 返回给调用方的检索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
  pub label: String,
  pub similarity: f32,
  /// 百分比，保留一位小数，例如 `"81.3%"`
  pub confidence: String,
  pub source_reference: String,
}

impl MatchResult {
  fn from_candidate(candidate: &Candidate) -> Self {
    Self {
      label: candidate.label.clone(),
      similarity: candidate.similarity,
      confidence: format!("{:.1}%", candidate.similarity * 100.0),
      source_reference: candidate.source_reference.clone(),
    }
  }
}

/// 一次查询的结论
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
  Matched(Vec<MatchResult>),
  /// 无法读取任何帧
  NoFrames,
  /// 没有检测到手（或检测失败）
  NoDetection,
  /// 最佳相似度低于置信度阈值
  LowConfidence { best: f32 },
  /// 第一与第二候选过于接近
  Ambiguous { margin: f32 },
  /// 索引没有返回任何候选
  Empty,
}

impl MatchOutcome {
  pub fn is_matched(&self) -> bool {
    matches!(self, MatchOutcome::Matched(_))
  }

  pub fn into_results(self) -> Vec<MatchResult> {
    match self {
      MatchOutcome::Matched(results) => results,
      _ => Vec::new(),
    }
  }
}

impl From<&EmbedError> for MatchOutcome {
  fn from(e: &EmbedError) -> Self {
    match e {
      EmbedError::NoFrames(_) => MatchOutcome::NoFrames,
      EmbedError::NoDetection | EmbedError::Extract(_) => MatchOutcome::NoDetection,
    }
  }
}

/// 同一标签只保留相似度最高的一条，按相似度降序排列
///
/// 相似度相同时保持首次出现的顺序。
pub fn aggregate_by_label<I>(hits: I) -> Vec<Candidate>
where
  I: IntoIterator<Item = Candidate>,
{
  let mut order: Vec<Candidate> = Vec::new();
  let mut seen: HashMap<String, usize> = HashMap::new();
  for hit in hits {
    match seen.get(&hit.label) {
      Some(&i) => {
        if hit.similarity > order[i].similarity {
          order[i] = hit;
        }
      }
      None => {
        seen.insert(hit.label.clone(), order.len());
        order.push(hit);
      }
    }
  }
  order.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
  order
}

/// 对排好序的候选依次应用置信度门控与间隔门控
pub fn gate(candidates: &[Candidate], config: &MatcherConfig) -> MatchOutcome {
  let Some(best) = candidates.first() else {
    return MatchOutcome::Empty;
  };
  if best.similarity < config.confidence_threshold {
    return MatchOutcome::LowConfidence {
      best: best.similarity,
    };
  }
  if let Some(second) = candidates.get(1) {
    let margin = best.similarity - second.similarity;
    if margin < config.margin_threshold {
      return MatchOutcome::Ambiguous { margin };
    }
  }

  MatchOutcome::Matched(
    candidates
      .iter()
      .take(config.max_results)
      .filter(|c| c.similarity >= config.confidence_threshold)
      .map(MatchResult::from_candidate)
      .collect(),
  )
}

fn dump_candidates(candidates: &[Candidate], config: &MatcherConfig) {
  debug!(
    "检索候选 (阈值 {}, 间隔 {}):",
    config.confidence_threshold, config.margin_threshold
  );
  for (rank, c) in candidates.iter().take(DEBUG_DUMP).enumerate() {
    let status = if c.similarity >= config.confidence_threshold {
      "PASS"
    } else {
      "FILTERED"
    };
    debug!(
      "  [{}] {:<20} | sim: {:.4} | {}",
      rank + 1,
      c.label,
      c.similarity,
      status
    );
  }
}

fn log_outcome(outcome: &MatchOutcome, config: &MatcherConfig) {
  match outcome {
    MatchOutcome::LowConfidence { best } => info!(
      "最佳候选低于阈值 ({:.4} < {})",
      best, config.confidence_threshold
    ),
    MatchOutcome::Ambiguous { margin } => info!(
      "结果过于接近 (间隔 {:.4} < {})",
      margin, config.margin_threshold
    ),
    MatchOutcome::Matched(results) => debug!("返回 {} 条结果", results.len()),
    _ => {}
  }
}

/// 用一组查询描述子检索索引，合并结果后门控
///
/// 每个描述子都会先做 L2 归一化；维度与索引不一致时返回错误。
/// 含 NaN 或无穷大的描述子视为没有可用的检测结果。
pub fn match_descriptors(
  index: &VectorIndex,
  queries: &[&[f32]],
  k: usize,
  config: &MatcherConfig,
) -> Result<MatchOutcome, MatchError> {
  let mut hits = Vec::new();
  for query in queries {
    if query.len() != index.dim() {
      error!(
        "查询描述子维度不匹配: 索引 {}, 查询 {}",
        index.dim(),
        query.len()
      );
      return Err(MatchError::DimensionMismatch {
        expected: index.dim(),
        actual: query.len(),
      });
    }
    if !is_finite(query) {
      warn!("查询描述子含有非有限值，放弃检索");
      return Ok(MatchOutcome::NoDetection);
    }
    for neighbor in index.search(&l2_normalize(query), k)? {
      if !neighbor.similarity.is_finite() {
        continue;
      }
      if let (Some(label), Some(source)) = (index.label(neighbor.position), index.source(neighbor.position)) {
        hits.push(Candidate {
          label: label.to_string(),
          similarity: neighbor.similarity,
          source_reference: source.to_string(),
        });
      }
    }
  }

  let candidates = aggregate_by_label(hits);
  dump_candidates(&candidates, config);
  let outcome = gate(&candidates, config);
  log_outcome(&outcome, config);
  Ok(outcome)
}

/// 检索服务：持有只读索引与嵌入器
pub struct Matcher<M: HandModel> {
  index: VectorIndex,
  embedder: Embedder<M>,
  config: MatcherConfig,
}

impl<M: HandModel> Matcher<M> {
  pub fn new(index: VectorIndex, embedder: Embedder<M>, config: MatcherConfig) -> Self {
    if index.dim() != embedder.dim() {
      error!(
        "索引维度 {} 与嵌入器维度 {} 不一致，查询将失败",
        index.dim(),
        embedder.dim()
      );
    }
    Self {
      index,
      embedder,
      config,
    }
  }

  pub fn index(&self) -> &VectorIndex {
    &self.index
  }

  pub fn embedder(&self) -> &Embedder<M> {
    &self.embedder
  }

  pub fn config(&self) -> &MatcherConfig {
    &self.config
  }

  /// 原方向与镜像方向各检索一次，合并后门控
  pub fn query(&self, clip: &Clip, k: usize) -> Result<MatchOutcome, MatchError> {
    let start = Instant::now();
    let descriptors = self.embedder.embed(clip, false).and_then(|normal| {
      self
        .embedder
        .embed(clip, true)
        .map(|mirrored| (normal, mirrored))
    });
    let (normal, mirrored) = match descriptors {
      Ok(pair) => pair,
      Err(e) => return Ok(MatchOutcome::from(&e)),
    };
    let embedded = start.elapsed();

    let outcome = match_descriptors(&self.index, &[normal.as_slice(), mirrored.as_slice()], k, &self.config)?;
    info!(
      "查询 {}: 嵌入 {:.2?}, 检索 {:.2?}",
      clip,
      embedded,
      start.elapsed() - embedded
    );
    Ok(outcome)
  }

  /// 只返回通过门控的结果列表，被拒绝时为空
  pub fn search(&self, clip: &Clip, k: usize) -> Result<Vec<MatchResult>, MatchError> {
    Ok(self.query(clip, k)?.into_results())
  }
}
