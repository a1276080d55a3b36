// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/index.rs - 参考词表的向量索引
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

//! 暴力内积检索的向量索引。
//!
//! 落盘为同一目录下的三个文件，必须一起写入与读取：
//!
//! - `vectors.bin`: 魔数 `SHYV`、版本 (u32)、维度 (u32)、数量 (u32)，
//!   随后是 `数量 × 维度` 个小端 f32；
//! - `labels.json`: 标签字符串数组；
//! - `sources.json`: 来源引用字符串数组。

use std::{
  fs,
  io::{BufReader, BufWriter, Read, Write},
  path::Path,
};

use thiserror::Error;
use tracing::{debug, info};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const LABELS_FILE: &str = "labels.json";
pub const SOURCES_FILE: &str = "sources.json";

const MAGIC: &[u8; 4] = b"SHYV";
const VERSION: u32 = 1;
const MIN_NORM: f32 = 1e-12;

#[derive(Error, Debug)]
pub enum IndexError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("维度不匹配: 期望 {expected}, 实际 {actual}")]
  DimensionMismatch { expected: usize, actual: usize },
  #[error("索引为空")]
  Empty,
  #[error("索引维度必须大于 0")]
  ZeroDimension,
  #[error("第 {position} 条向量含有非有限值")]
  NonFinite { position: usize },
  #[error("索引文件格式错误: {0}")]
  InvalidFormat(String),
  #[error("索引文件数量不一致: 向量 {vectors}, 标签 {labels}, 来源 {sources}")]
  Misaligned {
    vectors: usize,
    labels: usize,
    sources: usize,
  },
}

/// L2 归一化；范数过小的向量原样返回
pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
  let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
  if norm < MIN_NORM {
    return vector.to_vec();
  }
  vector.iter().map(|v| v / norm).collect()
}

/// 一次检索命中：条目下标与内积相似度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
  pub position: usize,
  pub similarity: f32,
}

/// 离线构建索引；加入的向量会被 L2 归一化
#[derive(Debug, Clone)]
pub struct IndexBuilder {
  dim: usize,
  vectors: Vec<f32>,
  labels: Vec<String>,
  sources: Vec<String>,
}

impl IndexBuilder {
  pub fn new(dim: usize) -> Self {
    Self {
      dim,
      vectors: Vec::new(),
      labels: Vec::new(),
      sources: Vec::new(),
    }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn add(
    &mut self,
    vector: &[f32],
    label: impl Into<String>,
    source: impl Into<String>,
  ) -> Result<(), IndexError> {
    if vector.len() != self.dim {
      return Err(IndexError::DimensionMismatch {
        expected: self.dim,
        actual: vector.len(),
      });
    }
    if !is_finite(vector) {
      return Err(IndexError::NonFinite {
        position: self.labels.len(),
      });
    }
    self.vectors.extend(l2_normalize(vector));
    self.labels.push(label.into());
    self.sources.push(source.into());
    Ok(())
  }

  pub fn build(self) -> Result<VectorIndex, IndexError> {
    if self.dim == 0 {
      return Err(IndexError::ZeroDimension);
    }
    if self.labels.is_empty() {
      return Err(IndexError::Empty);
    }
    Ok(VectorIndex {
      dim: self.dim,
      vectors: self.vectors,
      labels: self.labels,
      sources: self.sources,
    })
  }
}

/// 只读向量索引
///
/// 加载后不可变，可以在线程间共享并发读取。
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
  dim: usize,
  vectors: Vec<f32>,
  labels: Vec<String>,
  sources: Vec<String>,
}

impl VectorIndex {
  pub fn dim(&self) -> usize {
    self.dim
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn label(&self, position: usize) -> Option<&str> {
    self.labels.get(position).map(String::as_str)
  }

  pub fn source(&self, position: usize) -> Option<&str> {
    self.sources.get(position).map(String::as_str)
  }

  pub fn vector(&self, position: usize) -> Option<&[f32]> {
    self
      .vectors
      .chunks_exact(self.dim)
      .nth(position)
  }

  /// 内积最大的 `k` 个条目，按相似度降序；相同相似度保持条目顺序
  pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
    if query.len() != self.dim {
      return Err(IndexError::DimensionMismatch {
        expected: self.dim,
        actual: query.len(),
      });
    }

    let mut neighbors: Vec<Neighbor> = self
      .vectors
      .chunks_exact(self.dim)
      .enumerate()
      .map(|(position, vector)| Neighbor {
        position,
        similarity: vector.iter().zip(query.iter()).map(|(a, b)| a * b).sum(),
      })
      .collect();
    neighbors.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    neighbors.truncate(k);
    Ok(neighbors)
  }

  pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<(), IndexError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut writer = BufWriter::new(fs::File::create(dir.join(VECTORS_FILE))?);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&header_u32(self.dim)?.to_le_bytes())?;
    writer.write_all(&header_u32(self.len())?.to_le_bytes())?;
    for value in &self.vectors {
      writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;

    fs::write(dir.join(LABELS_FILE), serde_json::to_vec(&self.labels)?)?;
    fs::write(dir.join(SOURCES_FILE), serde_json::to_vec(&self.sources)?)?;

    info!(
      "索引已写入 {}: {} 条, {} 维",
      dir.display(),
      self.len(),
      self.dim
    );
    Ok(())
  }

  pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, IndexError> {
    let dir = dir.as_ref();

    let mut reader = BufReader::new(fs::File::open(dir.join(VECTORS_FILE))?);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
      return Err(IndexError::InvalidFormat(format!("魔数错误: {:?}", magic)));
    }
    let version = read_u32(&mut reader)?;
    if version != VERSION {
      return Err(IndexError::InvalidFormat(format!(
        "不支持的版本: {}",
        version
      )));
    }
    let dim = read_u32(&mut reader)? as usize;
    let count = read_u32(&mut reader)? as usize;
    if dim == 0 {
      return Err(IndexError::ZeroDimension);
    }

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() != dim * count * 4 {
      return Err(IndexError::InvalidFormat(format!(
        "向量数据长度 {} 字节, 期望 {} 字节",
        bytes.len(),
        dim * count * 4
      )));
    }
    let vectors: Vec<f32> = bytes
      .chunks_exact(4)
      .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .collect();
    if let Some(position) = vectors.chunks_exact(dim).position(|v| !is_finite(v)) {
      return Err(IndexError::NonFinite { position });
    }

    let labels: Vec<String> = serde_json::from_slice(&fs::read(dir.join(LABELS_FILE))?)?;
    let sources: Vec<String> = serde_json::from_slice(&fs::read(dir.join(SOURCES_FILE))?)?;
    if labels.len() != count || sources.len() != count {
      return Err(IndexError::Misaligned {
        vectors: count,
        labels: labels.len(),
        sources: sources.len(),
      });
    }

    debug!("从 {} 加载索引: {} 条, {} 维", dir.display(), count, dim);
    Ok(Self {
      dim,
      vectors,
      labels,
      sources,
    })
  }
}

/// 向量中不含 NaN 与无穷大
pub fn is_finite(vector: &[f32]) -> bool {
  vector.iter().all(|v| v.is_finite())
}

fn header_u32(value: usize) -> Result<u32, IndexError> {
  u32::try_from(value).map_err(|_| IndexError::InvalidFormat(format!("数值过大: {}", value)))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, IndexError> {
  let mut buffer = [0u8; 4];
  reader.read_exact(&mut buffer)?;
  Ok(u32::from_le_bytes(buffer))
}
