// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/bin/query_sign.rs - 查询手语片段
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use shouyu::{
  FromUrl,
  config::Config,
  embed::Embedder,
  index::VectorIndex,
  input::{Clip, parse_clip_arg},
  matcher::Matcher,
  model::RknnHandModelBuilder,
  task::{QueryTask, Task},
};

/// 在参考词表中检索手语片段，每个片段输出一行 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型，例如 rknn-hand:///opt/models/hand.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 查询片段（URI 或本地路径），可重复
  #[arg(long, value_name = "SOURCE", required = true)]
  pub input: Vec<String>,
  /// 索引目录
  #[arg(long, value_name = "DIR")]
  pub index: PathBuf,
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 每个方向检索的候选数
  #[arg(long, value_name = "K")]
  pub top_k: Option<usize>,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,
  /// 第一与第二候选的最小间隔
  #[arg(long, value_name = "THRESHOLD")]
  pub margin: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let mut config = match &args.config {
    Some(path) => Config::load(path)?,
    None => Config::default(),
  };
  if let Some(k) = args.top_k {
    config.matcher.top_k = k;
  }
  if let Some(threshold) = args.confidence {
    config.matcher.confidence_threshold = threshold;
  }
  if let Some(margin) = args.margin {
    config.matcher.margin_threshold = margin;
  }
  config.matcher.validate()?;

  info!("模型: {}", args.model);
  info!("索引: {}", args.index.display());

  let index = VectorIndex::load(&args.index)?;
  if args.config.is_none() {
    // 没有配置文件时描述子形式跟随索引
    if config.embedder.follow_index_dim(index.dim()) {
      info!(
        "索引为 {} 维，手腕位置统计: {}",
        index.dim(),
        config.embedder.wrist_features
      );
    }
  } else if config.embedder.descriptor_dim() != index.dim() {
    warn!(
      "配置的描述子为 {} 维，与索引的 {} 维不一致",
      config.embedder.descriptor_dim(),
      index.dim()
    );
  }

  let model = RknnHandModelBuilder::from_url(&args.model)?.build()?;
  let embedder = Embedder::new(model, &config.embedder);
  let matcher = Matcher::new(index, embedder, config.matcher.clone());

  let clips = args
    .input
    .iter()
    .map(|arg| parse_clip_arg(arg).map(Clip::from))
    .collect::<Result<Vec<_>, _>>()?;

  QueryTask::new(config.matcher.top_k).run_task(clips, matcher, std::io::stdout().lock())?;

  Ok(())
}
