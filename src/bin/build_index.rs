// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/bin/build_index.rs - 离线构建参考词表索引
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
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use shouyu::{
  FromUrl,
  config::Config,
  embed::Embedder,
  model::RknnHandModelBuilder,
  task::{BuildIndexTask, Dataset, Task},
};

/// 从 `<dataset>/<label>/<clip>` 构建参考词表索引
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型，例如 rknn-hand:///opt/models/hand.rknn?presence=0.5
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 数据集根目录
  #[arg(long, value_name = "DIR")]
  pub input: PathBuf,
  /// 索引输出目录
  #[arg(long, value_name = "DIR")]
  pub index: PathBuf,
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 不附加手腕位置统计（378 维描述子）
  #[arg(long)]
  pub no_wrist_features: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("数据集: {}", args.input.display());
  info!("索引输出: {}", args.index.display());

  let mut config = match &args.config {
    Some(path) => Config::load(path)?,
    None => Config::default(),
  };
  if args.no_wrist_features {
    config.embedder.wrist_features = false;
  }

  let model = RknnHandModelBuilder::from_url(&args.model)?.build()?;
  let embedder = Embedder::new(model, &config.embedder);
  let dataset = Dataset::scan(&args.input)?;

  BuildIndexTask::default()
    .with_interrupt(true)
    .run_task(dataset, embedder, &args.index)?;

  Ok(())
}
