// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/bin/inspect_clip.rs - 逐帧检查关键点检测结果
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
  embed::{DEFAULT_COVERAGE_THRESHOLD, Embedder},
  input::{Clip, parse_clip_arg},
  model::RknnHandModelBuilder,
  output::LandmarkRecordOutput,
  task::{InspectTask, Task},
};

/// 把片段每一帧的槽位关键点画出来，用于检查检测质量
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型，例如 rknn-hand:///opt/models/hand.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 片段（URI 或本地路径）
  #[arg(long, value_name = "SOURCE")]
  pub input: String,
  /// 输出，例如 record:///tmp/inspect?record&always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 镜像后再检测
  #[arg(long)]
  pub mirror: bool,
  /// 只检查手部覆盖率
  #[arg(long)]
  pub coverage_only: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  let config = match &args.config {
    Some(path) => Config::load(path)?,
    None => Config::default(),
  };
  let clip = Clip::from(parse_clip_arg(&args.input)?);

  info!("模型: {}", args.model);
  info!("片段: {}", clip);
  info!("输出: {}", args.output);

  let model = RknnHandModelBuilder::from_url(&args.model)?.build()?;
  let embedder = Embedder::new(model, &config.embedder);

  if args.coverage_only {
    let sufficient = embedder.has_sufficient_coverage(&clip, DEFAULT_COVERAGE_THRESHOLD);
    info!("手部覆盖率是否足够 (>= {}): {}", DEFAULT_COVERAGE_THRESHOLD, sufficient);
    return Ok(());
  }

  let output = LandmarkRecordOutput::from_url(&args.output)?;
  InspectTask::default()
    .with_mirror(args.mirror)
    .run_task(clip, embedder, output)?;

  Ok(())
}
