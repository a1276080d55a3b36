// 该文件是 Shouyu （手语检索） 项目的一部分。
// src/task.rs - 建库、查询与检查任务
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

use std::{
  io::Write,
  path::{Path, PathBuf},
  sync::mpsc::{Receiver, channel},
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  embed::Embedder,
  index::{IndexBuilder, VectorIndex},
  input::{Clip, clip_url_for_path, is_clip_path},
  matcher::{MatchOutcome, MatchResult, Matcher},
  model::HandModel,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 注册 Ctrl-C 处理器；第二次中断 30 秒后强制退出
fn interrupt_channel() -> anyhow::Result<Receiver<()>> {
  let (tx, rx) = channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理器")?;
  Ok(rx)
}

/// 带标签的参考片段
#[derive(Debug, Clone)]
pub struct LabeledClip {
  pub label: String,
  /// 写入索引的来源引用
  pub source: String,
  pub clip: Clip,
}

/// 参考数据集：`<root>/<label>/<clip>`
#[derive(Debug, Clone, Default)]
pub struct Dataset {
  pub clips: Vec<LabeledClip>,
}

impl Dataset {
  /// 扫描数据集目录，标签与文件都按名称排序；隐藏文件与无法识别的扩展名被跳过
  pub fn scan<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
    let root = root.as_ref();
    let mut labels: Vec<PathBuf> = std::fs::read_dir(root)
      .with_context(|| format!("无法读取数据集目录 {}", root.display()))?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| path.is_dir() && !is_hidden(path))
      .collect();
    labels.sort();

    let mut clips = Vec::new();
    for label_dir in labels {
      let Some(label) = label_dir.file_name().and_then(|n| n.to_str()) else {
        warn!("跳过无法解析的标签目录 {}", label_dir.display());
        continue;
      };
      let mut files: Vec<PathBuf> = std::fs::read_dir(&label_dir)
        .with_context(|| format!("无法读取标签目录 {}", label_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && !is_hidden(path) && is_clip_path(path))
        .collect();
      files.sort();

      for file in files {
        let url = clip_url_for_path(&file)
          .with_context(|| format!("无法为 {} 构造 URI", file.display()))?;
        clips.push(LabeledClip {
          label: label.to_string(),
          source: file.display().to_string(),
          clip: Clip::Url(url),
        });
      }
    }

    info!("数据集 {}: {} 个片段", root.display(), clips.len());
    Ok(Self { clips })
  }

  pub fn len(&self) -> usize {
    self.clips.len()
  }

  pub fn is_empty(&self) -> bool {
    self.clips.is_empty()
  }
}

impl FromIterator<LabeledClip> for Dataset {
  fn from_iter<T: IntoIterator<Item = LabeledClip>>(iter: T) -> Self {
    Self {
      clips: iter.into_iter().collect(),
    }
  }
}

fn is_hidden(path: &Path) -> bool {
  path
    .file_name()
    .and_then(|n| n.to_str())
    .is_some_and(|n| n.starts_with('.'))
}

/// 建库统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
  pub embedded: usize,
  pub failed: usize,
  pub dim: usize,
  pub interrupted: bool,
}

/// 离线建库：逐个嵌入参考片段并写出索引文件
#[derive(Debug, Default)]
pub struct BuildIndexTask {
  interruptible: bool,
}

impl BuildIndexTask {
  /// 允许 Ctrl-C 中断遍历，已经嵌入的片段仍会写出
  pub fn with_interrupt(mut self, interruptible: bool) -> Self {
    self.interruptible = interruptible;
    self
  }

  pub fn build<M: HandModel>(
    &self,
    dataset: &Dataset,
    embedder: &Embedder<M>,
    interrupt: Option<&Receiver<()>>,
  ) -> anyhow::Result<(VectorIndex, BuildReport)> {
    let mut builder = IndexBuilder::new(embedder.dim());
    let mut report = BuildReport {
      dim: embedder.dim(),
      ..Default::default()
    };

    for (i, item) in dataset.clips.iter().enumerate() {
      if interrupt.is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，停止遍历数据集");
        report.interrupted = true;
        break;
      }

      let now = Instant::now();
      // 含非有限值的描述子与嵌入失败一样跳过
      let added = embedder
        .embed(&item.clip, false)
        .map_err(anyhow::Error::from)
        .and_then(|descriptor| {
          builder.add(&descriptor, item.label.as_str(), item.source.as_str())?;
          Ok(())
        });
      match added {
        Ok(()) => {
          report.embedded += 1;
          info!(
            "[{}/{}] {} ({}) 嵌入完成，耗时: {:.2?}",
            i + 1,
            dataset.len(),
            item.label,
            item.source,
            now.elapsed()
          );
        }
        Err(e) => {
          report.failed += 1;
          warn!("[{}/{}] 跳过 {}: {}", i + 1, dataset.len(), item.source, e);
        }
      }
    }

    if builder.is_empty() {
      anyhow::bail!("没有任何片段嵌入成功 (失败 {} 个)", report.failed);
    }
    let index = builder.build()?;
    info!(
      "建库完成: {} 条, {} 维, 失败 {} 个",
      report.embedded, report.dim, report.failed
    );
    Ok((index, report))
  }
}

impl<M: HandModel, P: AsRef<Path>> Task<Dataset, Embedder<M>, P> for BuildIndexTask {
  type Error = anyhow::Error;

  fn run_task(self, input: Dataset, model: Embedder<M>, output: P) -> Result<(), Self::Error> {
    info!("开始建库任务...");
    let interrupt = if self.interruptible {
      Some(interrupt_channel()?)
    } else {
      None
    };

    let (index, _) = self.build(&input, &model, interrupt.as_ref())?;
    index
      .save(output.as_ref())
      .with_context(|| format!("无法写出索引到 {}", output.as_ref().display()))?;

    info!("任务完成，退出");
    Ok(())
  }
}

/// 查询输出的一行
#[derive(Debug, Serialize)]
pub struct QueryRecord<'a> {
  pub clip: String,
  pub outcome: &'static str,
  pub results: &'a [MatchResult],
}

fn outcome_name(outcome: &MatchOutcome) -> &'static str {
  match outcome {
    MatchOutcome::Matched(_) => "matched",
    MatchOutcome::NoFrames => "no_frames",
    MatchOutcome::NoDetection => "no_detection",
    MatchOutcome::LowConfidence { .. } => "low_confidence",
    MatchOutcome::Ambiguous { .. } => "ambiguous",
    MatchOutcome::Empty => "empty",
  }
}

/// 逐个查询片段，每个片段输出一行 JSON
#[derive(Debug)]
pub struct QueryTask {
  k: usize,
}

impl QueryTask {
  pub fn new(k: usize) -> Self {
    Self { k }
  }
}

impl<I, M, W> Task<I, Matcher<M>, W> for QueryTask
where
  I: IntoIterator<Item = Clip>,
  M: HandModel,
  W: Write,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: Matcher<M>, mut output: W) -> Result<(), Self::Error> {
    info!("开始查询任务...");
    for clip in input {
      let now = Instant::now();
      let outcome = model.query(&clip, self.k)?;
      let name = outcome_name(&outcome);
      let results = outcome.into_results();
      info!(
        "{}: {} ({} 条结果)，耗时: {:.2?}",
        clip,
        name,
        results.len(),
        now.elapsed()
      );

      let record = QueryRecord {
        clip: clip.to_string(),
        outcome: name,
        results: &results,
      };
      serde_json::to_writer(&mut output, &record)?;
      writeln!(output)?;
    }
    output.flush()?;
    info!("任务完成，退出");
    Ok(())
  }
}

/// 逐帧绘制关键点，用于检查检测质量
#[cfg(feature = "landmark_record")]
#[derive(Debug, Default)]
pub struct InspectTask {
  mirror: bool,
}

#[cfg(feature = "landmark_record")]
impl InspectTask {
  pub fn with_mirror(mut self, mirror: bool) -> Self {
    self.mirror = mirror;
    self
  }
}

#[cfg(feature = "landmark_record")]
impl<M, O, RE> Task<Clip, Embedder<M>, O> for InspectTask
where
  M: HandModel,
  RE: std::error::Error + Send + Sync + 'static,
  O: crate::output::Render<crate::frame::Frame, crate::landmark::SlotFrame, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: Clip, model: Embedder<M>, output: O) -> Result<(), Self::Error> {
    info!("开始检查任务...");
    let now = Instant::now();
    let (frames, sequence) = model.landmarks(&input, self.mirror)?;
    info!(
      "{}: {} 帧，手部覆盖率 {:.2}，耗时: {:.2?}",
      input,
      frames.len(),
      sequence.hand_coverage(),
      now.elapsed()
    );

    for (frame, result) in frames.iter().zip(sequence.frames.iter()) {
      debug!(
        "第 {} 帧 ({}ms): 槽位 {:?}",
        frame.index, frame.timestamp_ms, result.present
      );
      output.render_result(frame, result)?;
    }

    match model.embed_sequence(&sequence) {
      Ok(descriptor) => info!("描述子 {} 维", descriptor.len()),
      Err(e) => warn!("无法生成描述子: {}", e),
    }
    info!("任务完成，退出");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scan_sorts_labels_and_skips_unknown_files() {
    let dir = tempfile::tempdir().unwrap();
    for (label, files) in [("zebra", vec!["b.gif", "a.gif"]), ("apple", vec!["x.png", "notes.txt", ".hidden.gif"])] {
      let label_dir = dir.path().join(label);
      std::fs::create_dir_all(&label_dir).unwrap();
      for file in files {
        std::fs::write(label_dir.join(file), b"").unwrap();
      }
    }
    std::fs::write(dir.path().join("README.md"), b"").unwrap();

    let dataset = Dataset::scan(dir.path()).unwrap();
    let order: Vec<(&str, &str)> = dataset
      .clips
      .iter()
      .map(|c| {
        let name = Path::new(&c.source).file_name().and_then(|n| n.to_str()).unwrap();
        (c.label.as_str(), name)
      })
      .collect();
    assert_eq!(
      order,
      vec![("apple", "x.png"), ("zebra", "a.gif"), ("zebra", "b.gif")]
    );
    assert!(matches!(&dataset.clips[0].clip, Clip::Url(url) if url.scheme() == "image"));
  }

  #[test]
  fn outcome_names_are_stable() {
    assert_eq!(outcome_name(&MatchOutcome::Matched(Vec::new())), "matched");
    assert_eq!(
      outcome_name(&MatchOutcome::Ambiguous { margin: 0.01 }),
      "ambiguous"
    );
    assert_eq!(outcome_name(&MatchOutcome::NoFrames), "no_frames");
  }
}
