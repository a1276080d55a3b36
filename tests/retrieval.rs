// 该文件是 Shouyu （手语检索） 项目的一部分。
// tests/retrieval.rs - 端到端检索测试
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

mod common;

use common::{HandPose, MarkerModel, empty_clip, gesture_a, gesture_b, gesture_c, render};
use shouyu::{
  config::{Config, EmbedderConfig, MatcherConfig},
  embed::{DEFAULT_COVERAGE_THRESHOLD, EmbedError, Embedder},
  index::VectorIndex,
  input::{Clip, MemoryClip},
  matcher::{MatchError, MatchOutcome, Matcher, match_descriptors},
  task::{BuildIndexTask, Dataset, LabeledClip, QueryTask, Task},
};
use url::Url;

fn labeled(label: &str, clip: MemoryClip) -> LabeledClip {
  LabeledClip {
    label: label.to_string(),
    source: format!("{}/0.gif", label),
    clip: Clip::from(clip),
  }
}

fn reference_dataset() -> Dataset {
  vec![
    labeled("A", gesture_a([0.0, 0.0], 1.0, 0.4)),
    labeled("B", gesture_b()),
    labeled("C", gesture_c()),
  ]
  .into_iter()
  .collect()
}

fn build_matcher(config: &Config) -> Matcher<MarkerModel> {
  let embedder = Embedder::new(MarkerModel, &config.embedder);
  let (index, report) = BuildIndexTask::default()
    .build(&reference_dataset(), &embedder, None)
    .unwrap();
  assert_eq!(report.embedded, 3);
  assert_eq!(report.failed, 0);
  Matcher::new(index, embedder, config.matcher.clone())
}

#[test]
fn perturbed_clip_retrieves_its_label() {
  let matcher = build_matcher(&Config::default());
  let query = Clip::from(gesture_a([6.0, -8.0], 1.1, 0.35));

  let outcome = matcher.query(&query, 20).unwrap();
  assert!(outcome.is_matched(), "期望匹配成功，实际为 {:?}", outcome);
  let results = outcome.into_results();
  assert_eq!(results[0].label, "A");
  assert!(results[0].similarity > 0.55);
  if let Some(second) = results.get(1) {
    assert!(results[0].similarity - second.similarity > 0.03);
  }
  assert_eq!(results[0].source_reference, "A/0.gif");
  assert!(results[0].confidence.ends_with('%'));
}

#[test]
fn every_reference_is_its_own_nearest_neighbour() {
  let config = Config::default();
  let matcher = build_matcher(&config);
  for item in reference_dataset().clips {
    let descriptor = matcher.embedder().embed(&item.clip, false).unwrap();
    let outcome = match_descriptors(
      matcher.index(),
      &[descriptor.as_slice()],
      20,
      &config.matcher,
    )
    .unwrap();
    let results = outcome.into_results();
    assert_eq!(results[0].label, item.label);
    assert!((results[0].similarity - 1.0).abs() < 1e-4);
  }
}

#[test]
fn two_handed_clip_is_not_confused_with_one_hand() {
  let matcher = build_matcher(&Config::default());
  let results = matcher.search(&Clip::from(gesture_c()), 20).unwrap();
  assert_eq!(results[0].label, "C");
}

#[test]
fn clip_without_hands_yields_empty_result() {
  let matcher = build_matcher(&Config::default());
  let clip = Clip::from(empty_clip(12));
  assert_eq!(matcher.query(&clip, 20).unwrap(), MatchOutcome::NoDetection);
  assert!(matcher.search(&clip, 20).unwrap().is_empty());
  assert!(matches!(
    matcher.embedder().embed(&clip, false),
    Err(EmbedError::NoDetection)
  ));
}

#[test]
fn unreadable_clip_yields_empty_result() {
  let matcher = build_matcher(&Config::default());

  let missing = Clip::from(Url::parse("image:///no/such/clip.gif").unwrap());
  assert_eq!(matcher.query(&missing, 20).unwrap(), MatchOutcome::NoFrames);

  let empty = Clip::from(MemoryClip::new());
  assert!(matcher.search(&empty, 20).unwrap().is_empty());
}

#[test]
fn descriptor_dimension_must_match_index() {
  let matcher = build_matcher(&Config::default());
  let index = matcher.index().clone();
  assert_eq!(index.dim(), 388);

  let narrow = EmbedderConfig {
    wrist_features: false,
    ..EmbedderConfig::default()
  };
  let mismatched = Matcher::new(
    index,
    Embedder::new(MarkerModel, &narrow),
    MatcherConfig::default(),
  );
  assert!(matches!(
    mismatched.query(&Clip::from(gesture_b()), 20),
    Err(MatchError::DimensionMismatch {
      expected: 388,
      actual: 378
    })
  ));
}

#[test]
fn strict_thresholds_gate_out_weak_matches() {
  let config = Config {
    matcher: MatcherConfig {
      confidence_threshold: 1.0,
      ..MatcherConfig::default()
    },
    ..Config::default()
  };
  let matcher = build_matcher(&config);
  let outcome = matcher
    .query(&Clip::from(gesture_a([6.0, -8.0], 1.1, 0.35)), 20)
    .unwrap();
  assert!(matches!(outcome, MatchOutcome::LowConfidence { .. }));
}

#[test]
fn built_index_survives_save_and_load() {
  let dir = tempfile::tempdir().unwrap();
  let config = Config::default();

  BuildIndexTask::default()
    .run_task(
      reference_dataset(),
      Embedder::new(MarkerModel, &config.embedder),
      dir.path(),
    )
    .unwrap();

  let loaded = VectorIndex::load(dir.path()).unwrap();
  assert_eq!(loaded.len(), 3);
  assert_eq!(loaded.dim(), 388);
  assert_eq!(loaded.label(1), Some("B"));
  assert_eq!(loaded.source(2), Some("C/0.gif"));

  let rebuilt = build_matcher(&config);
  assert_eq!(&loaded, rebuilt.index());

  let matcher = Matcher::new(
    loaded,
    Embedder::new(MarkerModel, &config.embedder),
    config.matcher.clone(),
  );
  let results = matcher
    .search(&Clip::from(gesture_a([6.0, -8.0], 1.1, 0.35)), 20)
    .unwrap();
  assert_eq!(results[0].label, "A");
}

#[test]
fn build_skips_clips_that_fail_to_embed() {
  let embedder = Embedder::new(MarkerModel, &EmbedderConfig::default());
  let mut dataset = reference_dataset();
  dataset.clips.push(labeled("blank", empty_clip(5)));

  let (index, report) = BuildIndexTask::default()
    .build(&dataset, &embedder, None)
    .unwrap();
  assert_eq!(report.embedded, 3);
  assert_eq!(report.failed, 1);
  assert_eq!(index.len(), 3);

  let only_blank: Dataset = vec![labeled("blank", empty_clip(5))].into_iter().collect();
  assert!(
    BuildIndexTask::default()
      .build(&only_blank, &embedder, None)
      .is_err()
  );
}

#[test]
fn dataset_directory_of_still_images() {
  let dir = tempfile::tempdir().unwrap();
  let poses = [
    ("up", HandPose::upright([100.0, 150.0])),
    (
      "right",
      HandPose {
        rotation: std::f32::consts::FRAC_PI_2,
        ..HandPose::upright([60.0, 100.0])
      },
    ),
  ];
  for (label, pose) in poses {
    let label_dir = dir.path().join("dataset").join(label);
    std::fs::create_dir_all(&label_dir).unwrap();
    render(&[pose]).save(label_dir.join("0.png")).unwrap();
  }

  let config = Config::default();
  let dataset = Dataset::scan(dir.path().join("dataset")).unwrap();
  assert_eq!(dataset.len(), 2);
  let index_dir = dir.path().join("index");
  BuildIndexTask::default()
    .run_task(
      dataset,
      Embedder::new(MarkerModel, &config.embedder),
      &index_dir,
    )
    .unwrap();

  let query_path = dir.path().join("query.png");
  render(&[HandPose {
    scale: 1.2,
    ..HandPose::upright([90.0, 140.0])
  }])
  .save(&query_path)
  .unwrap();

  let matcher = Matcher::new(
    VectorIndex::load(&index_dir).unwrap(),
    Embedder::new(MarkerModel, &config.embedder),
    config.matcher.clone(),
  );
  let query = Clip::from(shouyu::input::clip_url_for_path(&query_path).unwrap());

  let mut output = Vec::new();
  QueryTask::new(20)
    .run_task(vec![query], matcher, &mut output)
    .unwrap();
  let line: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(line["outcome"], "matched");
  assert_eq!(line["results"][0]["label"], "up");
}

#[test]
fn hand_coverage_check() {
  let embedder = Embedder::new(MarkerModel, &EmbedderConfig::default());
  let pose = HandPose::upright([100.0, 150.0]);

  let sparse = common::clip_from_poses(10, |phase| {
    if phase < 0.2 { vec![pose] } else { Vec::new() }
  });
  assert!(!embedder.has_sufficient_coverage(&Clip::from(sparse), DEFAULT_COVERAGE_THRESHOLD));

  let dense = common::clip_from_poses(10, |phase| {
    if phase < 0.5 { vec![pose] } else { Vec::new() }
  });
  assert!(embedder.has_sufficient_coverage(&Clip::from(dense), DEFAULT_COVERAGE_THRESHOLD));

  assert!(!embedder.has_sufficient_coverage(&Clip::from(MemoryClip::new()), DEFAULT_COVERAGE_THRESHOLD));
}
