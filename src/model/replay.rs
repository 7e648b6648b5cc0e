// 该文件是 Tiletrack 项目的一部分。
// src/model/replay.rs - 回放预先计算的跟踪结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 跟踪结果回放
//!
//! 从 JSON Lines 文件读取外部跟踪器已经产出的结果，每行对应一帧中的一个子图：
//!
//! ```text
//! {"frame":0,"tile":0,"detections":[{"id":1,"bbox":[0,0,10,10],"score":0.9,"class":0}]}
//! ```
//!
//! `id` 缺失或为 `null` 表示跟踪器尚未确认身份。检测框使用子图内坐标。
//!
//! URL 形式为 `replay:///path/to/tracks.jsonl`。

use std::{
  collections::HashMap,
  fs::File,
  io::{BufRead, BufReader},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  grid::Tile,
  model::{BoundingBox, Detection, Identity, TileTracker, TrackId, TrackParams},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配: 期望 'replay', 实际 '{0}'")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
  frame: u64,
  tile: usize,
  #[serde(default)]
  detections: Vec<ReplayDetection>,
}

#[derive(Debug, Deserialize)]
struct ReplayDetection {
  #[serde(default)]
  id: Option<TrackId>,
  bbox: [f32; 4],
  #[serde(default = "default_score")]
  score: f32,
  #[serde(default, rename = "class")]
  class_id: u32,
}

fn default_score() -> f32 {
  1.0
}

impl From<ReplayDetection> for Detection {
  fn from(det: ReplayDetection) -> Self {
    Detection {
      identity: Identity::from(det.id),
      bbox: BoundingBox::from(det.bbox),
      score: det.score,
      class_id: det.class_id,
    }
  }
}

/// 按 (帧序号, 子图序号) 回放的跟踪器
#[derive(Debug, Default)]
pub struct ReplayTracker {
  records: HashMap<(u64, usize), Vec<Detection>>,
}

impl FromUrlWithScheme for ReplayTracker {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayTracker {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch(url.scheme().to_string()));
    }

    info!("加载回放文件: {}", url.path());
    let file = File::open(url.path())?;
    Self::from_reader(BufReader::new(file))
  }
}

impl ReplayTracker {
  pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ReplayError> {
    let mut records: HashMap<(u64, usize), Vec<Detection>> = HashMap::new();
    for (number, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record: ReplayRecord =
        serde_json::from_str(&line).map_err(|source| ReplayError::ParseError {
          line: number + 1,
          source,
        })?;
      records
        .entry((record.frame, record.tile))
        .or_default()
        .extend(record.detections.into_iter().map(Detection::from));
    }

    info!("回放记录加载完成，共 {} 条", records.len());
    Ok(Self { records })
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl TileTracker for ReplayTracker {
  type Error = ReplayError;

  fn track(
    &mut self,
    frame_index: u64,
    tile: &Tile,
    params: &TrackParams,
  ) -> Result<Vec<Detection>, Self::Error> {
    let Some(recorded) = self.records.get(&(frame_index, tile.index)) else {
      return Ok(Vec::new());
    };

    let mut detections = recorded
      .iter()
      .filter(|det| det.score >= params.confidence)
      .cloned()
      .collect::<Vec<_>>();
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    detections.truncate(params.max_detections);

    debug!(
      "回放第 {} 帧子图 {}: {} 个检测",
      frame_index,
      tile.index,
      detections.len()
    );
    Ok(detections)
  }
}
