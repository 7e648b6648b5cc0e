// 该文件是 Tiletrack 项目的一部分。
// src/model.rs - 检测/跟踪模型接口
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, grid::Tile};

mod replay;
pub use self::replay::{ReplayError, ReplayTracker};

/// 跟踪器分配的目标编号
pub type TrackId = u64;

/// 检测结果的身份
///
/// 跟踪器尚未确认身份的检测为 `Unconfirmed`，这类检测不进入目标登记表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
  Identified(TrackId),
  Unconfirmed,
}

impl From<Option<TrackId>> for Identity {
  fn from(id: Option<TrackId>) -> Self {
    match id {
      Some(id) => Identity::Identified(id),
      None => Identity::Unconfirmed,
    }
  }
}

/// 像素坐标下的检测框 (x1, y1, x2, y2)
///
/// 不要求 x1 <= x2，退化的框原样保存，由绘制阶段处理。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BoundingBox {
  pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn translate(&self, dx: f32, dy: f32) -> Self {
    Self {
      x1: self.x1 + dx,
      y1: self.y1 + dy,
      x2: self.x2 + dx,
      y2: self.y2 + dy,
    }
  }

  /// 保证 (x1, y1) 为左上角
  pub fn normalized(&self) -> Self {
    Self {
      x1: self.x1.min(self.x2),
      y1: self.y1.min(self.y2),
      x2: self.x1.max(self.x2),
      y2: self.y1.max(self.y2),
    }
  }

  /// 与区域 [x_min, y_min, x_max, y_max) 是否有交集（边框像素包含在内）
  pub fn intersects(&self, extent: &[f32; 4]) -> bool {
    let b = self.normalized();
    b.x1 < extent[2] && b.x2 >= extent[0] && b.y1 < extent[3] && b.y2 >= extent[1]
  }
}

impl From<[f32; 4]> for BoundingBox {
  fn from(b: [f32; 4]) -> Self {
    Self::new(b[0], b[1], b[2], b[3])
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub identity: Identity,
  pub bbox: BoundingBox,
  pub score: f32,
  pub class_id: u32,
}

impl Detection {
  pub fn identified(id: TrackId, bbox: impl Into<BoundingBox>) -> Self {
    Self {
      identity: Identity::Identified(id),
      bbox: bbox.into(),
      score: 1.0,
      class_id: 0,
    }
  }

  pub fn unconfirmed(bbox: impl Into<BoundingBox>) -> Self {
    Self {
      identity: Identity::Unconfirmed,
      bbox: bbox.into(),
      score: 1.0,
      class_id: 0,
    }
  }

  pub fn with_score(mut self, score: f32) -> Self {
    self.score = score;
    self
  }

  pub fn with_class(mut self, class_id: u32) -> Self {
    self.class_id = class_id;
    self
  }
}

/// 每次跟踪调用的固定参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackParams {
  pub confidence: f32,
  pub iou: f32,
  pub agnostic_nms: bool,
  pub max_detections: usize,
}

impl Default for TrackParams {
  fn default() -> Self {
    Self {
      confidence: 0.3,
      iou: 0.75,
      agnostic_nms: false,
      max_detections: 100,
    }
  }
}

#[derive(Error, Debug)]
pub enum DetectionError {
  #[error("子图 {tile} 检测失败: {message}")]
  Tracker { tile: usize, message: String },
  #[error("子图 {tile} 无效: {width}x{height}")]
  MalformedTile { tile: usize, width: u32, height: u32 },
}

/// 外部检测/跟踪能力
///
/// 返回的检测框使用子图内坐标。实现需要在连续调用之间给同一目标保持稳定的编号。
pub trait TileTracker {
  type Error: std::error::Error;

  fn track(
    &mut self,
    frame_index: u64,
    tile: &Tile,
    params: &TrackParams,
  ) -> Result<Vec<Detection>, Self::Error>;
}

impl<T: TileTracker + ?Sized> TileTracker for Box<T> {
  type Error = T::Error;

  fn track(
    &mut self,
    frame_index: u64,
    tile: &Tile,
    params: &TrackParams,
  ) -> Result<Vec<Detection>, Self::Error> {
    (**self).track(frame_index, tile, params)
  }
}

/// 按子图调用跟踪器，并把检测框换算到整帧坐标
pub struct DetectorAdapter<M> {
  model: M,
  params: TrackParams,
}

impl<M: TileTracker> DetectorAdapter<M> {
  pub fn new(model: M, params: TrackParams) -> Self {
    Self { model, params }
  }

  pub fn params(&self) -> &TrackParams {
    &self.params
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn model_mut(&mut self) -> &mut M {
    &mut self.model
  }

  /// 单个子图的检测，返回整帧坐标下的结果
  pub fn try_detect(
    &mut self,
    frame_index: u64,
    tile: &Tile,
  ) -> Result<Vec<Detection>, DetectionError> {
    if tile.width() == 0 || tile.height() == 0 {
      return Err(DetectionError::MalformedTile {
        tile: tile.index,
        width: tile.width(),
        height: tile.height(),
      });
    }

    let mut detections = self
      .model
      .track(frame_index, tile, &self.params)
      .map_err(|e| DetectionError::Tracker {
        tile: tile.index,
        message: e.to_string(),
      })?;

    let (dx, dy) = (tile.x as f32, tile.y as f32);
    for det in detections.iter_mut() {
      det.bbox = det.bbox.translate(dx, dy);
    }
    Ok(detections)
  }

  /// 失败时记录日志并视为空结果，第二个返回值表示检测是否成功
  pub fn detect_or_empty(&mut self, frame_index: u64, tile: &Tile) -> (Vec<Detection>, bool) {
    match self.try_detect(frame_index, tile) {
      Ok(detections) => (detections, true),
      Err(e) => {
        warn!("第 {} 帧: {}，按无检测处理", frame_index, e);
        (Vec::new(), false)
      }
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("回放检测错误: {0}")]
  Replay(#[from] ReplayError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 根据 URL 选择检测器
pub enum ModelWrapper {
  Replay(ReplayTracker),
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ReplayTracker::SCHEME => Ok(ModelWrapper::Replay(ReplayTracker::from_url(url)?)),
      other => Err(ModelError::SchemeMismatch(other.to_string())),
    }
  }
}

impl TileTracker for ModelWrapper {
  type Error = ModelError;

  fn track(
    &mut self,
    frame_index: u64,
    tile: &Tile,
    params: &TrackParams,
  ) -> Result<Vec<Detection>, Self::Error> {
    match self {
      ModelWrapper::Replay(model) => Ok(model.track(frame_index, tile, params)?),
    }
  }
}
