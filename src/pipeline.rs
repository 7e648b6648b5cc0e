// 该文件是 Tiletrack 项目的一部分。
// src/pipeline.rs - 单帧处理流程
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

//! 每一帧按固定顺序处理：
//!
//! 切分 → 逐个子图检测 → 更新登记表 → 逐个子图绘制 → 拼接。
//!
//! 检测结果在进入登记表前已换算为整帧坐标，绘制时再换算回子图坐标。

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::{
  frame::RgbNhwcFrame,
  grid::{GridSpec, ShapeMismatchError},
  model::{DetectorAdapter, TileTracker, TrackParams},
  output::draw::Painter,
  registry::{ObjectRegistry, UpdateSummary},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("帧形状错误: {0}")]
  ShapeMismatch(#[from] ShapeMismatchError),
}

/// 一帧的处理结果
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
  pub index: u64,
  /// 绘制后拼接的帧
  pub frame: RgbNhwcFrame,
  pub summary: UpdateSummary,
  /// 本帧所有子图的检测总数
  pub detections: usize,
  /// 检测失败、按空结果处理的子图数
  pub failed_tiles: usize,
  pub elapsed: Duration,
}

/// 处理线程独占的全部状态
pub struct TilePipeline<M> {
  grid: GridSpec,
  adapter: DetectorAdapter<M>,
  registry: ObjectRegistry,
  painter: Painter,
}

impl<M: TileTracker> TilePipeline<M> {
  pub fn new(
    grid: GridSpec,
    model: M,
    params: TrackParams,
    registry: ObjectRegistry,
    painter: Painter,
  ) -> Self {
    Self {
      grid,
      adapter: DetectorAdapter::new(model, params),
      registry,
      painter,
    }
  }

  pub fn grid(&self) -> GridSpec {
    self.grid
  }

  pub fn registry(&self) -> &ObjectRegistry {
    &self.registry
  }

  pub fn painter(&self) -> &Painter {
    &self.painter
  }

  pub fn adapter(&self) -> &DetectorAdapter<M> {
    &self.adapter
  }

  pub fn process(
    &mut self,
    index: u64,
    frame: &RgbNhwcFrame,
  ) -> Result<ProcessedFrame, PipelineError> {
    let started = Instant::now();
    let tiles = self.grid.split(frame)?;

    let mut detections = Vec::new();
    let mut failed_tiles = 0;
    for tile in &tiles {
      let (found, ok) = self.adapter.detect_or_empty(index, tile);
      if !ok {
        failed_tiles += 1;
      }
      detections.extend(found);
    }

    let summary = self.registry.update(&detections);

    let rendered = tiles
      .iter()
      .map(|tile| self.painter.render_tile(tile, &self.registry))
      .collect::<Vec<_>>();
    let merged = self.grid.merge(&rendered)?;

    let elapsed = started.elapsed();
    debug!(
      "第 {} 帧: {} 个检测, 登记 {} 个目标, 耗时 {:.2?}",
      index,
      detections.len(),
      self.registry.len(),
      elapsed
    );

    Ok(ProcessedFrame {
      index,
      frame: merged,
      summary,
      detections: detections.len(),
      failed_tiles,
      elapsed,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    grid::Tile,
    model::{Detection, TrackId},
    output::draw::BoxStyles,
    registry::ExpiryPolicy,
  };

  #[derive(Debug, Error)]
  #[error("tile rejected")]
  struct Rejected;

  /// 每个子图都在左上角报告一个以子图序号为编号的目标，`reject` 中的子图失败
  struct CornerTracker {
    reject: Vec<usize>,
  }

  impl TileTracker for CornerTracker {
    type Error = Rejected;

    fn track(
      &mut self,
      _frame_index: u64,
      tile: &Tile,
      _params: &TrackParams,
    ) -> Result<Vec<Detection>, Self::Error> {
      if self.reject.contains(&tile.index) {
        return Err(Rejected);
      }
      Ok(vec![Detection::identified(
        tile.index as TrackId + 100,
        [0.0, 0.0, 1.0, 1.0],
      )])
    }
  }

  fn pipeline(reject: Vec<usize>) -> TilePipeline<CornerTracker> {
    TilePipeline::new(
      GridSpec::new(2, 2).unwrap(),
      CornerTracker { reject },
      TrackParams::default(),
      ObjectRegistry::new(ExpiryPolicy::new(2, 10).unwrap()),
      Painter::new(BoxStyles::default()),
    )
  }

  #[test]
  fn detections_are_registered_in_frame_coordinates() {
    let mut pipeline = pipeline(vec![]);
    let out = pipeline.process(0, &RgbNhwcFrame::with_shape(8, 6)).unwrap();

    assert_eq!(out.detections, 4);
    assert_eq!(out.summary.inserted, 4);
    let obj = pipeline.registry().get(103).unwrap();
    assert_eq!((obj.last_box.x1, obj.last_box.y1), (4.0, 3.0));
    assert_eq!((out.frame.width(), out.frame.height()), (8, 6));
  }

  #[test]
  fn failing_tile_does_not_stop_the_frame() {
    let mut pipeline = pipeline(vec![0, 2]);
    let out = pipeline.process(0, &RgbNhwcFrame::with_shape(8, 8)).unwrap();

    assert_eq!(out.failed_tiles, 2);
    assert_eq!(out.detections, 2);
    assert!(pipeline.registry().get(100).is_none());
    assert!(pipeline.registry().get(101).is_some());
  }

  #[test]
  fn too_small_frame_is_a_shape_mismatch() {
    let mut pipeline = pipeline(vec![]);
    assert!(matches!(
      pipeline.process(0, &RgbNhwcFrame::with_shape(1, 1)),
      Err(PipelineError::ShapeMismatch(_))
    ));
  }

  #[test]
  fn odd_frame_is_cropped_to_the_grid() {
    let mut pipeline = pipeline(vec![]);
    let out = pipeline.process(0, &RgbNhwcFrame::with_shape(9, 7)).unwrap();
    assert_eq!((out.frame.width(), out.frame.height()), (8, 6));
  }
}
