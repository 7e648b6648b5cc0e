// 该文件是 Tiletrack 项目的一部分。
// src/grid.rs - 帧的网格切分与拼接
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

//! # 网格切分
//!
//! 将一帧按 `rows × cols` 切成若干子图，子图按行优先顺序排列：
//!
//! - `tile_height = frame_height / rows`
//! - `tile_width = frame_width / cols`
//!
//! 除不尽时，最下方与最右侧剩余的像素会被直接丢弃，
//! 因此 `merge(split(frame))` 得到的是裁剪到
//! `rows·tile_height × cols·tile_width` 的原帧。

use std::fmt;

use thiserror::Error;

use crate::frame::RgbNhwcFrame;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("网格尺寸无效: {rows}x{cols}，行列数必须至少为 1")]
pub struct InvalidGridError {
  pub rows: u32,
  pub cols: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeMismatchError {
  #[error("帧尺寸 {width}x{height} 不足以切分为 {rows}x{cols} 网格")]
  FrameTooSmall {
    width: u32,
    height: u32,
    rows: u32,
    cols: u32,
  },
  #[error("子图数量不匹配: 期望 {expected}, 实际 {actual}")]
  TileCount { expected: usize, actual: usize },
  #[error("第 {row} 行第 {col} 个子图高度为 {actual}, 期望 {expected}")]
  RowHeight {
    row: u32,
    col: u32,
    expected: u32,
    actual: u32,
  },
  #[error("第 {row} 行总宽度为 {actual}, 期望 {expected}")]
  RowWidth { row: u32, expected: u32, actual: u32 },
}

/// 网格规格 (rows, cols)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridSpec {
  rows: u32,
  cols: u32,
}

impl Default for GridSpec {
  fn default() -> Self {
    Self { rows: 3, cols: 3 }
  }
}

impl fmt::Display for GridSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.rows, self.cols)
  }
}

impl GridSpec {
  pub fn new(rows: u32, cols: u32) -> Result<Self, InvalidGridError> {
    if rows == 0 || cols == 0 {
      return Err(InvalidGridError { rows, cols });
    }
    Ok(Self { rows, cols })
  }

  /// 读取失败时回退到 2x2
  pub fn new_or_fallback(rows: u32, cols: u32) -> Self {
    Self::new(rows, cols).unwrap_or_else(|e| {
      tracing::warn!("{}，回退到 2x2", e);
      Self { rows: 2, cols: 2 }
    })
  }

  pub fn rows(&self) -> u32 {
    self.rows
  }

  pub fn cols(&self) -> u32 {
    self.cols
  }

  pub fn tile_count(&self) -> usize {
    self.rows as usize * self.cols as usize
  }

  /// 给定帧尺寸下单个子图的 (width, height)
  pub fn tile_size(&self, frame_width: u32, frame_height: u32) -> (u32, u32) {
    (frame_width / self.cols, frame_height / self.rows)
  }

  /// 按行优先顺序切分帧
  pub fn split(&self, frame: &RgbNhwcFrame) -> Result<Vec<Tile>, ShapeMismatchError> {
    let (tile_w, tile_h) = self.tile_size(frame.width(), frame.height());
    if tile_w == 0 || tile_h == 0 {
      return Err(ShapeMismatchError::FrameTooSmall {
        width: frame.width(),
        height: frame.height(),
        rows: self.rows,
        cols: self.cols,
      });
    }

    let channels = frame.channels();
    let tile_stride = tile_w as usize * channels;
    let mut tiles = Vec::with_capacity(self.tile_count());

    for row in 0..self.rows {
      for col in 0..self.cols {
        let x = col * tile_w;
        let y = row * tile_h;
        let mut image = RgbNhwcFrame::with_shape(tile_w, tile_h);
        let offset = x as usize * channels;
        for dy in 0..tile_h {
          image
            .row_mut(dy)
            .copy_from_slice(&frame.row(y + dy)[offset..offset + tile_stride]);
        }

        tiles.push(Tile {
          index: (row * self.cols + col) as usize,
          row,
          col,
          x,
          y,
          image,
        });
      }
    }

    Ok(tiles)
  }

  /// `split` 的逆操作：先按行横向拼接，再纵向堆叠
  pub fn merge(&self, tiles: &[RgbNhwcFrame]) -> Result<RgbNhwcFrame, ShapeMismatchError> {
    if tiles.len() != self.tile_count() {
      return Err(ShapeMismatchError::TileCount {
        expected: self.tile_count(),
        actual: tiles.len(),
      });
    }

    let cols = self.cols as usize;
    let mut width = None;
    let mut height = 0u32;

    for (row, row_tiles) in tiles.chunks(cols).enumerate() {
      let row_height = row_tiles[0].height();
      for (col, tile) in row_tiles.iter().enumerate() {
        if tile.height() != row_height {
          return Err(ShapeMismatchError::RowHeight {
            row: row as u32,
            col: col as u32,
            expected: row_height,
            actual: tile.height(),
          });
        }
      }

      let row_width = row_tiles.iter().map(RgbNhwcFrame::width).sum::<u32>();
      match width {
        None => width = Some(row_width),
        Some(expected) if expected != row_width => {
          return Err(ShapeMismatchError::RowWidth {
            row: row as u32,
            expected,
            actual: row_width,
          });
        }
        Some(_) => {}
      }
      height += row_height;
    }

    let width = width.unwrap_or(0);
    let mut merged = RgbNhwcFrame::with_shape(width, height);
    let mut y = 0u32;
    for row_tiles in tiles.chunks(cols) {
      let row_height = row_tiles[0].height();
      for dy in 0..row_height {
        let dst = merged.row_mut(y + dy);
        let mut offset = 0usize;
        for tile in row_tiles {
          let src = tile.row(dy);
          dst[offset..offset + src.len()].copy_from_slice(src);
          offset += src.len();
        }
      }
      y += row_height;
    }

    Ok(merged)
  }
}

/// 子图及其在原帧中的位置
#[derive(Debug, Clone)]
pub struct Tile {
  /// 行优先序号
  pub index: usize,
  pub row: u32,
  pub col: u32,
  /// 左上角在原帧中的横坐标
  pub x: u32,
  /// 左上角在原帧中的纵坐标
  pub y: u32,
  pub image: RgbNhwcFrame,
}

impl Tile {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  /// 子图在原帧坐标系中的范围 [x_min, y_min, x_max, y_max)
  pub fn extent(&self) -> [f32; 4] {
    [
      self.x as f32,
      self.y as f32,
      (self.x + self.width()) as f32,
      (self.y + self.height()) as f32,
    ]
  }
}
