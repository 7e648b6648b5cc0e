// 该文件是 Tiletrack 项目的一部分。
// src/output/draw.rs - 目标框可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::RgbNhwcFrame,
  grid::Tile,
  model::BoundingBox,
  registry::{ObjectRegistry, TrackedObject},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: i32 = 18;
const LABEL_CHAR_WIDTH: f32 = 9.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 1;

/// 像素坐标的取值上限，远超出画面的框被截到这个范围内
const PIXEL_COORD_LIMIT: f32 = (i32::MAX / 4) as f32;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 边框样式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxStyle {
  pub color: [u8; 3],
  pub thickness: u32,
}

impl BoxStyle {
  pub const fn new(color: [u8; 3], thickness: u32) -> Self {
    Self { color, thickness }
  }
}

/// live 与 held 两种样式，默认 live 为蓝色、held 为绿色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxStyles {
  pub live: BoxStyle,
  pub held: BoxStyle,
}

impl Default for BoxStyles {
  fn default() -> Self {
    Self {
      live: BoxStyle::new([0, 0, 255], 2), // 蓝色
      held: BoxStyle::new([0, 255, 0], 2), // 绿色
    }
  }
}

/// 根据登记表绘制目标框，不修改登记表
#[derive(Clone)]
pub struct Painter {
  styles: BoxStyles,
  font: Option<FontArc>,
  font_size: f32,
}

impl Default for Painter {
  fn default() -> Self {
    Self::new(BoxStyles::default())
  }
}

impl Painter {
  pub fn new(styles: BoxStyles) -> Self {
    Self {
      styles,
      font: None,
      font_size: LABEL_FONT_SIZE,
    }
  }

  /// 加载字体后在框上方标注目标编号
  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    self.font = Some(FontArc::try_from_vec(data)?);
    info!("标签字体已加载: {}", path.as_ref().display());
    Ok(self)
  }

  pub fn styles(&self) -> &BoxStyles {
    &self.styles
  }

  /// 在整帧上绘制全部目标
  pub fn render(&self, frame: &RgbNhwcFrame, registry: &ObjectRegistry) -> RgbNhwcFrame {
    let extent = [0.0, 0.0, frame.width() as f32, frame.height() as f32];
    let mut image = frame.to_rgb_image();
    self.draw_objects(&mut image, (0, 0), &extent, registry);
    RgbNhwcFrame::from(image)
  }

  /// 只绘制与子图相交的目标，坐标换算到子图内
  pub fn render_tile(&self, tile: &Tile, registry: &ObjectRegistry) -> RgbNhwcFrame {
    let mut image = tile.image.to_rgb_image();
    self.draw_objects(
      &mut image,
      (tile.x as i32, tile.y as i32),
      &tile.extent(),
      registry,
    );
    RgbNhwcFrame::from(image)
  }

  fn draw_objects(
    &self,
    image: &mut RgbImage,
    origin: (i32, i32),
    extent: &[f32; 4],
    registry: &ObjectRegistry,
  ) {
    for (object, state) in registry.iter() {
      if !object.last_box.intersects(extent) {
        continue;
      }
      let style = if state.is_held() {
        self.styles.held
      } else {
        self.styles.live
      };
      let Some(corners) = pixel_corners(&object.last_box, origin) else {
        debug!("目标 {} 的检测框坐标无效，跳过绘制", object.id);
        continue;
      };
      draw_box(image, corners, style);
      if let Some(font) = &self.font {
        self.draw_label(image, corners, object, style, font);
      }
    }
  }

  fn draw_label(
    &self,
    image: &mut RgbImage,
    corners: [i32; 4],
    object: &TrackedObject,
    style: BoxStyle,
    font: &FontArc,
  ) {
    let label = format!("#{}", object.id);
    let text_width = (label.len() as f32 * LABEL_CHAR_WIDTH).ceil() as u32;
    let label_x = corners[0];
    let label_y = corners[1].saturating_sub(LABEL_TEXT_HEIGHT);
    let (w, h) = (image.width() as i32, image.height() as i32);
    if label_x >= w
      || label_y >= h
      || label_x.saturating_add(text_width as i32) < 0
      || label_y.saturating_add(LABEL_TEXT_HEIGHT) < 0
    {
      return;
    }

    let rect = imageproc::rect::Rect::at(label_x, label_y)
      .of_size(text_width.max(1), LABEL_TEXT_HEIGHT as u32);
    draw_filled_rect_mut(image, rect, Rgb(style.color));
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      PxScale::from(self.font_size),
      font,
      &label,
    );
  }
}

/// 检测框换算为相对 origin 的像素角点 [x_min, y_min, x_max, y_max]（闭区间）
///
/// 翻转的框在这里被规整。坐标含 NaN 或无穷大时返回 `None`。
pub fn pixel_corners(bbox: &BoundingBox, origin: (i32, i32)) -> Option<[i32; 4]> {
  // normalized 中的 min/max 会吞掉 NaN，先检查原始坐标
  if [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
    .iter()
    .any(|v| !v.is_finite())
  {
    return None;
  }
  let b = bbox.normalized();
  let to_pixel = |v: f32| v.floor().clamp(-PIXEL_COORD_LIMIT, PIXEL_COORD_LIMIT) as i32;
  Some([
    to_pixel(b.x1).saturating_sub(origin.0),
    to_pixel(b.y1).saturating_sub(origin.1),
    to_pixel(b.x2).saturating_sub(origin.0),
    to_pixel(b.y2).saturating_sub(origin.1),
  ])
}

/// 绘制空心矩形，超出图像的部分被裁掉
pub fn draw_box(image: &mut RgbImage, corners: [i32; 4], style: BoxStyle) {
  let (w, h) = (image.width() as i32, image.height() as i32);
  let color = Rgb(style.color);
  let [x_min, y_min, x_max, y_max] = corners;

  for t in 0..style.thickness as i32 {
    let (left, top, right, bottom) = (
      x_min.saturating_add(t),
      y_min.saturating_add(t),
      x_max.saturating_sub(t),
      y_max.saturating_sub(t),
    );
    if left > right || top > bottom {
      break;
    }

    // 上下两条边
    for x in left.max(0)..=right.min(w - 1) {
      for y in [top, bottom] {
        if (0..h).contains(&y) {
          image.put_pixel(x as u32, y as u32, color);
        }
      }
    }

    // 左右两条边
    for y in top.max(0)..=bottom.min(h - 1) {
      for x in [left, right] {
        if (0..w).contains(&x) {
          image.put_pixel(x as u32, y as u32, color);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    grid::GridSpec,
    model::Detection,
    registry::{ExpiryPolicy, ObjectRegistry},
  };

  const BLACK: [u8; 3] = [0, 0, 0];
  const NONE: &[Detection] = &[];

  fn registry_with(dets: &[Detection]) -> ObjectRegistry {
    let mut reg = ObjectRegistry::new(ExpiryPolicy::new(2, 10).unwrap());
    reg.update(dets);
    reg
  }

  #[test]
  fn draws_box_outline_only() {
    let mut image = RgbImage::new(8, 8);
    draw_box(&mut image, [1, 1, 6, 6], BoxStyle::new([9, 9, 9], 1));

    assert_eq!(image.get_pixel(1, 1).0, [9, 9, 9]);
    assert_eq!(image.get_pixel(6, 3).0, [9, 9, 9]);
    assert_eq!(image.get_pixel(3, 6).0, [9, 9, 9]);
    assert_eq!(image.get_pixel(3, 3).0, BLACK);
    assert_eq!(image.get_pixel(0, 0).0, BLACK);
  }

  #[test]
  fn out_of_bounds_edges_are_clipped_not_clamped() {
    let mut image = RgbImage::new(4, 4);
    draw_box(&mut image, [-2, 1, 10, 2], BoxStyle::new([9, 9, 9], 1));

    // 左右边在图像外，不应在边界处出现竖线
    assert_eq!(image.get_pixel(0, 1).0, [9, 9, 9]);
    assert_eq!(image.get_pixel(3, 2).0, [9, 9, 9]);
    assert_eq!(image.get_pixel(0, 3).0, BLACK);
    assert_eq!(image.get_pixel(3, 0).0, BLACK);
  }

  #[test]
  fn flipped_box_is_drawn_normalized() {
    let flipped = BoundingBox::new(5.0, 5.0, 1.0, 2.0);
    assert_eq!(pixel_corners(&flipped, (0, 0)), Some([1, 2, 5, 5]));
    assert_eq!(pixel_corners(&flipped, (1, 2)), Some([0, 0, 4, 3]));
  }

  #[test]
  fn live_and_held_styles_follow_age() {
    let painter = Painter::new(BoxStyles::default());
    let frame = RgbNhwcFrame::with_shape(6, 6);
    let mut reg = registry_with(&[Detection::identified(1, [0.0, 0.0, 3.0, 3.0])]);

    let out = painter.render(&frame, &reg);
    assert_eq!(out.pixel(0, 0), BoxStyles::default().live.color);

    reg.update(NONE);
    let out = painter.render(&frame, &reg);
    assert_eq!(out.pixel(0, 0), BoxStyles::default().live.color);

    reg.update(NONE);
    let out = painter.render(&frame, &reg);
    assert_eq!(out.pixel(0, 0), BoxStyles::default().held.color);
    assert_eq!(frame.pixel(0, 0), BLACK);
  }

  #[test]
  fn tile_rendering_matches_whole_frame_rendering() {
    let painter = Painter::new(BoxStyles::default());
    let grid = GridSpec::new(2, 2).unwrap();
    let frame = RgbNhwcFrame::filled(8, 8, [40, 40, 40]);
    // 跨越四个子图的框
    let reg = registry_with(&[
      Detection::identified(1, [2.5, 1.0, 6.0, 5.2]),
      Detection::identified(2, [0.0, 6.0, 1.0, 7.0]),
    ]);

    let tiles = grid.split(&frame).unwrap();
    let rendered = tiles
      .iter()
      .map(|tile| painter.render_tile(tile, &reg))
      .collect::<Vec<_>>();
    let merged = grid.merge(&rendered).unwrap();

    assert_eq!(merged, painter.render(&frame, &reg));
  }

  fn render_by_tiles(
    painter: &Painter,
    frame: &RgbNhwcFrame,
    reg: &ObjectRegistry,
  ) -> RgbNhwcFrame {
    let grid = GridSpec::new(2, 2).unwrap();
    let rendered = grid
      .split(frame)
      .unwrap()
      .iter()
      .map(|tile| painter.render_tile(tile, reg))
      .collect::<Vec<_>>();
    grid.merge(&rendered).unwrap()
  }

  #[test]
  fn far_off_frame_box_is_clipped_in_every_tile() {
    const GRAY: [u8; 3] = [40, 40, 40];
    let painter = Painter::new(BoxStyles::default());
    let live = BoxStyles::default().live.color;
    let frame = RgbNhwcFrame::filled(8, 8, GRAY);
    let reg = registry_with(&[Detection::identified(1, [-1.0e10, 0.0, 7.0, 6.0])]);

    let merged = render_by_tiles(&painter, &frame, &reg);
    assert_eq!(merged, painter.render(&frame, &reg));

    // 上边、下边与右边可见，左边在画面外
    assert_eq!(merged.pixel(0, 0), live);
    assert_eq!(merged.pixel(3, 6), live);
    assert_eq!(merged.pixel(7, 3), live);
    assert_eq!(merged.pixel(0, 3), GRAY);
    assert_eq!(merged.pixel(3, 3), GRAY);
    assert_eq!(merged.pixel(3, 7), GRAY);

    let tall = registry_with(&[Detection::identified(2, [1.0, 2.0, 4.0, 3.0e12])]);
    let merged = render_by_tiles(&painter, &frame, &tall);
    assert_eq!(merged, painter.render(&frame, &tall));
    assert_eq!(merged.pixel(1, 7), live);
    assert_eq!(merged.pixel(4, 7), live);
    assert_eq!(merged.pixel(5, 7), GRAY);
  }

  #[test]
  fn non_finite_box_is_not_drawn() {
    let painter = Painter::new(BoxStyles::default());
    let frame = RgbNhwcFrame::filled(8, 8, [40, 40, 40]);
    let reg = registry_with(&[
      Detection::identified(1, [f32::NAN, 0.0, 5.0, 5.0]),
      Detection::identified(2, [f32::NEG_INFINITY, 1.0, 6.0, 6.0]),
      Detection::identified(3, [0.0, 0.0, 4.0, f32::INFINITY]),
    ]);

    assert_eq!(painter.render(&frame, &reg), frame);
    assert_eq!(render_by_tiles(&painter, &frame, &reg), frame);
    assert_eq!(
      pixel_corners(&BoundingBox::new(1.0, f32::NAN, 2.0, 2.0), (0, 0)),
      None
    );
  }
}
