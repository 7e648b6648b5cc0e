use image::{Rgb, RgbImage};
use thiserror::Error;

use tiletrack::{
  frame::RgbNhwcFrame,
  grid::{GridSpec, Tile},
  model::{BoundingBox, Detection, TileTracker, TrackParams},
  output::draw::{BoxStyles, Painter},
  pipeline::TilePipeline,
  registry::{ExpiryPolicy, ObjectRegistry, ObjectState},
};

const TOP_LEFT: [u8; 3] = [200, 0, 0];
const TOP_RIGHT: [u8; 3] = [0, 200, 0];
const BOTTOM_LEFT: [u8; 3] = [0, 0, 200];
const BOTTOM_RIGHT: [u8; 3] = [200, 200, 0];

#[derive(Debug, Error)]
#[error("unreachable")]
struct Never;

/// 只在第 0 帧的左上子图报告编号 1
struct FirstFrameOnly;

impl TileTracker for FirstFrameOnly {
  type Error = Never;

  fn track(
    &mut self,
    frame_index: u64,
    tile: &Tile,
    _params: &TrackParams,
  ) -> Result<Vec<Detection>, Self::Error> {
    if frame_index == 0 && tile.row == 0 && tile.col == 0 {
      Ok(vec![Detection::identified(1, [0.0, 0.0, 1.0, 1.0])])
    } else {
      Ok(Vec::new())
    }
  }
}

fn four_color_frame() -> RgbNhwcFrame {
  RgbNhwcFrame::from(RgbImage::from_fn(4, 4, |x, y| {
    Rgb(match (y < 2, x < 2) {
      (true, true) => TOP_LEFT,
      (true, false) => TOP_RIGHT,
      (false, true) => BOTTOM_LEFT,
      (false, false) => BOTTOM_RIGHT,
    })
  }))
}

fn pipeline() -> TilePipeline<FirstFrameOnly> {
  TilePipeline::new(
    GridSpec::new(2, 2).unwrap(),
    FirstFrameOnly,
    TrackParams::default(),
    ObjectRegistry::new(ExpiryPolicy::default()),
    Painter::new(BoxStyles::default()),
  )
}

#[test]
fn object_survives_a_missed_frame_and_is_drawn_live() {
  let frame = four_color_frame();
  let live = BoxStyles::default().live.color;
  let mut pipeline = pipeline();

  let first = pipeline.process(0, &frame).unwrap();
  assert_eq!(first.summary.inserted, 1);
  assert_eq!(pipeline.registry().len(), 1);
  assert_eq!(pipeline.registry().get(1).unwrap().age, 0);

  let second = pipeline.process(1, &frame).unwrap();
  assert_eq!(second.detections, 0);
  let object = pipeline.registry().get(1).unwrap();
  assert_eq!(object.age, 1);
  assert_eq!(object.last_box, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
  assert_eq!(pipeline.registry().state(1), Some(ObjectState::Holding));

  // 框仍画在原位置，使用 live 样式
  for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
    assert_eq!(second.frame.pixel(x, y), live, "pixel ({x}, {y})");
  }
  assert_eq!(second.frame.pixel(2, 0), TOP_RIGHT);
  assert_eq!(second.frame.pixel(0, 2), BOTTOM_LEFT);
  assert_eq!(second.frame.pixel(3, 3), BOTTOM_RIGHT);
}

#[test]
fn tiled_render_matches_whole_frame_render() {
  let frame = four_color_frame();
  let mut pipeline = pipeline();
  pipeline.process(0, &frame).unwrap();
  let out = pipeline.process(1, &frame).unwrap();

  let expected = pipeline.painter().render(&frame, pipeline.registry());
  assert_eq!(out.frame, expected);
}

#[test]
fn object_turns_held_then_disappears() {
  let frame = four_color_frame();
  let held = BoxStyles::default().held.color;
  let mut pipeline = TilePipeline::new(
    GridSpec::new(2, 2).unwrap(),
    FirstFrameOnly,
    TrackParams::default(),
    ObjectRegistry::new(ExpiryPolicy::new(2, 3).unwrap()),
    Painter::default(),
  );

  pipeline.process(0, &frame).unwrap();
  pipeline.process(1, &frame).unwrap();
  let out = pipeline.process(2, &frame).unwrap();
  assert_eq!(pipeline.registry().state(1), Some(ObjectState::Stale));
  assert_eq!(out.frame.pixel(0, 0), held);

  let out = pipeline.process(3, &frame).unwrap();
  assert_eq!(out.summary.evicted, 1);
  assert!(pipeline.registry().is_empty());
  assert_eq!(out.frame, frame);
}
