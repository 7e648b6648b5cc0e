// 该文件是 Tiletrack 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 从摄像头（V4L2）或视频文件读取帧，统一转换为 RGB。
//!
//! ## URL 形式
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=30&format=YUY2&rotate=90`
//! - `gst://file/path/to/video.mp4?rotate=180`
//!
//! 摄像头未指定分辨率时使用 640x480@30。只有同时给出 `width` 与 `height` 时
//! 才会按该比例裁剪画面。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbNhwcFrame,
  input::{CameraOptions, DEFAULT_CAMERA_FPS, DEFAULT_CAMERA_HEIGHT, DEFAULT_CAMERA_WIDTH},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

/// 等待管道进入播放状态的最长时间
const STARTUP_TIMEOUT_SECS: u64 = 5;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://camera/..." 或 "gst://file/..."）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 视频文件不存在
  #[error("File not found: {0}")]
  FileNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: Option<String>,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat {
    format: String,
  },
  AspectRatio {
    ratio: (u32, u32),
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        let format_str = format
          .as_ref()
          .map(|format| format!("format={},", format))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,{}width={},height={},framerate={}/1",
          camera, io_mode_str, format_str, width, height, fps
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::AspectRatio { ratio } => {
        format!("aspectratiocrop aspect-ratio={}/{}", ratio.0, ratio.1)
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
    }
  }
}

/// GStreamer 输入管道构建器
///
/// ```no_run
/// use tiletrack::input::{CameraOptions, GStreamerInputPipelineBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let input = GStreamerInputPipelineBuilder::camera("/dev/video0", &CameraOptions::default())
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GStreamerInputPipelineBuilder {
  name: String,
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  pub fn camera(device: &str, options: &CameraOptions) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::CameraSource {
      camera: device.to_string(),
      io_mode: options.io_mode,
      format: options.format.clone(),
      width: options.width,
      height: options.height,
      fps: options.fps,
    }];
    if options.crop {
      items.push(GStreamerInputBuilderItem::AspectRatio {
        ratio: (options.width, options.height),
      });
    }
    items.extend(Self::video_flip(options.rotate));
    items.push(Self::target_format());

    Self {
      name: device.to_string(),
      items,
    }
  }

  pub fn file(path: &str, rotate: Option<u32>) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::FileSource(path.to_string())];
    items.extend(Self::video_flip(rotate));
    items.push(Self::target_format());

    Self {
      name: path.to_string(),
      items,
    }
  }

  fn camera_from_query(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());
    let width = parse("width");
    let height = parse("height");

    let options = CameraOptions {
      io_mode: parse("io-mode"),
      format: query.get("format").cloned(),
      width: width.unwrap_or(DEFAULT_CAMERA_WIDTH),
      height: height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
      fps: parse("fps").unwrap_or(DEFAULT_CAMERA_FPS),
      crop: width.is_some() && height.is_some(),
      rotate: parse("rotate"),
    };
    Self::camera(path, &options)
  }

  fn video_flip(rotate: Option<u32>) -> Option<GStreamerInputBuilderItem> {
    let (method, direction) = match rotate? {
      90 => (1, 1),
      180 => (2, 2),
      270 => (3, 3),
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
  }

  fn target_format() -> GStreamerInputBuilderItem {
    GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn items(&self) -> &[GStreamerInputBuilderItem] {
    &self.items
  }

  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      basic_pipeline
    )
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    if let Some(GStreamerInputBuilderItem::FileSource(path)) = self.items.first()
      && !std::path::Path::new(path).is_file()
    {
      return Err(GStreamerInputError::FileNotFound(path.clone()));
    }

    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 从这里开始由 GStreamerInput 负责把管道置回 Null
    let input = GStreamerInput {
      name: self.name,
      pipeline,
      appsink,
    };
    input.pipeline.set_state(gst::State::Playing)?;
    input.wait_started()?;

    Ok(input)
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    match url.host_str() {
      Some("camera") => Ok(Self::camera_from_query(url.path(), &query)),
      Some("file") => {
        let rotate = query.get("rotate").and_then(|v| v.parse::<u32>().ok());
        Ok(Self::file(url.path(), rotate))
      }
      _ => Err(GStreamerInputError::SchemeMismatch),
    }
  }
}

/// GStreamer 视频输入
///
/// 作为帧迭代器使用，数据结束或出错时返回 `None`。被丢弃时停止管道。
pub struct GStreamerInput {
  name: String,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    info!("输入源已关闭: {}", self.name);
  }
}

impl GStreamerInput {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// 等待管道启动，失败时取出总线上的错误信息
  fn wait_started(&self) -> Result<(), GStreamerInputError> {
    let (result, _, _) = self
      .pipeline
      .state(gst::ClockTime::from_seconds(STARTUP_TIMEOUT_SECS));
    if result.is_ok() {
      return Ok(());
    }

    let message = self
      .pipeline
      .bus()
      .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
      .and_then(|msg| match msg.view() {
        gst::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
      })
      .unwrap_or_else(|| "pipeline failed to start".to_string());
    Err(GStreamerInputError::PipelineError(message))
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        info!("No more samples from {}: {}", self.name, e);
        e
      })
      .ok()
  }
}

impl Iterator for GStreamerInput {
  type Item = RgbNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self.pull_sample()?;
    convert_sample_to_nhwc(sample)
      .map_err(|e| {
        error!("Failed to fetch sample: {}", e);
        e
      })
      .ok()
  }
}

fn convert_sample_to_nhwc(sample: gst::Sample) -> Result<RgbNhwcFrame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width();
  let height = video_info.height();
  let row_bytes = width as usize * 3;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // 行末可能有对齐填充
  let expected_size = stride * height.saturating_sub(1) as usize + row_bytes;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut frame = RgbNhwcFrame::with_shape(width, height);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for y in 0..height {
        let src = &data[y as usize * stride..y as usize * stride + row_bytes];
        frame.row_mut(y).copy_from_slice(src);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for y in 0..height {
        let src = &data[y as usize * stride..y as usize * stride + row_bytes];
        for (dst, src) in frame.row_mut(y).chunks_mut(3).zip(src.chunks(3)) {
          dst.copy_from_slice(&[src[2], src[1], src[0]]);
        }
      }
    }
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  }

  Ok(frame)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_caps_and_crop() {
    let url = Url::parse("gst://camera/dev/video2?width=1280&height=720&fps=15&rotate=90").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();

    assert_eq!(builder.name(), "/dev/video2");
    let description = builder.description();
    assert!(description.starts_with(
      "v4l2src device=/dev/video2 ! video/x-raw,width=1280,height=720,framerate=15/1"
    ));
    assert!(description.contains("aspectratiocrop aspect-ratio=1280/720"));
    assert!(description.contains("videoflip method=1"));
    assert!(description.ends_with("appsink max-buffers=2 drop=true name=sink"));
  }

  #[test]
  fn camera_without_size_is_not_cropped() {
    let url = Url::parse("gst://camera/dev/video0").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();

    assert!(
      !builder
        .items()
        .iter()
        .any(|item| matches!(item, GStreamerInputBuilderItem::AspectRatio { .. }))
    );
    assert!(builder.description().contains("width=640,height=480"));
  }

  #[test]
  fn file_url_decodes_to_rgb() {
    let url = Url::parse("gst://file/data/clip.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();

    assert_eq!(
      builder.items(),
      &[
        GStreamerInputBuilderItem::FileSource("/data/clip.mp4".to_string()),
        GStreamerInputBuilderItem::TargetFormat {
          format: "RGB".to_string()
        },
      ]
    );
  }

  #[test]
  fn unknown_host_is_rejected() {
    let url = Url::parse("gst://network/stream").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
  }

  #[test]
  fn missing_file_fails_before_gstreamer_init() {
    let builder = GStreamerInputPipelineBuilder::file("/nonexistent/tiletrack/clip.mp4", None);
    assert!(matches!(
      builder.build(),
      Err(GStreamerInputError::FileNotFound(_))
    ));
  }
}
