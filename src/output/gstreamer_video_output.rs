// 该文件是 Tiletrack 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件与窗口输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输出模块
//!
//! 将处理后的帧编码为视频文件，或直接显示在窗口中。
//!
//! ## 支持的格式
//!
//! - **MP4** (H.264) - 默认格式
//! - **MKV** (Matroska)
//! - **AVI**
//! - **WebM** (VP8)
//!
//! ## URL Scheme
//!
//! - `gst:///output.mp4?fps=30` 写入视频文件
//! - `display://?fps=30` 在窗口中显示
//!
//! 帧尺寸在收到第一帧时确定，之后尺寸变化会返回错误。
//!
//! ```no_run
//! use tiletrack::{FromUrl, output::GStreamerVideoOutput};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst:///output.mp4?fps=25")?;
//! let output = GStreamerVideoOutput::from_url(&url)?;
//! # Ok(())
//! # }
//! ```

use std::sync::{
  OnceLock,
  atomic::{AtomicU64, Ordering},
};

use crate::{FromUrl, frame::RgbNhwcFrame, output::Render, registry::RegistrySnapshot};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  /// URI scheme 不匹配
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 无法转换元素为 appsrc
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 缓冲区创建错误
  #[error("Buffer creation error")]
  BufferCreationError,
  /// 帧尺寸与第一帧不一致
  #[error("Frame size changed from {expected:?} to {actual:?}")]
  FrameSizeChanged {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

const GSTREAMER_VIDEO_OUTPUT_SCHEME: &str = "gst";
const DISPLAY_OUTPUT_SCHEME: &str = "display";
const DEFAULT_FPS: i32 = 30;

/// 根据文件扩展名选择编码管道，未知扩展名按 MP4 处理
pub fn encoder_pipeline(file_path: &str) -> String {
  if file_path.ends_with(".mkv") {
    format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink location=\"{}\"",
      file_path
    )
  } else if file_path.ends_with(".avi") {
    format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=\"{}\"",
      file_path
    )
  } else if file_path.ends_with(".webm") {
    format!(
      "appsrc name=src ! videoconvert ! vp8enc ! webmmux ! filesink location=\"{}\"",
      file_path
    )
  } else {
    format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux ! filesink location=\"{}\"",
      file_path
    )
  }
}

fn display_pipeline() -> String {
  "appsrc name=src is-live=true ! videoconvert ! autovideosink sync=false".to_string()
}

/// GStreamer 视频输出
///
/// 被丢弃时发送 EOS，保证文件正确收尾。
pub struct GStreamerVideoOutput {
  name: String,
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  size: OnceLock<(u32, u32)>,
  frame_count: AtomicU64,
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let fps: i32 = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(DEFAULT_FPS);

    let (name, pipeline_desc) = match url.scheme() {
      GSTREAMER_VIDEO_OUTPUT_SCHEME => (url.path().to_string(), encoder_pipeline(url.path())),
      DISPLAY_OUTPUT_SCHEME => ("display".to_string(), display_pipeline()),
      other => {
        error!(
          "URI scheme mismatch: expected '{}' or '{}', found '{}'",
          GSTREAMER_VIDEO_OUTPUT_SCHEME, DISPLAY_OUTPUT_SCHEME, other
        );
        return Err(GStreamerVideoOutputError::SchemeMismatch);
      }
    };

    Self::launch(name, &pipeline_desc, fps)
  }
}

impl GStreamerVideoOutput {
  pub const SCHEMES: [&'static str; 2] = [GSTREAMER_VIDEO_OUTPUT_SCHEME, DISPLAY_OUTPUT_SCHEME];

  fn launch(name: String, pipeline_desc: &str, fps: i32) -> Result<Self, GStreamerVideoOutputError> {
    // Initialize GStreamer (subsequent calls are safe no-ops)
    gst::init()?;

    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;
    appsrc.set_format(gst::Format::Time);

    let output = GStreamerVideoOutput {
      name,
      pipeline,
      appsrc,
      fps,
      size: OnceLock::new(),
      frame_count: AtomicU64::new(0),
    };
    output.pipeline.set_state(gst::State::Playing)?;
    info!("Video output initialized: {} @ {} fps", output.name, fps);

    Ok(output)
  }

  pub fn frames_written(&self) -> u64 {
    self.frame_count.load(Ordering::Relaxed)
  }

  /// 第一帧到达时设置 caps
  fn ensure_caps(&self, width: u32, height: u32) -> Result<(), GStreamerVideoOutputError> {
    let expected = *self.size.get_or_init(|| {
      let caps = gst::Caps::builder("video/x-raw")
        .field("format", "RGB")
        .field("width", width as i32)
        .field("height", height as i32)
        .field("framerate", gst::Fraction::new(self.fps, 1))
        .build();
      self.appsrc.set_caps(Some(&caps));
      info!("Video output {} caps: {}x{}", self.name, width, height);
      (width, height)
    });

    if expected != (width, height) {
      return Err(GStreamerVideoOutputError::FrameSizeChanged {
        expected,
        actual: (width, height),
      });
    }
    Ok(())
  }

  fn push_frame(&self, frame: &RgbNhwcFrame) -> Result<(), GStreamerVideoOutputError> {
    self.ensure_caps(frame.width(), frame.height())?;

    let mut buffer = gst::Buffer::from_mut_slice(frame.as_nhwc().to_vec());
    let index = self.frame_count.fetch_add(1, Ordering::Relaxed);
    let frame_duration = 1_000_000_000 / self.fps as u64;
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(index * frame_duration));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    // Send EOS to properly close the file
    let _ = self.appsrc.end_of_stream();

    if let Some(bus) = self.pipeline.bus() {
      let _ = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(5),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }

    info!(
      "Video output {} closed. Total frames written: {}",
      self.name,
      self.frames_written()
    );
  }
}

impl Render<RgbNhwcFrame, RegistrySnapshot> for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn render_result(
    &self,
    frame: &RgbNhwcFrame,
    _result: &RegistrySnapshot,
  ) -> Result<(), Self::Error> {
    self.push_frame(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encoder_is_chosen_by_extension() {
    assert!(encoder_pipeline("/tmp/a.mkv").contains("matroskamux"));
    assert!(encoder_pipeline("/tmp/a.avi").contains("avimux"));
    assert!(encoder_pipeline("/tmp/a.webm").contains("vp8enc"));
    assert!(encoder_pipeline("/tmp/a.mp4").contains("mp4mux"));
    assert!(encoder_pipeline("/tmp/a.mov").contains("mp4mux"));
  }

  #[test]
  fn other_schemes_are_rejected() {
    let url = Url::parse("rtsp://localhost/stream").unwrap();
    assert!(matches!(
      GStreamerVideoOutput::from_url(&url),
      Err(GStreamerVideoOutputError::SchemeMismatch)
    ));
  }
}
