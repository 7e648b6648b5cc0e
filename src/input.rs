// 该文件是 Tiletrack 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{fmt, path::PathBuf};

use thiserror::Error;
use tracing::info;

use crate::{FromUrl, frame::RgbNhwcFrame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputBuilderItem, GStreamerInputError,
  GStreamerInputPipelineBuilder,
};

#[derive(Error, Debug)]
pub enum InputError {
  /// 输入源无法打开，本次运行终止
  #[error("输入源不可用 {name}: {reason}")]
  SourceUnavailable { name: String, reason: String },
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

impl InputError {
  pub fn unavailable(name: impl Into<String>, reason: impl fmt::Display) -> Self {
    InputError::SourceUnavailable {
      name: name.into(),
      reason: reason.to_string(),
    }
  }
}

pub(crate) const DEFAULT_CAMERA_WIDTH: u32 = 640;
pub(crate) const DEFAULT_CAMERA_HEIGHT: u32 = 480;
pub(crate) const DEFAULT_CAMERA_FPS: u32 = 30;

/// 摄像头采集参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraOptions {
  pub io_mode: Option<u32>,
  pub format: Option<String>,
  pub width: u32,
  pub height: u32,
  pub fps: u32,
  /// 是否按 width:height 裁剪
  pub crop: bool,
  /// 旋转角度，文件输入同样适用
  pub rotate: Option<u32>,
}

impl Default for CameraOptions {
  fn default() -> Self {
    Self {
      io_mode: None,
      format: None,
      width: DEFAULT_CAMERA_WIDTH,
      height: DEFAULT_CAMERA_HEIGHT,
      fps: DEFAULT_CAMERA_FPS,
      crop: false,
      rotate: None,
    }
  }
}

/// 控制界面使用的输入源选择
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
  /// 摄像头序号，对应 `/dev/video<N>`
  Camera(u32),
  File(PathBuf),
}

impl SourceSelection {
  pub fn device_path(&self) -> PathBuf {
    match self {
      SourceSelection::Camera(index) => PathBuf::from(format!("/dev/video{}", index)),
      SourceSelection::File(path) => path.clone(),
    }
  }
}

impl fmt::Display for SourceSelection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceSelection::Camera(index) => write!(f, "camera #{}", index),
      SourceSelection::File(path) => write!(f, "file {}", path.display()),
    }
  }
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let builder = GStreamerInputPipelineBuilder::from_url(url)?;
        let name = builder.name().to_string();
        let input = builder
          .build()
          .map_err(|e| InputError::unavailable(name, e))?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input =
          ImageFileInput::from_url(url).map_err(|e| InputError::unavailable(url.path(), e))?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  /// 按摄像头序号或文件路径打开输入源
  ///
  /// 不带 GStreamer 时文件按单张图像读取，摄像头不可用。
  pub fn open(selection: &SourceSelection, camera: &CameraOptions) -> Result<Self, InputError> {
    let name = selection.device_path().display().to_string();
    info!("打开输入源: {}", selection);
    Self::open_backend(selection, name, camera)
  }

  #[cfg(feature = "gstreamer_input")]
  fn open_backend(
    selection: &SourceSelection,
    name: String,
    camera: &CameraOptions,
  ) -> Result<Self, InputError> {
    let builder = match selection {
      SourceSelection::Camera(_) => GStreamerInputPipelineBuilder::camera(&name, camera),
      SourceSelection::File(_) => GStreamerInputPipelineBuilder::file(&name, camera.rotate),
    };
    let input = builder
      .build()
      .map_err(|e| InputError::unavailable(name, e))?;
    Ok(InputWrapper::GStreamerInput(input))
  }

  #[cfg(all(not(feature = "gstreamer_input"), feature = "read_image_file"))]
  fn open_backend(
    selection: &SourceSelection,
    name: String,
    _camera: &CameraOptions,
  ) -> Result<Self, InputError> {
    match selection {
      SourceSelection::File(_) => ImageFileInput::open(&name)
        .map(InputWrapper::ReadImageFile)
        .map_err(|e| InputError::unavailable(name, e)),
      SourceSelection::Camera(_) => Err(InputError::unavailable(name, "camera support disabled")),
    }
  }

  #[cfg(not(any(feature = "gstreamer_input", feature = "read_image_file")))]
  fn open_backend(
    _selection: &SourceSelection,
    name: String,
    _camera: &CameraOptions,
  ) -> Result<Self, InputError> {
    Err(InputError::unavailable(name, "no input backend enabled"))
  }
}

impl Iterator for InputWrapper {
  type Item = RgbNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
    }
  }
}
