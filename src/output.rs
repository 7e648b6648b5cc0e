// 该文件是 Tiletrack 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "directory_record"))]
use crate::FromUrlWithScheme;
use crate::{frame::RgbNhwcFrame, registry::RegistrySnapshot};
use thiserror::Error;
use url::Url;

/// 接收处理完成的帧及其登记表快照
pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 依次交给每一个输出，遇到第一个错误即返回
impl<F, D, O: Render<F, D>> Render<F, D> for Vec<O> {
  type Error = O::Error;

  fn render_result(&self, frame: &F, result: &D) -> Result<(), Self::Error> {
    self
      .iter()
      .try_for_each(|output| output.render_result(frame, result))
  }
}

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{
  GStreamerVideoOutput, GStreamerVideoOutputError, encoder_pipeline,
};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideoOutput(GStreamerVideoOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "gstreamer_output")]
      scheme if GStreamerVideoOutput::SCHEMES.contains(&scheme) => {
        let output = GStreamerVideoOutput::from_url(url)?;
        Ok(OutputWrapper::GStreamerVideoOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl OutputWrapper {
  /// 按顺序创建多个输出
  pub fn from_urls<'a>(urls: impl IntoIterator<Item = &'a Url>) -> Result<Vec<Self>, OutputError> {
    urls.into_iter().map(Self::from_url).collect()
  }
}

impl Render<RgbNhwcFrame, RegistrySnapshot> for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &RgbNhwcFrame,
    result: &RegistrySnapshot,
  ) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;

  struct Collect(RefCell<Vec<u64>>, bool);

  #[derive(Debug, Error)]
  #[error("sink closed")]
  struct Closed;

  impl Render<RgbNhwcFrame, RegistrySnapshot> for Collect {
    type Error = Closed;

    fn render_result(
      &self,
      _frame: &RgbNhwcFrame,
      result: &RegistrySnapshot,
    ) -> Result<(), Self::Error> {
      if self.1 {
        return Err(Closed);
      }
      self.0.borrow_mut().push(result.frame);
      Ok(())
    }
  }

  #[test]
  fn every_output_in_a_vec_receives_the_frame() {
    let outputs = vec![
      Collect(RefCell::new(Vec::new()), false),
      Collect(RefCell::new(Vec::new()), false),
    ];
    let snapshot = crate::registry::ObjectRegistry::default().snapshot(7);
    outputs
      .render_result(&RgbNhwcFrame::with_shape(2, 2), &snapshot)
      .unwrap();

    assert!(outputs.iter().all(|o| *o.0.borrow() == vec![7]));
  }

  #[test]
  fn vec_output_stops_at_first_error() {
    let outputs = vec![
      Collect(RefCell::new(Vec::new()), true),
      Collect(RefCell::new(Vec::new()), false),
    ];
    let snapshot = crate::registry::ObjectRegistry::default().snapshot(0);
    assert!(
      outputs
        .render_result(&RgbNhwcFrame::with_shape(2, 2), &snapshot)
        .is_err()
    );
    assert!(outputs[1].0.borrow().is_empty());
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("ftp://example.com/out.png").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(scheme)) if scheme == "ftp"
    ));
  }
}
