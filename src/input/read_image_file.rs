// 该文件是 Tiletrack 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 单张图像，迭代一次后结束
pub struct ImageFileInput {
  path: String,
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Self::open(url.path())
  }
}

impl ImageFileInput {
  pub fn open(path: &str) -> Result<Self, ImageFileInputError> {
    let image = ImageReader::open(path)?.decode()?;
    info!("读取图像: {} ({}x{})", path, image.width(), image.height());

    Ok(ImageFileInput {
      path: path.to_string(),
      image: Some(image.into()),
    })
  }

  pub fn path(&self) -> &str {
    &self.path
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(RgbNhwcFrame::from)
  }
}
