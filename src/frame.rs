// 该文件是 Tiletrack 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeError {
  pub expected: usize,
  pub actual: usize,
}

/// RGB 帧，按 HWC 顺序存放像素。
///
/// 帧和切片后的子图使用同一类型，尺寸在运行时确定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNhwcFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl RgbNhwcFrame {
  /// 创建全黑帧
  pub fn with_shape(width: u32, height: u32) -> Self {
    let size = RGB_CHANNELS * (width as usize) * (height as usize);
    Self {
      width,
      height,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  pub fn from_vec(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameSizeError> {
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameSizeError {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 用单一颜色填充的帧
  pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
    let data = color
      .iter()
      .copied()
      .cycle()
      .take(RGB_CHANNELS * width as usize * height as usize)
      .collect::<Vec<u8>>();
    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 一行像素占用的字节数
  pub fn stride(&self) -> usize {
    self.width as usize * RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn row(&self, y: u32) -> &[u8] {
    let stride = self.stride();
    let start = y as usize * stride;
    &self.data[start..start + stride]
  }

  pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
    let stride = self.stride();
    let start = y as usize * stride;
    &mut self.data[start..start + stride]
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  pub fn into_rgb_image(self) -> RgbImage {
    // 长度在构造时已校验
    RgbImage::from_raw(self.width, self.height, self.data.into_vec())
      .unwrap_or_else(|| RgbImage::new(0, 0))
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    self.clone().into_rgb_image()
  }
}

impl AsMut<[u8]> for RgbNhwcFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsRef<[u8]> for RgbNhwcFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl From<RgbImage> for RgbNhwcFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}
