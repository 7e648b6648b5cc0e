// 该文件是 Tiletrack 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 按日期分目录保存每一帧：`<dir>/YYYY/MM/DD/HH-MM-SS-<frame>.png`。
//!
//! URL 形式为 `folder:///path?record&always`：
//!
//! - `record`：同时写出同名 `.json`，内容为该帧的目标登记表快照；
//! - `always`：登记表为空的帧也保存。

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, output::Render, registry::RegistrySnapshot,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  record: bool,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record = uri.query_pairs().any(|(k, _)| k == "record");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(Self::new(uri.path(), record, always))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl AsRef<Path>, record: bool, always: bool) -> Self {
    DirectoryRecordOutput {
      directory: directory.as_ref().to_path_buf(),
      record,
      always,
    }
  }

  fn frame_path(&self, frame_index: u64) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:06}.png",
      now.format("%H-%M-%S"),
      frame_index
    )))
  }

  fn write_record(
    &self,
    path: &Path,
    snapshot: &RegistrySnapshot,
  ) -> Result<(), DirectoryRecordOutputError> {
    let mut writer = BufWriter::new(File::create(path.with_extension("json"))?);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;
    Ok(())
  }
}

impl Render<RgbNhwcFrame, RegistrySnapshot> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(
    &self,
    frame: &RgbNhwcFrame,
    result: &RegistrySnapshot,
  ) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }

    let path = self.frame_path(result.frame)?;
    frame.to_rgb_image().save(&path)?;
    if self.record {
      self.write_record(&path, result)?;
    }
    debug!("第 {} 帧已记录: {}", result.frame, path.display());

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::Detection,
    registry::{ExpiryPolicy, ObjectRegistry},
  };

  fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
      "tiletrack-{}-{}",
      name,
      std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
  }

  fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
      let Ok(entries) = std::fs::read_dir(&dir) else {
        continue;
      };
      for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
          pending.push(path);
        } else if path.extension().is_some_and(|e| e == ext) {
          found.push(path);
        }
      }
    }
    found
  }

  #[test]
  fn parses_flags_from_url() {
    let url = url::Url::parse("folder:///tmp/out?record&always").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(output.record);
    assert!(output.always);
    assert_eq!(output.directory, PathBuf::from("/tmp/out"));
  }

  #[test]
  fn empty_snapshot_is_skipped_unless_always() {
    let dir = scratch_dir("record-skip");
    let frame = RgbNhwcFrame::with_shape(4, 4);
    let snapshot = ObjectRegistry::default().snapshot(0);

    DirectoryRecordOutput::new(&dir, false, false)
      .render_result(&frame, &snapshot)
      .unwrap();
    assert!(files_with_extension(&dir, "png").is_empty());

    DirectoryRecordOutput::new(&dir, false, true)
      .render_result(&frame, &snapshot)
      .unwrap();
    assert_eq!(files_with_extension(&dir, "png").len(), 1);

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn record_mode_writes_snapshot_json() {
    let dir = scratch_dir("record-json");
    let mut registry = ObjectRegistry::new(ExpiryPolicy::default());
    registry.update(&[Detection::identified(5, [1.0, 1.0, 2.0, 2.0])]);

    DirectoryRecordOutput::new(&dir, true, false)
      .render_result(&RgbNhwcFrame::with_shape(4, 4), &registry.snapshot(3))
      .unwrap();

    let records = files_with_extension(&dir, "json");
    assert_eq!(records.len(), 1);
    let json: serde_json::Value =
      serde_json::from_reader(File::open(&records[0]).unwrap()).unwrap();
    assert_eq!(json["frame"], 3);
    assert_eq!(json["objects"][0]["id"], 5);

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
