// 该文件是 Tiletrack 项目的一部分。
// src/bin/tile_oneshot.rs - 单帧分块检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use tiletrack::{
  FromUrl,
  grid::GridSpec,
  input::InputWrapper,
  model::{ModelWrapper, TrackParams},
  output::{OutputWrapper, draw::Painter},
  pipeline::TilePipeline,
  registry::{ExpiryPolicy, ObjectRegistry},
  task::{OneShotTask, Task},
};

/// 对一帧图像做分块检测并输出绘制结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测器，例如 replay:///path/to/tracks.jsonl
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Url,
  /// 输入，例如 image:///path/to/frame.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 image:///tmp/out.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, default_value_t = 3)]
  pub rows: u32,
  #[arg(long, default_value_t = 3)]
  pub cols: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测器: {}", args.detector);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let model = ModelWrapper::from_url(&args.detector)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let pipeline = TilePipeline::new(
    GridSpec::new_or_fallback(args.rows, args.cols),
    model,
    TrackParams::default(),
    ObjectRegistry::new(ExpiryPolicy::default()),
    Painter::default(),
  );
  let snapshot = OneShotTask.run_task(input, pipeline, output)?;
  info!("共 {} 个目标", snapshot.objects.len());

  Ok(())
}
