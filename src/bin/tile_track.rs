// 该文件是 Tiletrack 项目的一部分。
// src/bin/tile_track.rs - 分块跟踪主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args as ClapArgs, Parser};
use tracing::{info, warn};
use url::Url;

use tiletrack::{
  control::{Controller, ControllerConfig, UrlCollaborators},
  input::{CameraOptions, SourceSelection},
  model::TrackParams,
  output::draw::{BoxStyles, Painter},
  registry::ExpiryPolicy,
  task::{DEFAULT_QUEUE_CAPACITY, install_interrupt_handler},
};

/// Tiletrack 分块检测与跟踪
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测器，例如 replay:///path/to/tracks.jsonl
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Url,

  /// 摄像头序号，对应 /dev/video<N>
  #[arg(long, value_name = "INDEX", conflicts_with = "file")]
  pub camera: Option<u32>,
  /// 视频文件路径
  #[arg(long, value_name = "PATH")]
  pub file: Option<PathBuf>,

  /// 输出，可重复指定，例如 gst:///tmp/out.mp4、display://、folder:///tmp/rec?record
  #[arg(long, value_name = "OUTPUT")]
  pub output: Vec<Url>,

  /// 网格行数
  #[arg(long, default_value_t = 3)]
  pub rows: u32,
  /// 网格列数
  #[arg(long, default_value_t = 3)]
  pub cols: u32,

  #[command(flatten)]
  pub track: TrackArgs,

  /// 连续多少帧未检测到后改为保留样式
  #[arg(long, default_value_t = 150)]
  pub expiry_visible: u32,
  /// 连续多少帧未检测到后移除，默认为 expiry_visible 的 5 倍
  #[arg(long)]
  pub expiry_remove: Option<u32>,

  /// 帧队列容量
  #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
  pub queue_capacity: usize,
  /// 处理指定帧数后退出
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,

  /// 标签字体文件，不指定则不绘制编号
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,

  #[command(flatten)]
  pub camera_options: CameraArgs,
}

#[derive(ClapArgs, Debug)]
pub struct TrackArgs {
  /// 置信度阈值
  #[arg(long, default_value_t = 0.3)]
  pub confidence: f32,
  /// NMS IOU 阈值
  #[arg(long, default_value_t = 0.75)]
  pub iou: f32,
  /// 每个子图的最大检测数
  #[arg(long, default_value_t = 100)]
  pub max_detections: usize,
  /// 不区分类别做 NMS
  #[arg(long)]
  pub agnostic_nms: bool,
}

impl From<&TrackArgs> for TrackParams {
  fn from(args: &TrackArgs) -> Self {
    TrackParams {
      confidence: args.confidence,
      iou: args.iou,
      agnostic_nms: args.agnostic_nms,
      max_detections: args.max_detections,
    }
  }
}

#[derive(ClapArgs, Debug)]
pub struct CameraArgs {
  /// 摄像头采集宽度
  #[arg(long, default_value_t = 640)]
  pub width: u32,
  /// 摄像头采集高度
  #[arg(long, default_value_t = 480)]
  pub height: u32,
  #[arg(long, default_value_t = 30)]
  pub fps: u32,
  /// 采集格式，例如 YUY2
  #[arg(long)]
  pub format: Option<String>,
  /// v4l2src io-mode
  #[arg(long)]
  pub io_mode: Option<u32>,
  /// 按宽高比裁剪
  #[arg(long)]
  pub crop: bool,
  /// 旋转角度 (90/180/270)
  #[arg(long)]
  pub rotate: Option<u32>,
}

impl From<CameraArgs> for CameraOptions {
  fn from(args: CameraArgs) -> Self {
    CameraOptions {
      io_mode: args.io_mode,
      format: args.format,
      width: args.width,
      height: args.height,
      fps: args.fps,
      crop: args.crop,
      rotate: args.rotate,
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let selection = match (args.camera, args.file) {
    (Some(index), _) => SourceSelection::Camera(index),
    (None, Some(path)) => SourceSelection::File(path),
    (None, None) => bail!("需要指定 --camera 或 --file"),
  };
  if args.output.is_empty() {
    warn!("没有指定输出，处理结果只记录日志");
  }

  info!("检测器: {}", args.detector);
  info!("输入来源: {}", selection);
  for output in &args.output {
    info!("输出: {}", output);
  }

  let policy = match args.expiry_remove {
    Some(remove) => ExpiryPolicy::new(args.expiry_visible, remove)?,
    None => ExpiryPolicy::from_visible(args.expiry_visible)?,
  };
  let mut painter = Painter::new(BoxStyles::default());
  if let Some(font) = &args.font {
    painter = painter.with_font_file(font)?;
  }

  let config = ControllerConfig {
    params: TrackParams::from(&args.track),
    policy,
    painter,
    queue_capacity: args.queue_capacity,
    frame_limit: args.frame_number,
  };
  let collaborators = UrlCollaborators {
    detector: args.detector,
    outputs: args.output,
    camera: args.camera_options.into(),
  };

  let mut controller = Controller::new(collaborators, config);
  install_interrupt_handler(controller.run_flag())?;

  controller.start(args.rows, args.cols, selection)?;
  info!("网格: {}", controller.grid());

  if let Some(report) = controller.wait()? {
    info!(
      "读取 {} 帧, 丢弃 {} 帧, 处理 {} 帧, 子图检测失败 {} 次",
      report.capture.frames_read,
      report.capture.frames_dropped,
      report.process.frames_processed,
      report.process.tile_failures
    );
  }
  info!("程序退出");

  Ok(())
}
