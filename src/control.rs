// 该文件是 Tiletrack 项目的一部分。
// src/control.rs - 运行控制
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

//! # 运行控制
//!
//! [`Session`] 是一次运行：一个采集线程加一个处理线程。
//! [`Controller`] 对外只提供 `start(rows, cols, source)` 与 `stop()`，
//! 每次 `start` 使用新的登记表。

use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::RgbNhwcFrame,
  grid::GridSpec,
  input::{CameraOptions, InputError, InputWrapper, SourceSelection},
  model::{ModelError, ModelWrapper, TileTracker, TrackParams},
  output::{OutputError, OutputWrapper, Render, draw::Painter},
  pipeline::TilePipeline,
  registry::{ExpiryPolicy, ObjectRegistry, RegistrySnapshot},
  task::{
    CaptureStats, ContinuousTask, DEFAULT_QUEUE_CAPACITY, ProcessStats, RunFlag, TaskError,
    capture_loop, frame_queue, process_loop,
  },
};

#[derive(Error, Debug)]
pub enum ControlError {
  #[error("已有运行中的会话")]
  AlreadyRunning,
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("检测器错误: {0}")]
  Model(#[from] ModelError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("线程创建失败: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("{0} 线程异常退出")]
  ThreadPanicked(&'static str),
  #[error("任务错误: {0}")]
  Task(#[from] TaskError),
}

/// 一次运行结束后的汇总
#[derive(Debug, Clone)]
pub struct SessionReport {
  pub capture: CaptureStats,
  pub process: ProcessStats,
  /// 最后一帧处理完成后的登记表
  pub registry: RegistrySnapshot,
}

type ProcessOutcome = Result<(ProcessStats, RegistrySnapshot), TaskError>;

/// 正在运行的采集线程与处理线程
pub struct Session {
  flag: RunFlag,
  capture: JoinHandle<CaptureStats>,
  process: JoinHandle<ProcessOutcome>,
}

impl Session {
  pub fn spawn<S, M, O>(
    source: S,
    pipeline: TilePipeline<M>,
    output: O,
    task: &ContinuousTask,
  ) -> Result<Self, ControlError>
  where
    S: Iterator<Item = RgbNhwcFrame> + Send + 'static,
    M: TileTracker + Send + 'static,
    O: Render<RgbNhwcFrame, RegistrySnapshot> + Send + 'static,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    let flag = task.run_flag().clone();
    let frame_limit = task.frame_number();
    let (tx, rx) = frame_queue(task.queue_capacity());
    flag.raise();

    let process_flag = flag.clone();
    let process = thread::Builder::new()
      .name("tiletrack-process".to_string())
      .spawn(move || {
        let mut pipeline = pipeline;
        let stats = process_loop(rx, &mut pipeline, &output, &process_flag, frame_limit);
        drop(output);
        let snapshot = pipeline
          .registry()
          .snapshot(stats.as_ref().ok().and_then(|s| s.last_frame).unwrap_or(0));
        stats.map(|stats| (stats, snapshot))
      })
      .inspect_err(|_| flag.clear())?;

    let capture_flag = flag.clone();
    let capture = match thread::Builder::new()
      .name("tiletrack-capture".to_string())
      .spawn(move || capture_loop(source, tx, &capture_flag))
    {
      Ok(handle) => handle,
      Err(e) => {
        flag.clear();
        if process.join().is_err() {
          error!("处理线程异常退出");
        }
        return Err(ControlError::Spawn(e));
      }
    };

    info!("会话已启动");
    Ok(Self {
      flag,
      capture,
      process,
    })
  }

  pub fn run_flag(&self) -> &RunFlag {
    &self.flag
  }

  /// 请求停止，两个线程在当前一次读取/处理完成后退出
  pub fn stop(&self) {
    self.flag.clear();
  }

  pub fn is_finished(&self) -> bool {
    self.capture.is_finished() && self.process.is_finished()
  }

  /// 等待两个线程退出
  pub fn join(self) -> Result<SessionReport, ControlError> {
    let process = self.process.join();
    // 处理线程退出时已清除运行标志，这里保证 panic 时也一样
    self.flag.clear();
    let capture = self
      .capture
      .join()
      .map_err(|_| ControlError::ThreadPanicked("capture"))?;
    let (process, registry) = process.map_err(|_| ControlError::ThreadPanicked("process"))??;

    info!(
      "会话结束: 读取 {} 帧, 丢弃 {} 帧, 处理 {} 帧, 当前 {} 个目标",
      capture.frames_read,
      capture.frames_dropped,
      process.frames_processed,
      registry.objects.len()
    );
    Ok(SessionReport {
      capture,
      process,
      registry,
    })
  }
}

/// 控制器创建会话所需的外部协作者
pub trait Collaborators {
  type Source: Iterator<Item = RgbNhwcFrame> + Send + 'static;
  type Tracker: TileTracker + Send + 'static;
  type Output: Render<RgbNhwcFrame, RegistrySnapshot> + Send + 'static;

  /// 打不开时返回 `InputError::SourceUnavailable`
  fn open_source(&mut self, selection: &SourceSelection) -> Result<Self::Source, InputError>;
  fn tracker(&mut self) -> Result<Self::Tracker, ControlError>;
  fn output(&mut self) -> Result<Self::Output, ControlError>;
}

/// 通过 URL 创建检测器与输出
#[derive(Debug, Clone)]
pub struct UrlCollaborators {
  pub detector: Url,
  pub outputs: Vec<Url>,
  pub camera: CameraOptions,
}

impl Collaborators for UrlCollaborators {
  type Source = InputWrapper;
  type Tracker = ModelWrapper;
  type Output = Vec<OutputWrapper>;

  fn open_source(&mut self, selection: &SourceSelection) -> Result<Self::Source, InputError> {
    InputWrapper::open(selection, &self.camera)
  }

  fn tracker(&mut self) -> Result<Self::Tracker, ControlError> {
    Ok(ModelWrapper::from_url(&self.detector)?)
  }

  fn output(&mut self) -> Result<Self::Output, ControlError> {
    Ok(OutputWrapper::from_urls(&self.outputs)?)
  }
}

#[derive(Clone)]
pub struct ControllerConfig {
  pub params: TrackParams,
  pub policy: ExpiryPolicy,
  pub painter: Painter,
  pub queue_capacity: usize,
  pub frame_limit: Option<u64>,
}

impl Default for ControllerConfig {
  fn default() -> Self {
    Self {
      params: TrackParams::default(),
      policy: ExpiryPolicy::default(),
      painter: Painter::default(),
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      frame_limit: None,
    }
  }
}

/// start/stop 控制界面
///
/// 同一时间最多一个会话。控制器被丢弃时会停止并等待当前会话。
pub struct Controller<C: Collaborators> {
  collaborators: C,
  config: ControllerConfig,
  run_flag: RunFlag,
  grid: GridSpec,
  session: Option<Session>,
}

impl<C> Controller<C>
where
  C: Collaborators,
  <C::Output as Render<RgbNhwcFrame, RegistrySnapshot>>::Error:
    std::error::Error + Send + Sync + 'static,
{
  pub fn new(collaborators: C, config: ControllerConfig) -> Self {
    Self {
      collaborators,
      config,
      run_flag: RunFlag::new(),
      grid: GridSpec::default(),
      session: None,
    }
  }

  /// 所有会话共用的运行标志，可交给中断处理程序
  pub fn run_flag(&self) -> RunFlag {
    self.run_flag.clone()
  }

  /// 最近一次 `start` 使用的网格
  pub fn grid(&self) -> GridSpec {
    self.grid
  }

  pub fn is_running(&self) -> bool {
    self
      .session
      .as_ref()
      .is_some_and(|session| !session.is_finished())
  }

  /// 按给定网格与输入源开始运行
  ///
  /// 行列数无效时回退到 2x2。输入源打不开时返回错误，不会重试。
  pub fn start(
    &mut self,
    grid_rows: u32,
    grid_cols: u32,
    selection: SourceSelection,
  ) -> Result<(), ControlError> {
    if self.is_running() {
      return Err(ControlError::AlreadyRunning);
    }
    if let Some(previous) = self.session.take()
      && let Err(e) = previous.join()
    {
      warn!("上一次会话以错误结束: {}", e);
    }

    self.grid = GridSpec::new_or_fallback(grid_rows, grid_cols);
    info!("开始运行: 网格 {}, 输入 {}", self.grid, selection);

    let source = self.collaborators.open_source(&selection).map_err(|e| {
      error!("{}", e);
      e
    })?;
    let tracker = self.collaborators.tracker()?;
    let output = self.collaborators.output()?;

    let pipeline = TilePipeline::new(
      self.grid,
      tracker,
      self.config.params,
      ObjectRegistry::new(self.config.policy),
      self.config.painter.clone(),
    );
    let task = ContinuousTask::default()
      .with_run_flag(self.run_flag.clone())
      .with_queue_capacity(self.config.queue_capacity)
      .with_frame_number(self.config.frame_limit);

    self.session = Some(Session::spawn(source, pipeline, output, &task)?);
    Ok(())
  }

  /// 清除运行标志，不等待线程退出
  pub fn stop(&self) {
    info!("请求停止");
    self.run_flag.clear();
  }

  /// 等待当前会话结束，没有会话时返回 `None`
  pub fn wait(&mut self) -> Result<Option<SessionReport>, ControlError> {
    self.session.take().map(Session::join).transpose()
  }
}

impl<C: Collaborators> Drop for Controller<C> {
  fn drop(&mut self) {
    if let Some(session) = self.session.take() {
      session.stop();
      if let Err(e) = session.join() {
        warn!("会话以错误结束: {}", e);
      }
    }
  }
}
