// 该文件是 Tiletrack 项目的一部分。
// src/task.rs - 采集与处理任务
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

//! # 采集与处理
//!
//! 采集线程从输入源读帧并放入有界队列，处理线程从队列取帧执行完整的单帧流程。
//! 队列满时丢弃最旧的一帧，采集永远不会因为处理慢而阻塞。
//!
//! 两个线程都在每次循环开始时检查运行标志。处理线程退出时（无论正常结束、
//! 出错还是 panic）都会清除运行标志，采集线程随之在当前读取完成后退出。
//! 输入源由采集线程持有，退出循环时释放；输出由处理线程持有。

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  control::{Session, SessionReport},
  frame::RgbNhwcFrame,
  model::TileTracker,
  output::Render,
  pipeline::{PipelineError, TilePipeline},
  registry::RegistrySnapshot,
};

/// 默认队列容量（帧）
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// 处理线程等待新帧时检查运行标志的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 中断后强制退出前的等待时间
pub const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("处理错误: {0}")]
  Pipeline(#[from] PipelineError),
  #[error("输出错误: {0}")]
  Output(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("没有输入帧")]
  NoInputFrame,
  #[error("会话错误: {0}")]
  Session(String),
}

/// 共享的运行标志
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn raise(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn clear(&self) {
    self.0.store(false, Ordering::SeqCst);
  }

  pub fn is_running(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 离开作用域时清除运行标志
struct ClearOnExit<'a>(&'a RunFlag);

impl Drop for ClearOnExit<'_> {
  fn drop(&mut self) {
    self.0.clear();
  }
}

/// 队列中的一帧，序号由采集线程按读取顺序分配
#[derive(Debug, Clone)]
pub struct QueuedFrame {
  pub index: u64,
  pub frame: RgbNhwcFrame,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("帧队列已关闭")]
pub struct QueueClosed;

/// 创建容量为 `capacity` 的丢弃最旧帧队列
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
  let (tx, rx) = bounded(capacity.max(1));
  (
    FrameSender {
      tx,
      evict: rx.clone(),
      dropped: 0,
    },
    FrameReceiver { rx },
  )
}

/// 生产端
///
/// 持有一个接收端副本用于丢弃最旧的帧。
pub struct FrameSender {
  tx: Sender<QueuedFrame>,
  evict: Receiver<QueuedFrame>,
  dropped: u64,
}

impl FrameSender {
  /// 放入一帧，队列满时先丢弃最旧的帧；返回本次丢弃的帧数
  pub fn push(&mut self, mut item: QueuedFrame) -> Result<u64, QueueClosed> {
    let mut dropped = 0;
    loop {
      match self.tx.try_send(item) {
        Ok(()) => return Ok(dropped),
        Err(TrySendError::Full(back)) => {
          item = back;
          if let Ok(old) = self.evict.try_recv() {
            dropped += 1;
            self.dropped += 1;
            debug!("队列已满，丢弃第 {} 帧 (累计 {})", old.index, self.dropped);
          }
        }
        Err(TrySendError::Disconnected(_)) => return Err(QueueClosed),
      }
    }
  }

  pub fn dropped(&self) -> u64 {
    self.dropped
  }

  pub fn len(&self) -> usize {
    self.tx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tx.is_empty()
  }
}

/// 消费端，生产端全部释放且队列取空后返回 `Disconnected`
pub struct FrameReceiver {
  rx: Receiver<QueuedFrame>,
}

impl FrameReceiver {
  pub fn recv_timeout(&self, timeout: Duration) -> Result<QueuedFrame, RecvTimeoutError> {
    self.rx.recv_timeout(timeout)
  }

  pub fn try_recv(&self) -> Option<QueuedFrame> {
    self.rx.try_recv().ok()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
  pub frames_read: u64,
  pub frames_dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
  pub frames_processed: u64,
  pub detections: u64,
  pub unconfirmed: u64,
  pub tile_failures: u64,
  pub objects_evicted: u64,
  pub last_frame: Option<u64>,
}

/// 采集循环，返回时输入源已经释放
pub fn capture_loop<S>(source: S, mut queue: FrameSender, flag: &RunFlag) -> CaptureStats
where
  S: Iterator<Item = RgbNhwcFrame>,
{
  let mut source = source;
  let mut stats = CaptureStats::default();

  while flag.is_running() {
    let Some(frame) = source.next() else {
      info!("输入源已结束");
      break;
    };
    let index = stats.frames_read;
    stats.frames_read += 1;
    if queue.push(QueuedFrame { index, frame }).is_err() {
      warn!("帧队列已关闭，停止采集");
      break;
    }
  }

  drop(source);
  stats.frames_dropped = queue.dropped();
  info!(
    "采集结束: 读取 {} 帧, 丢弃 {} 帧",
    stats.frames_read, stats.frames_dropped
  );
  stats
}

/// 处理循环
///
/// 输入源结束且队列取空、运行标志被清除、达到帧数上限或出错时返回。
pub fn process_loop<M, O>(
  queue: FrameReceiver,
  pipeline: &mut TilePipeline<M>,
  output: &O,
  flag: &RunFlag,
  frame_limit: Option<u64>,
) -> Result<ProcessStats, TaskError>
where
  M: TileTracker,
  O: Render<RgbNhwcFrame, RegistrySnapshot>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  let _guard = ClearOnExit(flag);
  let mut stats = ProcessStats::default();

  while flag.is_running() {
    let queued = match queue.recv_timeout(POLL_INTERVAL) {
      Ok(queued) => queued,
      Err(RecvTimeoutError::Timeout) => continue,
      Err(RecvTimeoutError::Disconnected) => {
        info!("没有更多输入帧");
        break;
      }
    };

    let now = Instant::now();
    let processed = pipeline.process(queued.index, &queued.frame)?;
    let snapshot = pipeline.registry().snapshot(queued.index);
    output
      .render_result(&processed.frame, &snapshot)
      .map_err(|e| TaskError::Output(Box::new(e)))?;

    stats.frames_processed += 1;
    stats.detections += processed.detections as u64;
    stats.unconfirmed += processed.summary.unconfirmed as u64;
    stats.tile_failures += processed.failed_tiles as u64;
    stats.objects_evicted += processed.summary.evicted as u64;
    stats.last_frame = Some(queued.index);
    info!(
      "第 {} 帧处理完成，耗时: {:.2?} / {:.2?}",
      queued.index,
      processed.elapsed,
      now.elapsed()
    );

    if frame_limit.is_some_and(|n| stats.frames_processed >= n) {
      info!("达到指定帧数 {}, 退出任务循环", stats.frames_processed);
      break;
    }
  }

  info!(
    "处理结束: {} 帧, {} 个检测, {} 个子图检测失败, 移除 {} 个目标",
    stats.frames_processed, stats.detections, stats.tile_failures, stats.objects_evicted
  );
  Ok(stats)
}

/// 安装 Ctrl-C 处理：清除运行标志，超时未退出则强制结束进程
pub fn install_interrupt_handler(flag: RunFlag) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    flag.clear();
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(
    self,
    input: I,
    pipeline: TilePipeline<M>,
    output: O,
  ) -> Result<Self::Output, Self::Error>;
}

/// 只处理输入的第一帧，在当前线程完成
pub struct OneShotTask;

impl<I, M, O> Task<I, M, O> for OneShotTask
where
  I: Iterator<Item = RgbNhwcFrame>,
  M: TileTracker,
  O: Render<RgbNhwcFrame, RegistrySnapshot>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = RegistrySnapshot;
  type Error = TaskError;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: TilePipeline<M>,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or(TaskError::NoInputFrame)?;
    drop(input);

    info!("输入帧获取成功，开始处理...");
    let processed = pipeline.process(0, &frame)?;
    info!("处理完成，耗时: {:.2?}", processed.elapsed);

    let snapshot = pipeline.registry().snapshot(0);
    output
      .render_result(&processed.frame, &snapshot)
      .map_err(|e| TaskError::Output(Box::new(e)))?;
    info!("渲染完成，共 {} 个目标", snapshot.objects.len());

    Ok(snapshot)
  }
}

/// 采集与处理分线程运行，直到输入结束或运行标志被清除
#[derive(Debug, Clone)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
  queue_capacity: usize,
  run_flag: RunFlag,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      run_flag: RunFlag::new(),
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  /// 使用外部提供的运行标志，例如中断处理程序持有的那一个
  pub fn with_run_flag(mut self, run_flag: RunFlag) -> Self {
    self.run_flag = run_flag;
    self
  }

  pub fn run_flag(&self) -> &RunFlag {
    &self.run_flag
  }

  pub fn frame_number(&self) -> Option<u64> {
    self.frame_number
  }

  pub fn queue_capacity(&self) -> usize {
    self.queue_capacity
  }
}

impl<I, M, O> Task<I, M, O> for ContinuousTask
where
  I: Iterator<Item = RgbNhwcFrame> + Send + 'static,
  M: TileTracker + Send + 'static,
  O: Render<RgbNhwcFrame, RegistrySnapshot> + Send + 'static,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = SessionReport;
  type Error = TaskError;

  fn run_task(
    self,
    input: I,
    pipeline: TilePipeline<M>,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let session = Session::spawn(input, pipeline, output, &self)
      .map_err(|e| TaskError::Session(e.to_string()))?;
    let report = session
      .join()
      .map_err(|e| TaskError::Session(e.to_string()))?;
    info!("任务完成，退出");
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(index: u64) -> QueuedFrame {
    QueuedFrame {
      index,
      frame: RgbNhwcFrame::with_shape(1, 1),
    }
  }

  #[test]
  fn full_queue_drops_oldest_frame() {
    let (mut tx, rx) = frame_queue(2);
    assert_eq!(tx.push(frame(0)), Ok(0));
    assert_eq!(tx.push(frame(1)), Ok(0));
    assert_eq!(tx.push(frame(2)), Ok(1));
    assert_eq!(tx.dropped(), 1);

    assert_eq!(rx.try_recv().map(|f| f.index), Some(1));
    assert_eq!(rx.try_recv().map(|f| f.index), Some(2));
    assert!(rx.try_recv().is_none());
  }

  #[test]
  fn receiver_sees_disconnect_after_draining() {
    let (mut tx, rx) = frame_queue(4);
    tx.push(frame(0)).unwrap();
    drop(tx);

    assert_eq!(rx.recv_timeout(POLL_INTERVAL).unwrap().index, 0);
    assert!(matches!(
      rx.recv_timeout(POLL_INTERVAL),
      Err(RecvTimeoutError::Disconnected)
    ));
  }

  #[test]
  fn capture_stops_when_flag_is_cleared() {
    let flag = RunFlag::new();
    let (tx, rx) = frame_queue(4);
    let stats = capture_loop(
      std::iter::repeat_with(|| RgbNhwcFrame::with_shape(1, 1)),
      tx,
      &flag,
    );
    assert_eq!(stats.frames_read, 0);
    assert!(rx.try_recv().is_none());
  }

  #[test]
  fn capture_reads_until_source_ends() {
    let flag = RunFlag::new();
    flag.raise();
    let (tx, rx) = frame_queue(2);
    let stats = capture_loop(
      (0..5).map(|_| RgbNhwcFrame::with_shape(1, 1)),
      tx,
      &flag,
    );

    assert_eq!(stats, CaptureStats {
      frames_read: 5,
      frames_dropped: 3,
    });
    assert_eq!(rx.try_recv().map(|f| f.index), Some(3));
    assert_eq!(rx.try_recv().map(|f| f.index), Some(4));
  }

  #[test]
  fn guard_clears_flag() {
    let flag = RunFlag::new();
    flag.raise();
    {
      let _guard = ClearOnExit(&flag);
      assert!(flag.is_running());
    }
    assert!(!flag.is_running());
  }
}
