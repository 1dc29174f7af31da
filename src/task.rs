// 该文件是 Huishou （回收计数） 项目的一部分。
// src/task.rs - 检测调度
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Huishou Authors

use std::{
  fmt,
  sync::{Arc, Condvar, Mutex, PoisonError},
  time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
  counts::{CountAggregator, Counts},
  frame::RawFrame,
  input::{FrameSource, FrameSourceError},
  model::InferenceError,
  pipeline::{Detector, PipelineError},
  settings::Settings,
  store::{PersistenceStore, SettingsStore},
};

mod cancel;
pub use self::cancel::CancellationToken;

// 输入源暂无新帧时的重试间隔
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  Idle,
  Running,
}

/// 检测任务正常结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  UserRequest,
  SourceExhausted,
  FrameLimit,
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StopReason::UserRequest => f.write_str("用户停止"),
      StopReason::SourceExhausted => f.write_str("输入结束"),
      StopReason::FrameLimit => f.write_str("达到指定帧数"),
    }
  }
}

struct Session {
  state: SchedulerState,
  token: CancellationToken,
}

struct Shared {
  session: Mutex<Session>,
  changed: Condvar,
}

impl Shared {
  fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
    self.session.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn start(&self) -> CancellationToken {
    let mut session = self.lock();
    session.state = SchedulerState::Running;
    self.changed.notify_all();
    session.token.clone()
  }

  fn finish(&self) {
    let mut session = self.lock();
    session.state = SchedulerState::Idle;
    // 已用过的令牌换新，未触发的停止请求留给下一次运行
    if session.token.is_cancelled() {
      session.token = CancellationToken::new();
    }
    self.changed.notify_all();
  }
}

/// 可在任意线程停止检测任务
#[derive(Clone)]
pub struct StopHandle {
  shared: Arc<Shared>,
}

impl StopHandle {
  /// 请求停止，不等待
  pub fn request_stop(&self) {
    self.shared.lock().token.cancel();
  }

  /// 请求停止并等待任务释放输入源、回到空闲状态
  ///
  /// 不能在运行检测任务的线程上调用。
  pub fn stop(&self) {
    let mut session = self.shared.lock();
    session.token.cancel();
    while session.state == SchedulerState::Running {
      session = self
        .shared
        .changed
        .wait(session)
        .unwrap_or_else(PoisonError::into_inner);
    }
    debug!("检测任务已停止");
  }

  pub fn state(&self) -> SchedulerState {
    self.shared.lock().state
  }
}

/// 离开任务时释放输入源并回到空闲状态，panic 展开时同样执行
struct RunGuard<'a, F: FrameSource> {
  shared: &'a Shared,
  source: F,
}

impl<F: FrameSource> Drop for RunGuard<'_, F> {
  fn drop(&mut self) {
    self.source.release();
    self.shared.finish();
  }
}

enum FramePoll {
  Frame(RawFrame),
  Stopped(StopReason),
}

/// 按设定间隔循环执行 取帧 → 检测 → 计数
pub struct DetectionScheduler<S, P> {
  detector: Detector,
  settings: S,
  aggregator: CountAggregator<P>,
  shared: Arc<Shared>,
  frame_number: Option<usize>,
}

impl<S: SettingsStore, P: PersistenceStore> DetectionScheduler<S, P> {
  pub fn new(detector: Detector, settings: S, aggregator: CountAggregator<P>) -> Self {
    Self {
      detector,
      settings,
      aggregator,
      shared: Arc::new(Shared {
        session: Mutex::new(Session {
          state: SchedulerState::Idle,
          token: CancellationToken::new(),
        }),
        changed: Condvar::new(),
      }),
      frame_number: None,
    }
  }

  /// 处理指定帧数后结束
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn stop_handle(&self) -> StopHandle {
    StopHandle {
      shared: self.shared.clone(),
    }
  }

  pub fn state(&self) -> SchedulerState {
    self.shared.lock().state
  }

  pub fn counts(&self) -> Counts {
    self.aggregator.counts()
  }

  pub fn aggregator(&self) -> &CountAggregator<P> {
    &self.aggregator
  }

  pub fn detector(&self) -> &Detector {
    &self.detector
  }

  /// 运行检测任务直到停止、输入结束或出错
  ///
  /// 无论结果如何，返回前都会释放输入源并回到空闲状态。
  pub fn run<F: FrameSource>(&mut self, source: F) -> Result<StopReason, PipelineError> {
    info!("开始检测任务...");
    let token = self.shared.start();

    let result = {
      let mut guard = RunGuard {
        shared: &self.shared,
        source,
      };
      self.run_loop(&mut guard.source, &token)
    };

    match &result {
      Ok(reason) => info!("检测任务结束: {}, 当前计数: {}", reason, self.counts()),
      Err(e) => error!("检测任务出错: {}。{}", e, e.hint()),
    }
    result
  }

  fn ensure_model(&self, settings: &Settings) -> Result<(), PipelineError> {
    if let Some(reference) = settings.model() {
      self.detector.adapter().load_model(reference)?;
    }
    Ok(())
  }

  fn next_frame<F: FrameSource>(
    &self,
    source: &mut F,
    token: &CancellationToken,
  ) -> Result<FramePoll, PipelineError> {
    loop {
      match source.acquire_frame() {
        Ok(frame) => return Ok(FramePoll::Frame(frame)),
        Err(FrameSourceError::NoFrameAvailable) => {
          if token.wait_timeout(FRAME_POLL_INTERVAL) {
            return Ok(FramePoll::Stopped(StopReason::UserRequest));
          }
        }
        Err(FrameSourceError::EndOfStream) => {
          return Ok(FramePoll::Stopped(StopReason::SourceExhausted));
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  fn run_loop<F: FrameSource>(
    &self,
    source: &mut F,
    token: &CancellationToken,
  ) -> Result<StopReason, PipelineError> {
    let mut settings = self.settings.current_settings();
    info!(
      "置信度阈值: {}, 更新间隔: {:?}",
      settings.confidence_threshold(),
      settings.update_interval()
    );
    self.ensure_model(&settings)?;

    let mut frame_index = 0usize;
    let mut last_cycle: Option<Instant> = None;
    loop {
      if let Some(started) = last_cycle {
        let elapsed = started.elapsed();
        if elapsed < settings.update_interval()
          && token.wait_timeout(settings.update_interval() - elapsed)
        {
          return Ok(StopReason::UserRequest);
        }
      }
      if token.is_cancelled() {
        return Ok(StopReason::UserRequest);
      }
      let started = Instant::now();
      last_cycle = Some(started);

      // 参数变化只在周期开始时生效
      settings = self.settings.current_settings();
      self.ensure_model(&settings)?;

      let frame = match self.next_frame(source, token)? {
        FramePoll::Frame(frame) => frame,
        FramePoll::Stopped(reason) => return Ok(reason),
      };

      let detections =
        match self
          .detector
          .detect(&frame, settings.confidence_threshold(), Some(token))
        {
          Ok(detections) => detections,
          Err(PipelineError::Inference(InferenceError::Cancelled)) => {
            return Ok(StopReason::UserRequest);
          }
          Err(e) => return Err(e),
        };
      if token.is_cancelled() {
        warn!("停止请求到达，丢弃第 {} 帧的检测结果", frame_index + 1);
        return Ok(StopReason::UserRequest);
      }

      frame_index += 1;
      let counts = self.aggregator.record(&detections);
      info!(
        "第 {} 帧: {} 个检测, 耗时 {:.2?}, 计数 {}",
        frame_index,
        detections.len(),
        started.elapsed(),
        counts
      );

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        return Ok(StopReason::FrameLimit);
      }
    }
  }
}
