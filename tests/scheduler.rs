// 该文件是 Huishou （回收计数） 项目的一部分。
// tests/scheduler.rs - 检测调度集成测试
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
  collections::VecDeque,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, Mutex},
  thread,
  time::Duration,
};

use image::{Rgb, RgbImage};

use huishou::{
  category::Category,
  counts::{CountAggregator, Counts},
  frame::{RawFrame, TargetShape, Tensor},
  input::{ChannelInput, ImageFileInput},
  model::{Backend, BackendError, InferenceAdapter, InferenceError, ModelHandle, OutputTensor},
  pipeline::{Detector, PipelineError},
  settings::Settings,
  store::{MemoryStore, PersistenceStore, StoreError},
  task::{DetectionScheduler, SchedulerState, StopReason},
};

const CANDIDATES: usize = 16;
const ATTRS: usize = 4 + Category::ALL.len();

/// (类别, 分数, [cx, cy, w, h])，坐标为模型输入像素
type Scripted = Vec<(usize, f32, [f32; 4])>;

fn head(detections: &[(usize, f32, [f32; 4])]) -> OutputTensor {
  let mut data = vec![0.0; ATTRS * CANDIDATES];
  for (i, (class, score, bbox)) in detections.iter().enumerate() {
    for (attr, value) in bbox.iter().enumerate() {
      data[attr * CANDIDATES + i] = *value;
    }
    data[(4 + class) * CANDIDATES + i] = *score;
  }
  OutputTensor::new("output0", vec![1, ATTRS, CANDIDATES], data)
}

/// 按顺序为每一帧返回预设的检测结果
struct ScriptedBackend {
  frames: Mutex<VecDeque<Scripted>>,
  delay: Duration,
}

impl ScriptedBackend {
  fn new(frames: Vec<Scripted>) -> Self {
    Self {
      frames: Mutex::new(frames.into()),
      delay: Duration::ZERO,
    }
  }

  fn slow(delay: Duration) -> Self {
    Self {
      frames: Mutex::new(VecDeque::new()),
      delay,
    }
  }
}

impl Backend for ScriptedBackend {
  fn run(&self, input: &Tensor) -> Result<Vec<OutputTensor>, BackendError> {
    assert_eq!(input.shape(), [1, 3, 32, 32]);
    thread::sleep(self.delay);
    let detections = self.frames.lock().unwrap().pop_front().unwrap_or_default();
    Ok(vec![head(&detections)])
  }
}

fn detector(backend: ScriptedBackend) -> Detector {
  let adapter = InferenceAdapter::default().timeout(Duration::from_millis(200));
  adapter.bind(ModelHandle::graph(
    "scripted",
    TargetShape::square(32),
    Box::new(backend),
  ));
  Detector::new(adapter)
}

fn frame() -> RawFrame {
  RawFrame::from(RgbImage::from_pixel(64, 64, Rgb([90, 120, 30])))
}

fn fast_settings() -> Settings {
  Settings::new(0.3, 50, None)
}

fn scheduler(
  detector: Detector,
  store: &Arc<MemoryStore>,
) -> DetectionScheduler<Arc<MemoryStore>, Arc<MemoryStore>> {
  DetectionScheduler::new(
    detector,
    store.clone(),
    CountAggregator::new(store.clone()),
  )
}

#[test]
fn missing_model_stops_with_model_not_loaded() {
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(Detector::new(InferenceAdapter::default()), &store);
  let (sender, input) = ChannelInput::new();
  sender.send(frame()).unwrap();

  let result = scheduler.run(input);

  assert!(matches!(result, Err(PipelineError::ModelNotLoaded)));
  assert_eq!(scheduler.state(), SchedulerState::Idle);
  // 输入源已释放
  assert!(sender.send(frame()).is_err());
  assert_eq!(store.save_count(), 0);
}

#[test]
fn frames_are_counted_in_order() {
  let backend = ScriptedBackend::new(vec![
    vec![(0, 0.9, [8.0, 8.0, 6.0, 6.0])],
    vec![
      (1, 0.8, [4.0, 4.0, 4.0, 4.0]),
      (1, 0.7, [24.0, 24.0, 4.0, 4.0]),
      // 与第一个 can 重叠，被抑制
      (1, 0.6, [4.5, 4.0, 4.0, 4.0]),
    ],
    vec![(4, 0.95, [16.0, 16.0, 10.0, 10.0]), (2, 0.2, [2.0, 2.0, 2.0, 2.0])],
  ]);
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(detector(backend), &store).with_frame_number(Some(3));
  let input = ImageFileInput::from_image(frame().image().clone()).repeat(true);

  let reason = scheduler.run(input).unwrap();

  assert_eq!(reason, StopReason::FrameLimit);
  let counts = scheduler.counts();
  assert_eq!(counts.get(Category::Glass), 1);
  assert_eq!(counts.get(Category::Can), 2);
  assert_eq!(counts.get(Category::Carton), 1);
  assert_eq!(counts.get(Category::Pet1), 0);
  assert_eq!(store.saved_counts(), Some(counts));
  assert_eq!(store.save_count(), 3);
}

#[test]
fn finite_source_ends_the_run() {
  let backend = ScriptedBackend::new(vec![vec![(3, 0.5, [8.0, 8.0, 4.0, 4.0])]]);
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(detector(backend), &store);

  let reason = scheduler
    .run(ImageFileInput::from_image(RgbImage::new(20, 10)))
    .unwrap();

  assert_eq!(reason, StopReason::SourceExhausted);
  assert_eq!(scheduler.counts().get(Category::Hdpe2), 1);
  assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[test]
fn threshold_comes_from_current_settings() {
  let backend = ScriptedBackend::new(vec![vec![(0, 0.5, [8.0, 8.0, 4.0, 4.0])]]);
  let store = Arc::new(MemoryStore::new(Settings::new(0.6, 50, None)));
  let mut scheduler = scheduler(detector(backend), &store);

  scheduler
    .run(ImageFileInput::from_image(RgbImage::new(8, 8)))
    .unwrap();

  assert_eq!(scheduler.counts().total(), 0);
  // 没有检测结果的帧也会保存一次
  assert_eq!(store.save_count(), 1);
}

#[test]
fn stop_from_another_thread_releases_the_source() {
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(detector(ScriptedBackend::new(vec![])), &store);
  let handle = scheduler.stop_handle();
  let (sender, input) = ChannelInput::new();

  let stopper = thread::spawn(move || {
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.state(), SchedulerState::Running);
    handle.stop();
    // stop 返回时输入源必然已释放
    sender.send(frame()).is_err()
  });

  let reason = scheduler.run(input).unwrap();

  assert_eq!(reason, StopReason::UserRequest);
  assert!(stopper.join().unwrap());
  assert_eq!(scheduler.state(), SchedulerState::Idle);
  assert_eq!(store.save_count(), 0);
}

#[test]
fn stop_requested_before_run_applies_to_the_next_run() {
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(detector(ScriptedBackend::new(vec![])), &store);
  scheduler.stop_handle().request_stop();

  let input = ImageFileInput::from_image(RgbImage::new(8, 8)).repeat(true);
  assert_eq!(scheduler.run(input).unwrap(), StopReason::UserRequest);

  // 令牌已更换，下一次运行正常进行
  let input = ImageFileInput::from_image(RgbImage::new(8, 8));
  assert_eq!(
    scheduler.run(input).unwrap(),
    StopReason::SourceExhausted
  );
}

#[test]
fn slow_inference_times_out() {
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = scheduler(
    detector(ScriptedBackend::slow(Duration::from_millis(600))),
    &store,
  );

  let result = scheduler.run(ImageFileInput::from_image(RgbImage::new(8, 8)));

  assert!(matches!(
    result,
    Err(PipelineError::Inference(InferenceError::Timeout(_)))
  ));
  assert_eq!(scheduler.state(), SchedulerState::Idle);
  assert_eq!(scheduler.counts().total(), 0);
}

/// 保存计数时直接 panic 的存储
struct PanickingStore;

impl PersistenceStore for PanickingStore {
  fn load_counts(&self) -> Result<Counts, StoreError> {
    Ok(Counts::default())
  }

  fn save_counts(&self, _counts: &Counts) -> Result<(), StoreError> {
    panic!("存储故障");
  }
}

#[test]
fn panic_during_run_still_releases_the_source() {
  let store = Arc::new(MemoryStore::new(fast_settings()));
  let mut scheduler = DetectionScheduler::new(
    detector(ScriptedBackend::new(vec![])),
    store.clone(),
    CountAggregator::new(PanickingStore),
  );
  let handle = scheduler.stop_handle();
  let (sender, input) = ChannelInput::new();
  sender.send(frame()).unwrap();

  let outcome = catch_unwind(AssertUnwindSafe(|| scheduler.run(input)));

  assert!(outcome.is_err());
  assert_eq!(handle.state(), SchedulerState::Idle);
  assert!(sender.send(frame()).is_err());
  // 不会阻塞
  handle.stop();
}
