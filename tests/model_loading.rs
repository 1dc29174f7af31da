// 该文件是 Huishou （回收计数） 项目的一部分。
// tests/model_loading.rs - 模型加载集成测试
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
  io::{Cursor, Write},
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::RgbImage;
use zip::{ZipWriter, write::SimpleFileOptions};

use huishou::{
  category::Category,
  counts::CountAggregator,
  frame::{TargetShape, Tensor},
  input::{ChannelInput, ImageFileInput},
  model::{
    Backend, BackendError, BackendFactory, GraphModel, InferenceAdapter, ModelError, ModelKind,
    ModelLoader, ModelReference, OutputTensor, SessionBindings, SessionModel,
  },
  pipeline::{Detector, PipelineError},
  settings::Settings,
  store::{JsonCountsStore, JsonSettingsStore, MemoryStore},
  task::{DetectionScheduler, SchedulerState, StopReason},
};

/// 每帧输出一个 can，位于输入中心
struct OneCan;

impl Backend for OneCan {
  fn run(&self, input: &Tensor) -> Result<Vec<OutputTensor>, BackendError> {
    assert_eq!(input.shape(), [1, 3, 32, 32]);
    let attrs = 4 + Category::ALL.len();
    let candidates = 16;
    let mut data = vec![0.0; attrs * candidates];
    data[0] = 16.0;
    data[candidates] = 16.0;
    data[2 * candidates] = 8.0;
    data[3 * candidates] = 8.0;
    data[(4 + Category::Can.label_id()) * candidates] = 0.9;
    Ok(vec![OutputTensor::new(
      "output0",
      vec![1, attrs, candidates],
      data,
    )])
  }

  fn input_shape(&self) -> Option<TargetShape> {
    Some(TargetShape::square(32))
  }
}

#[derive(Clone, Default)]
struct CountingFactory {
  sessions: Arc<AtomicUsize>,
}

impl BackendFactory for CountingFactory {
  fn graph(&self, _model: &GraphModel) -> Result<Box<dyn Backend>, ModelError> {
    Err(ModelError::BackendUnavailable(ModelKind::Graph))
  }

  fn session(
    &self,
    model: &SessionModel,
    bindings: &SessionBindings,
  ) -> Result<Box<dyn Backend>, ModelError> {
    assert!(model.name.ends_with(".onnx"));
    assert_eq!(bindings.input, "images");
    self.sessions.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(OneCan))
  }
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
  let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
  for (name, bytes) in entries {
    writer
      .start_file(*name, SimpleFileOptions::default())
      .unwrap();
    writer.write_all(bytes).unwrap();
  }
  let bytes = writer.finish().unwrap().into_inner();
  std::fs::write(path, bytes).unwrap();
}

fn session_archive(dir: &Path) -> ModelReference {
  let path = dir.join("model.zip");
  write_zip(
    &path,
    &[
      ("__MACOSX/._model.onnx", b"junk"),
      ("export/model.onnx", &[0x08, 0x07, 0x12, 0x00]),
    ],
  );
  ModelReference::new(path)
}

fn adapter(factory: &CountingFactory) -> InferenceAdapter {
  InferenceAdapter::new(ModelLoader::new(factory.clone()))
}

#[test]
fn archived_session_model_is_loaded_once() {
  let dir = tempfile::tempdir().unwrap();
  let reference = session_archive(dir.path());
  let factory = CountingFactory::default();
  let adapter = adapter(&factory);

  let handle = adapter.load_model(&reference).unwrap();
  assert_eq!(handle.kind(), ModelKind::Session);
  assert_eq!(handle.input_shape(), TargetShape::square(32));

  adapter.load_model(&reference).unwrap();
  assert_eq!(factory.sessions.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_load_keeps_the_previous_model() {
  let dir = tempfile::tempdir().unwrap();
  let good = session_archive(dir.path());
  let bad = dir.path().join("notes.txt");
  std::fs::write(&bad, "not a model").unwrap();
  let factory = CountingFactory::default();
  let adapter = adapter(&factory);

  adapter.load_model(&good).unwrap();
  assert!(matches!(
    adapter.load_model(&ModelReference::new(&bad)),
    Err(ModelError::Format(_))
  ));
  assert_eq!(
    adapter.current().unwrap().reference(),
    good.to_string()
  );
}

#[test]
fn unreadable_model_stops_the_scheduler() {
  let dir = tempfile::tempdir().unwrap();
  let bad = dir.path().join("model.bin");
  std::fs::write(&bad, [0xffu8, 0x00, 0x01]).unwrap();
  let store = Arc::new(MemoryStore::new(Settings::new(
    0.3,
    50,
    Some(ModelReference::new(&bad)),
  )));
  let detector = Detector::new(adapter(&CountingFactory::default()));
  let mut scheduler =
    DetectionScheduler::new(detector, store.clone(), CountAggregator::new(store.clone()));
  let (sender, input) = ChannelInput::new();

  let result = scheduler.run(input);

  assert!(matches!(
    result,
    Err(PipelineError::ModelFormat(ModelError::Format(_)))
  ));
  assert_eq!(scheduler.state(), SchedulerState::Idle);
  assert!(sender.send(RgbImage::new(4, 4).into()).is_err());
}

#[test]
fn settings_file_drives_a_counting_run() {
  let dir = tempfile::tempdir().unwrap();
  session_archive(dir.path());
  let settings_path = dir.path().join("settings.json");
  std::fs::write(
    &settings_path,
    r#"{"detectionThreshold": "0.5", "updateInterval": 50, "modelFile": "model.zip"}"#,
  )
  .unwrap();
  let counts_path = dir.path().join("counts.json");

  let factory = CountingFactory::default();
  let detector = Detector::new(adapter(&factory));
  let mut scheduler = DetectionScheduler::new(
    detector,
    JsonSettingsStore::new(&settings_path),
    CountAggregator::new(JsonCountsStore::new(&counts_path)),
  )
  .with_frame_number(Some(2));

  let input = ImageFileInput::from_image(RgbImage::new(64, 64)).repeat(true);
  assert_eq!(scheduler.run(input).unwrap(), StopReason::FrameLimit);
  assert_eq!(scheduler.counts().get(Category::Can), 2);

  let saved: serde_json::Value =
    serde_json::from_slice(&std::fs::read(&counts_path).unwrap()).unwrap();
  assert_eq!(saved["counts"]["can"], 2);
  assert_eq!(saved["counts"]["glass"], 0);
  assert!(saved["updatedAt"].is_string());

  // 重新打开时从文件恢复
  let reopened = CountAggregator::new(JsonCountsStore::new(&counts_path));
  assert_eq!(reopened.counts(), scheduler.counts());
}
