// 该文件是 Huishou （回收计数） 项目的一部分。
// src/bin/counter.rs - 连续检测计数
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

use std::{path::PathBuf, thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use url::Url;

use huishou::{
  FromUrl,
  counts::CountAggregator,
  input::InputWrapper,
  model::{InferenceAdapter, ModelLoader, ModelReference, OutputLayout, SessionBindings},
  pipeline::Detector,
  postprocess::{DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_DETECTIONS, NmsConfig},
  settings::Settings,
  store::{JsonCountsStore, JsonSettingsStore, SettingsStore},
  task::DetectionScheduler,
};
use tracing::{info, warn};

/// 回收物连续检测计数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，如 image:///path/to/frame.png?repeat 或 v4l:///dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 参数文件 (JSON)，每个周期重新读取
  #[arg(long, value_name = "SETTINGS")]
  pub settings: Option<PathBuf>,
  /// 模型文件，覆盖参数文件中的 modelFile
  #[arg(long, value_name = "MODEL")]
  pub model: Option<PathBuf>,
  /// 置信度阈值，覆盖参数文件
  #[arg(long, value_name = "THRESHOLD")]
  pub threshold: Option<f32>,
  /// 更新间隔（毫秒），覆盖参数文件
  #[arg(long, value_name = "MILLIS")]
  pub interval: Option<u64>,
  /// 计数文件 (JSON)
  #[arg(long, value_name = "COUNTS", default_value = "counts.json")]
  pub counts: PathBuf,
  /// 开始前清零计数
  #[arg(long)]
  pub reset_counts: bool,

  #[arg(long, value_name = "IOU", default_value_t = DEFAULT_IOU_THRESHOLD)]
  pub iou: f32,
  #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_DETECTIONS)]
  pub max_detections: usize,
  /// 不同类别之间也做非极大值抑制
  #[arg(long)]
  pub class_agnostic: bool,
  /// 单次推理超时（毫秒）
  #[arg(long, value_name = "MILLIS", default_value_t = 5000)]
  pub timeout: u64,
  /// 会话模型的输入名
  #[arg(long, value_name = "NAME", default_value = "images")]
  pub input_binding: String,
  /// 会话模型的检测头输出名
  #[arg(long, value_name = "NAME", default_value = "output0")]
  pub output_binding: String,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

/// 参数文件加上命令行覆盖项
struct CliSettings {
  file: Option<JsonSettingsStore>,
  model: Option<PathBuf>,
  threshold: Option<f32>,
  interval: Option<u64>,
}

impl SettingsStore for CliSettings {
  fn current_settings(&self) -> Settings {
    let base = self
      .file
      .as_ref()
      .map(|file| file.current_settings())
      .unwrap_or_default();
    let model = self
      .model
      .clone()
      .map(ModelReference::new)
      .or_else(|| base.model().cloned());
    Settings::new(
      self.threshold.unwrap_or(base.confidence_threshold()),
      self.interval.unwrap_or(base.update_interval_ms()),
      model,
    )
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("计数文件: {}", args.counts.display());

  let settings = CliSettings {
    file: args.settings.clone().map(JsonSettingsStore::new),
    model: args.model.clone(),
    threshold: args.threshold,
    interval: args.interval,
  };
  if settings.current_settings().model().is_none() {
    warn!("没有设置模型文件，检测会立即失败");
  }

  let loader = ModelLoader::default().bindings(SessionBindings {
    input: args.input_binding.clone(),
    layout: OutputLayout::DetectionHead {
      output: args.output_binding.clone(),
    },
  });
  let adapter = InferenceAdapter::new(loader).timeout(Duration::from_millis(args.timeout));
  let detector = Detector::new(adapter).nms(NmsConfig {
    iou_threshold: args.iou,
    max_detections: args.max_detections,
    class_agnostic: args.class_agnostic,
  });

  let aggregator = CountAggregator::new(JsonCountsStore::new(&args.counts));
  if args.reset_counts {
    aggregator.reset();
  }

  let input = InputWrapper::from_url(&args.input)?;
  let mut scheduler =
    DetectionScheduler::new(detector, settings, aggregator).with_frame_number(args.frame_number);

  let handle = scheduler.stop_handle();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
    handle.stop();
  })?;

  let reason = scheduler.run(input)?;
  info!("任务完成 ({})，退出", reason);

  for (category, count) in scheduler.counts().iter() {
    println!("{}\t{}", category, count);
  }

  Ok(())
}
