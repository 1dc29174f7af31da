// 该文件是 Huishou （回收计数） 项目的一部分。
// src/bin/oneshot.rs - 单帧检测
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use huishou::{
  FromUrl,
  counts::{Counts, apply},
  input::{FrameSource, InputWrapper},
  model::{InferenceAdapter, ModelReference},
  pipeline::Detector,
  postprocess::{DEFAULT_IOU_THRESHOLD, NmsConfig},
  settings::DEFAULT_CONFIDENCE_THRESHOLD,
};
use tracing::info;

/// 对单帧图像做一次检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件：图模型描述、会话模型或压缩包
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  #[arg(long, value_name = "THRESHOLD", default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
  pub threshold: f32,
  #[arg(long, value_name = "IOU", default_value_t = DEFAULT_IOU_THRESHOLD)]
  pub iou: f32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model.display());
  info!("输入来源: {}", args.input);

  let adapter = InferenceAdapter::default();
  adapter.load_model(&ModelReference::new(&args.model))?;
  let detector = Detector::new(adapter).nms(NmsConfig::with_iou_threshold(args.iou));

  let mut input = InputWrapper::from_url(&args.input)?;
  let frame = input.acquire_frame();
  input.release();
  let frame = frame?;
  info!("输入帧获取成功 ({}x{})，开始推理...", frame.width(), frame.height());

  let now = std::time::Instant::now();
  let detections = detector.detect(&frame, args.threshold, None)?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  for detection in &detections {
    let bbox = detection.bbox;
    info!(
      "{} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
      detection.category, detection.confidence, bbox.x, bbox.y, bbox.width, bbox.height
    );
  }
  println!("{}", apply(&detections, &Counts::default()));

  Ok(())
}
