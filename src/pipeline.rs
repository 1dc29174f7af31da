// 该文件是 Huishou （回收计数） 项目的一部分。
// src/pipeline.rs - 单帧检测流水线
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

use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::{
  frame::RawFrame,
  input::FrameSourceError,
  model::{Detection, InferenceAdapter, InferenceError, ModelError},
  postprocess::{NmsConfig, postprocess_with},
  preprocess::{PreprocessError, preprocess},
  task::CancellationToken,
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("无效帧: {0}")]
  InvalidFrame(#[from] PreprocessError),
  #[error("没有加载模型")]
  ModelNotLoaded,
  #[error("模型加载失败: {0}")]
  ModelFormat(#[from] ModelError),
  #[error("推理失败: {0}")]
  Inference(InferenceError),
  #[error("输入源错误: {0}")]
  FrameSource(#[from] FrameSourceError),
}

impl From<InferenceError> for PipelineError {
  fn from(err: InferenceError) -> Self {
    match err {
      InferenceError::ModelNotLoaded => PipelineError::ModelNotLoaded,
      err => PipelineError::Inference(err),
    }
  }
}

impl PipelineError {
  /// 给用户的处理建议
  pub fn hint(&self) -> &'static str {
    match self {
      PipelineError::InvalidFrame(_) => "检查摄像头或图像文件是否输出了有效画面",
      PipelineError::ModelNotLoaded => "请在参数中设置模型文件后重新开始",
      PipelineError::ModelFormat(_) => "请检查模型文件，或重新选择模型后再试",
      PipelineError::Inference(InferenceError::Timeout(_)) => "推理过慢，请换用更小的模型或增大超时",
      PipelineError::Inference(_) => "请重新加载模型后再试",
      PipelineError::FrameSource(_) => "请检查输入设备后重新开始",
    }
  }
}

/// 预处理、推理、后处理组成的单帧检测
pub struct Detector {
  adapter: InferenceAdapter,
  nms: NmsConfig,
}

impl Detector {
  pub fn new(adapter: InferenceAdapter) -> Self {
    Self {
      adapter,
      nms: NmsConfig::default(),
    }
  }

  pub fn nms(mut self, nms: NmsConfig) -> Self {
    self.nms = nms;
    self
  }

  pub fn adapter(&self) -> &InferenceAdapter {
    &self.adapter
  }

  pub fn detect(
    &self,
    frame: &RawFrame,
    confidence_threshold: f32,
    cancel: Option<&CancellationToken>,
  ) -> Result<Vec<Detection>, PipelineError> {
    let shape = self
      .adapter
      .input_shape()
      .ok_or(PipelineError::ModelNotLoaded)?;

    let now = Instant::now();
    let tensor = preprocess(frame, shape)?;
    let preprocessed = now.elapsed();
    let raw = self.adapter.infer(tensor, cancel)?;
    let inferred = now.elapsed();
    let detections = postprocess_with(&raw, confidence_threshold, &self.nms);
    debug!(
      "单帧检测耗时: 预处理 {:.2?} / 推理 {:.2?} / 总计 {:.2?}",
      preprocessed,
      inferred - preprocessed,
      now.elapsed()
    );
    Ok(detections)
  }
}
