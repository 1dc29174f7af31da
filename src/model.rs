// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model.rs - 模型与检测结果定义
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
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
  category::Category,
  frame::{TargetShape, Tensor},
};

mod adapter;
mod archive;
mod graph;
mod layout;
mod loader;
#[cfg(feature = "onnx")]
mod onnx;

pub use self::adapter::{DEFAULT_INFERENCE_TIMEOUT, InferenceAdapter, InferenceError};
pub use self::graph::{GraphDescriptor, SignatureOutput, WeightGroup, WeightSizeError, WeightSpec};
pub use self::layout::{Geometry, OutputLayout};
pub use self::loader::{
  BackendFactory, DefaultBackends, GraphModel, ModelError, ModelLoader, ModelPayload,
  SessionModel, read_payload,
};
#[cfg(feature = "onnx")]
pub use self::onnx::OrtBackend;

/// 帧像素坐标系下的检测框，宽高恒为非负
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width: width.max(0.0),
      height: height.max(0.0),
    }
  }

  pub fn from_corners(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
  }

  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
  }

  pub fn x_max(&self) -> f32 {
    self.x + self.width
  }

  pub fn y_max(&self) -> f32 {
    self.y + self.height
  }

  pub fn area(&self) -> f32 {
    self.width * self.height
  }

  pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.x_max().min(other.x_max());
    let y2 = self.y_max().min(other.y_max());
    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  /// 交并比；两个框面积均为零时返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let intersection = self.intersection_area(other);
    let union = self.area() + other.area() - intersection;
    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  pub fn scale(&self, sx: f32, sy: f32) -> Self {
    Self::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
  }
}

/// 推理适配器输出的单个候选框，尚未过滤
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
  pub class_index: usize,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 三个等长序列：检测框、分数、类别索引
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
  boxes: Vec<BoundingBox>,
  scores: Vec<f32>,
  class_indices: Vec<usize>,
}

impl RawOutput {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      boxes: Vec::with_capacity(capacity),
      scores: Vec::with_capacity(capacity),
      class_indices: Vec::with_capacity(capacity),
    }
  }

  /// 三个序列长度不一致时返回 `None`
  pub fn from_parts(
    boxes: Vec<BoundingBox>,
    scores: Vec<f32>,
    class_indices: Vec<usize>,
  ) -> Option<Self> {
    if boxes.len() != scores.len() || boxes.len() != class_indices.len() {
      return None;
    }
    Some(Self {
      boxes,
      scores,
      class_indices,
    })
  }

  pub fn push(&mut self, item: RawDetection) {
    self.boxes.push(item.bbox);
    self.scores.push(item.confidence);
    self.class_indices.push(item.class_index);
  }

  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  pub fn boxes(&self) -> &[BoundingBox] {
    &self.boxes
  }

  pub fn scores(&self) -> &[f32] {
    &self.scores
  }

  pub fn class_indices(&self) -> &[usize] {
    &self.class_indices
  }

  pub fn iter(&self) -> impl Iterator<Item = RawDetection> + '_ {
    self
      .boxes
      .iter()
      .zip(&self.scores)
      .zip(&self.class_indices)
      .map(|((bbox, &confidence), &class_index)| RawDetection {
        class_index,
        confidence,
        bbox: *bbox,
      })
  }
}

impl FromIterator<RawDetection> for RawOutput {
  fn from_iter<I: IntoIterator<Item = RawDetection>>(iter: I) -> Self {
    let mut output = RawOutput::default();
    for item in iter {
      output.push(item);
    }
    output
  }
}

/// 通过置信度过滤与非极大值抑制后的检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub category: Category,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 推理后端给出的命名输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  pub name: String,
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl OutputTensor {
  pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self {
      name: name.into(),
      shape,
      data,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
  #[error("张量形状错误: {0}")]
  Shape(String),
  #[error("后端运行时错误: {0}")]
  Runtime(String),
}

/// 可运行的模型实例
///
/// 推理期间只读共享，实现需自行保证 `run` 可被并发调用。
pub trait Backend: Send + Sync {
  fn run(&self, input: &Tensor) -> Result<Vec<OutputTensor>, BackendError>;

  /// 模型元数据中声明的输入尺寸
  fn input_shape(&self) -> Option<TargetShape> {
    None
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
  Graph,
  Session,
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelKind::Graph => f.write_str("graph-model"),
      ModelKind::Session => f.write_str("session"),
    }
  }
}

/// 模型文件位置，同时作为模型缓存的键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelReference(PathBuf);

impl ModelReference {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self(path.into())
  }

  pub fn path(&self) -> &Path {
    &self.0
  }

  pub fn file_name(&self) -> String {
    self
      .0
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default()
  }
}

impl fmt::Display for ModelReference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.display())
  }
}

/// 会话模型的输入输出绑定名
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBindings {
  pub input: String,
  pub layout: OutputLayout,
}

impl Default for SessionBindings {
  fn default() -> Self {
    Self {
      input: "images".to_string(),
      layout: OutputLayout::DetectionHead {
        output: "output0".to_string(),
      },
    }
  }
}

pub struct GraphHandle {
  reference: String,
  input_shape: TargetShape,
  outputs: Vec<SignatureOutput>,
  backend: Box<dyn Backend>,
}

pub struct SessionHandle {
  reference: String,
  input_shape: TargetShape,
  bindings: SessionBindings,
  backend: Box<dyn Backend>,
}

/// 已加载的模型，两种变体在加载时根据模型内容确定
pub enum ModelHandle {
  Graph(GraphHandle),
  Session(SessionHandle),
}

impl ModelHandle {
  pub fn graph(
    reference: impl Into<String>,
    input_shape: TargetShape,
    backend: Box<dyn Backend>,
  ) -> Self {
    Self::graph_with_signature(reference, input_shape, Vec::new(), backend)
  }

  /// 带签名输出的图模型，推理结果优先按签名中的张量名解析
  pub fn graph_with_signature(
    reference: impl Into<String>,
    input_shape: TargetShape,
    outputs: Vec<SignatureOutput>,
    backend: Box<dyn Backend>,
  ) -> Self {
    let input_shape = backend.input_shape().unwrap_or(input_shape);
    ModelHandle::Graph(GraphHandle {
      reference: reference.into(),
      input_shape,
      outputs,
      backend,
    })
  }

  pub fn session(
    reference: impl Into<String>,
    bindings: SessionBindings,
    backend: Box<dyn Backend>,
  ) -> Self {
    let input_shape = backend.input_shape().unwrap_or_default();
    ModelHandle::Session(SessionHandle {
      reference: reference.into(),
      input_shape,
      bindings,
      backend,
    })
  }

  pub fn kind(&self) -> ModelKind {
    match self {
      ModelHandle::Graph(_) => ModelKind::Graph,
      ModelHandle::Session(_) => ModelKind::Session,
    }
  }

  pub fn reference(&self) -> &str {
    match self {
      ModelHandle::Graph(handle) => &handle.reference,
      ModelHandle::Session(handle) => &handle.reference,
    }
  }

  pub fn input_shape(&self) -> TargetShape {
    match self {
      ModelHandle::Graph(handle) => handle.input_shape,
      ModelHandle::Session(handle) => handle.input_shape,
    }
  }

  /// 运行模型并把输出统一为 [`RawOutput`]
  pub fn infer(&self, tensor: &Tensor) -> Result<RawOutput, InferenceError> {
    let (frame_width, frame_height) = tensor.source_size();
    let geometry = Geometry {
      input_width: tensor.width() as f32,
      input_height: tensor.height() as f32,
      frame_width: frame_width as f32,
      frame_height: frame_height as f32,
    };

    match self {
      ModelHandle::Graph(handle) => {
        let outputs = handle.backend.run(tensor)?;
        debug!("图模型输出 {} 个张量", outputs.len());
        layout::normalize_graph(outputs, &handle.outputs, &geometry)
      }
      ModelHandle::Session(handle) => {
        let outputs = handle.backend.run(tensor)?;
        debug!("会话模型输出 {} 个张量", outputs.len());
        layout::normalize_session(&outputs, &handle.bindings.layout, &geometry)
      }
    }
  }
}

impl fmt::Debug for ModelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelHandle")
      .field("kind", &self.kind())
      .field("reference", &self.reference())
      .field("input_shape", &self.input_shape())
      .finish()
  }
}
