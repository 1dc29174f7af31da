// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/loader.rs - 模型文件读取与后端构建
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

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{
  Backend, BackendError, ModelHandle, ModelKind, ModelReference, SessionBindings, archive,
  graph::GraphDescriptor,
};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("无法识别的模型格式: {0}")]
  Format(String),
  #[error("模型压缩包错误: {0}")]
  Archive(#[from] zip::result::ZipError),
  #[error("图模型描述解析错误: {0}")]
  Descriptor(#[from] serde_json::Error),
  #[error("没有可用的 {0} 推理后端")]
  BackendUnavailable(ModelKind),
  #[error("推理后端初始化失败: {0}")]
  Backend(#[from] BackendError),
}

/// 图模型：描述文件加上按清单顺序拼接好的权重
#[derive(Debug, Clone)]
pub struct GraphModel {
  pub descriptor: GraphDescriptor,
  pub weights: Vec<u8>,
}

/// 会话模型：单个自描述的模型文件
#[derive(Debug, Clone)]
pub struct SessionModel {
  pub name: String,
  pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ModelPayload {
  Graph(GraphModel),
  Session(SessionModel),
}

impl ModelPayload {
  pub fn kind(&self) -> ModelKind {
    match self {
      ModelPayload::Graph(_) => ModelKind::Graph,
      ModelPayload::Session(_) => ModelKind::Session,
    }
  }
}

/// 拼接权重分片并核对清单声明的总字节数
pub(crate) fn graph_model(
  descriptor: GraphDescriptor,
  shards: Vec<Vec<u8>>,
) -> Result<GraphModel, ModelError> {
  let expected = descriptor
    .expected_weight_bytes()
    .map_err(|e| ModelError::Format(e.to_string()))?;
  let weights = shards.concat();
  if weights.len() != expected {
    return Err(ModelError::Format(format!(
      "权重大小不匹配: 清单声明 {} 字节, 实际 {} 字节",
      expected,
      weights.len()
    )));
  }
  debug!("图模型权重 {} 字节", weights.len());
  Ok(GraphModel {
    descriptor,
    weights,
  })
}

fn looks_like_json(bytes: &[u8]) -> bool {
  bytes
    .iter()
    .find(|b| !b.is_ascii_whitespace())
    .is_some_and(|b| *b == b'{')
}

// protobuf 编码的 ModelProto 以字段 1 (ir_version, varint) 开头
fn looks_like_session(bytes: &[u8]) -> bool {
  bytes.len() > 1 && bytes[0] == 0x08
}

/// 根据文件内容判断模型格式
///
/// 依次识别：压缩包、图模型描述（分片从 `base_dir` 读取）、会话模型。
pub fn read_payload(
  name: &str,
  bytes: Vec<u8>,
  base_dir: Option<&Path>,
) -> Result<ModelPayload, ModelError> {
  if archive::is_zip(&bytes) {
    debug!("{} 是压缩包", name);
    return archive::locate_payload(&bytes)?.ok_or_else(|| {
      ModelError::Format(format!("{}: 压缩包中没有 model.json 或 .onnx 文件", name))
    });
  }

  if looks_like_json(&bytes) {
    let descriptor = GraphDescriptor::from_slice(&bytes)?;
    let dir = base_dir.unwrap_or_else(|| Path::new("."));
    let shards = descriptor
      .shard_paths()
      .map(|path| {
        debug!("读取权重分片: {}", path);
        std::fs::read(dir.join(path))
      })
      .collect::<Result<Vec<_>, _>>()?;
    return graph_model(descriptor, shards).map(ModelPayload::Graph);
  }

  if archive::is_session_name(name) || looks_like_session(&bytes) {
    return Ok(ModelPayload::Session(SessionModel {
      name: name.to_string(),
      bytes,
    }));
  }

  Err(ModelError::Format(format!(
    "{}: 既不是压缩包，也不是图模型描述或会话模型",
    name
  )))
}

/// 根据模型内容创建推理后端
pub trait BackendFactory: Send + Sync {
  fn graph(&self, model: &GraphModel) -> Result<Box<dyn Backend>, ModelError>;

  fn session(
    &self,
    model: &SessionModel,
    bindings: &SessionBindings,
  ) -> Result<Box<dyn Backend>, ModelError>;
}

/// 编译时启用的后端：会话模型在 `onnx` 特性下交给 ONNX Runtime，
/// 图模型没有内置后端
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBackends;

impl BackendFactory for DefaultBackends {
  fn graph(&self, model: &GraphModel) -> Result<Box<dyn Backend>, ModelError> {
    warn!(
      "图模型 ({} 字节权重) 没有内置推理后端",
      model.weights.len()
    );
    Err(ModelError::BackendUnavailable(ModelKind::Graph))
  }

  #[cfg(feature = "onnx")]
  fn session(
    &self,
    model: &SessionModel,
    bindings: &SessionBindings,
  ) -> Result<Box<dyn Backend>, ModelError> {
    let backend = crate::model::OrtBackend::from_memory(&model.bytes, &bindings.input)?;
    Ok(Box::new(backend))
  }

  #[cfg(not(feature = "onnx"))]
  fn session(
    &self,
    model: &SessionModel,
    _bindings: &SessionBindings,
  ) -> Result<Box<dyn Backend>, ModelError> {
    warn!("未启用 onnx 特性，无法运行会话模型 {}", model.name);
    Err(ModelError::BackendUnavailable(ModelKind::Session))
  }
}

/// 读取模型文件并构建 [`ModelHandle`]
#[derive(Clone)]
pub struct ModelLoader {
  factory: Arc<dyn BackendFactory>,
  bindings: SessionBindings,
}

impl Default for ModelLoader {
  fn default() -> Self {
    Self::new(DefaultBackends)
  }
}

impl ModelLoader {
  pub fn new(factory: impl BackendFactory + 'static) -> Self {
    Self {
      factory: Arc::new(factory),
      bindings: SessionBindings::default(),
    }
  }

  pub fn bindings(mut self, bindings: SessionBindings) -> Self {
    self.bindings = bindings;
    self
  }

  pub fn read(&self, reference: &ModelReference) -> Result<ModelPayload, ModelError> {
    info!("加载模型文件: {}", reference);
    let bytes = std::fs::read(reference.path())?;
    debug!(
      "模型文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );
    read_payload(&reference.file_name(), bytes, reference.path().parent())
  }

  pub fn load(&self, reference: &ModelReference) -> Result<ModelHandle, ModelError> {
    let payload = self.read(reference)?;
    let handle = self.build(reference.to_string(), payload)?;
    info!(
      "模型加载完成: {} ({}, 输入 {}x{})",
      handle.reference(),
      handle.kind(),
      handle.input_shape().width,
      handle.input_shape().height
    );
    Ok(handle)
  }

  pub fn build(&self, reference: String, payload: ModelPayload) -> Result<ModelHandle, ModelError> {
    match payload {
      ModelPayload::Graph(model) => {
        let backend = self.factory.graph(&model)?;
        let shape = model.descriptor.input_shape().unwrap_or_default();
        let outputs = model.descriptor.outputs();
        Ok(ModelHandle::graph_with_signature(
          reference, shape, outputs, backend,
        ))
      }
      ModelPayload::Session(model) => {
        let backend = self.factory.session(&model, &self.bindings)?;
        Ok(ModelHandle::session(reference, self.bindings.clone(), backend))
      }
    }
  }
}
