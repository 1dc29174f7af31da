// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 会话后端
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

use std::sync::Mutex;

use ort::{session::Session, value::Tensor as OrtTensor, value::ValueType};
use tracing::{debug, info};

use crate::{
  frame::{TargetShape, Tensor},
  model::{Backend, BackendError, OutputTensor},
};

fn runtime(err: ort::Error) -> BackendError {
  BackendError::Runtime(err.to_string())
}

/// 基于 ONNX Runtime 的会话模型后端
///
/// `Session::run` 需要可变借用，因此会话放在互斥锁里。
pub struct OrtBackend {
  session: Mutex<Session>,
  input_name: String,
  output_names: Vec<String>,
  input_shape: Option<TargetShape>,
}

impl OrtBackend {
  pub fn from_memory(bytes: &[u8], input_name: &str) -> Result<Self, BackendError> {
    info!("创建 ONNX Runtime 会话");
    let session = Session::builder()
      .map_err(runtime)?
      .commit_from_memory(bytes)
      .map_err(runtime)?;

    let input = session
      .inputs
      .iter()
      .find(|input| input.name == input_name)
      .ok_or_else(|| BackendError::Shape(format!("模型没有名为 {} 的输入", input_name)))?;

    let input_shape = match &input.input_type {
      ValueType::Tensor { shape, .. } => match shape.iter().copied().collect::<Vec<i64>>()[..] {
        [_, 3, h, w] if h > 0 && w > 0 => Some(TargetShape::new(w as u32, h as u32)),
        _ => None,
      },
      _ => None,
    };
    let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    debug!("模型输入 {:?}, 输出 {:?}", input_shape, output_names);

    Ok(Self {
      session: Mutex::new(session),
      input_name: input_name.to_string(),
      output_names,
      input_shape,
    })
  }
}

impl Backend for OrtBackend {
  fn run(&self, input: &Tensor) -> Result<Vec<OutputTensor>, BackendError> {
    let [n, c, h, w] = input.shape();
    let value = OrtTensor::from_array(([n, c, h, w], input.as_nchw().to_vec())).map_err(runtime)?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| BackendError::Runtime("会话锁已损坏".to_string()))?;
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => value])
      .map_err(runtime)?;

    let mut tensors = Vec::with_capacity(self.output_names.len());
    for name in &self.output_names {
      let (shape, data) = outputs[name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(runtime)?;
      let shape = shape.iter().map(|d| (*d).max(0) as usize).collect();
      tensors.push(OutputTensor::new(name.clone(), shape, data.to_vec()));
    }
    Ok(tensors)
  }

  fn input_shape(&self) -> Option<TargetShape> {
    self.input_shape
  }
}
