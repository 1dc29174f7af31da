// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/graph.rs - 图模型描述文件
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

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::frame::TargetShape;

/// 图模型描述文件的固定文件名
pub const GRAPH_DESCRIPTOR_NAME: &str = "model.json";

/// 图模型描述：网络拓扑、权重清单与可选的输入输出签名
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDescriptor {
  #[serde(default)]
  pub format: Option<String>,
  pub model_topology: serde_json::Value,
  pub weights_manifest: Vec<WeightGroup>,
  #[serde(default)]
  pub signature: Option<Signature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightGroup {
  pub paths: Vec<String>,
  pub weights: Vec<WeightSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightSpec {
  pub name: String,
  pub shape: Vec<usize>,
  pub dtype: String,
  #[serde(default)]
  pub quantization: Option<Quantization>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Quantization {
  pub dtype: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Signature {
  #[serde(default)]
  pub inputs: BTreeMap<String, TensorInfo>,
  #[serde(default)]
  pub outputs: BTreeMap<String, TensorInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorInfo {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub tensor_shape: Option<TensorShape>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TensorShape {
  #[serde(default)]
  pub dim: Vec<Dim>,
}

/// 维度大小在描述文件中可能是数字，也可能是字符串
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dim {
  #[serde(default)]
  pub size: Option<serde_json::Value>,
}

impl Dim {
  fn value(&self) -> Option<i64> {
    match self.size.as_ref()? {
      serde_json::Value::Number(n) => n.as_i64(),
      serde_json::Value::String(s) => s.parse().ok(),
      _ => None,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeightSizeError {
  #[error("权重 {name} 的类型 {dtype} 不受支持")]
  UnsupportedDtype { name: String, dtype: String },
  #[error("权重 {0} 的大小超出范围")]
  Overflow(String),
}

/// 签名中的一个输出：签名键描述用途，张量名对应推理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutput {
  pub key: String,
  pub name: String,
}

fn dtype_size(dtype: &str) -> Option<usize> {
  match dtype {
    "float32" | "int32" => Some(4),
    "float16" | "uint16" | "int16" => Some(2),
    "uint8" | "int8" | "bool" => Some(1),
    "complex64" => Some(8),
    _ => None,
  }
}

impl WeightSpec {
  /// 该权重在二进制文件中占用的字节数，量化权重按量化后的类型计算
  pub fn byte_size(&self) -> Result<usize, WeightSizeError> {
    let dtype = self
      .quantization
      .as_ref()
      .map(|q| q.dtype.as_str())
      .unwrap_or(self.dtype.as_str());
    let size = dtype_size(dtype).ok_or_else(|| WeightSizeError::UnsupportedDtype {
      name: self.name.clone(),
      dtype: dtype.to_string(),
    })?;
    // 形状来自外部文件，任何一步溢出都视为格式错误
    self
      .shape
      .iter()
      .try_fold(size, |acc, dim| acc.checked_mul(*dim))
      .ok_or_else(|| WeightSizeError::Overflow(self.name.clone()))
  }
}

impl GraphDescriptor {
  pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }

  /// 清单声明的权重总字节数
  pub fn expected_weight_bytes(&self) -> Result<usize, WeightSizeError> {
    let mut total = 0usize;
    for spec in self.weights_manifest.iter().flat_map(|g| &g.weights) {
      total = total
        .checked_add(spec.byte_size()?)
        .ok_or_else(|| WeightSizeError::Overflow(spec.name.clone()))?;
    }
    Ok(total)
  }

  /// 按清单顺序列出所有分片路径
  pub fn shard_paths(&self) -> impl Iterator<Item = &str> {
    self
      .weights_manifest
      .iter()
      .flat_map(|g| g.paths.iter().map(String::as_str))
  }

  /// 从签名推断输入尺寸，支持 NHWC 与 NCHW
  pub fn input_shape(&self) -> Option<TargetShape> {
    let info = self.signature.as_ref()?.inputs.values().next()?;
    let dims: Vec<i64> = info
      .tensor_shape
      .as_ref()?
      .dim
      .iter()
      .map(|d| d.value().unwrap_or(-1))
      .collect();
    let (height, width) = match dims.as_slice() {
      [_, 3, h, w] => (*h, *w),
      [_, h, w, 3] => (*h, *w),
      _ => return None,
    };
    if height > 0 && width > 0 {
      Some(TargetShape::new(width as u32, height as u32))
    } else {
      None
    }
  }

  /// 签名声明的输出，缺少张量名时以签名键代替
  pub fn outputs(&self) -> Vec<SignatureOutput> {
    self
      .signature
      .as_ref()
      .map(|s| {
        s.outputs
          .iter()
          .map(|(key, info)| SignatureOutput {
            key: key.clone(),
            name: info.name.clone().unwrap_or_else(|| key.clone()),
          })
          .collect()
      })
      .unwrap_or_default()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) const DESCRIPTOR: &str = r#"{
    "format": "graph-model",
    "generatedBy": "2.15.0",
    "modelTopology": {"node": []},
    "weightsManifest": [
      {
        "paths": ["group1-shard1of2.bin", "group1-shard2of2.bin"],
        "weights": [
          {"name": "conv/kernel", "shape": [3, 3, 3, 2], "dtype": "float32"},
          {"name": "conv/bias", "shape": [2], "dtype": "float32",
           "quantization": {"dtype": "uint8", "min": 0.0, "scale": 0.1}}
        ]
      }
    ],
    "signature": {
      "inputs": {"images:0": {"name": "images:0", "dtype": "DT_FLOAT",
        "tensorShape": {"dim": [{"size": "-1"}, {"size": "320"}, {"size": "320"}, {"size": "3"}]}}},
      "outputs": {"Identity:0": {"name": "Identity:0"}}
    }
  }"#;

  #[test]
  fn descriptor_reports_weights_and_shape() {
    let descriptor = GraphDescriptor::from_slice(DESCRIPTOR.as_bytes()).unwrap();

    assert_eq!(descriptor.expected_weight_bytes(), Ok(3 * 3 * 3 * 2 * 4 + 2));
    assert_eq!(
      descriptor.shard_paths().collect::<Vec<_>>(),
      vec!["group1-shard1of2.bin", "group1-shard2of2.bin"]
    );
    assert_eq!(descriptor.input_shape(), Some(TargetShape::square(320)));
    assert_eq!(
      descriptor.outputs(),
      vec![SignatureOutput {
        key: "Identity:0".to_string(),
        name: "Identity:0".to_string(),
      }]
    );
  }

  #[test]
  fn unknown_dtype_is_reported() {
    let json = r#"{"modelTopology": {}, "weightsManifest": [
      {"paths": ["a.bin"], "weights": [{"name": "w", "shape": [1], "dtype": "string"}]}]}"#;
    let descriptor = GraphDescriptor::from_slice(json.as_bytes()).unwrap();
    assert_eq!(
      descriptor.expected_weight_bytes(),
      Err(WeightSizeError::UnsupportedDtype {
        name: "w".to_string(),
        dtype: "string".to_string(),
      })
    );
    assert_eq!(descriptor.input_shape(), None);
  }

  #[test]
  fn oversized_shapes_are_rejected() {
    let json = r#"{"modelTopology": {}, "weightsManifest": [
      {"paths": [], "weights": [
        {"name": "huge", "shape": [4294967296, 4294967296, 16], "dtype": "float32"}]}]}"#;
    let descriptor = GraphDescriptor::from_slice(json.as_bytes()).unwrap();
    assert_eq!(
      descriptor.expected_weight_bytes(),
      Err(WeightSizeError::Overflow("huge".to_string()))
    );
  }

  #[test]
  fn total_size_overflow_is_rejected() {
    let half = usize::MAX / 2 + 1;
    let json = format!(
      r#"{{"modelTopology": {{}}, "weightsManifest": [
        {{"paths": [], "weights": [
          {{"name": "a", "shape": [{half}], "dtype": "uint8"}},
          {{"name": "b", "shape": [{half}], "dtype": "uint8"}}]}}]}}"#
    );
    let descriptor = GraphDescriptor::from_slice(json.as_bytes()).unwrap();
    assert_eq!(
      descriptor.expected_weight_bytes(),
      Err(WeightSizeError::Overflow("b".to_string()))
    );
  }
}
