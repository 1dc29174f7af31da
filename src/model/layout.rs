// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/layout.rs - 模型输出布局归一化
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

use tracing::{debug, error};

use crate::model::{
  BoundingBox, InferenceError, OutputTensor, RawDetection, RawOutput, SignatureOutput,
};

const BOX_ATTRS: usize = 4;

/// 模型输出张量的排布方式
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLayout {
  /// 单个检测头张量，`[1, 4+C, N]` 或 `[1, N, 4+C]`，
  /// 每个候选为 `cx, cy, w, h`（模型输入像素）加 C 个类别分数
  DetectionHead { output: String },
  /// 分离的框/分数/类别张量，框为归一化的 `ymin, xmin, ymax, xmax`
  BoxScoreClass {
    boxes: String,
    scores: String,
    classes: String,
  },
}

/// 模型输入尺寸与来源帧尺寸，用于把框映射回帧像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
  pub input_width: f32,
  pub input_height: f32,
  pub frame_width: f32,
  pub frame_height: f32,
}

impl Geometry {
  fn scale_x(&self) -> f32 {
    self.frame_width / self.input_width
  }

  fn scale_y(&self) -> f32 {
    self.frame_height / self.input_height
  }
}

/// 去掉前导的单位维度（批次维），保留至少两维
fn squeeze(shape: &[usize]) -> &[usize] {
  let mut dims = shape;
  while dims.len() > 2 && dims[0] == 1 {
    dims = &dims[1..];
  }
  dims
}

fn element_count(shape: &[usize]) -> usize {
  shape.iter().product()
}

pub(crate) fn decode_head(
  tensor: &OutputTensor,
  geometry: &Geometry,
) -> Result<RawOutput, InferenceError> {
  let dims = squeeze(&tensor.shape);
  if dims.len() != 2 {
    error!("检测头 {} 形状无效: {:?}", tensor.name, tensor.shape);
    return Err(InferenceError::Shape(format!(
      "检测头 {} 需要二维或三维张量, 实际形状 {:?}",
      tensor.name, tensor.shape
    )));
  }
  if tensor.data.len() != element_count(dims) {
    return Err(InferenceError::Shape(format!(
      "检测头 {} 数据长度 {} 与形状 {:?} 不符",
      tensor.name,
      tensor.data.len(),
      tensor.shape
    )));
  }

  // 属性数量总是远小于候选数量，据此判断是否需要转置
  let channel_first = dims[0] < dims[1];
  let (attrs, count) = if channel_first {
    (dims[0], dims[1])
  } else {
    (dims[1], dims[0])
  };
  if attrs <= BOX_ATTRS {
    return Err(InferenceError::Shape(format!(
      "检测头 {} 每个候选只有 {} 个属性",
      tensor.name, attrs
    )));
  }
  debug!(
    "检测头 {}: {} 个候选, {} 个类别, 转置: {}",
    tensor.name,
    count,
    attrs - BOX_ATTRS,
    channel_first
  );

  let data = &tensor.data;
  let at = |candidate: usize, attr: usize| {
    if channel_first {
      data[attr * count + candidate]
    } else {
      data[candidate * attrs + attr]
    }
  };

  let (sx, sy) = (geometry.scale_x(), geometry.scale_y());
  let mut output = RawOutput::with_capacity(count);
  for i in 0..count {
    let mut class_index = 0usize;
    let mut confidence = f32::MIN;
    for c in 0..attrs - BOX_ATTRS {
      let score = at(i, BOX_ATTRS + c);
      if score > confidence {
        confidence = score;
        class_index = c;
      }
    }

    let bbox = BoundingBox::from_center(at(i, 0), at(i, 1), at(i, 2), at(i, 3)).scale(sx, sy);
    output.push(RawDetection {
      class_index,
      confidence,
      bbox,
    });
  }
  Ok(output)
}

pub(crate) fn decode_triple(
  boxes: &OutputTensor,
  scores: &OutputTensor,
  classes: &OutputTensor,
  geometry: &Geometry,
) -> Result<RawOutput, InferenceError> {
  let count = scores.data.len();
  if boxes.data.len() != count * BOX_ATTRS || classes.data.len() != count {
    error!(
      "输出长度不一致: 框 {}, 分数 {}, 类别 {}",
      boxes.data.len(),
      scores.data.len(),
      classes.data.len()
    );
    return Err(InferenceError::Shape(format!(
      "框/分数/类别长度不一致: {} / {} / {}",
      boxes.data.len(),
      count,
      classes.data.len()
    )));
  }

  let mut output = RawOutput::with_capacity(count);
  for i in 0..count {
    let b = &boxes.data[i * BOX_ATTRS..(i + 1) * BOX_ATTRS];
    let bbox = BoundingBox::from_corners(
      b[1] * geometry.frame_width,
      b[0] * geometry.frame_height,
      b[3] * geometry.frame_width,
      b[2] * geometry.frame_height,
    );
    let class = classes.data[i];
    // 非法类别值交给后处理按未知类别丢弃
    let class_index = if class.is_finite() && class >= 0.0 {
      class.round() as usize
    } else {
      usize::MAX
    };
    output.push(RawDetection {
      class_index,
      confidence: scores.data[i],
      bbox,
    });
  }
  Ok(output)
}

fn find<'a>(outputs: &'a [OutputTensor], name: &str) -> Result<&'a OutputTensor, InferenceError> {
  outputs
    .iter()
    .find(|o| o.name == name)
    .ok_or_else(|| InferenceError::MissingOutput(name.to_string()))
}

/// 会话模型：严格按绑定名取输出
pub(crate) fn normalize_session(
  outputs: &[OutputTensor],
  layout: &OutputLayout,
  geometry: &Geometry,
) -> Result<RawOutput, InferenceError> {
  match layout {
    OutputLayout::DetectionHead { output } => decode_head(find(outputs, output)?, geometry),
    OutputLayout::BoxScoreClass {
      boxes,
      scores,
      classes,
    } => decode_triple(
      find(outputs, boxes)?,
      find(outputs, scores)?,
      find(outputs, classes)?,
      geometry,
    ),
  }
}

fn by_hint<'a>(outputs: &'a [OutputTensor], hint: &str) -> Option<&'a OutputTensor> {
  outputs
    .iter()
    .find(|o| o.name.to_ascii_lowercase().contains(hint))
}

// 张量名可能带或不带 `:0` 后缀
fn base_tensor_name(name: &str) -> &str {
  name.strip_suffix(":0").unwrap_or(name)
}

fn named<'a>(outputs: &'a [OutputTensor], name: &str) -> Option<&'a OutputTensor> {
  let name = base_tensor_name(name);
  outputs.iter().find(|o| base_tensor_name(&o.name) == name)
}

// 签名键说明用途，签名中的张量名定位实际输出
fn by_signature<'a>(
  outputs: &'a [OutputTensor],
  signature: &[SignatureOutput],
  hint: &str,
) -> Option<&'a OutputTensor> {
  let entry = signature
    .iter()
    .find(|s| s.key.to_ascii_lowercase().contains(hint))?;
  named(outputs, &entry.name)
}

fn resolve_by_signature(
  outputs: &[OutputTensor],
  signature: &[SignatureOutput],
  geometry: &Geometry,
) -> Option<Result<RawOutput, InferenceError>> {
  if let (Some(boxes), Some(scores), Some(classes)) = (
    by_signature(outputs, signature, "box"),
    by_signature(outputs, signature, "score"),
    by_signature(outputs, signature, "class"),
  ) {
    debug!(
      "按签名匹配图模型输出: 框 {}, 分数 {}, 类别 {}",
      boxes.name, scores.name, classes.name
    );
    return Some(decode_triple(boxes, scores, classes, geometry));
  }
  match signature {
    [head] => named(outputs, &head.name).map(|head| decode_head(head, geometry)),
    _ => None,
  }
}

/// 图模型：先按描述文件签名解析输出，签名缺失或对不上时按名称提示和形状推断
pub(crate) fn normalize_graph(
  outputs: Vec<OutputTensor>,
  signature: &[SignatureOutput],
  geometry: &Geometry,
) -> Result<RawOutput, InferenceError> {
  if let Some(result) = resolve_by_signature(&outputs, signature, geometry) {
    return result;
  }

  match outputs.len() {
    0 => Err(InferenceError::Shape("图模型没有输出".to_string())),
    1 => decode_head(&outputs[0], geometry),
    _ => {
      if let (Some(boxes), Some(scores), Some(classes)) = (
        by_hint(&outputs, "box"),
        by_hint(&outputs, "score"),
        by_hint(&outputs, "class"),
      ) {
        return decode_triple(boxes, scores, classes, geometry);
      }

      let boxes = outputs
        .iter()
        .position(|o| o.shape.last() == Some(&BOX_ATTRS) && squeeze(&o.shape).len() == 2);
      if let Some(boxes_idx) = boxes {
        let count = element_count(squeeze(&outputs[boxes_idx].shape)) / BOX_ATTRS;
        let rest: Vec<&OutputTensor> = outputs
          .iter()
          .enumerate()
          .filter(|(idx, o)| *idx != boxes_idx && o.data.len() == count)
          .map(|(_, o)| o)
          .collect();
        if rest.len() >= 2 {
          debug!("按位置匹配图模型输出: 框 {}", outputs[boxes_idx].name);
          return decode_triple(&outputs[boxes_idx], rest[0], rest[1], geometry);
        }
      }

      let head = outputs
        .iter()
        .find(|o| {
          let dims = squeeze(&o.shape);
          dims.len() == 2 && dims.iter().min() > Some(&BOX_ATTRS)
        });
      match head {
        Some(head) => decode_head(head, geometry),
        None => Err(InferenceError::Shape(format!(
          "无法识别的图模型输出: {:?}",
          outputs
            .iter()
            .map(|o| (o.name.as_str(), o.shape.clone()))
            .collect::<Vec<_>>()
        ))),
      }
    }
  }
}
