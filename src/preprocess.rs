// 该文件是 Huishou （回收计数） 项目的一部分。
// src/preprocess.rs - 图像预处理
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

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::debug;

use crate::frame::{RGB_CHANNELS, RawFrame, TargetShape, Tensor};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("无效帧: 尺寸为 {width}x{height}")]
  InvalidFrame { width: u32, height: u32 },
  #[error("无效目标尺寸: {width}x{height}")]
  InvalidTarget { width: u32, height: u32 },
}

/// 将原始帧转换为模型输入张量
///
/// 双线性缩放到目标尺寸（直接拉伸，不保持宽高比），像素值从 [0, 255] 映射到 [0, 1]，
/// 再按通道优先排列并补上批次维度，输出形状总是 `[1, 3, H, W]`。
pub fn preprocess(frame: &RawFrame, target: TargetShape) -> Result<Tensor, PreprocessError> {
  let (source_width, source_height) = (frame.width(), frame.height());
  if source_width == 0 || source_height == 0 {
    return Err(PreprocessError::InvalidFrame {
      width: source_width,
      height: source_height,
    });
  }
  if target.width == 0 || target.height == 0 {
    return Err(PreprocessError::InvalidTarget {
      width: target.width,
      height: target.height,
    });
  }

  debug!(
    "预处理: {}x{} -> {}x{}",
    source_width, source_height, target.width, target.height
  );

  // FilterType::Triangle 即双线性插值
  let resized = imageops::resize(
    frame.image(),
    target.width,
    target.height,
    FilterType::Triangle,
  );

  let width = target.width as usize;
  let plane = width * target.height as usize;
  let mut data = vec![0f32; RGB_CHANNELS * plane];
  for (x, y, pixel) in resized.enumerate_pixels() {
    let offset = y as usize * width + x as usize;
    for c in 0..RGB_CHANNELS {
      data[c * plane + offset] = f32::from(pixel[c]) / 255.0;
    }
  }

  Tensor::from_nchw(target, data, source_width, source_height).ok_or(
    PreprocessError::InvalidTarget {
      width: target.width,
      height: target.height,
    },
  )
}
