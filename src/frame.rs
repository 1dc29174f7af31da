// 该文件是 Huishou （回收计数） 项目的一部分。
// src/frame.rs - 原始帧与 NCHW 张量定义
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

use image::RgbImage;

pub const RGB_CHANNELS: usize = 3;

/// 摄像头或文件提供的原始 RGB 帧，分辨率任意
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
  image: RgbImage,
}

impl From<RgbImage> for RawFrame {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl RawFrame {
  /// 由 NHWC 排列的 RGB 字节构造，长度不匹配时返回 `None`
  pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
    RgbImage::from_raw(width, height, data).map(Self::from)
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }
}

/// 模型期望的输入尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetShape {
  pub width: u32,
  pub height: u32,
}

impl TargetShape {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub const fn square(size: u32) -> Self {
    Self::new(size, size)
  }
}

impl Default for TargetShape {
  fn default() -> Self {
    Self::square(640)
  }
}

/// 形状固定为 `[1, 3, H, W]` 的浮点张量，取值范围 [0, 1]
///
/// 同时记录来源帧的尺寸，推理适配器据此把检测框映射回帧像素坐标。
#[derive(Debug, Clone)]
pub struct Tensor {
  data: Box<[f32]>,
  width: usize,
  height: usize,
  source_width: u32,
  source_height: u32,
}

impl Tensor {
  /// 数据长度必须等于 `3 * H * W`
  pub fn from_nchw(
    shape: TargetShape,
    data: Vec<f32>,
    source_width: u32,
    source_height: u32,
  ) -> Option<Self> {
    let (width, height) = (shape.width as usize, shape.height as usize);
    if data.len() != RGB_CHANNELS * width * height {
      return None;
    }
    Some(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      source_width,
      source_height,
    })
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height, self.width]
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn source_size(&self) -> (u32, u32) {
    (self.source_width, self.source_height)
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tensor_rejects_wrong_length() {
    let shape = TargetShape::new(4, 2);
    assert!(Tensor::from_nchw(shape, vec![0.0; 23], 4, 2).is_none());
    let tensor = Tensor::from_nchw(shape, vec![0.0; 24], 8, 4).unwrap();
    assert_eq!(tensor.shape(), [1, 3, 2, 4]);
    assert_eq!(tensor.source_size(), (8, 4));
  }

  #[test]
  fn raw_frame_checks_buffer_size() {
    assert!(RawFrame::from_rgb(2, 2, vec![0; 11]).is_none());
    let frame = RawFrame::from_rgb(2, 2, vec![0; 12]).unwrap();
    assert_eq!((frame.width(), frame.height()), (2, 2));
  }
}
