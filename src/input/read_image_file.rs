// 该文件是 Huishou （回收计数） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RawFrame,
  input::{FrameSource, FrameSourceError},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 从单个图像文件读取帧
///
/// 默认只产生一帧，随后报告输入结束；URL 带 `?repeat` 时每次都返回同一帧。
pub struct ImageFileInput {
  image: Option<RgbImage>,
  repeat: bool,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let repeat = url
      .query_pairs()
      .any(|(key, value)| key == "repeat" && value != "false");
    Ok(Self::open(url.path())?.repeat(repeat))
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    info!("读取图像文件: {}", path.display());
    let image = ImageReader::open(path)?.decode()?.into_rgb8();
    debug!("图像尺寸: {}x{}", image.width(), image.height());
    Ok(Self::from_image(image))
  }

  pub fn from_image(image: RgbImage) -> Self {
    Self {
      image: Some(image),
      repeat: false,
    }
  }

  pub fn repeat(mut self, repeat: bool) -> Self {
    self.repeat = repeat;
    self
  }
}

impl FrameSource for ImageFileInput {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError> {
    let image = if self.repeat {
      self.image.clone()
    } else {
      self.image.take()
    };
    image.map(RawFrame::from).ok_or(FrameSourceError::EndOfStream)
  }

  fn release(&mut self) {
    if self.image.take().is_some() {
      debug!("释放图像文件输入");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn repeat_yields_the_same_frame_until_released() {
    let mut input = ImageFileInput::from_image(RgbImage::new(3, 3)).repeat(true);
    assert_eq!(input.acquire_frame().unwrap().height(), 3);
    assert_eq!(input.acquire_frame().unwrap().height(), 3);

    input.release();
    assert_eq!(input.acquire_frame(), Err(FrameSourceError::EndOfStream));
  }

  #[test]
  fn query_enables_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.jpg");
    RgbImage::new(8, 6).save(&path).unwrap();

    let url = Url::parse(&format!("image://{}?repeat", path.display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert!(input.acquire_frame().is_ok());
    assert!(input.acquire_frame().is_ok());
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let url = Url::parse("image:///nonexistent/frame.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
