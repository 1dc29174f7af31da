// 该文件是 Huishou （回收计数） 项目的一部分。
// src/input.rs - 帧来源
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

use thiserror::Error;

use crate::{FromUrl, frame::RawFrame};

mod channel_input;
pub use self::channel_input::ChannelInput;

mod read_image_file;
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameSourceError {
  /// 暂时没有新帧，稍后重试
  #[error("暂无可用帧")]
  NoFrameAvailable,
  #[error("输入已结束")]
  EndOfStream,
  #[error("输入设备错误: {0}")]
  Device(String),
}

/// 按需提供原始帧的输入源
pub trait FrameSource {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError>;

  /// 释放底层资源，之后不再产生新帧
  fn release(&mut self);
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError> {
    (**self).acquire_frame()
  }

  fn release(&mut self) {
    (**self).release()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L 输入错误: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("不支持的 URI 方案: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  Channel(ChannelInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    if url.scheme() == ImageFileInput::SCHEME {
      let input = ImageFileInput::from_url(url)?;
      return Ok(InputWrapper::ReadImageFile(input));
    }
    #[cfg(feature = "v4l_input")]
    {
      if url.scheme() == V4lInput::SCHEME {
        let input = V4lInput::from_url(url)?;
        return Ok(InputWrapper::V4l(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl From<ChannelInput> for InputWrapper {
  fn from(input: ChannelInput) -> Self {
    InputWrapper::Channel(input)
  }
}

impl FrameSource for InputWrapper {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError> {
    match self {
      InputWrapper::ReadImageFile(input) => input.acquire_frame(),
      InputWrapper::Channel(input) => input.acquire_frame(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.acquire_frame(),
    }
  }

  fn release(&mut self) {
    match self {
      InputWrapper::ReadImageFile(input) => input.release(),
      InputWrapper::Channel(input) => input.release(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.release(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(scheme)) if scheme == "rtsp"
    ));
  }

  #[test]
  fn image_url_builds_file_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    image::RgbImage::new(4, 2).save(&path).unwrap();

    let url = url::Url::from_file_path(&path).unwrap();
    let url = url::Url::parse(&format!("image://{}", url.path())).unwrap();
    let mut input = InputWrapper::from_url(&url).unwrap();

    assert_eq!(input.acquire_frame().unwrap().width(), 4);
    assert_eq!(input.acquire_frame(), Err(FrameSourceError::EndOfStream));
  }
}
