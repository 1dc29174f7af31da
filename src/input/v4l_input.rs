// 该文件是 Huishou （回收计数） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use std::{io, pin::Pin, sync::Arc};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;
use v4l::{
  FourCC,
  buffer::Type,
  device::Handle,
  io::{mmap::Stream, traits::CaptureStream},
  prelude::*,
  video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RawFrame,
  input::{FrameSource, FrameSourceError},
};

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;
const POLLIN: i16 = 0x0001;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Rgb3,
  Yuyv,
  Mjpg,
}

impl PixelFormat {
  fn from_fourcc(fourcc: FourCC) -> Option<Self> {
    match &fourcc.repr {
      b"RGB3" => Some(PixelFormat::Rgb3),
      b"YUYV" => Some(PixelFormat::Yuyv),
      b"MJPG" => Some(PixelFormat::Mjpg),
      _ => None,
    }
  }
}

fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);
  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }
  rgb
}

/// 取出所有已就绪的缓冲区，返回最后一个及丢弃的数量
///
/// `dequeue` 返回 `None` 表示当前没有就绪的缓冲区。
fn drain_ready(
  mut dequeue: impl FnMut() -> io::Result<Option<Vec<u8>>>,
  limit: u32,
) -> io::Result<Option<(Vec<u8>, usize)>> {
  let mut latest = None;
  let mut dropped = 0;
  for _ in 0..limit {
    let Some(buffer) = dequeue()? else {
      break;
    };
    if latest.replace(buffer).is_some() {
      dropped += 1;
    }
  }
  Ok(latest.map(|buffer| (buffer, dropped)))
}

/// V4L2 摄像头输入，URL 形如 `v4l:///dev/video0`
///
/// 驱动按到达顺序排队已填充的缓冲区。取帧时不阻塞，把已就绪的缓冲区全部取出，
/// 只解码最新的一帧，较早的帧直接丢弃；没有就绪的帧时返回 `NoFrameAvailable`。
pub struct V4lInput {
  // stream 借用 device，必须先于 device 释放
  stream: Option<Stream<'static>>,
  handle: Option<Arc<Handle>>,
  device: Option<Pin<Box<Device>>>,
  format: PixelFormat,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemeMismatch);
    }

    let device_path = if url.path().is_empty() || url.path() == "/" {
      DEFAULT_DEVICE
    } else {
      url.path()
    };
    Self::open(device_path)
  }
}

impl V4lInput {
  pub fn open(device_path: &str) -> Result<Self, V4lInputError> {
    info!("打开摄像头: {}", device_path);
    let device = Box::pin(Device::with_path(device_path)?);

    let mut format = device.format()?;
    format.width = DEFAULT_WIDTH;
    format.height = DEFAULT_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    let pixel_format = PixelFormat::from_fourcc(format.fourcc)
      .ok_or_else(|| V4lInputError::UnsupportedPixelFormat(format.fourcc.to_string()))?;
    debug!(
      "摄像头格式: {}x{} {}",
      format.width, format.height, format.fourcc
    );

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；
    // stream 总是在 device 之前被丢弃（见 release 与 Drop）
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(&*device);
      Stream::with_buffers(device_static, Type::VideoCapture, BUFFER_COUNT)?
    };

    Ok(Self {
      stream: Some(stream),
      handle: Some(device.handle()),
      device: Some(device),
      format: pixel_format,
      width: format.width,
      height: format.height,
    })
  }

  fn decode(&self, buffer: &[u8]) -> Result<RgbImage, FrameSourceError> {
    let image = match self.format {
      PixelFormat::Rgb3 => RgbImage::from_raw(self.width, self.height, buffer.to_vec()),
      PixelFormat::Yuyv => RgbImage::from_raw(
        self.width,
        self.height,
        yuyv_to_rgb(buffer, self.width, self.height),
      ),
      PixelFormat::Mjpg => image::load_from_memory(buffer)
        .map(|image| image.into_rgb8())
        .ok(),
    };
    image.ok_or_else(|| {
      FrameSourceError::Device(format!("无法解码 {:?} 帧 ({} 字节)", self.format, buffer.len()))
    })
  }
}

impl FrameSource for V4lInput {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError> {
    let (Some(stream), Some(handle)) = (self.stream.as_mut(), self.handle.as_ref()) else {
      return Err(FrameSourceError::EndOfStream);
    };
    let drained = drain_ready(
      || {
        // 未开始采集时 poll 报告 POLLERR，由 next 启动采集并等待第一帧
        if handle.poll(POLLIN, 0)? == 0 {
          return Ok(None);
        }
        stream.next().map(|(buffer, _meta)| Some(buffer.to_vec()))
      },
      BUFFER_COUNT,
    );
    let buffer = match drained {
      Ok(Some((buffer, dropped))) => {
        if dropped > 0 {
          debug!("丢弃 {} 个较早的帧", dropped);
        }
        buffer
      }
      Ok(None) => return Err(FrameSourceError::NoFrameAvailable),
      Err(e) => {
        error!("无法捕获帧: {}", e);
        return Err(FrameSourceError::Device(e.to_string()));
      }
    };
    self.decode(&buffer).map(RawFrame::from)
  }

  fn release(&mut self) {
    self.stream.take();
    self.handle.take();
    if self.device.take().is_some() {
      info!("关闭摄像头");
    }
  }
}

impl Drop for V4lInput {
  fn drop(&mut self) {
    self.stream.take();
  }
}
