// 该文件是 Huishou （回收计数） 项目的一部分。
// src/input/channel_input.rs - 进程内通道输入
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

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tracing::debug;

use crate::{
  frame::RawFrame,
  input::{FrameSource, FrameSourceError},
};

/// 由其他线程推送帧的输入源
///
/// 每次取帧时清空通道，只返回最新的一帧；发送端全部关闭后报告输入结束。
/// 释放后接收端被丢弃，发送端会收到发送错误。
pub struct ChannelInput {
  receiver: Option<Receiver<RawFrame>>,
}

impl ChannelInput {
  pub fn new() -> (Sender<RawFrame>, Self) {
    let (sender, receiver) = mpsc::channel();
    (
      sender,
      Self {
        receiver: Some(receiver),
      },
    )
  }
}

impl FrameSource for ChannelInput {
  fn acquire_frame(&mut self) -> Result<RawFrame, FrameSourceError> {
    let receiver = self
      .receiver
      .as_ref()
      .ok_or(FrameSourceError::EndOfStream)?;

    let mut latest = None;
    let mut dropped = 0usize;
    let mut disconnected = false;
    loop {
      match receiver.try_recv() {
        Ok(frame) => {
          if latest.replace(frame).is_some() {
            dropped += 1;
          }
        }
        Err(TryRecvError::Empty) => break,
        Err(TryRecvError::Disconnected) => {
          disconnected = true;
          break;
        }
      }
    }
    if dropped > 0 {
      debug!("丢弃 {} 个过期帧", dropped);
    }

    match latest {
      Some(frame) => Ok(frame),
      None if disconnected => Err(FrameSourceError::EndOfStream),
      None => Err(FrameSourceError::NoFrameAvailable),
    }
  }

  fn release(&mut self) {
    if self.receiver.take().is_some() {
      debug!("释放通道输入");
    }
  }
}
