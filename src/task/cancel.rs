// 该文件是 Huishou （回收计数） 项目的一部分。
// src/task/cancel.rs - 取消令牌
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

use std::{
  sync::{Arc, Condvar, Mutex, PoisonError},
  time::Duration,
};

/// 可跨线程共享的取消令牌，一旦取消不可恢复
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
  inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    let (cancelled, changed) = &*self.inner;
    *cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
    changed.notify_all();
  }

  pub fn is_cancelled(&self) -> bool {
    *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 最多等待 `timeout`，期间被取消则提前返回；返回值表示是否已取消
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let (cancelled, changed) = &*self.inner;
    let guard = cancelled.lock().unwrap_or_else(PoisonError::into_inner);
    let (guard, _) = changed
      .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
      .unwrap_or_else(PoisonError::into_inner);
    *guard
  }
}
