// 该文件是 Huishou （回收计数） 项目的一部分。
// src/model/adapter.rs - 推理适配器
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
  sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{TargetShape, Tensor},
  model::{BackendError, ModelError, ModelHandle, ModelLoader, ModelReference, RawOutput},
  task::CancellationToken,
};

/// 单次推理的默认超时
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(5);

// 等待推理结果时检查取消令牌的间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("没有加载模型")]
  ModelNotLoaded,
  #[error("推理后端错误: {0}")]
  Backend(#[from] BackendError),
  #[error("缺少输出张量: {0}")]
  MissingOutput(String),
  #[error("输出形状错误: {0}")]
  Shape(String),
  #[error("推理超时 ({0:?})")]
  Timeout(Duration),
  #[error("推理已取消")]
  Cancelled,
  #[error("推理线程异常退出")]
  WorkerLost,
  #[error("上一次推理尚未结束")]
  Busy,
}

// 推理线程结束（包括崩溃）时清除忙标志
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// 持有当前模型并在工作线程上执行推理
///
/// 模型句柄只会被整体替换，正在进行的推理持有旧句柄的 `Arc`，
/// 推理结束后旧模型才会释放。同一时刻最多只有一次推理在运行。
pub struct InferenceAdapter {
  loader: ModelLoader,
  current: RwLock<Option<Arc<ModelHandle>>>,
  timeout: Duration,
  busy: Arc<AtomicBool>,
}

impl Default for InferenceAdapter {
  fn default() -> Self {
    Self::new(ModelLoader::default())
  }
}

impl InferenceAdapter {
  pub fn new(loader: ModelLoader) -> Self {
    Self {
      loader,
      current: RwLock::new(None),
      timeout: DEFAULT_INFERENCE_TIMEOUT,
      busy: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn current(&self) -> Option<Arc<ModelHandle>> {
    self
      .current
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 当前模型的输入尺寸
  pub fn input_shape(&self) -> Option<TargetShape> {
    self.current().map(|handle| handle.input_shape())
  }

  fn replace(&self, handle: Option<Arc<ModelHandle>>) -> Option<Arc<ModelHandle>> {
    let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *current, handle)
  }

  /// 加载模型；与当前模型引用相同时直接复用
  ///
  /// 加载失败时保留原有模型。
  pub fn load_model(&self, reference: &ModelReference) -> Result<Arc<ModelHandle>, ModelError> {
    if let Some(handle) = self.current() {
      if handle.reference() == reference.to_string() {
        debug!("模型 {} 已加载，直接复用", reference);
        return Ok(handle);
      }
    }

    let handle = Arc::new(self.loader.load(reference)?);
    if let Some(previous) = self.replace(Some(handle.clone())) {
      info!("替换模型: {} -> {}", previous.reference(), handle.reference());
    }
    Ok(handle)
  }

  /// 直接绑定一个已构建的模型
  pub fn bind(&self, handle: ModelHandle) -> Arc<ModelHandle> {
    let handle = Arc::new(handle);
    self.replace(Some(handle.clone()));
    handle
  }

  pub fn unload(&self) {
    if let Some(previous) = self.replace(None) {
      info!("卸载模型: {}", previous.reference());
    }
  }

  /// 在工作线程上运行当前模型
  ///
  /// 等待期间定期检查取消令牌；超时或取消后结果被丢弃，工作线程自行结束。
  pub fn infer(
    &self,
    tensor: Tensor,
    cancel: Option<&CancellationToken>,
  ) -> Result<RawOutput, InferenceError> {
    let handle = self.current().ok_or(InferenceError::ModelNotLoaded)?;

    if self
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      warn!("上一次推理仍在运行");
      return Err(InferenceError::Busy);
    }
    let guard = BusyGuard(self.busy.clone());

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
      .name("huishou-infer".to_string())
      .spawn(move || {
        let guard = guard;
        let result = handle.infer(&tensor);
        // 先释放模型和忙标志再交付结果，调用方拿到结果时二者都已归还
        drop(handle);
        drop(guard);
        // 接收端可能因超时或取消已经放弃
        let _ = tx.send(result);
      })
      .map_err(|e| {
        warn!("无法创建推理线程: {}", e);
        InferenceError::WorkerLost
      })?;

    // 超时大到无法表示时不设截止时间
    let deadline = Instant::now().checked_add(self.timeout);
    loop {
      if cancel.is_some_and(CancellationToken::is_cancelled) {
        debug!("推理等待被取消");
        return Err(InferenceError::Cancelled);
      }
      let wait = match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            warn!("推理超过 {:?} 未返回", self.timeout);
            return Err(InferenceError::Timeout(self.timeout));
          }
          (deadline - now).min(CANCEL_POLL_INTERVAL)
        }
        None => CANCEL_POLL_INTERVAL,
      };
      match rx.recv_timeout(wait) {
        Ok(result) => return result,
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => return Err(InferenceError::WorkerLost),
      }
    }
  }
}
