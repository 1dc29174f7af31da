// 该文件是 Huishou （回收计数） 项目的一部分。
// src/store.rs - 参数与计数的存储
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
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, PoisonError, RwLock,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  counts::Counts,
  model::ModelReference,
  settings::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_UPDATE_INTERVAL_MS, Settings},
};

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("存储不可用: {0}")]
  Unavailable(String),
}

/// 提供当前的参数快照
pub trait SettingsStore: Send + Sync {
  fn current_settings(&self) -> Settings;
}

/// 计数的读取与保存
pub trait PersistenceStore: Send + Sync {
  fn load_counts(&self) -> Result<Counts, StoreError>;
  fn save_counts(&self, counts: &Counts) -> Result<(), StoreError>;
}

impl<T: SettingsStore + ?Sized> SettingsStore for &T {
  fn current_settings(&self) -> Settings {
    (**self).current_settings()
  }
}

impl<T: SettingsStore + ?Sized> SettingsStore for Arc<T> {
  fn current_settings(&self) -> Settings {
    (**self).current_settings()
  }
}

impl<T: PersistenceStore + ?Sized> PersistenceStore for &T {
  fn load_counts(&self) -> Result<Counts, StoreError> {
    (**self).load_counts()
  }

  fn save_counts(&self, counts: &Counts) -> Result<(), StoreError> {
    (**self).save_counts(counts)
  }
}

impl<T: PersistenceStore + ?Sized> PersistenceStore for Arc<T> {
  fn load_counts(&self) -> Result<Counts, StoreError> {
    (**self).load_counts()
  }

  fn save_counts(&self, counts: &Counts) -> Result<(), StoreError> {
    (**self).save_counts(counts)
  }
}

/// 固定不变的参数
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub Settings);

impl SettingsStore for StaticSettings {
  fn current_settings(&self) -> Settings {
    self.0.clone()
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
  #[serde(default)]
  detection_threshold: Option<Value>,
  #[serde(default)]
  update_interval: Option<Value>,
  #[serde(default)]
  model_file: Option<String>,
}

// 数值既可能以数字保存，也可能以字符串保存
fn number(key: &str, value: Option<&Value>) -> Option<f64> {
  let value = value?;
  let parsed = match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  };
  if parsed.is_none() {
    warn!("参数 {} 的值 {} 无法解析，使用默认值", key, value);
  }
  parsed
}

/// 以 JSON 文件保存的参数，每次取快照时重新读取
///
/// 文件格式：`{"detectionThreshold": 0.3, "updateInterval": 500, "modelFile": "model.onnx"}`，
/// 相对的模型路径以参数文件所在目录为基准。
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
  path: PathBuf,
}

impl JsonSettingsStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn read(&self) -> Result<SettingsFile, StoreError> {
    let bytes = std::fs::read(&self.path)?;
    Ok(serde_json::from_slice(&bytes)?)
  }
}

impl SettingsStore for JsonSettingsStore {
  fn current_settings(&self) -> Settings {
    let file = match self.read() {
      Ok(file) => file,
      Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("参数文件 {} 不存在，使用默认参数", self.path.display());
        SettingsFile::default()
      }
      Err(e) => {
        warn!("读取参数文件 {} 失败: {}", self.path.display(), e);
        SettingsFile::default()
      }
    };

    let threshold = number("detectionThreshold", file.detection_threshold.as_ref())
      .map(|v| v as f32)
      .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
    let interval = number("updateInterval", file.update_interval.as_ref())
      .map(|v| v.max(0.0) as u64)
      .unwrap_or(DEFAULT_UPDATE_INTERVAL_MS);
    let model = file
      .model_file
      .filter(|name| !name.trim().is_empty())
      .map(|name| {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        ModelReference::new(dir.join(name))
      });

    Settings::new(threshold, interval, model)
  }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountsFile {
  counts: Counts,
  #[serde(default)]
  updated_at: Option<DateTime<Utc>>,
}

/// 以 JSON 文件保存的计数，先写临时文件再重命名
///
/// 读取时文件内容无法解析则先改名为 `<文件名>.bak` 再返回错误。
#[derive(Debug, Clone)]
pub struct JsonCountsStore {
  path: PathBuf,
}

impl JsonCountsStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn sibling(&self, suffix: &str) -> PathBuf {
    let mut name = self.path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    self.path.with_file_name(name)
  }

  fn temp_path(&self) -> PathBuf {
    self.sibling(".tmp")
  }

  /// 无法解析的计数文件被移到这里，之后的保存不会覆盖它
  pub fn backup_path(&self) -> PathBuf {
    self.sibling(".bak")
  }
}

impl PersistenceStore for JsonCountsStore {
  fn load_counts(&self) -> Result<Counts, StoreError> {
    let bytes = match std::fs::read(&self.path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("计数文件 {} 不存在", self.path.display());
        return Ok(Counts::default());
      }
      Err(e) => return Err(e.into()),
    };
    let file: CountsFile = match serde_json::from_slice(&bytes) {
      Ok(file) => file,
      Err(e) => {
        let backup = self.backup_path();
        match std::fs::rename(&self.path, &backup) {
          Ok(()) => warn!(
            "计数文件 {} 无法解析，已移至 {}",
            self.path.display(),
            backup.display()
          ),
          Err(rename) => warn!("备份计数文件 {} 失败: {}", self.path.display(), rename),
        }
        return Err(e.into());
      }
    };
    if let Some(updated_at) = file.updated_at {
      debug!("计数最后更新于 {}", updated_at.to_rfc3339());
    }
    Ok(file.counts)
  }

  fn save_counts(&self, counts: &Counts) -> Result<(), StoreError> {
    let file = CountsFile {
      counts: counts.clone(),
      updated_at: Some(Utc::now()),
    };
    let temp = self.temp_path();
    std::fs::write(&temp, serde_json::to_vec_pretty(&file)?)?;
    std::fs::rename(&temp, &self.path)?;
    Ok(())
  }
}

/// 内存中的参数与计数
#[derive(Debug, Default)]
pub struct MemoryStore {
  settings: RwLock<Settings>,
  counts: Mutex<Option<Counts>>,
  saves: AtomicUsize,
  fail_saves: AtomicBool,
}

impl MemoryStore {
  pub fn new(settings: Settings) -> Self {
    Self {
      settings: RwLock::new(settings),
      ..Self::default()
    }
  }

  pub fn set_settings(&self, settings: Settings) {
    *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
  }

  pub fn set_counts(&self, counts: Counts) {
    *self.counts.lock().unwrap_or_else(PoisonError::into_inner) = Some(counts);
  }

  /// 最近一次成功保存的计数
  pub fn saved_counts(&self) -> Option<Counts> {
    self
      .counts
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn save_count(&self) -> usize {
    self.saves.load(Ordering::Acquire)
  }

  /// 模拟存储故障
  pub fn set_fail_saves(&self, fail: bool) {
    self.fail_saves.store(fail, Ordering::Release);
  }
}

impl SettingsStore for MemoryStore {
  fn current_settings(&self) -> Settings {
    self
      .settings
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl PersistenceStore for MemoryStore {
  fn load_counts(&self) -> Result<Counts, StoreError> {
    Ok(self.saved_counts().unwrap_or_default())
  }

  fn save_counts(&self, counts: &Counts) -> Result<(), StoreError> {
    if self.fail_saves.load(Ordering::Acquire) {
      return Err(StoreError::Unavailable("内存存储被设置为失败".to_string()));
    }
    self.set_counts(counts.clone());
    self.saves.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }
}
