// 该文件是 Huishou （回收计数） 项目的一部分。
// src/counts.rs - 分类计数聚合
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
  collections::BTreeMap,
  fmt,
  sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{category::Category, model::Detection, store::PersistenceStore};

/// 各类别的累计数量，所有类别总是存在，缺省为 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<Category, u64>", from = "BTreeMap<String, u64>")]
pub struct Counts(BTreeMap<Category, u64>);

impl Default for Counts {
  fn default() -> Self {
    Self(Category::ALL.iter().map(|c| (*c, 0)).collect())
  }
}

impl Counts {
  pub fn get(&self, category: Category) -> u64 {
    self.0.get(&category).copied().unwrap_or(0)
  }

  pub fn total(&self) -> u64 {
    self.0.values().sum()
  }

  pub fn iter(&self) -> impl Iterator<Item = (Category, u64)> + '_ {
    self.0.iter().map(|(c, n)| (*c, *n))
  }

  /// 从标签名构建，未知标签丢弃并记录警告
  pub fn from_labels<I, S>(entries: I) -> Self
  where
    I: IntoIterator<Item = (S, u64)>,
    S: AsRef<str>,
  {
    let mut counts = Counts::default();
    for (label, count) in entries {
      match label.as_ref().parse::<Category>() {
        Ok(category) => {
          counts.0.insert(category, count);
        }
        Err(e) => warn!("忽略计数项: {}", e),
      }
    }
    counts
  }

  pub(crate) fn increment(&mut self, category: Category) {
    *self.0.entry(category).or_insert(0) += 1;
  }
}

impl From<BTreeMap<String, u64>> for Counts {
  fn from(map: BTreeMap<String, u64>) -> Self {
    Counts::from_labels(map)
  }
}

impl From<Counts> for BTreeMap<Category, u64> {
  fn from(counts: Counts) -> Self {
    counts.0
  }
}

impl fmt::Display for Counts {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (category, count) in self.iter() {
      if !first {
        f.write_str(", ")?;
      }
      write!(f, "{}: {}", category, count)?;
      first = false;
    }
    Ok(())
  }
}

/// 把一帧的检测结果累加到计数上，返回新的计数，不修改输入
pub fn apply(detections: &[Detection], counts: &Counts) -> Counts {
  let mut next = counts.clone();
  for detection in detections {
    next.increment(detection.category);
  }
  next
}

/// 维护当前计数，每次更新后写入持久化存储
///
/// 持久化失败只记录警告，不影响内存中的计数。
pub struct CountAggregator<P> {
  store: P,
  counts: Mutex<Counts>,
}

impl<P: PersistenceStore> CountAggregator<P> {
  pub fn new(store: P) -> Self {
    let counts = match store.load_counts() {
      Ok(counts) => {
        info!("读取已保存的计数: {}", counts);
        counts
      }
      Err(e) => {
        warn!("读取计数失败，从零开始: {}", e);
        Counts::default()
      }
    };
    Self {
      store,
      counts: Mutex::new(counts),
    }
  }

  pub fn counts(&self) -> Counts {
    self
      .counts
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn store(&self) -> &P {
    &self.store
  }

  fn commit(&self, update: impl FnOnce(&Counts) -> Counts) -> Counts {
    let mut current = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
    let next = update(&current);
    *current = next.clone();
    if let Err(e) = self.store.save_counts(&next) {
      warn!("保存计数失败: {}", e);
    }
    next
  }

  /// 聚合一帧的检测结果
  pub fn record(&self, detections: &[Detection]) -> Counts {
    let next = self.commit(|current| apply(detections, current));
    debug!("本帧 {} 个检测, 当前计数: {}", detections.len(), next);
    next
  }

  /// 清零并保存
  pub fn reset(&self) -> Counts {
    info!("计数清零");
    self.commit(|_| Counts::default())
  }
}
