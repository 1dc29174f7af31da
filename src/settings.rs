// 该文件是 Huishou （回收计数） 项目的一部分。
// src/settings.rs - 运行参数快照
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

use std::time::Duration;

use tracing::warn;

use crate::model::ModelReference;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 500;
pub const MIN_UPDATE_INTERVAL_MS: u64 = 50;

/// 不可变的参数快照，每个检测周期开始时读取一次
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
  confidence_threshold: f32,
  update_interval_ms: u64,
  model: Option<ModelReference>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
      model: None,
    }
  }
}

impl Settings {
  /// 越界的阈值或过短的间隔会回退到默认值并记录警告
  pub fn new(confidence_threshold: f32, update_interval_ms: u64, model: Option<ModelReference>) -> Self {
    let confidence_threshold = if (0.0..=1.0).contains(&confidence_threshold) {
      confidence_threshold
    } else {
      warn!(
        "置信度阈值 {} 超出 [0, 1]，使用默认值 {}",
        confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD
      );
      DEFAULT_CONFIDENCE_THRESHOLD
    };

    let update_interval_ms = if update_interval_ms >= MIN_UPDATE_INTERVAL_MS {
      update_interval_ms
    } else {
      warn!(
        "更新间隔 {}ms 小于 {}ms，使用默认值 {}ms",
        update_interval_ms, MIN_UPDATE_INTERVAL_MS, DEFAULT_UPDATE_INTERVAL_MS
      );
      DEFAULT_UPDATE_INTERVAL_MS
    };

    Self {
      confidence_threshold,
      update_interval_ms,
      model,
    }
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn update_interval(&self) -> Duration {
    Duration::from_millis(self.update_interval_ms)
  }

  pub fn update_interval_ms(&self) -> u64 {
    self.update_interval_ms
  }

  pub fn model(&self) -> Option<&ModelReference> {
    self.model.as_ref()
  }

  pub fn with_model(mut self, model: ModelReference) -> Self {
    self.model = Some(model);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn valid_values_are_kept() {
    let settings = Settings::new(0.55, 1000, Some(ModelReference::new("model.onnx")));
    assert_eq!(settings.confidence_threshold(), 0.55);
    assert_eq!(settings.update_interval(), Duration::from_millis(1000));
    assert_eq!(settings.model(), Some(&ModelReference::new("model.onnx")));
  }

  #[test]
  fn out_of_range_values_fall_back() {
    let settings = Settings::new(1.5, 10, None);
    assert_eq!(settings.confidence_threshold(), DEFAULT_CONFIDENCE_THRESHOLD);
    assert_eq!(settings.update_interval_ms(), DEFAULT_UPDATE_INTERVAL_MS);

    assert_eq!(
      Settings::new(f32::NAN, 50, None).confidence_threshold(),
      DEFAULT_CONFIDENCE_THRESHOLD
    );
    assert_eq!(Settings::new(0.0, 50, None).update_interval_ms(), 50);
  }
}
