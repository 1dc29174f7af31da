// 该文件是 Huishou （回收计数） 项目的一部分。
// src/category.rs - 可回收物类别
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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CategoryError {
  #[error("未知类别索引: {0}")]
  UnknownIndex(usize),
  #[error("未知类别标签: {0}")]
  UnknownLabel(String),
}

/// 可回收物类别，顺序与模型输出的类别索引一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  Glass,
  Can,
  Pet1,
  Hdpe2,
  Carton,
}

impl Category {
  pub const ALL: [Category; 5] = [
    Category::Glass,
    Category::Can,
    Category::Pet1,
    Category::Hdpe2,
    Category::Carton,
  ];

  pub fn from_label_id(id: usize) -> Result<Self, CategoryError> {
    Self::ALL
      .get(id)
      .copied()
      .ok_or(CategoryError::UnknownIndex(id))
  }

  pub fn label_id(&self) -> usize {
    *self as usize
  }

  pub fn to_label_str(&self) -> &'static str {
    match self {
      Category::Glass => "glass",
      Category::Can => "can",
      Category::Pet1 => "pet1",
      Category::Hdpe2 => "hdpe2",
      Category::Carton => "carton",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.to_label_str())
  }
}

impl FromStr for Category {
  type Err = CategoryError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|c| c.to_label_str() == s)
      .ok_or_else(|| CategoryError::UnknownLabel(s.to_string()))
  }
}
