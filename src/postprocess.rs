// 该文件是 Huishou （回收计数） 项目的一部分。
// src/postprocess.rs - 置信度过滤与非极大值抑制
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

use tracing::{debug, warn};

use crate::{
  category::Category,
  model::{Detection, RawOutput},
};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsConfig {
  pub iou_threshold: f32,
  pub max_detections: usize,
  /// 为真时不同类别的框之间也会互相抑制
  pub class_agnostic: bool,
}

impl Default for NmsConfig {
  fn default() -> Self {
    Self {
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
      class_agnostic: false,
    }
  }
}

impl NmsConfig {
  pub fn with_iou_threshold(iou_threshold: f32) -> Self {
    Self {
      iou_threshold,
      ..Self::default()
    }
  }
}

/// 只保留分数严格大于阈值且类别已知的候选
pub fn filter_by_confidence(raw: &RawOutput, threshold: f32) -> Vec<Detection> {
  raw
    .iter()
    .filter(|item| item.confidence > threshold)
    .filter_map(|item| match Category::from_label_id(item.class_index) {
      Ok(category) => Some(Detection {
        category,
        confidence: item.confidence,
        bbox: item.bbox,
      }),
      Err(e) => {
        warn!("丢弃检测结果: {}", e);
        None
      }
    })
    .collect()
}

/// 贪心非极大值抑制
///
/// 按置信度降序（同分保持原有顺序）依次保留最高者，并移除与其交并比
/// 不小于阈值的其余候选，直到候选耗尽或达到数量上限。
pub fn non_max_suppression(mut detections: Vec<Detection>, config: &NmsConfig) -> Vec<Detection> {
  // sort_by 是稳定排序
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut result = Vec::new();
  while !detections.is_empty() && result.len() < config.max_detections {
    let best = detections.remove(0);
    result.push(best);

    detections.retain(|det| {
      if !config.class_agnostic && det.category != best.category {
        return true;
      }
      best.bbox.iou(&det.bbox) < config.iou_threshold
    });
  }

  result
}

/// 置信度过滤后做非极大值抑制，其余参数使用默认值
pub fn postprocess(raw: &RawOutput, confidence_threshold: f32, iou_threshold: f32) -> Vec<Detection> {
  postprocess_with(raw, confidence_threshold, &NmsConfig::with_iou_threshold(iou_threshold))
}

pub fn postprocess_with(raw: &RawOutput, confidence_threshold: f32, config: &NmsConfig) -> Vec<Detection> {
  let candidates = filter_by_confidence(raw, confidence_threshold);
  let candidate_count = candidates.len();
  let detections = non_max_suppression(candidates, config);
  debug!(
    "后处理: {} 个原始候选, {} 个通过阈值, {} 个保留",
    raw.len(),
    candidate_count,
    detections.len()
  );
  detections
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::model::{BoundingBox, RawDetection};

  fn raw(items: &[(usize, f32, BoundingBox)]) -> RawOutput {
    items
      .iter()
      .map(|&(class_index, confidence, bbox)| RawDetection {
        class_index,
        confidence,
        bbox,
      })
      .collect()
  }

  #[test]
  fn overlapping_boxes_of_same_category_keep_the_best() {
    // 交并比约为 0.7
    let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    let b = BoundingBox::new(0.0, 17.6, 100.0, 100.0);
    assert!((a.iou(&b) - 0.7).abs() < 0.01);

    let detections = postprocess(&raw(&[(1, 0.9, a), (1, 0.85, b)]), 0.3, 0.5);

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].category, Category::Can);
    assert_eq!(detections[0].confidence, 0.9);
  }

  #[test]
  fn low_confidence_detection_is_filtered() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(50.0, 50.0, 10.0, 10.0);
    let detections = postprocess(&raw(&[(0, 0.4, a), (1, 0.2, b)]), 0.3, 0.5);

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].category, Category::Glass);
  }

  #[test]
  fn threshold_is_exclusive() {
    let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(postprocess(&raw(&[(2, 0.3, bbox)]), 0.3, 0.5).is_empty());
    assert_eq!(postprocess(&raw(&[(2, 0.31, bbox)]), 0.3, 0.5).len(), 1);
  }

  #[test]
  fn unknown_class_index_is_dropped() {
    let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(postprocess(&raw(&[(5, 0.9, bbox), (usize::MAX, 0.9, bbox)]), 0.3, 0.5).is_empty());
  }

  #[test]
  fn different_categories_do_not_suppress_each_other() {
    let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let input = raw(&[(3, 0.9, bbox), (4, 0.8, bbox)]);
    assert_eq!(postprocess(&input, 0.3, 0.5).len(), 2);

    let agnostic = NmsConfig {
      class_agnostic: true,
      ..NmsConfig::default()
    };
    assert_eq!(postprocess_with(&input, 0.3, &agnostic).len(), 1);
  }

  #[test]
  fn cap_keeps_the_highest_scores() {
    let items: Vec<_> = (0..150)
      .map(|i| {
        let bbox = BoundingBox::new(i as f32 * 20.0, 0.0, 10.0, 10.0);
        (0, 0.31 + i as f32 * 0.004, bbox)
      })
      .collect();
    let detections = postprocess(&raw(&items), 0.3, 0.5);

    assert_eq!(detections.len(), DEFAULT_MAX_DETECTIONS);
    let lowest_kept = detections.last().unwrap().confidence;
    assert!((lowest_kept - (0.31 + 50.0 * 0.004)).abs() < 1e-5);
  }

  #[test]
  fn equal_scores_keep_input_order() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(1.0, 0.0, 10.0, 10.0);
    let detections = postprocess(&raw(&[(0, 0.5, a), (0, 0.5, b)]), 0.3, 0.5);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, a);
  }

  fn detection() -> impl Strategy<Value = Detection> {
    (
      0usize..Category::ALL.len(),
      0.0f32..=1.0,
      0.0f32..200.0,
      0.0f32..200.0,
      1.0f32..80.0,
      1.0f32..80.0,
    )
      .prop_map(|(class, confidence, x, y, width, height)| Detection {
        category: Category::ALL[class],
        confidence,
        bbox: BoundingBox::new(x, y, width, height),
      })
  }

  proptest! {
    #[test]
    fn nms_is_idempotent(detections in prop::collection::vec(detection(), 0..60)) {
      let config = NmsConfig::default();
      let once = non_max_suppression(detections, &config);
      let twice = non_max_suppression(once.clone(), &config);
      prop_assert_eq!(once, twice);
    }

    #[test]
    fn kept_boxes_never_overlap_within_a_category(
      detections in prop::collection::vec(detection(), 0..60),
      iou_threshold in 0.1f32..0.9,
    ) {
      let config = NmsConfig::with_iou_threshold(iou_threshold);
      let kept = non_max_suppression(detections, &config);

      prop_assert!(kept.len() <= config.max_detections);
      for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
          prop_assert!(a.confidence >= b.confidence);
          if a.category == b.category {
            prop_assert!(a.bbox.iou(&b.bbox) < iou_threshold);
          }
        }
      }
    }
  }
}
