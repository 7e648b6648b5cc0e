// 该文件是 Tiletrack 项目的一部分。
// src/registry.rs - 目标登记表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # 目标登记表
//!
//! 以跟踪器编号为键，保存每个目标最后一次出现的检测框与“未见帧数”（age）。
//! 每帧更新一次：
//!
//! 1. 所有已登记目标的 age 加 1；
//! 2. 本帧出现的已确认目标写入最新检测框并把 age 归零，新编号直接登记；
//! 3. age 达到 `expiry_remove` 的目标被移除。
//!
//! 未确认身份的检测不会登记。
//!
//! 目标状态随 age 变化：
//!
//! | age                                   | 状态      | 绘制样式 |
//! |---------------------------------------|-----------|----------|
//! | 0                                     | `Active`  | live     |
//! | `1 ..< expiry_visible`                | `Holding` | live     |
//! | `expiry_visible ..< expiry_remove`    | `Stale`   | held     |
//! | `>= expiry_remove`                    | 已移除    | -        |

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::model::{BoundingBox, Detection, Identity, TrackId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpiryPolicyError {
  #[error("expiry_visible 必须至少为 1")]
  ZeroVisible,
  #[error("expiry_remove ({remove}) 不能小于 expiry_visible ({visible})")]
  RemoveBeforeVisible { visible: u32, remove: u32 },
}

/// 两级过期阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiryPolicy {
  visible: u32,
  remove: u32,
}

impl Default for ExpiryPolicy {
  fn default() -> Self {
    Self {
      visible: 150,
      remove: 750,
    }
  }
}

impl ExpiryPolicy {
  pub const REMOVE_FACTOR: u32 = 5;

  pub fn new(visible: u32, remove: u32) -> Result<Self, ExpiryPolicyError> {
    if visible == 0 {
      return Err(ExpiryPolicyError::ZeroVisible);
    }
    if remove < visible {
      return Err(ExpiryPolicyError::RemoveBeforeVisible { visible, remove });
    }
    Ok(Self { visible, remove })
  }

  /// `expiry_remove = 5 × expiry_visible`
  pub fn from_visible(visible: u32) -> Result<Self, ExpiryPolicyError> {
    Self::new(visible, visible.saturating_mul(Self::REMOVE_FACTOR))
  }

  pub fn visible(&self) -> u32 {
    self.visible
  }

  pub fn remove(&self) -> u32 {
    self.remove
  }

  pub fn state_for(&self, age: u32) -> ObjectState {
    if age == 0 {
      ObjectState::Active
    } else if age < self.visible {
      ObjectState::Holding
    } else {
      ObjectState::Stale
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
  Active,
  Holding,
  Stale,
}

impl ObjectState {
  /// 是否以 held 样式绘制
  pub fn is_held(&self) -> bool {
    matches!(self, ObjectState::Stale)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedObject {
  pub id: TrackId,
  pub last_box: BoundingBox,
  /// 自最后一次被检测到以来经过的帧数
  pub age: u32,
  pub class_id: u32,
  pub score: f32,
  /// 累计被检测到的次数
  pub hits: u64,
}

impl TrackedObject {
  fn new(id: TrackId, det: &Detection) -> Self {
    Self {
      id,
      last_box: det.bbox,
      age: 0,
      class_id: det.class_id,
      score: det.score,
      hits: 1,
    }
  }

  fn refresh(&mut self, det: &Detection) {
    self.last_box = det.bbox;
    self.age = 0;
    self.class_id = det.class_id;
    self.score = det.score;
    self.hits += 1;
  }
}

/// 一次更新的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
  pub inserted: usize,
  pub refreshed: usize,
  pub unconfirmed: usize,
  pub evicted: usize,
}

/// 目标登记表
///
/// 只由处理线程持有和修改。
#[derive(Debug, Clone, Default)]
pub struct ObjectRegistry {
  policy: ExpiryPolicy,
  objects: BTreeMap<TrackId, TrackedObject>,
}

impl ObjectRegistry {
  pub fn new(policy: ExpiryPolicy) -> Self {
    Self {
      policy,
      objects: BTreeMap::new(),
    }
  }

  pub fn policy(&self) -> &ExpiryPolicy {
    &self.policy
  }

  pub fn len(&self) -> usize {
    self.objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }

  pub fn get(&self, id: TrackId) -> Option<&TrackedObject> {
    self.objects.get(&id)
  }

  pub fn state(&self, id: TrackId) -> Option<ObjectState> {
    self.get(id).map(|obj| self.policy.state_for(obj.age))
  }

  /// 按编号升序遍历
  pub fn iter(&self) -> impl Iterator<Item = (&TrackedObject, ObjectState)> {
    self
      .objects
      .values()
      .map(|obj| (obj, self.policy.state_for(obj.age)))
  }

  /// 用一帧的全部检测更新登记表
  ///
  /// 同一编号在一帧中出现多次时，以最后一个检测为准。
  pub fn update<'a, I>(&mut self, detections: I) -> UpdateSummary
  where
    I: IntoIterator<Item = &'a Detection>,
  {
    let mut summary = UpdateSummary::default();

    for obj in self.objects.values_mut() {
      obj.age = obj.age.saturating_add(1);
    }

    for det in detections {
      let Identity::Identified(id) = det.identity else {
        summary.unconfirmed += 1;
        continue;
      };

      match self.objects.get_mut(&id) {
        Some(obj) => {
          // 同一帧重复出现时 age 已经是 0
          if obj.age != 0 {
            summary.refreshed += 1;
          }
          obj.refresh(det);
        }
        None => {
          self.objects.insert(id, TrackedObject::new(id, det));
          summary.inserted += 1;
        }
      }
    }

    let remove = self.policy.remove;
    let before = self.objects.len();
    self.objects.retain(|id, obj| {
      let keep = obj.age < remove;
      if !keep {
        debug!("目标 {} 已 {} 帧未出现，移除", id, obj.age);
      }
      keep
    });
    summary.evicted = before - self.objects.len();

    summary
  }

  pub fn clear(&mut self) {
    self.objects.clear();
  }

  pub fn snapshot(&self, frame_index: u64) -> RegistrySnapshot {
    RegistrySnapshot {
      frame: frame_index,
      policy: self.policy,
      objects: self
        .iter()
        .map(|(obj, state)| ObjectRecord {
          object: obj.clone(),
          state,
        })
        .collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
  #[serde(flatten)]
  pub object: TrackedObject,
  pub state: ObjectState,
}

/// 某一帧处理完成后登记表的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
  pub frame: u64,
  pub policy: ExpiryPolicy,
  pub objects: Vec<ObjectRecord>,
}

impl RegistrySnapshot {
  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const NONE: &[Detection] = &[];

  fn registry(visible: u32, remove: u32) -> ObjectRegistry {
    ObjectRegistry::new(ExpiryPolicy::new(visible, remove).unwrap())
  }

  fn det(id: TrackId, x: f32) -> Detection {
    Detection::identified(id, [x, x, x + 1.0, x + 1.0])
  }

  #[test]
  fn policy_validation() {
    assert_eq!(ExpiryPolicy::new(0, 5), Err(ExpiryPolicyError::ZeroVisible));
    assert_eq!(
      ExpiryPolicy::new(5, 4),
      Err(ExpiryPolicyError::RemoveBeforeVisible {
        visible: 5,
        remove: 4
      })
    );
    let policy = ExpiryPolicy::from_visible(150).unwrap();
    assert_eq!((policy.visible(), policy.remove()), (150, 750));
    assert_eq!(policy, ExpiryPolicy::default());
  }

  #[test]
  fn unseen_id_is_inserted_with_age_zero() {
    let mut reg = registry(3, 15);
    let summary = reg.update(&[det(7, 1.0)]);

    assert_eq!(summary.inserted, 1);
    assert_eq!(reg.len(), 1);
    let obj = reg.get(7).unwrap();
    assert_eq!(obj.age, 0);
    assert_eq!(obj.hits, 1);
    assert_eq!(reg.state(7), Some(ObjectState::Active));
  }

  #[test]
  fn missing_id_ages_by_one_and_keeps_box() {
    let mut reg = registry(3, 15);
    reg.update(&[det(1, 2.0)]);
    reg.update(NONE);

    let obj = reg.get(1).unwrap();
    assert_eq!(obj.age, 1);
    assert_eq!(obj.last_box, BoundingBox::new(2.0, 2.0, 3.0, 3.0));
    assert_eq!(reg.state(1), Some(ObjectState::Holding));
  }

  #[test]
  fn redetection_resets_age_and_moves_box() {
    let mut reg = registry(3, 15);
    reg.update(&[det(1, 0.0)]);
    reg.update(NONE);
    reg.update(NONE);
    let summary = reg.update(&[det(1, 5.0)]);

    assert_eq!(summary.refreshed, 1);
    let obj = reg.get(1).unwrap();
    assert_eq!(obj.age, 0);
    assert_eq!(obj.hits, 2);
    assert_eq!(obj.last_box.x1, 5.0);
  }

  #[test]
  fn only_present_ids_are_reset() {
    let mut reg = registry(3, 15);
    reg.update(&[det(1, 0.0), det(2, 0.0)]);
    reg.update(&[det(2, 1.0)]);

    assert_eq!(reg.get(1).unwrap().age, 1);
    assert_eq!(reg.get(2).unwrap().age, 0);
  }

  #[test]
  fn unconfirmed_detections_are_not_registered() {
    let mut reg = registry(3, 15);
    let summary = reg.update(&[Detection::unconfirmed([0.0, 0.0, 1.0, 1.0])]);

    assert!(reg.is_empty());
    assert_eq!(summary.unconfirmed, 1);
    assert_eq!(summary.inserted, 0);
  }

  #[test]
  fn object_is_evicted_when_age_reaches_remove() {
    let mut reg = registry(2, 4);
    reg.update(&[det(1, 0.0)]);
    for _ in 0..3 {
      reg.update(NONE);
    }
    assert_eq!(reg.get(1).unwrap().age, 3);

    let summary = reg.update(NONE);
    assert_eq!(summary.evicted, 1);
    assert!(reg.get(1).is_none());
  }

  #[test]
  fn states_follow_the_two_thresholds() {
    let mut reg = registry(2, 4);
    reg.update(&[det(1, 0.0)]);
    assert_eq!(reg.state(1), Some(ObjectState::Active));
    reg.update(NONE);
    assert_eq!(reg.state(1), Some(ObjectState::Holding));
    reg.update(NONE);
    assert_eq!(reg.state(1), Some(ObjectState::Stale));
    assert!(reg.state(1).unwrap().is_held());
    reg.update(NONE);
    assert_eq!(reg.state(1), Some(ObjectState::Stale));
    reg.update(NONE);
    assert_eq!(reg.state(1), None);
  }

  #[test]
  fn degenerate_boxes_are_stored_as_given() {
    let mut reg = registry(3, 15);
    let flipped = Detection::identified(9, [10.0, 10.0, 2.0, 3.0]);
    reg.update(&[flipped]);

    assert_eq!(
      reg.get(9).unwrap().last_box,
      BoundingBox::new(10.0, 10.0, 2.0, 3.0)
    );
  }

  #[test]
  fn duplicate_id_in_one_frame_keeps_last_box() {
    let mut reg = registry(3, 15);
    let summary = reg.update(&[det(4, 0.0), det(4, 8.0)]);

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.refreshed, 0);
    assert_eq!(reg.get(4).unwrap().last_box.x1, 8.0);
  }

  #[test]
  fn snapshot_lists_objects_with_state() {
    let mut reg = registry(1, 5);
    reg.update(&[det(2, 0.0), det(1, 0.0)]);
    reg.update(&[det(2, 0.0)]);

    let snapshot = reg.snapshot(10);
    assert_eq!(snapshot.frame, 10);
    let states = snapshot
      .objects
      .iter()
      .map(|r| (r.object.id, r.state))
      .collect::<Vec<_>>();
    assert_eq!(
      states,
      vec![(1, ObjectState::Stale), (2, ObjectState::Active)]
    );

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["objects"][0]["id"], 1);
    assert_eq!(json["objects"][0]["state"], "stale");
  }
}
