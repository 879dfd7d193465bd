//! In-Flight 槽位
//!
//! 每个操作族最多一个暂存操作。槽位非空意味着对应请求正在飞行或即将发送，
//! 物化器永远不能覆盖非空槽位。

use crate::queue::operation::OpFamily;
use crate::queue::staged::{StagedOp, StagedRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub op: StagedOp,
    /// 已发出的请求 id；None 表示已暂存但尚未发送
    pub request_id: Option<u64>,
}

#[derive(Debug, Default)]
pub struct InFlightSlots {
    slots: [Option<SlotEntry>; 7],
}

impl InFlightSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self, family: OpFamily) -> bool {
        self.slots[family.index()].is_none()
    }

    /// 放入暂存操作；槽位已被占用属于不可恢复的状态错误
    pub fn put(&mut self, op: StagedOp) {
        let family = op.family();
        let slot = &mut self.slots[family.index()];
        if let Some(existing) = slot {
            panic!(
                "in-flight slot {} already holds {} (new target {})",
                family,
                existing.op.target(),
                op.target()
            );
        }
        *slot = Some(SlotEntry { op, request_id: None });
    }

    pub fn get(&self, family: OpFamily) -> Option<&SlotEntry> {
        self.slots[family.index()].as_ref()
    }

    /// 已暂存但尚未发送的操作
    pub fn unsent(&self, family: OpFamily) -> Option<&StagedOp> {
        self.get(family)
            .filter(|entry| entry.request_id.is_none())
            .map(|entry| &entry.op)
    }

    pub fn mark_sent(&mut self, family: OpFamily, request_id: u64) {
        if let Some(entry) = self.slots[family.index()].as_mut() {
            entry.request_id = Some(request_id);
        }
    }

    /// 请求失败但需要保留时，恢复为未发送状态
    pub fn mark_unsent(&mut self, family: OpFamily) {
        if let Some(entry) = self.slots[family.index()].as_mut() {
            entry.request_id = None;
        }
    }

    pub fn take(&mut self, family: OpFamily) -> Option<StagedOp> {
        self.slots[family.index()].take().map(|entry| entry.op)
    }

    pub fn occupied(&self) -> impl Iterator<Item = &SlotEntry> {
        self.slots.iter().flatten()
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::operation::OperationHeader;
    use crate::queue::staged::{StagedKind, StagedPhotoRemoval};
    use serde_json::json;

    fn removal(photo_id: i64) -> StagedOp {
        StagedOp::new(
            OperationHeader::new(0),
            35,
            StagedKind::RemovePhotos(StagedPhotoRemoval {
                photo_id,
                payload: json!({}),
            }),
        )
    }

    #[test]
    fn test_put_take_cycle() {
        let mut slots = InFlightSlots::new();
        assert!(slots.is_empty(OpFamily::RemovePhotos));
        slots.put(removal(1));
        assert!(slots.unsent(OpFamily::RemovePhotos).is_some());

        slots.mark_sent(OpFamily::RemovePhotos, 9);
        assert!(slots.unsent(OpFamily::RemovePhotos).is_none());
        assert_eq!(slots.get(OpFamily::RemovePhotos).unwrap().request_id, Some(9));

        let op = slots.take(OpFamily::RemovePhotos).unwrap();
        assert_eq!(op.target(), crate::storage::entities::EntityRef::Photo(1));
        assert!(slots.is_empty(OpFamily::RemovePhotos));
        assert_eq!(slots.occupied().count(), 0);
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn test_overwriting_occupied_slot_panics() {
        let mut slots = InFlightSlots::new();
        slots.put(removal(1));
        slots.put(removal(2));
    }
}
