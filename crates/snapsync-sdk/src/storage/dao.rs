//! 实体表访问
//!
//! 四类可同步实体共享同一套存取方式：前缀 + 本地 id 作为键，JSON 作为值。
//! `StoredEntity` 同时暴露意图状态与队列指针，让隔离 / 解除隔离可以泛型实现。

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::entities::{
    ActivityRecord, EntityRef, EpisodeRecord, IntentState, PhotoRecord, QueuePointer,
    ViewpointRecord,
};
use crate::storage::keys;

pub trait StoredEntity: Serialize + DeserializeOwned {
    const PREFIX: &'static [u8];

    fn local_id(&self) -> i64;

    fn entity_ref(&self) -> EntityRef;

    fn intent(&self) -> &IntentState;

    fn intent_mut(&mut self) -> &mut IntentState;

    fn queue_pointer(&self) -> Option<QueuePointer>;

    fn set_queue_pointer(&mut self, pointer: Option<QueuePointer>);
}

macro_rules! stored_entity {
    ($ty:ty, $prefix:expr, $id:ident, $variant:ident) => {
        impl StoredEntity for $ty {
            const PREFIX: &'static [u8] = $prefix;

            fn local_id(&self) -> i64 {
                self.$id
            }

            fn entity_ref(&self) -> EntityRef {
                EntityRef::$variant(self.$id)
            }

            fn intent(&self) -> &IntentState {
                &self.intent
            }

            fn intent_mut(&mut self) -> &mut IntentState {
                &mut self.intent
            }

            fn queue_pointer(&self) -> Option<QueuePointer> {
                self.queue
            }

            fn set_queue_pointer(&mut self, pointer: Option<QueuePointer>) {
                self.queue = pointer;
            }
        }
    };
}

stored_entity!(PhotoRecord, keys::PHOTO_PREFIX, photo_id, Photo);
stored_entity!(EpisodeRecord, keys::EPISODE_PREFIX, episode_id, Episode);
stored_entity!(ActivityRecord, keys::ACTIVITY_PREFIX, activity_id, Activity);
stored_entity!(ViewpointRecord, keys::VIEWPOINT_PREFIX, viewpoint_id, Viewpoint);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventManager;
    use crate::storage::entities::{ActivityContent, PhotoWork};
    use crate::storage::kv::KvStore;
    use std::sync::Arc;

    #[test]
    fn test_entities_round_trip_through_txn() {
        let store = KvStore::temporary("u", Arc::new(EventManager::new(4))).unwrap();
        let mut photo = PhotoRecord::new(11);
        photo.intent.request(PhotoWork::UploadThumbnail);
        let activity = ActivityRecord::new(
            3,
            5,
            ActivityContent::PostComment {
                message: "hi".to_string(),
            },
        );

        store
            .transact(|txn| {
                txn.put_entity(&photo)?;
                txn.put_entity(&activity)
            })
            .unwrap();

        let loaded = store
            .transact(|txn| txn.get_entity::<PhotoRecord>(11))
            .unwrap()
            .unwrap();
        assert!(loaded.intent().needs(PhotoWork::UploadThumbnail));
        assert_eq!(loaded.entity_ref(), EntityRef::Photo(11));

        // 不同前缀互不干扰
        assert!(store.get_entity::<ViewpointRecord>(11).unwrap().is_none());
        assert_eq!(store.entity_ids::<ActivityRecord>().unwrap(), vec![3]);
    }
}
