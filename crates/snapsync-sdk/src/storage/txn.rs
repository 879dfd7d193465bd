//! 事务包装
//!
//! sled 在冲突时会重跑事务闭包，所以闭包内部不能产生任何外部副作用。
//! 统计增量、事件、"日志已修改" 标记都先记在 `TxnEffects` 里，
//! 由 `KvStore::transact` 在提交成功之后统一生效。

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionalTree;

use crate::error::{SnapSyncError, TxResult};
use crate::events::SyncEvent;
use crate::storage::dao::StoredEntity;
use crate::storage::keys;

/// 提交后才生效的副作用
#[derive(Debug, Default)]
pub struct TxnEffects {
    /// (priority, milli_units)
    pub stats_deltas: Vec<(u32, i64)>,
    pub log_mutated: bool,
    pub events: Vec<SyncEvent>,
}

pub struct Txn<'a> {
    tree: &'a TransactionalTree,
    effects: TxnEffects,
    now_ms: i64,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(tree: &'a TransactionalTree, now_ms: i64) -> Self {
        Self {
            tree,
            effects: TxnEffects::default(),
            now_ms,
        }
    }

    pub(crate) fn into_effects(self) -> TxnEffects {
        self.effects
    }

    /// 事务开始时的时钟（同一事务内保持不变）
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn get_raw(&self, key: &[u8]) -> TxResult<Option<sled::IVec>> {
        Ok(self.tree.get(key)?)
    }

    pub fn insert_raw(&self, key: &[u8], value: Vec<u8>) -> TxResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn remove_raw(&self, key: &[u8]) -> TxResult<Option<sled::IVec>> {
        Ok(self.tree.remove(key)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> TxResult<Option<T>> {
        match self.tree.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(SnapSyncError::from)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> TxResult<()> {
        let bytes = serde_json::to_vec(value).map_err(SnapSyncError::from)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn get_entity<E: StoredEntity>(&self, local_id: i64) -> TxResult<Option<E>> {
        self.get_json(&keys::entity_key(E::PREFIX, local_id))
    }

    pub fn put_entity<E: StoredEntity>(&self, entity: &E) -> TxResult<()> {
        self.put_json(&keys::entity_key(E::PREFIX, entity.local_id()), entity)
    }

    /// 读取并递增持久化的序号计数器
    pub fn next_sequence(&self) -> TxResult<u64> {
        let current = match self.tree.get(keys::NEXT_SEQUENCE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    SnapSyncError::InvalidData("next_sequence counter is corrupt".to_string())
                })?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };
        self.tree
            .insert(keys::NEXT_SEQUENCE_KEY, (current + 1).to_be_bytes().to_vec())?;
        Ok(current)
    }

    pub(crate) fn record_stats(&mut self, priority: u32, milli_units: i64) {
        self.effects.stats_deltas.push((priority, milli_units));
        self.effects.log_mutated = true;
    }

    pub(crate) fn mark_log_mutated(&mut self) {
        self.effects.log_mutated = true;
    }

    pub fn emit(&mut self, event: SyncEvent) {
        self.effects.events.push(event);
    }
}
