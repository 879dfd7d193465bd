//! 实体意图状态机
//!
//! `requeue` 是修改队列的唯一入口：先无条件删掉实体当前的日志条目（保证统计正确），
//! 再根据工作位重新计算优先级并写回。优先级不变时复用旧序号，实体的工作集合只是
//! 变大时不会被排到新加入的无关工作之后。隔离中的实体只出队，不再入队。

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TxResult};
use crate::events::SyncEvent;
use crate::queue::op_log;
use crate::queue::operation::{split_stat_unit, OpFamily, Operation, OperationHeader, OperationRecord};
use crate::queue::priority::{self, QueuePolicy};
use crate::storage::dao::StoredEntity;
use crate::storage::entities::{
    ActivityRecord, ActivityWork, EpisodeRecord, EpisodeWork, FailureOutcome, PhotoRecord,
    PhotoWork, QueuePointer, ViewpointRecord, WorkUnit,
};
use crate::storage::kv::KvStore;
use crate::storage::txn::Txn;

/// 优先级变化时如何处理序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SequencePolicy {
    /// 只有优先级完全不变才复用序号
    #[default]
    ExactPriorityOnly,
    /// 优先级降低（例如 UI 关闭后转为后台）时也保留序号
    PreserveOnDowngrade,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueContext {
    pub policy: QueuePolicy,
    pub sequence_policy: SequencePolicy,
}

/// 实体当前应当占据的日志条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredEntry {
    pub priority: u32,
    pub operation: Operation,
    pub stat_labels: Vec<&'static str>,
}

pub trait Requeue: StoredEntity {
    /// 根据工作位计算目标条目；None 表示无需入队
    fn desired_entry(&self, ctx: &RequeueContext) -> Option<DesiredEntry>;
}

impl PhotoRecord {
    /// 当前策略下仍然需要执行的工作单元
    pub fn effective_work(&self, policy: &QueuePolicy) -> Vec<PhotoWork> {
        self.intent
            .pending::<PhotoWork>()
            .into_iter()
            .filter(|w| policy.store_originals || *w != PhotoWork::UploadOriginal)
            .collect()
    }
}

impl Requeue for PhotoRecord {
    fn desired_entry(&self, ctx: &RequeueContext) -> Option<DesiredEntry> {
        if self.intent.is_quarantined() {
            return None;
        }
        let interactive = self.intent.is_interactive();
        let units = self.effective_work(&ctx.policy);
        let (priority, family) = units
            .iter()
            .map(|w| priority::photo_unit(*w, interactive))
            .min_by_key(|(p, _)| *p)?;
        let operation = match family {
            OpFamily::DownloadPhoto => Operation::DownloadPhoto { photo_id: self.photo_id },
            OpFamily::UploadPhoto => Operation::UploadPhoto { photo_id: self.photo_id },
            OpFamily::UpdatePhoto => Operation::UpdatePhoto { photo_id: self.photo_id },
            OpFamily::RemovePhotos => Operation::RemovePhotos { photo_id: self.photo_id },
            other => unreachable!("photo work never maps to {}", other),
        };
        let stat_labels = units
            .iter()
            .filter(|w| priority::photo_unit(**w, interactive).1 == family)
            .map(|w| w.name())
            .collect();
        Some(DesiredEntry {
            priority,
            operation,
            stat_labels,
        })
    }
}

impl Requeue for EpisodeRecord {
    fn desired_entry(&self, _ctx: &RequeueContext) -> Option<DesiredEntry> {
        if self.intent.is_quarantined() || !self.intent.needs(EpisodeWork::Upload) {
            return None;
        }
        Some(DesiredEntry {
            priority: priority::episode_priority(self.intent.is_interactive()),
            operation: Operation::UploadEpisode {
                episode_id: self.episode_id,
            },
            stat_labels: Vec::new(),
        })
    }
}

impl Requeue for ActivityRecord {
    fn desired_entry(&self, _ctx: &RequeueContext) -> Option<DesiredEntry> {
        if self.intent.is_quarantined() || !self.intent.needs(ActivityWork::Upload) {
            return None;
        }
        Some(DesiredEntry {
            priority: priority::activity_priority(self.intent.is_interactive()),
            operation: Operation::UploadActivity {
                activity_id: self.activity_id,
            },
            stat_labels: vec![self.content.kind()],
        })
    }
}

impl Requeue for ViewpointRecord {
    fn desired_entry(&self, _ctx: &RequeueContext) -> Option<DesiredEntry> {
        if self.intent.is_quarantined() {
            return None;
        }
        let interactive = self.intent.is_interactive();
        let priority = self
            .intent
            .pending::<crate::storage::entities::ViewpointWork>()
            .into_iter()
            .map(|w| priority::viewpoint_priority(w, interactive))
            .min()?;
        Some(DesiredEntry {
            priority,
            operation: Operation::UpdateViewpoint {
                viewpoint_id: self.viewpoint_id,
            },
            stat_labels: Vec::new(),
        })
    }
}

/// 重新物化实体的日志条目并保存实体，返回队列状态是否变化
pub fn requeue<E: Requeue>(txn: &mut Txn<'_>, entity: &mut E, ctx: &RequeueContext) -> TxResult<bool> {
    let old = entity.queue_pointer();
    let old_record = match old {
        Some(p) => op_log::remove(txn, p.priority, p.sequence)?,
        None => None,
    };

    let new_pointer = match entity.desired_entry(ctx) {
        None => None,
        Some(desired) => {
            let reuse = old.filter(|p| match ctx.sequence_policy {
                SequencePolicy::ExactPriorityOnly => p.priority == desired.priority,
                SequencePolicy::PreserveOnDowngrade => p.priority <= desired.priority,
            });
            let (sequence, header) = match (reuse, old_record) {
                (Some(p), Some(old_record)) => (p.sequence, old_record.header),
                (Some(p), None) => (p.sequence, OperationHeader::new(txn.now_ms())),
                (None, _) => (txn.next_sequence()?, OperationHeader::new(txn.now_ms())),
            };
            let record = OperationRecord {
                header,
                operation: desired.operation,
                stats: split_stat_unit(&desired.stat_labels),
            };
            op_log::put(txn, desired.priority, sequence, &record)?;
            Some(QueuePointer {
                priority: desired.priority,
                sequence,
            })
        }
    };

    entity.set_queue_pointer(new_pointer);
    txn.put_entity(entity)?;

    let changed = old != new_pointer;
    if changed {
        debug!(entity = %entity.entity_ref(), ?old, new = ?new_pointer, "实体重新入队");
    }
    Ok(changed)
}

/// 记录一次终止性失败；第二次失败时隔离并发布事件
pub fn fail_unit<E: Requeue, W: WorkUnit>(
    txn: &mut Txn<'_>,
    entity: &mut E,
    unit: W,
    ctx: &RequeueContext,
) -> TxResult<FailureOutcome> {
    let outcome = entity.intent_mut().record_failure(unit);
    match outcome {
        FailureOutcome::Flagged => {
            warn!(entity = %entity.entity_ref(), unit = unit.name(), "工作单元失败，已设置 sticky error");
        }
        FailureOutcome::Quarantined => {
            warn!(entity = %entity.entity_ref(), unit = unit.name(), "同一工作单元第二次失败，实体进入隔离");
            txn.emit(SyncEvent::EntityQuarantined {
                target: entity.entity_ref(),
            });
        }
    }
    requeue(txn, entity, ctx)?;
    Ok(outcome)
}

/// 所需输入永久不可得时直接隔离
pub fn quarantine<E: Requeue>(
    txn: &mut Txn<'_>,
    entity: &mut E,
    ctx: &RequeueContext,
    reason: &str,
) -> TxResult<()> {
    if !entity.intent().is_quarantined() {
        warn!(entity = %entity.entity_ref(), reason, "实体进入隔离");
        entity.intent_mut().quarantine();
        txn.emit(SyncEvent::EntityQuarantined {
            target: entity.entity_ref(),
        });
    }
    requeue(txn, entity, ctx)?;
    Ok(())
}

/// 显式解除隔离：清除 sticky error 并重新入队
pub fn unquarantine<E: Requeue>(store: &KvStore, local_id: i64, ctx: &RequeueContext) -> Result<bool> {
    store.transact(|txn| {
        let Some(mut entity) = txn.get_entity::<E>(local_id)? else {
            return Ok(false);
        };
        if !entity.intent().is_quarantined() {
            return Ok(false);
        }
        entity.intent_mut().unquarantine();
        info!(entity = %entity.entity_ref(), "实体解除隔离");
        requeue(txn, &mut entity, ctx)?;
        Ok(true)
    })
}

/// 在一个事务中加载并重新入队某个实体
pub fn requeue_by_id<E: Requeue>(store: &KvStore, local_id: i64, ctx: &RequeueContext) -> Result<bool> {
    store.transact(|txn| match txn.get_entity::<E>(local_id)? {
        Some(mut entity) => requeue(txn, &mut entity, ctx),
        None => Ok(false),
    })
}

/// 策略变化后重建所有实体的日志条目，返回变化的实体数
pub fn requeue_all(store: &KvStore, ctx: &RequeueContext) -> Result<usize> {
    let mut changed = 0;
    changed += requeue_all_of::<PhotoRecord>(store, ctx)?;
    changed += requeue_all_of::<EpisodeRecord>(store, ctx)?;
    changed += requeue_all_of::<ActivityRecord>(store, ctx)?;
    changed += requeue_all_of::<ViewpointRecord>(store, ctx)?;
    info!(changed, "全部实体重新入队完成");
    Ok(changed)
}

fn requeue_all_of<E: Requeue>(store: &KvStore, ctx: &RequeueContext) -> Result<usize> {
    let mut changed = 0;
    for id in store.entity_ids::<E>()? {
        if requeue_by_id::<E>(store, id, ctx)? {
            changed += 1;
        }
    }
    Ok(changed)
}
