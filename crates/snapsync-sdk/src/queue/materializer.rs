//! 队列物化器（MaybeQueue*）
//!
//! 在某个操作族空闲时，从操作日志里找出该族下一个可处理的条目，
//! 解析出所有辅助输入（父 episode 的服务端 id、未过期的预签名地址、本地图片），
//! 生成一个可以直接发送的暂存操作放进 In-Flight 槽位。
//!
//! - 意图已满足或已隔离的实体：删除过期条目，继续下一个
//! - 输入永久不可得：隔离实体，继续下一个
//! - 输入需要异步计算（重算派生图片）：挂起，由调度方在计算完成后恢复
//! - 前置操作尚未完成（父 episode 没有服务端 id）：先暂存前置操作，返回 Yielded

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::SyncEvent;
use crate::net::sources::{ImageLookup, ImageStore};
use crate::queue::intent::{self, Requeue, RequeueContext};
use crate::queue::op_log::{self, OpLogEntry, OpLogIter};
use crate::queue::operation::{OpFamily, Operation, OperationHeader};
use crate::queue::priority::{self, BandPolicy};
use crate::queue::slots::InFlightSlots;
use crate::queue::staged::{
    photo_metadata_payload, PhotoUploadKind, StagedActivityUpload, StagedDownload,
    StagedEpisodeUpload, StagedKind, StagedOp, StagedPhotoRemoval, StagedPhotoUpdate,
    StagedPhotoUpload, StagedRequest, StagedViewpointUpdate,
};
use crate::storage::entities::{
    ActivityContent, ActivityRecord, ActivityWork, EpisodeRecord, EpisodeWork, ImageSize,
    PhotoRecord, PhotoWork, QueuePointer, ViewpointRecord, ViewpointWork, WorkUnit,
};
use crate::storage::kv::KvStore;
use crate::utils::time::now_millis;

/// 等待异步计算的物化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suspension {
    pub family: OpFamily,
    pub photo_id: i64,
    pub size: ImageSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// 槽位已填充
    Staged,
    /// 前置操作已暂存（或已在飞行），本族等它完成后再试
    Yielded { prerequisite: OpFamily },
    Suspended(Suspension),
    /// 没有可处理的条目
    Idle,
}

/// 单个条目的处理结果
enum Step {
    Stage(StagedKind),
    Skip,
    Yield(OpFamily),
    Suspend(Suspension),
}

pub struct Materializer<'a> {
    store: &'a KvStore,
    images: &'a dyn ImageStore,
    ctx: RequeueContext,
    band: BandPolicy,
}

impl<'a> Materializer<'a> {
    pub fn new(store: &'a KvStore, images: &'a dyn ImageStore, ctx: RequeueContext, band: BandPolicy) -> Self {
        Self {
            store,
            images,
            ctx,
            band,
        }
    }

    /// 为 `family` 暂存下一个操作；调用方保证该族槽位为空且没有挂起
    pub fn maybe_queue(
        &self,
        family: OpFamily,
        ceiling: Option<u32>,
        slots: &mut InFlightSlots,
    ) -> Result<StageOutcome> {
        let mut iter = OpLogIter::new(self.store.tree()).with_ceiling(ceiling);
        while let Some(entry) = iter.next() {
            let entry = entry?;
            if !self.band.band_enabled(entry.priority) {
                debug!(priority = entry.priority, "优先级段被策略禁用，跳过");
                iter.skip_to_next_priority(entry.priority);
                continue;
            }
            if entry.record.operation.family() != family {
                continue;
            }

            let step = match entry.record.operation {
                Operation::DownloadPhoto { photo_id } => self.stage_download(&entry, photo_id)?,
                Operation::UploadPhoto { photo_id } => self.stage_photo_upload(&entry, photo_id, slots)?,
                Operation::UploadEpisode { episode_id } => self.stage_episode(&entry, episode_id)?,
                Operation::UploadActivity { activity_id } => self.stage_activity(&entry, activity_id)?,
                Operation::UpdateViewpoint { viewpoint_id } => self.stage_viewpoint(&entry, viewpoint_id)?,
                Operation::UpdatePhoto { photo_id } => self.stage_photo_update(&entry, photo_id)?,
                Operation::RemovePhotos { photo_id } => self.stage_removal(&entry, photo_id)?,
            };

            match step {
                Step::Stage(kind) => {
                    let op = StagedOp::new(entry.record.header.clone(), entry.priority, kind);
                    self.publish_staged(&op);
                    slots.put(op);
                    return Ok(StageOutcome::Staged);
                }
                Step::Skip => continue,
                Step::Yield(prerequisite) => {
                    debug!(%family, %prerequisite, "等待前置操作");
                    return Ok(StageOutcome::Yielded { prerequisite });
                }
                Step::Suspend(suspension) => {
                    info!(%family, photo_id = suspension.photo_id, size = suspension.size.as_str(), "物化挂起，等待图片重算");
                    return Ok(StageOutcome::Suspended(suspension));
                }
            }
        }
        Ok(StageOutcome::Idle)
    }

    fn publish_staged(&self, op: &StagedOp) {
        debug!(family = %op.family(), target = %op.target(), priority = op.priority, "操作已暂存");
        self.store.events().emit(SyncEvent::OperationStaged {
            family: op.family(),
            target: op.target(),
            priority: op.priority,
        });
    }

    /// 载入条目对应的实体；实体缺失、已隔离或条目不是实体当前指针时清理并返回 None
    fn load_current<E: Requeue>(&self, entry: &OpLogEntry, local_id: i64) -> Result<Option<E>> {
        let pointer = QueuePointer {
            priority: entry.priority,
            sequence: entry.sequence,
        };
        match self.store.get_entity::<E>(local_id)? {
            Some(entity) if !entity.intent().is_quarantined() && entity.queue_pointer() == Some(pointer) => {
                Ok(Some(entity))
            }
            _ => {
                self.settle::<E>(entry, local_id)?;
                Ok(None)
            }
        }
    }

    /// 删除过期条目并按实体当前状态重新入队
    fn settle<E: Requeue>(&self, entry: &OpLogEntry, local_id: i64) -> Result<()> {
        let pointer = QueuePointer {
            priority: entry.priority,
            sequence: entry.sequence,
        };
        debug!(priority = entry.priority, sequence = entry.sequence, "清理过期条目");
        self.store.transact(|txn| {
            match txn.get_entity::<E>(local_id)? {
                Some(mut entity) => {
                    if entity.queue_pointer() != Some(pointer) {
                        op_log::remove(txn, pointer.priority, pointer.sequence)?;
                    }
                    intent::requeue(txn, &mut entity, &self.ctx)?;
                }
                None => {
                    op_log::remove(txn, pointer.priority, pointer.sequence)?;
                }
            }
            Ok(())
        })
    }

    fn quarantine<E: Requeue>(&self, local_id: i64, reason: &str) -> Result<()> {
        self.store.transact(|txn| {
            if let Some(mut entity) = txn.get_entity::<E>(local_id)? {
                intent::quarantine(txn, &mut entity, &self.ctx, reason)?;
            }
            Ok(())
        })
    }

    /// 修改实体后重新入队
    fn update<E, F>(&self, local_id: i64, mutate: F) -> Result<()>
    where
        E: Requeue,
        F: Fn(&mut E),
    {
        self.store.transact(|txn| {
            if let Some(mut entity) = txn.get_entity::<E>(local_id)? {
                mutate(&mut entity);
                intent::requeue(txn, &mut entity, &self.ctx)?;
            }
            Ok(())
        })
    }

    fn stage_download(&self, entry: &OpLogEntry, photo_id: i64) -> Result<Step> {
        let Some(photo) = self.load_current::<PhotoRecord>(entry, photo_id)? else {
            return Ok(Step::Skip);
        };
        let interactive = photo.intent.is_interactive();
        let unit = photo
            .intent
            .pending::<PhotoWork>()
            .into_iter()
            .filter(|w| w.is_download())
            .min_by_key(|w| priority::photo_unit(*w, interactive).0);
        let (Some(unit), Some(size)) = (unit, unit.and_then(|u| u.image_size())) else {
            self.settle::<PhotoRecord>(entry, photo_id)?;
            return Ok(Step::Skip);
        };
        let Some(server_id) = photo.server_id.clone() else {
            self.quarantine::<PhotoRecord>(photo_id, "download requested for photo without server id")?;
            return Ok(Step::Skip);
        };
        Ok(Step::Stage(StagedKind::DownloadPhoto(StagedDownload {
            photo_id,
            server_id,
            unit,
            size,
        })))
    }

    fn stage_photo_upload(&self, entry: &OpLogEntry, photo_id: i64, slots: &mut InFlightSlots) -> Result<Step> {
        let Some(photo) = self.load_current::<PhotoRecord>(entry, photo_id)? else {
            return Ok(Step::Skip);
        };
        let units: Vec<PhotoWork> = photo
            .effective_work(&self.ctx.policy)
            .into_iter()
            .filter(|w| w.is_upload())
            .collect();
        if units.is_empty() {
            self.settle::<PhotoRecord>(entry, photo_id)?;
            return Ok(Step::Skip);
        }

        let Some(episode_id) = photo.episode_id else {
            self.quarantine::<PhotoRecord>(photo_id, "photo has no parent episode")?;
            return Ok(Step::Skip);
        };
        let Some(episode) = self.store.get_entity::<EpisodeRecord>(episode_id)? else {
            self.quarantine::<PhotoRecord>(photo_id, "parent episode missing")?;
            return Ok(Step::Skip);
        };
        let episode_server_id = match episode.server_id.clone() {
            Some(id) => id,
            None if episode.intent.is_quarantined() => {
                self.quarantine::<PhotoRecord>(photo_id, "parent episode quarantined")?;
                return Ok(Step::Skip);
            }
            None => {
                self.stage_episode_prerequisite(episode_id, slots)?;
                return Ok(Step::Yield(OpFamily::UploadEpisode));
            }
        };

        let image_sizes: Vec<ImageSize> = units.iter().filter_map(|w| w.image_size()).collect();
        let metadata = || {
            Step::Stage(StagedKind::UploadPhoto(StagedPhotoUpload {
                photo_id,
                kind: PhotoUploadKind::Metadata {
                    payload: photo_metadata_payload(&photo, &episode_server_id, &image_sizes),
                },
            }))
        };
        if units.contains(&PhotoWork::UploadMetadata) {
            return Ok(metadata());
        }

        // 按 Thumbnail → Medium → Full → Original 的顺序上传
        let Some(size) = image_sizes.first().copied() else {
            self.settle::<PhotoRecord>(entry, photo_id)?;
            return Ok(Step::Skip);
        };
        let url = match photo.upload_urls.get(&size) {
            Some(url) if !url.is_expired(now_millis()) => url.url.clone(),
            _ => {
                info!(photo_id, size = size.as_str(), "预签名地址缺失或过期，重新上传元数据");
                self.update::<PhotoRecord, _>(photo_id, |p| p.intent.request(PhotoWork::UploadMetadata))?;
                return Ok(metadata());
            }
        };

        match self.images.lookup(photo_id, size) {
            ImageLookup::Ready => match self.images.load(photo_id, size) {
                Ok(data) => Ok(Step::Stage(StagedKind::UploadPhoto(StagedPhotoUpload {
                    photo_id,
                    kind: PhotoUploadKind::Image { size, url, data },
                }))),
                Err(e) => {
                    warn!(photo_id, size = size.as_str(), "读取本地图片失败: {}", e);
                    self.quarantine::<PhotoRecord>(photo_id, "local image unreadable")?;
                    Ok(Step::Skip)
                }
            },
            ImageLookup::NeedsRecompute => Ok(Step::Suspend(Suspension {
                family: OpFamily::UploadPhoto,
                photo_id,
                size,
            })),
            ImageLookup::Missing => {
                self.quarantine::<PhotoRecord>(photo_id, "local image missing")?;
                Ok(Step::Skip)
            }
        }
    }

    /// 照片上传前同步暂存父 episode 的上传
    fn stage_episode_prerequisite(&self, episode_id: i64, slots: &mut InFlightSlots) -> Result<()> {
        if !slots.is_empty(OpFamily::UploadEpisode) {
            return Ok(());
        }
        let ctx = self.ctx;
        let (episode, header) = self.store.transact(|txn| {
            let Some(mut episode) = txn.get_entity::<EpisodeRecord>(episode_id)? else {
                return Ok((None, None));
            };
            episode.intent.request(EpisodeWork::Upload);
            intent::requeue(txn, &mut episode, &ctx)?;
            let header = match episode.queue {
                Some(p) => op_log::get(txn, p.priority, p.sequence)?.map(|r| r.header),
                None => None,
            };
            Ok((Some(episode), header))
        })?;
        let Some(episode) = episode else {
            return Ok(());
        };
        let Some(payload) = self.episode_payload(&episode)? else {
            return Ok(());
        };
        let priority = episode.queue.map(|p| p.priority).unwrap_or_else(|| priority::episode_priority(false));
        let op = StagedOp::new(
            header.unwrap_or_else(|| OperationHeader::new(now_millis())),
            priority,
            StagedKind::UploadEpisode(StagedEpisodeUpload { episode_id, payload }),
        );
        self.publish_staged(&op);
        slots.put(op);
        Ok(())
    }

    /// episode 上传请求体；所属 viewpoint 不存在时隔离 episode 并返回 None
    fn episode_payload(&self, episode: &EpisodeRecord) -> Result<Option<serde_json::Value>> {
        let viewpoint_server_id = match episode.viewpoint_id {
            Some(vp_id) => match self.store.get_entity::<ViewpointRecord>(vp_id)? {
                Some(vp) => Some(vp.server_id),
                None => {
                    self.quarantine::<EpisodeRecord>(episode.episode_id, "episode viewpoint missing")?;
                    return Ok(None);
                }
            },
            None => None,
        };
        Ok(Some(json!({
            "client_episode_id": episode.episode_id,
            "episode_id": episode.server_id,
            "viewpoint_id": viewpoint_server_id,
            "timestamp": episode.timestamp,
        })))
    }

    fn stage_episode(&self, entry: &OpLogEntry, episode_id: i64) -> Result<Step> {
        let Some(episode) = self.load_current::<EpisodeRecord>(entry, episode_id)? else {
            return Ok(Step::Skip);
        };
        if !episode.intent.needs(EpisodeWork::Upload) {
            self.settle::<EpisodeRecord>(entry, episode_id)?;
            return Ok(Step::Skip);
        }
        match self.episode_payload(&episode)? {
            Some(payload) => Ok(Step::Stage(StagedKind::UploadEpisode(StagedEpisodeUpload {
                episode_id,
                payload,
            }))),
            None => Ok(Step::Skip),
        }
    }

    fn stage_activity(&self, entry: &OpLogEntry, activity_id: i64) -> Result<Step> {
        let Some(activity) = self.load_current::<ActivityRecord>(entry, activity_id)? else {
            return Ok(Step::Skip);
        };
        if !activity.intent.needs(ActivityWork::Upload) {
            self.settle::<ActivityRecord>(entry, activity_id)?;
            return Ok(Step::Skip);
        }

        let no_op = match &activity.content {
            ActivityContent::RemoveFollowers { user_ids } | ActivityContent::AddFollowers { user_ids } => {
                user_ids.is_empty()
            }
            _ => false,
        };
        if no_op {
            info!(activity_id, kind = activity.content.kind(), "活动没有任何目标用户，直接丢弃");
            self.update::<ActivityRecord, _>(activity_id, |a| a.intent.cancel(ActivityWork::Upload))?;
            return Ok(Step::Skip);
        }

        let Some(viewpoint) = self.store.get_entity::<ViewpointRecord>(activity.viewpoint_id)? else {
            self.quarantine::<ActivityRecord>(activity_id, "activity viewpoint missing")?;
            return Ok(Step::Skip);
        };

        // 引用的照片必须先有服务端元数据；已隔离的照片从请求中剔除
        let mut photo_server_ids = Vec::new();
        for photo_id in activity.content.photo_ids() {
            let Some(photo) = self.store.get_entity::<PhotoRecord>(*photo_id)? else {
                continue;
            };
            if photo.intent.is_quarantined() {
                continue;
            }
            if photo.intent.needs(PhotoWork::UploadMetadata) {
                return Ok(Step::Yield(OpFamily::UploadPhoto));
            }
            if let Some(server_id) = photo.server_id {
                photo_server_ids.push(server_id);
            }
        }
        let needs_photos = !activity.content.photo_ids().is_empty()
            && !matches!(activity.content, ActivityContent::ShareNew { .. });
        if needs_photos && photo_server_ids.is_empty() {
            info!(activity_id, kind = activity.content.kind(), "活动引用的照片均不可用，直接丢弃");
            self.update::<ActivityRecord, _>(activity_id, |a| a.intent.cancel(ActivityWork::Upload))?;
            return Ok(Step::Skip);
        }

        let mut payload = json!({
            "activity_id": activity.server_id,
            "viewpoint_id": viewpoint.server_id,
            "timestamp": activity.timestamp,
            "photo_ids": photo_server_ids,
        });
        match &activity.content {
            ActivityContent::ShareNew { contact_user_ids, .. } => {
                payload["contacts"] = json!(contact_user_ids);
                payload["viewpoint"] = json!({ "title": viewpoint.title, "labels": viewpoint.labels });
            }
            ActivityContent::AddFollowers { user_ids } | ActivityContent::RemoveFollowers { user_ids } => {
                payload["user_ids"] = json!(user_ids);
            }
            ActivityContent::PostComment { message } => {
                payload["message"] = json!(message);
            }
            ActivityContent::ShareExisting { .. }
            | ActivityContent::SavePhotos { .. }
            | ActivityContent::Unshare { .. } => {}
        }

        Ok(Step::Stage(StagedKind::UploadActivity(StagedActivityUpload {
            activity_id,
            kind: activity.content.kind(),
            payload,
        })))
    }

    fn stage_viewpoint(&self, entry: &OpLogEntry, viewpoint_id: i64) -> Result<Step> {
        let Some(viewpoint) = self.load_current::<ViewpointRecord>(entry, viewpoint_id)? else {
            return Ok(Step::Skip);
        };
        let units = viewpoint.intent.pending::<ViewpointWork>();
        if units.is_empty() {
            self.settle::<ViewpointRecord>(entry, viewpoint_id)?;
            return Ok(Step::Skip);
        }
        let mut payload = json!({ "viewpoint_id": viewpoint.server_id });
        for unit in &units {
            match unit {
                ViewpointWork::UpdateMetadata => payload["title"] = json!(viewpoint.title),
                ViewpointWork::UpdateFollower => payload["labels"] = json!(viewpoint.labels),
                ViewpointWork::UpdateViewedSeq => payload["viewed_seq"] = json!(viewpoint.viewed_seq),
            }
        }
        debug!(viewpoint_id, units = ?units.iter().map(|u| u.name()).collect::<Vec<_>>(), "暂存 viewpoint 更新");
        Ok(Step::Stage(StagedKind::UpdateViewpoint(StagedViewpointUpdate {
            viewpoint_id,
            units,
            revision: viewpoint.revision,
            payload,
        })))
    }

    fn stage_photo_update(&self, entry: &OpLogEntry, photo_id: i64) -> Result<Step> {
        let Some(photo) = self.load_current::<PhotoRecord>(entry, photo_id)? else {
            return Ok(Step::Skip);
        };
        if !photo.intent.needs(PhotoWork::UpdateMetadata) {
            self.settle::<PhotoRecord>(entry, photo_id)?;
            return Ok(Step::Skip);
        }
        let Some(server_id) = photo.server_id.clone() else {
            if photo.intent.needs(PhotoWork::UploadMetadata) {
                // 元数据上传会带上最新字段
                self.update::<PhotoRecord, _>(photo_id, |p| p.intent.cancel(PhotoWork::UpdateMetadata))?;
            } else {
                self.quarantine::<PhotoRecord>(photo_id, "update requested for photo without server id")?;
            }
            return Ok(Step::Skip);
        };
        Ok(Step::Stage(StagedKind::UpdatePhoto(StagedPhotoUpdate {
            photo_id,
            revision: photo.revision,
            payload: json!({
                "photo_id": server_id,
                "caption": photo.caption,
                "aspect_ratio": photo.aspect_ratio,
                "timestamp": photo.timestamp,
            }),
        })))
    }

    fn stage_removal(&self, entry: &OpLogEntry, photo_id: i64) -> Result<Step> {
        let Some(photo) = self.load_current::<PhotoRecord>(entry, photo_id)? else {
            return Ok(Step::Skip);
        };
        if !photo.intent.needs(PhotoWork::Remove) {
            self.settle::<PhotoRecord>(entry, photo_id)?;
            return Ok(Step::Skip);
        }
        let Some(server_id) = photo.server_id.clone() else {
            // 从未上传过，本地直接了结
            self.update::<PhotoRecord, _>(photo_id, |p| {
                for unit in PhotoWork::ALL {
                    p.intent.complete(*unit);
                }
            })?;
            return Ok(Step::Skip);
        };
        let episode_server_id = match photo.episode_id {
            Some(id) => self.store.get_entity::<EpisodeRecord>(id)?.and_then(|e| e.server_id),
            None => None,
        };
        Ok(Step::Stage(StagedKind::RemovePhotos(StagedPhotoRemoval {
            photo_id,
            payload: json!({
                "episodes": [{ "episode_id": episode_server_id, "photo_ids": [server_id] }],
            }),
        })))
    }

    /// 挂起的图片重算失败后隔离照片
    pub fn abandon_suspension(&self, suspension: &Suspension) -> Result<()> {
        self.quarantine::<PhotoRecord>(suspension.photo_id, "image recompute failed")
    }
}
