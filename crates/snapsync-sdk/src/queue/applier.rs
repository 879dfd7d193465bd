//! 响应落地
//!
//! 把一次暂存操作的请求结果写回本地状态。成功时合并服务端字段并清除意图位，
//! 终止性客户端错误与本地落地失败记录 sticky error，其他失败不触碰实体。
//! 返回最终生效的失败类别（None 表示成功），调度器据此决定槽位与退避。

use tracing::{debug, warn};

use crate::error::{Result, SnapSyncError};
use crate::net::retry_policy::{FailureClass, RequestOutcome};
use crate::net::sources::ImageStore;
use crate::queue::intent::RequeueContext;
use crate::queue::staged::{StagedOp, StagedRequest};
use crate::storage::entities::FailureOutcome;
use crate::storage::kv::KvStore;

pub struct Applier<'a> {
    store: &'a KvStore,
    images: &'a dyn ImageStore,
    ctx: RequeueContext,
}

impl<'a> Applier<'a> {
    pub fn new(store: &'a KvStore, images: &'a dyn ImageStore, ctx: RequeueContext) -> Self {
        Self { store, images, ctx }
    }

    pub fn apply(&self, op: &StagedOp, outcome: &RequestOutcome) -> Result<Option<FailureClass>> {
        match outcome {
            RequestOutcome::Success(response) => self.apply_success(op, response),
            RequestOutcome::Failed(class) => {
                self.apply_failure(op, *class)?;
                Ok(Some(*class))
            }
        }
    }

    fn apply_success(
        &self,
        op: &StagedOp,
        response: &crate::net::request::NetResponse,
    ) -> Result<Option<FailureClass>> {
        match op.persist_payload(response, self.images) {
            Ok(()) => {}
            Err(SnapSyncError::Protocol(msg)) => {
                warn!(family = %op.family(), target = %op.target(), "响应内容无效: {}", msg);
                return Ok(Some(FailureClass::Protocol));
            }
            Err(e) => {
                // 本地写入失败按终止性错误处理：第一次标记，第二次隔离
                warn!(family = %op.family(), target = %op.target(), "响应落地失败: {}", e);
                self.apply_failure(op, FailureClass::TerminalClient)?;
                return Ok(Some(FailureClass::TerminalClient));
            }
        }

        let ctx = self.ctx;
        match self.store.transact(|txn| op.on_success(txn, response, &ctx)) {
            Ok(()) => {
                debug!(family = %op.family(), target = %op.target(), "✅ 操作完成");
                Ok(None)
            }
            Err(SnapSyncError::Protocol(msg)) => {
                warn!(family = %op.family(), target = %op.target(), "响应格式不符合预期: {}", msg);
                Ok(Some(FailureClass::Protocol))
            }
            Err(e) => Err(e),
        }
    }

    fn apply_failure(&self, op: &StagedOp, class: FailureClass) -> Result<()> {
        if !class.marks_entity() {
            debug!(family = %op.family(), target = %op.target(), ?class, "请求失败，实体状态不变");
            return Ok(());
        }
        let ctx = self.ctx;
        let outcome = self.store.transact(|txn| op.on_failure(txn, &ctx))?;
        match outcome {
            FailureOutcome::Flagged => {
                warn!(family = %op.family(), target = %op.target(), "终止性错误，已标记，下一次失败将隔离")
            }
            FailureOutcome::Quarantined => {
                warn!(family = %op.family(), target = %op.target(), "终止性错误，实体已隔离")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventManager, SyncEvent};
    use crate::net::request::NetResponse;
    use crate::queue::intent;
    use crate::queue::op_log;
    use crate::queue::operation::OperationHeader;
    use crate::queue::priority::PRIORITY_UI_UPLOAD_PHOTO;
    use crate::queue::staged::{
        PhotoUploadKind, StagedDownload, StagedKind, StagedPhotoUpload, StagedViewpointUpdate,
    };
    use crate::storage::entities::{ImageSize, PhotoRecord, PhotoWork, ViewpointRecord, ViewpointWork};
    use crate::test_support::MemoryImages;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> KvStore {
        KvStore::temporary("u", Arc::new(EventManager::new(64))).unwrap()
    }

    fn save<E: intent::Requeue + Clone>(store: &KvStore, entity: E) {
        store
            .transact(|txn| intent::requeue(txn, &mut entity.clone(), &RequeueContext::default()))
            .unwrap();
    }

    fn thumbnail_upload(photo_id: i64) -> StagedOp {
        StagedOp::new(
            OperationHeader::new(0),
            PRIORITY_UI_UPLOAD_PHOTO,
            StagedKind::UploadPhoto(StagedPhotoUpload {
                photo_id,
                kind: PhotoUploadKind::Image {
                    size: ImageSize::Thumbnail,
                    url: "https://bucket.example/p1_tn".to_string(),
                    data: Bytes::from_static(b"tn"),
                },
            }),
        )
    }

    #[test]
    fn test_interactive_thumbnail_upload_success() {
        let store = store();
        let mut photo = PhotoRecord::new(1);
        photo.server_id = Some("p1".into());
        photo.intent.request(PhotoWork::UploadThumbnail);
        photo.intent.set_interactive(true);
        save(&store, photo);
        assert_eq!(store.stats().unwrap().count(PRIORITY_UI_UPLOAD_PHOTO), 1.0);

        let images = MemoryImages::default();
        let applier = Applier::new(&store, &images, RequeueContext::default());
        let result = applier
            .apply(&thumbnail_upload(1), &RequestOutcome::Success(NetResponse::new(200, "")))
            .unwrap();
        assert_eq!(result, None);

        let photo: PhotoRecord = store.get_entity(1).unwrap().unwrap();
        assert!(!photo.intent.needs(PhotoWork::UploadThumbnail));
        assert!(!photo.intent.is_interactive());
        assert!(photo.queue.is_none());
        assert_eq!(store.stats().unwrap().count(PRIORITY_UI_UPLOAD_PHOTO), 0.0);
        assert_eq!(op_log::len(store.tree()), 0);
    }

    #[test]
    fn test_malformed_metadata_response_is_protocol_failure() {
        let store = store();
        let mut photo = PhotoRecord::new(1);
        photo.intent.request(PhotoWork::UploadMetadata);
        save(&store, photo);

        let op = StagedOp::new(
            OperationHeader::new(0),
            50,
            StagedKind::UploadPhoto(StagedPhotoUpload {
                photo_id: 1,
                kind: PhotoUploadKind::Metadata { payload: json!({}) },
            }),
        );
        let images = MemoryImages::default();
        let applier = Applier::new(&store, &images, RequeueContext::default());
        let result = applier
            .apply(&op, &RequestOutcome::Success(NetResponse::new(200, "not json")))
            .unwrap();
        assert_eq!(result, Some(FailureClass::Protocol));

        // 不设置 sticky error，工作位保留
        let photo: PhotoRecord = store.get_entity(1).unwrap().unwrap();
        assert!(photo.intent.needs(PhotoWork::UploadMetadata));
        assert!(!photo.intent.has_error(PhotoWork::UploadMetadata));
    }

    #[test]
    fn test_terminal_failure_twice_quarantines_once() {
        let store = store();
        let mut vp = ViewpointRecord::new(5);
        vp.intent.request(ViewpointWork::UpdateMetadata);
        save(&store, vp);
        let mut events = store.events().subscribe();

        let op = StagedOp::new(
            OperationHeader::new(0),
            20,
            StagedKind::UpdateViewpoint(StagedViewpointUpdate {
                viewpoint_id: 5,
                units: vec![ViewpointWork::UpdateMetadata],
                revision: 0,
                payload: json!({}),
            }),
        );
        let images = MemoryImages::default();
        let applier = Applier::new(&store, &images, RequeueContext::default());
        let failed = RequestOutcome::Failed(FailureClass::TerminalClient);

        applier.apply(&op, &failed).unwrap();
        let vp: ViewpointRecord = store.get_entity(5).unwrap().unwrap();
        assert!(vp.intent.has_error(ViewpointWork::UpdateMetadata));
        assert!(!vp.intent.is_requested(ViewpointWork::UpdateMetadata));
        assert!(vp.intent.flags_exclusive());
        assert!(!vp.intent.is_quarantined());
        // 仍凭错误位排队，等待第二次尝试
        assert!(vp.queue.is_some());

        applier.apply(&op, &failed).unwrap();
        let vp: ViewpointRecord = store.get_entity(5).unwrap().unwrap();
        assert!(vp.intent.flags_exclusive());
        assert!(vp.intent.is_quarantined());
        assert!(vp.queue.is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::EntityQuarantined {
                target: crate::storage::entities::EntityRef::Viewpoint(5)
            }
        );
    }

    #[test]
    fn test_local_write_failure_marks_then_quarantines() {
        let store = store();
        let mut photo = PhotoRecord::new(4);
        photo.server_id = Some("p4".into());
        photo.intent.request(PhotoWork::DownloadFull);
        save(&store, photo);

        let op = StagedOp::new(
            OperationHeader::new(0),
            15,
            StagedKind::DownloadPhoto(StagedDownload {
                photo_id: 4,
                server_id: "p4".into(),
                unit: PhotoWork::DownloadFull,
                size: ImageSize::Full,
            }),
        );
        let images = MemoryImages::default();
        *images.fail_store.lock() = true;
        let applier = Applier::new(&store, &images, RequeueContext::default());
        let downloaded = RequestOutcome::Success(NetResponse::new(200, "jpeg"));

        assert_eq!(applier.apply(&op, &downloaded).unwrap(), Some(FailureClass::TerminalClient));
        let photo: PhotoRecord = store.get_entity(4).unwrap().unwrap();
        assert!(photo.intent.has_error(PhotoWork::DownloadFull));
        assert!(photo.intent.flags_exclusive());
        assert!(!photo.intent.is_quarantined());
        assert!(photo.queue.is_some());

        assert_eq!(applier.apply(&op, &downloaded).unwrap(), Some(FailureClass::TerminalClient));
        let photo: PhotoRecord = store.get_entity(4).unwrap().unwrap();
        assert!(photo.intent.is_quarantined());
        assert!(photo.queue.is_none());
        assert!(images.get(4, ImageSize::Full).is_none());
    }

    #[test]
    fn test_transient_failure_leaves_entity_untouched() {
        let store = store();
        let mut photo = PhotoRecord::new(1);
        photo.server_id = Some("p1".into());
        photo.intent.request(PhotoWork::UploadThumbnail);
        save(&store, photo.clone());
        let before: PhotoRecord = store.get_entity(1).unwrap().unwrap();

        let images = MemoryImages::default();
        let applier = Applier::new(&store, &images, RequeueContext::default());
        let result = applier
            .apply(&thumbnail_upload(1), &RequestOutcome::Failed(FailureClass::Transient))
            .unwrap();
        assert_eq!(result, Some(FailureClass::Transient));
        assert_eq!(store.get_entity::<PhotoRecord>(1).unwrap().unwrap(), before);
    }
}
