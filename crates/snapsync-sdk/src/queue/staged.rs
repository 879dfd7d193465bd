//! 暂存操作
//!
//! 物化器产出的、可以直接发送的请求。每个操作族一个结构体，
//! 统一实现 `StagedRequest`：构造请求、成功落地、终止性失败处理。
//! `StagedOp` 是封闭的枚举，按族分派，保证匹配穷尽。

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, SnapSyncError, TxResult};
use crate::net::request::{HttpMethod, NetRequest, NetResponse, RequestTag};
use crate::net::sources::ImageStore;
use crate::queue::intent::{self, RequeueContext};
use crate::queue::operation::{OpFamily, OperationHeader};
use crate::storage::entities::{
    ActivityRecord, ActivityWork, EntityRef, EpisodeRecord, EpisodeWork, FailureOutcome,
    ImageSize, PhotoRecord, PhotoWork, PresignedUrl, ViewpointRecord, ViewpointWork,
};
use crate::storage::txn::Txn;

pub trait StagedRequest {
    fn family(&self) -> OpFamily;

    fn target(&self) -> EntityRef;

    fn build_request(&self) -> NetRequest;

    /// 事务外的落地步骤（例如把下载的图片写入缓存），在 `on_success` 之前执行
    fn persist_payload(&self, _response: &NetResponse, _images: &dyn ImageStore) -> Result<()> {
        Ok(())
    }

    /// 在响应事务中合并服务端字段、清除意图位并重新入队
    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()>;

    /// 终止性客户端错误：记录 sticky error，第二次隔离
    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome>;
}

fn parse_object(response: &NetResponse) -> std::result::Result<serde_json::Map<String, Value>, SnapSyncError> {
    response
        .json_object()
        .ok_or_else(|| SnapSyncError::Protocol("response body is not a JSON object".to_string()))
}

fn parse_as<T: for<'de> Deserialize<'de>>(response: &NetResponse) -> std::result::Result<T, SnapSyncError> {
    let object = parse_object(response)?;
    serde_json::from_value(Value::Object(object))
        .map_err(|e| SnapSyncError::Protocol(format!("unexpected response shape: {}", e)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedDownload {
    pub photo_id: i64,
    pub server_id: String,
    pub unit: PhotoWork,
    pub size: ImageSize,
}

impl StagedRequest for StagedDownload {
    fn family(&self) -> OpFamily {
        OpFamily::DownloadPhoto
    }

    fn target(&self) -> EntityRef {
        EntityRef::Photo(self.photo_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::DownloadPhoto),
            HttpMethod::Get,
            format!("/photos/{}/{}", self.server_id, self.size.as_str()),
        )
    }

    fn persist_payload(&self, response: &NetResponse, images: &dyn ImageStore) -> Result<()> {
        if response.body.is_empty() {
            return Err(SnapSyncError::Protocol("empty image body".to_string()));
        }
        images.store(self.photo_id, self.size, &response.body)
    }

    fn on_success(&self, txn: &mut Txn<'_>, _response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        let Some(mut photo) = txn.get_entity::<PhotoRecord>(self.photo_id)? else {
            return Ok(());
        };
        photo.intent.complete(self.unit);
        if !photo.intent.pending::<PhotoWork>().iter().any(|w| w.is_download()) {
            photo.intent.set_interactive(false);
        }
        intent::requeue(txn, &mut photo, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        fail_photo(txn, self.photo_id, self.unit, ctx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhotoUploadKind {
    /// 上传元数据，响应返回服务端 id 与各尺寸的预签名地址
    Metadata { payload: Value },
    /// 直接 PUT 到对象存储
    Image {
        size: ImageSize,
        url: String,
        data: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedPhotoUpload {
    pub photo_id: i64,
    pub kind: PhotoUploadKind,
}

impl StagedPhotoUpload {
    fn unit(&self) -> PhotoWork {
        match &self.kind {
            PhotoUploadKind::Metadata { .. } => PhotoWork::UploadMetadata,
            PhotoUploadKind::Image { size, .. } => PhotoWork::upload(*size),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadMetadataResponse {
    photo_id: String,
    #[serde(default)]
    upload_urls: std::collections::BTreeMap<String, PresignedUrl>,
}

fn size_from_str(s: &str) -> Option<ImageSize> {
    [
        ImageSize::Thumbnail,
        ImageSize::Medium,
        ImageSize::Full,
        ImageSize::Original,
    ]
    .into_iter()
    .find(|size| size.as_str() == s)
}

impl StagedRequest for StagedPhotoUpload {
    fn family(&self) -> OpFamily {
        OpFamily::UploadPhoto
    }

    fn target(&self) -> EntityRef {
        EntityRef::Photo(self.photo_id)
    }

    fn build_request(&self) -> NetRequest {
        let tag = RequestTag::Staged(OpFamily::UploadPhoto);
        match &self.kind {
            PhotoUploadKind::Metadata { payload } => {
                NetRequest::new(tag, HttpMethod::Post, "/service/upload_photo").json(payload.clone())
            }
            PhotoUploadKind::Image { url, data, .. } => NetRequest::new(tag, HttpMethod::Put, url.clone())
                .header("Content-Type", "image/jpeg")
                .bytes(data.clone()),
        }
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        let parsed = match &self.kind {
            PhotoUploadKind::Metadata { .. } => Some(parse_as::<UploadMetadataResponse>(response)?),
            PhotoUploadKind::Image { .. } => None,
        };
        let Some(mut photo) = txn.get_entity::<PhotoRecord>(self.photo_id)? else {
            return Ok(());
        };
        match &self.kind {
            PhotoUploadKind::Metadata { .. } => {
                if let Some(parsed) = parsed {
                    // 服务端 id 一旦设置不再覆盖
                    if photo.server_id.is_none() {
                        photo.server_id = Some(parsed.photo_id);
                    }
                    for (name, url) in parsed.upload_urls {
                        if let Some(size) = size_from_str(&name) {
                            photo.upload_urls.insert(size, url);
                        }
                    }
                }
                photo.intent.complete(PhotoWork::UploadMetadata);
            }
            PhotoUploadKind::Image { size, .. } => {
                photo.upload_urls.remove(size);
                photo.intent.complete(PhotoWork::upload(*size));
            }
        }
        if !photo.intent.pending::<PhotoWork>().iter().any(|w| w.is_upload()) {
            photo.intent.set_interactive(false);
        }
        intent::requeue(txn, &mut photo, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        if let PhotoUploadKind::Image { size, .. } = &self.kind {
            // 地址可能已失效，下次暂存时重新获取
            if let Some(mut photo) = txn.get_entity::<PhotoRecord>(self.photo_id)? {
                photo.upload_urls.remove(size);
                txn.put_entity(&photo)?;
            }
        }
        fail_photo(txn, self.photo_id, self.unit(), ctx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedEpisodeUpload {
    pub episode_id: i64,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct UploadEpisodeResponse {
    episode_id: String,
}

impl StagedRequest for StagedEpisodeUpload {
    fn family(&self) -> OpFamily {
        OpFamily::UploadEpisode
    }

    fn target(&self) -> EntityRef {
        EntityRef::Episode(self.episode_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::UploadEpisode),
            HttpMethod::Post,
            "/service/upload_episode",
        )
        .json(self.payload.clone())
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        let parsed: UploadEpisodeResponse = parse_as(response)?;
        let Some(mut episode) = txn.get_entity::<EpisodeRecord>(self.episode_id)? else {
            return Ok(());
        };
        if episode.server_id.is_none() {
            episode.server_id = Some(parsed.episode_id);
        }
        episode.intent.complete(EpisodeWork::Upload);
        intent::requeue(txn, &mut episode, ctx)?;

        // 等待父 episode 的照片现在可以上传了
        for photo_id in &episode.photo_ids {
            if let Some(mut photo) = txn.get_entity::<PhotoRecord>(*photo_id)? {
                intent::requeue(txn, &mut photo, ctx)?;
            }
        }
        debug!(episode_id = self.episode_id, photos = episode.photo_ids.len(), "episode 已上传");
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        match txn.get_entity::<EpisodeRecord>(self.episode_id)? {
            Some(mut episode) => intent::fail_unit(txn, &mut episode, EpisodeWork::Upload, ctx),
            None => Ok(FailureOutcome::Flagged),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedActivityUpload {
    pub activity_id: i64,
    pub kind: &'static str,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct UploadActivityResponse {
    #[serde(default)]
    timestamp: Option<f64>,
}

impl StagedRequest for StagedActivityUpload {
    fn family(&self) -> OpFamily {
        OpFamily::UploadActivity
    }

    fn target(&self) -> EntityRef {
        EntityRef::Activity(self.activity_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::UploadActivity),
            HttpMethod::Post,
            format!("/service/{}", self.kind),
        )
        .json(self.payload.clone())
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        let parsed: UploadActivityResponse = parse_as(response)?;
        let Some(mut activity) = txn.get_entity::<ActivityRecord>(self.activity_id)? else {
            return Ok(());
        };
        if activity.server_timestamp.is_none() {
            activity.server_timestamp = parsed.timestamp;
        }
        activity.intent.complete(ActivityWork::Upload);
        intent::requeue(txn, &mut activity, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        match txn.get_entity::<ActivityRecord>(self.activity_id)? {
            Some(mut activity) => intent::fail_unit(txn, &mut activity, ActivityWork::Upload, ctx),
            None => Ok(FailureOutcome::Flagged),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedViewpointUpdate {
    pub viewpoint_id: i64,
    pub units: Vec<ViewpointWork>,
    /// 暂存时的实体版本，飞行期间被修改则保留工作位
    pub revision: u64,
    pub payload: Value,
}

impl StagedRequest for StagedViewpointUpdate {
    fn family(&self) -> OpFamily {
        OpFamily::UpdateViewpoint
    }

    fn target(&self) -> EntityRef {
        EntityRef::Viewpoint(self.viewpoint_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::UpdateViewpoint),
            HttpMethod::Post,
            "/service/update_viewpoint",
        )
        .json(self.payload.clone())
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        parse_object(response)?;
        let Some(mut viewpoint) = txn.get_entity::<ViewpointRecord>(self.viewpoint_id)? else {
            return Ok(());
        };
        if viewpoint.revision == self.revision {
            for unit in &self.units {
                viewpoint.intent.complete(*unit);
            }
            viewpoint.intent.set_interactive(false);
        } else {
            info!(
                viewpoint_id = self.viewpoint_id,
                staged = self.revision,
                current = viewpoint.revision,
                "viewpoint 在请求期间被修改，保留待更新标记"
            );
        }
        intent::requeue(txn, &mut viewpoint, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        let Some(mut viewpoint) = txn.get_entity::<ViewpointRecord>(self.viewpoint_id)? else {
            return Ok(FailureOutcome::Flagged);
        };
        let mut outcome = FailureOutcome::Flagged;
        for unit in &self.units {
            if viewpoint.intent.record_failure(*unit) == FailureOutcome::Quarantined {
                outcome = FailureOutcome::Quarantined;
            }
        }
        if outcome == FailureOutcome::Quarantined {
            txn.emit(crate::events::SyncEvent::EntityQuarantined {
                target: EntityRef::Viewpoint(self.viewpoint_id),
            });
        }
        intent::requeue(txn, &mut viewpoint, ctx)?;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedPhotoUpdate {
    pub photo_id: i64,
    pub revision: u64,
    pub payload: Value,
}

impl StagedRequest for StagedPhotoUpdate {
    fn family(&self) -> OpFamily {
        OpFamily::UpdatePhoto
    }

    fn target(&self) -> EntityRef {
        EntityRef::Photo(self.photo_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::UpdatePhoto),
            HttpMethod::Post,
            "/service/update_photo",
        )
        .json(self.payload.clone())
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        parse_object(response)?;
        let Some(mut photo) = txn.get_entity::<PhotoRecord>(self.photo_id)? else {
            return Ok(());
        };
        if photo.revision == self.revision {
            photo.intent.complete(PhotoWork::UpdateMetadata);
        }
        intent::requeue(txn, &mut photo, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        fail_photo(txn, self.photo_id, PhotoWork::UpdateMetadata, ctx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedPhotoRemoval {
    pub photo_id: i64,
    pub payload: Value,
}

impl StagedRequest for StagedPhotoRemoval {
    fn family(&self) -> OpFamily {
        OpFamily::RemovePhotos
    }

    fn target(&self) -> EntityRef {
        EntityRef::Photo(self.photo_id)
    }

    fn build_request(&self) -> NetRequest {
        NetRequest::new(
            RequestTag::Staged(OpFamily::RemovePhotos),
            HttpMethod::Post,
            "/service/remove_photos",
        )
        .json(self.payload.clone())
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        parse_object(response)?;
        let Some(mut photo) = txn.get_entity::<PhotoRecord>(self.photo_id)? else {
            return Ok(());
        };
        // 已移除的照片不再需要任何同步
        for unit in photo.intent.pending::<PhotoWork>() {
            photo.intent.complete(unit);
        }
        intent::requeue(txn, &mut photo, ctx)?;
        Ok(())
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        fail_photo(txn, self.photo_id, PhotoWork::Remove, ctx)
    }
}

fn fail_photo(
    txn: &mut Txn<'_>,
    photo_id: i64,
    unit: PhotoWork,
    ctx: &RequeueContext,
) -> TxResult<FailureOutcome> {
    match txn.get_entity::<PhotoRecord>(photo_id)? {
        Some(mut photo) => intent::fail_unit(txn, &mut photo, unit, ctx),
        None => Ok(FailureOutcome::Flagged),
    }
}

/// 一个已暂存、可直接发送的操作
#[derive(Debug, Clone, PartialEq)]
pub enum StagedKind {
    DownloadPhoto(StagedDownload),
    UploadPhoto(StagedPhotoUpload),
    UploadEpisode(StagedEpisodeUpload),
    UploadActivity(StagedActivityUpload),
    UpdateViewpoint(StagedViewpointUpdate),
    UpdatePhoto(StagedPhotoUpdate),
    RemovePhotos(StagedPhotoRemoval),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedOp {
    pub header: OperationHeader,
    pub priority: u32,
    pub kind: StagedKind,
}

impl StagedOp {
    pub fn new(header: OperationHeader, priority: u32, kind: StagedKind) -> Self {
        Self {
            header,
            priority,
            kind,
        }
    }

    fn inner(&self) -> &dyn StagedRequest {
        match &self.kind {
            StagedKind::DownloadPhoto(op) => op,
            StagedKind::UploadPhoto(op) => op,
            StagedKind::UploadEpisode(op) => op,
            StagedKind::UploadActivity(op) => op,
            StagedKind::UpdateViewpoint(op) => op,
            StagedKind::UpdatePhoto(op) => op,
            StagedKind::RemovePhotos(op) => op,
        }
    }
}

impl StagedRequest for StagedOp {
    fn family(&self) -> OpFamily {
        self.inner().family()
    }

    fn target(&self) -> EntityRef {
        self.inner().target()
    }

    fn build_request(&self) -> NetRequest {
        self.inner()
            .build_request()
            .header("X-Operation-Id", self.header.op_id.clone())
            .header("X-Client-Timestamp", self.header.client_timestamp_ms.to_string())
    }

    fn persist_payload(&self, response: &NetResponse, images: &dyn ImageStore) -> Result<()> {
        self.inner().persist_payload(response, images)
    }

    fn on_success(&self, txn: &mut Txn<'_>, response: &NetResponse, ctx: &RequeueContext) -> TxResult<()> {
        self.inner().on_success(txn, response, ctx)
    }

    fn on_failure(&self, txn: &mut Txn<'_>, ctx: &RequeueContext) -> TxResult<FailureOutcome> {
        self.inner().on_failure(txn, ctx)
    }
}

/// 照片元数据上传的请求体
pub fn photo_metadata_payload(photo: &PhotoRecord, episode_server_id: &str, sizes: &[ImageSize]) -> Value {
    json!({
        "episode_id": episode_server_id,
        "client_photo_id": photo.photo_id,
        "photo_id": photo.server_id,
        "timestamp": photo.timestamp,
        "caption": photo.caption,
        "aspect_ratio": photo.aspect_ratio,
        "sizes": sizes.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    })
}
