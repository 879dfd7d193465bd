//! 测试用的内存协作方与脚本化传输

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, SnapSyncError};
use crate::net::request::{HttpMethod, NetRequest, NetResponse, RequestTag, TransportError};
use crate::net::sources::{
    AccountSource, Collaborators, ImageLookup, ImageStore, NotificationSource, PingSource, PingStatus,
    RefreshSource, RefreshStep,
};
use crate::net::transport::Transport;
use crate::queue::intent::{self, RequeueContext};
use crate::storage::entities::{EpisodeRecord, ImageSize, PhotoRecord, PhotoWork, PresignedUrl};
use crate::storage::kv::KvStore;

/// 写入已上传的 episode 1 和一张等待上传 `unit` 的照片（地址有效，图片已缓存）
pub fn seed_photo_upload(
    store: &KvStore,
    images: &MemoryImages,
    ctx: &RequeueContext,
    photo_id: i64,
    unit: PhotoWork,
    interactive: bool,
) {
    let size = unit.image_size().expect("image upload unit");
    let mut episode = EpisodeRecord::new(1);
    episode.server_id = Some("e1".into());

    let mut photo = PhotoRecord::new(photo_id);
    photo.episode_id = Some(1);
    photo.server_id = Some(format!("p{}", photo_id));
    photo.upload_urls.insert(
        size,
        PresignedUrl {
            url: format!("https://bucket.example/p{}_{}", photo_id, size.as_str()),
            expires_at: i64::MAX,
        },
    );
    photo.intent.request(unit);
    photo.intent.set_interactive(interactive);

    images.put(photo_id, size, b"jpeg");
    store
        .transact(|txn| {
            intent::requeue(txn, &mut episode.clone(), ctx)?;
            intent::requeue(txn, &mut photo.clone(), ctx)
        })
        .unwrap();
}

/// 内存图片缓存；存在原图时其他尺寸可以"重算"
#[derive(Debug, Default)]
pub struct MemoryImages {
    images: Mutex<HashMap<(i64, ImageSize), Bytes>>,
    /// 为 true 时重算总是失败
    pub fail_recompute: Mutex<bool>,
    /// 为 true 时写入缓存总是失败
    pub fail_store: Mutex<bool>,
}

impl MemoryImages {
    pub fn put(&self, photo_id: i64, size: ImageSize, data: &'static [u8]) {
        self.images.lock().insert((photo_id, size), Bytes::from_static(data));
    }

    pub fn clear(&self, photo_id: i64, size: ImageSize) {
        self.images.lock().remove(&(photo_id, size));
    }

    pub fn get(&self, photo_id: i64, size: ImageSize) -> Option<Bytes> {
        self.images.lock().get(&(photo_id, size)).cloned()
    }
}

#[async_trait]
impl ImageStore for MemoryImages {
    fn lookup(&self, photo_id: i64, size: ImageSize) -> ImageLookup {
        let images = self.images.lock();
        if images.contains_key(&(photo_id, size)) {
            ImageLookup::Ready
        } else if size != ImageSize::Original && images.contains_key(&(photo_id, ImageSize::Original)) {
            ImageLookup::NeedsRecompute
        } else {
            ImageLookup::Missing
        }
    }

    fn load(&self, photo_id: i64, size: ImageSize) -> Result<Bytes> {
        self.get(photo_id, size)
            .ok_or_else(|| SnapSyncError::NotFound(format!("image {} {}", photo_id, size.as_str())))
    }

    fn store(&self, photo_id: i64, size: ImageSize, data: &[u8]) -> Result<()> {
        if *self.fail_store.lock() {
            return Err(SnapSyncError::IO("disk full".to_string()));
        }
        self.images
            .lock()
            .insert((photo_id, size), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn recompute(&self, photo_id: i64, size: ImageSize) -> Result<()> {
        if *self.fail_recompute.lock() {
            return Err(SnapSyncError::NotFound("recompute disabled".to_string()));
        }
        let original = self.load(photo_id, ImageSize::Original)?;
        self.images.lock().insert((photo_id, size), original);
        Ok(())
    }
}

/// 按队列吐出请求的宿主协作方
#[derive(Debug, Default)]
pub struct ScriptedSources {
    pings: Mutex<VecDeque<NetRequest>>,
    notifications: Mutex<VecDeque<NetRequest>>,
    refresh: Mutex<HashMap<RefreshStep, VecDeque<NetRequest>>>,
    metadata: Mutex<VecDeque<NetRequest>>,
    contacts: Mutex<VecDeque<NetRequest>>,
    logs: Mutex<VecDeque<NetRequest>>,
    /// 已处理响应的请求标签
    pub handled: Mutex<Vec<RequestTag>>,
}

impl ScriptedSources {
    pub fn collaborators(self: &Arc<Self>, images: Arc<dyn ImageStore>) -> Collaborators {
        Collaborators {
            ping: self.clone(),
            notifications: self.clone(),
            refresh: self.clone(),
            account: self.clone(),
            images,
        }
    }

    pub fn push_ping(&self) {
        self.pings
            .lock()
            .push_back(NetRequest::new(RequestTag::Ping, HttpMethod::Get, "/service/ping"));
    }

    pub fn push_notification(&self) {
        self.notifications.lock().push_back(NetRequest::new(
            RequestTag::Notification,
            HttpMethod::Post,
            "/service/query_notifications",
        ));
    }

    pub fn push_refresh(&self, step: RefreshStep) {
        self.refresh.lock().entry(step).or_default().push_back(NetRequest::new(
            RequestTag::Refresh(step),
            HttpMethod::Post,
            format!("/service/refresh/{:?}", step).to_lowercase(),
        ));
    }

    pub fn push_metadata(&self) {
        self.metadata.lock().push_back(NetRequest::new(
            RequestTag::AccountMetadata,
            HttpMethod::Post,
            "/service/update_device",
        ));
    }

    pub fn push_contacts(&self) {
        self.contacts.lock().push_back(NetRequest::new(
            RequestTag::Contacts,
            HttpMethod::Post,
            "/service/upload_contacts",
        ));
    }

    pub fn push_log(&self) {
        self.logs.lock().push_back(NetRequest::new(
            RequestTag::LogUpload { urgent: false },
            HttpMethod::Put,
            "/service/upload_log",
        ));
    }
}

impl PingSource for ScriptedSources {
    fn next_request(&self) -> Option<NetRequest> {
        self.pings.lock().pop_front()
    }

    fn handle_response(&self, response: &NetResponse) -> Result<PingStatus> {
        self.handled.lock().push(RequestTag::Ping);
        let object = response
            .json_object()
            .ok_or_else(|| SnapSyncError::Protocol("ping body".to_string()))?;
        Ok(PingStatus {
            network_allowed: object
                .get("network_allowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        })
    }
}

impl NotificationSource for ScriptedSources {
    fn next_request(&self) -> Option<NetRequest> {
        self.notifications.lock().pop_front()
    }

    fn handle_response(&self, _response: &NetResponse) -> Result<()> {
        self.handled.lock().push(RequestTag::Notification);
        Ok(())
    }
}

impl RefreshSource for ScriptedSources {
    fn next_request(&self, step: RefreshStep) -> Option<NetRequest> {
        self.refresh.lock().get_mut(&step).and_then(|q| q.pop_front())
    }

    fn handle_response(&self, step: RefreshStep, _response: &NetResponse) -> Result<()> {
        self.handled.lock().push(RequestTag::Refresh(step));
        Ok(())
    }
}

impl AccountSource for ScriptedSources {
    fn log_upload_request(&self, urgent: bool) -> Option<NetRequest> {
        self.logs.lock().pop_front().map(|mut r| {
            r.tag = RequestTag::LogUpload { urgent };
            r
        })
    }

    fn metadata_request(&self) -> Option<NetRequest> {
        self.metadata.lock().pop_front()
    }

    fn contacts_request(&self) -> Option<NetRequest> {
        self.contacts.lock().pop_front()
    }

    fn handle_response(&self, tag: RequestTag, _response: &NetResponse) -> Result<()> {
        self.handled.lock().push(tag);
        Ok(())
    }
}

/// 按顺序返回预设结果的传输；脚本耗尽后返回 200 空响应
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<std::result::Result<NetResponse, TransportError>>>,
    pub sent: Mutex<Vec<NetRequest>>,
}

impl ScriptedTransport {
    pub fn push(&self, response: std::result::Result<NetResponse, TransportError>) {
        self.responses.lock().push_back(response);
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(NetResponse::new(status, "")));
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: NetRequest) -> std::result::Result<NetResponse, TransportError> {
        self.sent.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(NetResponse::new(200, "")))
    }
}
