//! SnapSync SDK 入口
//!
//! 分层初始化：存储层 → 网络监控 → 调度器 → 运行时 → 生命周期。
//! 业务代码只需要修改实体的意图位并调用 [`SnapSyncSDK::save`]，
//! 调度与重试由运行时在后台完成。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SnapSyncError};
use crate::events::{EventManager, SyncEvent};
use crate::lifecycle::AppLifecycle;
use crate::net::backoff::BackoffConfig;
use crate::net::dispatcher::{Dispatcher, DispatcherConfig};
use crate::net::sources::Collaborators;
use crate::net::transport::{HttpTransport, HttpTransportConfig, Transport};
use crate::network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::queue::intent::{self, Requeue, RequeueContext, SequencePolicy};
use crate::queue::priority::QueuePolicy;
use crate::queue::stats::StatsMap;
use crate::runtime::{RuntimeSnapshot, SyncHandle, SyncRuntime};
use crate::storage::kv::KvStore;

/// 队列配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 优先级变化时的序号处理策略
    pub sequence_policy: SequencePolicy,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 连续失败多少次后发布 NetworkDegraded
    pub degraded_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sequence_policy: SequencePolicy::default(),
            event_buffer_size: 1000,
            degraded_threshold: 3,
        }
    }
}

/// SnapSync SDK 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapSyncConfig {
    /// 数据存储目录（KV 库位于 `{data_dir}/kv`）
    pub data_dir: PathBuf,
    /// 当前登录用户，每个用户一棵独立的 Tree
    pub user_id: String,
    /// API 服务地址
    pub api_base_url: String,
    /// 退避延迟上下限
    pub backoff: BackoffConfig,
    pub queue: QueueConfig,
    /// 用户同步策略
    pub policy: QueuePolicy,
    /// 单个请求超时（秒）
    pub request_timeout: u64,
    /// 连接超时（秒）
    pub connect_timeout: u64,
}

impl Default for SnapSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./snapsync_data"),
            user_id: String::new(),
            api_base_url: "https://localhost".to_string(),
            backoff: BackoffConfig::default(),
            queue: QueueConfig::default(),
            policy: QueuePolicy::default(),
            request_timeout: 60,
            connect_timeout: 10,
        }
    }
}

impl SnapSyncConfig {
    pub fn builder() -> SnapSyncConfigBuilder {
        SnapSyncConfigBuilder::new()
    }

    /// 从 JSON 文件加载；缺省字段使用默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SnapSyncError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: SnapSyncConfig = serde_json::from_str(&content)
            .map_err(|e| SnapSyncError::Config(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(SnapSyncError::Config("数据目录不能为空".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(SnapSyncError::Config("user_id 不能为空".to_string()));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(SnapSyncError::Config(format!(
                "api_base_url 必须是 http(s) 地址: {}",
                self.api_base_url
            )));
        }
        if self.backoff.min_delay.is_zero() || self.backoff.min_delay > self.backoff.max_delay {
            return Err(SnapSyncError::Config(format!(
                "退避延迟配置无效: min={:?} max={:?}",
                self.backoff.min_delay, self.backoff.max_delay
            )));
        }
        Ok(())
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            backoff: self.backoff,
            policy: self.policy,
            sequence_policy: self.queue.sequence_policy,
            degraded_threshold: self.queue.degraded_threshold,
        }
    }
}

pub struct SnapSyncConfigBuilder {
    config: SnapSyncConfig,
}

impl Default for SnapSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SnapSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    /// 设置退避延迟下限和上限
    pub fn backoff(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.config.backoff = BackoffConfig { min_delay, max_delay };
        self
    }

    pub fn sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.config.queue.sequence_policy = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.queue.event_buffer_size = size;
        self
    }

    pub fn degraded_threshold(mut self, failures: u32) -> Self {
        self.config.queue.degraded_threshold = failures;
        self
    }

    pub fn policy(mut self, policy: QueuePolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.config.request_timeout = secs;
        self
    }

    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.config.connect_timeout = secs;
        self
    }

    pub fn build(self) -> SnapSyncConfig {
        self.config
    }
}

/// SnapSync SDK
pub struct SnapSyncSDK {
    config: SnapSyncConfig,
    store: Arc<KvStore>,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    lifecycle: AppLifecycle,
    handle: SyncHandle,
    runtime: tokio::sync::Mutex<Option<SyncRuntime>>,
    /// 网络状态 → 调度器的转发任务
    network_forwarder: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// 默认 HTTP 传输（用于设置会话 token）；自定义传输时为 None
    http: Option<Arc<HttpTransport>>,
    /// 与调度器共享；写入期间持有读锁，策略切换不会与之交错
    requeue_ctx: Arc<RwLock<RequeueContext>>,
}

impl std::fmt::Debug for SnapSyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapSyncSDK")
            .field("user_id", &self.config.user_id)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl SnapSyncSDK {
    /// 使用 reqwest 传输初始化；网络状态由宿主通过 `set_network_status` 上报
    pub async fn initialize(config: SnapSyncConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let http = Arc::new(HttpTransport::new(&HttpTransportConfig {
            base_url: config.api_base_url.clone(),
            request_timeout: Duration::from_secs(config.request_timeout),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        })?);
        let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Wifi));
        Self::build(config, collaborators, http.clone(), Some(http), listener).await
    }

    /// 使用自定义传输和平台网络监听器初始化
    pub async fn initialize_with(
        config: SnapSyncConfig,
        collaborators: Collaborators,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Self::build(config, collaborators, transport, None, listener).await
    }

    #[instrument(skip_all, fields(user_id = %config.user_id))]
    async fn build(
        config: SnapSyncConfig,
        collaborators: Collaborators,
        transport: Arc<dyn Transport>,
        http: Option<Arc<HttpTransport>>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 SnapSyncSDK...");

        // === 第1层：存储 ===
        let events = Arc::new(EventManager::new(config.queue.event_buffer_size));
        let store = Arc::new(KvStore::open(&config.data_dir, &config.user_id, events.clone()).await?);
        let stats = store.rebuild_stats()?;
        info!(entries = stats.total(), "操作日志统计已重建");

        // === 第2层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(listener));
        network.start().await?;
        let initial_status = network.get_status().await;

        // === 第3层：调度器与运行时 ===
        let images = collaborators.images.clone();
        let mut dispatcher = Dispatcher::new(store.clone(), collaborators, config.dispatcher_config());
        dispatcher.set_network_status(initial_status);
        let requeue_ctx = dispatcher.shared_requeue_context();
        let runtime = SyncRuntime::spawn(store.clone(), dispatcher, transport, images);
        let handle = runtime.handle();

        let mut status_rx = network.subscribe();
        let forward_handle = handle.clone();
        let network_forwarder = tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok(event) => {
                        if forward_handle.set_network_status(event.new_status).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "网络状态事件积压");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("网络状态转发任务退出");
        });

        // === 第4层：生命周期 ===
        let lifecycle = AppLifecycle::new(handle.clone());

        let sdk = Arc::new(Self {
            config,
            store,
            events,
            network,
            lifecycle,
            handle,
            runtime: tokio::sync::Mutex::new(Some(runtime)),
            network_forwarder: parking_lot::Mutex::new(Some(network_forwarder)),
            http,
            requeue_ctx,
        });

        // 重启后立即尝试发送遗留的日志条目
        sdk.handle.dispatch()?;
        info!("✅ SnapSyncSDK 初始化完成 (network: {:?})", initial_status);
        Ok(sdk)
    }

    pub fn config(&self) -> &SnapSyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn handle(&self) -> &SyncHandle {
        &self.handle
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn requeue_context(&self) -> RequeueContext {
        *self.requeue_ctx.read()
    }

    /// 写入实体并同步它的日志条目（同一个事务）
    pub fn save<E: Requeue + Clone>(&self, entity: &E) -> Result<bool> {
        let ctx = self.requeue_ctx.read();
        self.store
            .transact(|txn| intent::requeue(txn, &mut entity.clone(), &ctx))
    }

    /// 按当前状态重建某个实体的日志条目
    pub fn requeue<E: Requeue>(&self, local_id: i64) -> Result<bool> {
        let ctx = self.requeue_ctx.read();
        intent::requeue_by_id::<E>(&self.store, local_id, &ctx)
    }

    /// 解除隔离：清除错误标记后重新入队
    pub fn unquarantine<E: Requeue>(&self, local_id: i64) -> Result<bool> {
        let ctx = self.requeue_ctx.read();
        intent::unquarantine::<E>(&self.store, local_id, &ctx)
    }

    /// 登录状态变化；token 只对默认 HTTP 传输生效
    pub fn set_authenticated(&self, token: Option<String>) -> Result<()> {
        let authenticated = token.is_some();
        if let Some(http) = &self.http {
            http.set_auth_token(token);
        }
        self.handle.set_authenticated(authenticated)
    }

    /// 宿主上报网络状态（没有平台监听器时使用）
    pub async fn set_network_status(&self, status: NetworkStatus) {
        self.network.set_status(status).await;
    }

    pub async fn network_status(&self) -> NetworkStatus {
        self.network.get_status().await
    }

    /// 更新同步策略并重建全部日志条目
    pub async fn set_policy(&self, policy: QueuePolicy) -> Result<usize> {
        let rebuilt = self.handle.set_policy(policy).await?;
        info!(rebuilt, "同步策略已更新: {:?}", policy);
        Ok(rebuilt)
    }

    pub fn set_first_scan_complete(&self) -> Result<()> {
        self.handle.set_first_scan_complete()
    }

    pub fn pause_non_interactive(&self) -> Result<()> {
        self.handle.pause_non_interactive()
    }

    pub fn resume_non_interactive(&self) -> Result<()> {
        self.handle.resume_non_interactive()
    }

    pub async fn on_app_foreground(&self) -> Result<()> {
        self.lifecycle.on_foreground().await
    }

    pub async fn on_app_background(&self) -> Result<()> {
        self.lifecycle.on_background().await
    }

    pub fn stats(&self) -> Result<StatsMap> {
        self.handle.stats()
    }

    pub fn download_count(&self) -> Result<f64> {
        self.handle.download_count()
    }

    pub fn upload_count(&self) -> Result<f64> {
        self.handle.upload_count()
    }

    pub fn network_count(&self) -> u32 {
        self.handle.network_count()
    }

    pub async fn snapshot(&self) -> Result<RuntimeSnapshot> {
        self.handle.snapshot().await
    }

    /// 排空飞行中的请求后停止运行时；重复调用是空操作
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 SnapSyncSDK...");
        let Some(runtime) = self.runtime.lock().await.take() else {
            debug!("SnapSyncSDK 已关闭");
            return Ok(());
        };
        if let Some(forwarder) = self.network_forwarder.lock().take() {
            forwarder.abort();
        }
        runtime.shutdown().await?;
        self.network.stop().await;
        info!("SnapSyncSDK 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sources::ImageStore;
    use crate::queue::priority::PRIORITY_UPLOAD_PHOTO;
    use crate::storage::entities::{EpisodeRecord, ImageSize, PhotoRecord, PhotoWork, PresignedUrl};
    use crate::test_support::{MemoryImages, ScriptedTransport};
    use tempfile::TempDir;

    #[test]
    fn test_builder_and_validation() {
        let config = SnapSyncConfig::builder()
            .data_dir("/tmp/snapsync")
            .user_id("42")
            .api_base_url("https://api.example")
            .backoff(Duration::from_secs(2), Duration::from_secs(60))
            .sequence_policy(SequencePolicy::PreserveOnDowngrade)
            .request_timeout(15)
            .build();
        config.validate().unwrap();
        assert_eq!(config.backoff.min_delay, Duration::from_secs(2));
        assert_eq!(config.queue.sequence_policy, SequencePolicy::PreserveOnDowngrade);
        assert_eq!(config.dispatcher_config().backoff.max_delay, Duration::from_secs(60));

        let missing_user = SnapSyncConfig::builder().api_base_url("https://api.example").build();
        assert!(matches!(missing_user.validate(), Err(SnapSyncError::Config(_))));

        let bad_backoff = SnapSyncConfig::builder()
            .user_id("42")
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert!(bad_backoff.validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapsync.json");
        std::fs::write(
            &path,
            r#"{"user_id": "7", "api_base_url": "https://api.example", "policy": {"cellular_uploads": false, "cellular_original_downloads": false, "store_originals": true}}"#,
        )
        .unwrap();

        let config = SnapSyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.user_id, "7");
        assert!(!config.policy.cellular_uploads);
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.queue.event_buffer_size, 1000);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SnapSyncConfig::from_json_file(&path),
            Err(SnapSyncError::Config(_))
        ));
    }

    async fn open_sdk(
        dir: &TempDir,
        images: Arc<MemoryImages>,
        status: NetworkStatus,
    ) -> (Arc<SnapSyncSDK>, Arc<ScriptedTransport>) {
        let config = SnapSyncConfig::builder()
            .data_dir(dir.path())
            .user_id("42")
            .api_base_url("https://api.example")
            .build();
        let transport = Arc::new(ScriptedTransport::default());
        let sdk = SnapSyncSDK::initialize_with(
            config,
            Collaborators::with_images(images as Arc<dyn ImageStore>),
            transport.clone(),
            Arc::new(ManualNetworkListener::new(status)),
        )
        .await
        .unwrap();
        (sdk, transport)
    }

    fn pending_photo() -> (EpisodeRecord, PhotoRecord) {
        let mut episode = EpisodeRecord::new(1);
        episode.server_id = Some("e1".into());
        let mut photo = PhotoRecord::new(5);
        photo.episode_id = Some(1);
        photo.server_id = Some("p5".into());
        photo.upload_urls.insert(
            ImageSize::Thumbnail,
            PresignedUrl {
                url: "https://bucket.example/p5_tn".into(),
                expires_at: i64::MAX,
            },
        );
        photo.intent.request(PhotoWork::UploadThumbnail);
        (episode, photo)
    }

    #[tokio::test]
    async fn test_save_uploads_after_login() {
        let dir = TempDir::new().unwrap();
        let images = Arc::new(MemoryImages::default());
        images.put(5, ImageSize::Thumbnail, b"jpeg");
        let (sdk, transport) = open_sdk(&dir, images, NetworkStatus::Wifi).await;
        let mut events = sdk.subscribe_events();

        let (episode, photo) = pending_photo();
        sdk.save(&episode).unwrap();
        sdk.save(&photo).unwrap();
        assert_eq!(sdk.stats().unwrap().count(PRIORITY_UPLOAD_PHOTO), 1.0);
        assert_eq!(sdk.upload_count().unwrap(), 1.0);

        // 未登录时不发送
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_count(), 0);

        sdk.set_authenticated(Some("token".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SyncEvent::RequestFinished { success: true, .. } = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(transport.sent_count(), 1);
        assert_eq!(sdk.upload_count().unwrap(), 0.0);
        let stored: PhotoRecord = sdk.store().get_entity(5).unwrap().unwrap();
        assert!(!stored.intent.needs(PhotoWork::UploadThumbnail));

        sdk.on_app_foreground().await.unwrap();
        sdk.on_app_background().await.unwrap();
        sdk.shutdown().await.unwrap();
        sdk.shutdown().await.unwrap();
        assert!(sdk.set_first_scan_complete().is_err());
    }

    #[tokio::test]
    async fn test_offline_status_reaches_dispatcher() {
        let dir = TempDir::new().unwrap();
        let images = Arc::new(MemoryImages::default());
        images.put(5, ImageSize::Thumbnail, b"jpeg");
        let (sdk, transport) = open_sdk(&dir, images, NetworkStatus::Offline).await;
        assert_eq!(sdk.network_status().await, NetworkStatus::Offline);
        sdk.set_authenticated(Some("token".into())).unwrap();

        let (episode, photo) = pending_photo();
        sdk.save(&episode).unwrap();
        sdk.save(&photo).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_count(), 0);

        let mut events = sdk.subscribe_events();
        sdk.set_network_status(NetworkStatus::Wifi).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SyncEvent::RequestFinished { success: true, .. } = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.sent_count(), 1);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_policy_updates_save_context_immediately() {
        let dir = TempDir::new().unwrap();
        let images = Arc::new(MemoryImages::default());
        let (sdk, _transport) = open_sdk(&dir, images, NetworkStatus::Cellular).await;
        let policy = QueuePolicy {
            cellular_uploads: false,
            ..Default::default()
        };
        sdk.set_policy(policy).await.unwrap();
        // 调度器返回时新策略已对 save 可见
        assert_eq!(sdk.requeue_context().policy, policy);
        sdk.shutdown().await.unwrap();
    }
}
