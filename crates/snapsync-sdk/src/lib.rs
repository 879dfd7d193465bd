//! SnapSync SDK - 照片分享客户端的离线操作队列与多队列网络调度
//!
//! 本 SDK 提供：
//! - 🗂️ 持久化的优先级操作日志（sled），进程重启后继续执行
//! - 🧠 实体意图状态机：业务层只修改意图位，日志条目由引擎维护
//! - 📡 Ping / Notification / Refresh / Sync 四个流量类别，各自独立退避
//! - ⚙️ 事件系统：隔离、网络降级、鉴权失效等信号
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use snapsync_sdk::{Collaborators, FsImageStore, SnapSyncConfig, SnapSyncSDK};
//! use snapsync_sdk::storage::entities::{PhotoRecord, PhotoWork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SnapSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .user_id("42")
//!         .api_base_url("https://api.example.com")
//!         .build();
//!
//!     let images = Arc::new(FsImageStore::new("/path/to/images")?);
//!     let sdk = SnapSyncSDK::initialize(config, Collaborators::with_images(images)).await?;
//!     sdk.set_authenticated(Some("session-token".to_string()))?;
//!
//!     // 标记需要下载缩略图，引擎负责排队、发送和重试
//!     let mut photo = PhotoRecord::new(1);
//!     photo.server_id = Some("p1".to_string());
//!     photo.intent.request(PhotoWork::DownloadThumbnail);
//!     sdk.save(&photo)?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod lifecycle;
pub mod net;
pub mod network;
pub mod queue;
pub mod runtime;
pub mod sdk;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use error::{Result, SnapSyncError};
pub use events::{EventManager, SyncEvent, UiPriorityLevel};
pub use lifecycle::AppLifecycle;
pub use net::sources::{
    AccountSource, Collaborators, FsImageStore, ImageLookup, ImageStore, NotificationSource, PingSource,
    PingStatus, RefreshSource, RefreshStep,
};
pub use net::{FailureClass, HttpTransport, NetRequest, NetResponse, RequestTag, TrafficClass, Transport, TransportError};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use queue::{OpFamily, QueuePolicy, SequencePolicy};
pub use runtime::{RuntimeSnapshot, SyncHandle, SyncRuntime};
pub use sdk::{QueueConfig, SnapSyncConfig, SnapSyncConfigBuilder, SnapSyncSDK};
pub use utils::init_tracing;
