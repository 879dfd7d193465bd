//! 可同步实体
//!
//! 这里只保留同步核心关心的字段：意图位（work / sticky error / quarantine）、
//! 队列指针、服务端 id，以及构造请求所需的少量元数据。其余业务字段属于外部表。

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// 实体在操作日志中的位置（从 QueueEntry 反规范化而来）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuePointer {
    pub priority: u32,
    pub sequence: u64,
}

/// 指向某个实体的引用（用于事件与日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Photo(i64),
    Episode(i64),
    Activity(i64),
    Viewpoint(i64),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Photo(id) => write!(f, "photo:{}", id),
            EntityRef::Episode(id) => write!(f, "episode:{}", id),
            EntityRef::Activity(id) => write!(f, "activity:{}", id),
            EntityRef::Viewpoint(id) => write!(f, "viewpoint:{}", id),
        }
    }
}

/// 一个具名的工作单元，对应 IntentState 中的一位
pub trait WorkUnit: Copy + Eq + Debug + 'static {
    const ALL: &'static [Self];

    fn bit(self) -> u32;

    fn name(self) -> &'static str;
}

/// 单次失败后的意图状态迁移结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// 第一次失败：工作位转为 sticky error，实体凭错误位再试一次
    Flagged,
    /// 同一工作单元第二次失败：实体进入隔离
    Quarantined,
}

/// 嵌入在每个实体记录中的意图状态
///
/// - work: 待完成的工作位
/// - errors: sticky error 位，只有对应工作成功完成才会清除
/// - quarantined: 终止态，不再参与调度，直到显式解除
/// - interactive: UI 触发的工作，优先级高于同类后台工作
///
/// 同一工作单元的 work 位与 error 位互斥；两者任一置位都表示该单元仍未完成。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentState {
    work: u32,
    errors: u32,
    quarantined: bool,
    interactive: bool,
}

impl IntentState {
    /// 该单元仍未完成（首次尝试或失败一次后的重试）
    pub fn needs<W: WorkUnit>(&self, unit: W) -> bool {
        (self.work | self.errors) & unit.bit() != 0
    }

    /// 只看工作位
    pub fn is_requested<W: WorkUnit>(&self, unit: W) -> bool {
        self.work & unit.bit() != 0
    }

    pub fn has_error<W: WorkUnit>(&self, unit: W) -> bool {
        self.errors & unit.bit() != 0
    }

    pub fn has_any_work(&self) -> bool {
        (self.work | self.errors) != 0
    }

    pub fn flags_exclusive(&self) -> bool {
        self.work & self.errors == 0
    }

    /// 业务逻辑决定需要同步时调用；已有 sticky error 的单元保持错误位
    pub fn request<W: WorkUnit>(&mut self, unit: W) {
        if !self.has_error(unit) {
            self.work |= unit.bit();
        }
    }

    /// 仅在服务端确认成功后调用：同时清除工作位和对应的 sticky error
    pub fn complete<W: WorkUnit>(&mut self, unit: W) {
        self.work &= !unit.bit();
        self.errors &= !unit.bit();
    }

    /// 取消尚未开始的工作（例如请求本身已无意义）
    pub fn cancel<W: WorkUnit>(&mut self, unit: W) {
        self.work &= !unit.bit();
        self.errors &= !unit.bit();
    }

    /// 记录一次终止性客户端错误
    pub fn record_failure<W: WorkUnit>(&mut self, unit: W) -> FailureOutcome {
        if self.has_error(unit) {
            self.quarantined = true;
            FailureOutcome::Quarantined
        } else {
            self.work &= !unit.bit();
            self.errors |= unit.bit();
            FailureOutcome::Flagged
        }
    }

    pub fn quarantine(&mut self) {
        self.quarantined = true;
    }

    /// 解除隔离：sticky error 全部转回工作位，重新获得两次机会
    pub fn unquarantine(&mut self) {
        self.quarantined = false;
        self.work |= self.errors;
        self.errors = 0;
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// 当前待完成的工作单元（按 W::ALL 的顺序）
    pub fn pending<W: WorkUnit>(&self) -> Vec<W> {
        W::ALL.iter().copied().filter(|w| self.needs(*w)).collect()
    }
}

/// 图片尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImageSize {
    Thumbnail,
    Medium,
    Full,
    Original,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::Thumbnail => "tn",
            ImageSize::Medium => "med",
            ImageSize::Full => "full",
            ImageSize::Original => "orig",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhotoWork {
    DownloadThumbnail,
    DownloadFull,
    DownloadOriginal,
    UploadMetadata,
    UploadThumbnail,
    UploadMedium,
    UploadFull,
    UploadOriginal,
    UpdateMetadata,
    Remove,
}

impl WorkUnit for PhotoWork {
    const ALL: &'static [Self] = &[
        PhotoWork::DownloadThumbnail,
        PhotoWork::DownloadFull,
        PhotoWork::DownloadOriginal,
        PhotoWork::UploadMetadata,
        PhotoWork::UploadThumbnail,
        PhotoWork::UploadMedium,
        PhotoWork::UploadFull,
        PhotoWork::UploadOriginal,
        PhotoWork::UpdateMetadata,
        PhotoWork::Remove,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    fn name(self) -> &'static str {
        match self {
            PhotoWork::DownloadThumbnail => "download_thumbnail",
            PhotoWork::DownloadFull => "download_full",
            PhotoWork::DownloadOriginal => "download_original",
            PhotoWork::UploadMetadata => "upload_metadata",
            PhotoWork::UploadThumbnail => "upload_thumbnail",
            PhotoWork::UploadMedium => "upload_medium",
            PhotoWork::UploadFull => "upload_full",
            PhotoWork::UploadOriginal => "upload_original",
            PhotoWork::UpdateMetadata => "update_metadata",
            PhotoWork::Remove => "remove",
        }
    }
}

impl PhotoWork {
    pub fn download(size: ImageSize) -> Option<Self> {
        match size {
            ImageSize::Thumbnail => Some(PhotoWork::DownloadThumbnail),
            ImageSize::Full => Some(PhotoWork::DownloadFull),
            ImageSize::Original => Some(PhotoWork::DownloadOriginal),
            ImageSize::Medium => None,
        }
    }

    pub fn upload(size: ImageSize) -> Self {
        match size {
            ImageSize::Thumbnail => PhotoWork::UploadThumbnail,
            ImageSize::Medium => PhotoWork::UploadMedium,
            ImageSize::Full => PhotoWork::UploadFull,
            ImageSize::Original => PhotoWork::UploadOriginal,
        }
    }

    /// 上传/下载图片类工作对应的尺寸
    pub fn image_size(self) -> Option<ImageSize> {
        match self {
            PhotoWork::DownloadThumbnail | PhotoWork::UploadThumbnail => Some(ImageSize::Thumbnail),
            PhotoWork::UploadMedium => Some(ImageSize::Medium),
            PhotoWork::DownloadFull | PhotoWork::UploadFull => Some(ImageSize::Full),
            PhotoWork::DownloadOriginal | PhotoWork::UploadOriginal => Some(ImageSize::Original),
            _ => None,
        }
    }

    pub fn is_download(self) -> bool {
        matches!(
            self,
            PhotoWork::DownloadThumbnail | PhotoWork::DownloadFull | PhotoWork::DownloadOriginal
        )
    }

    pub fn is_upload(self) -> bool {
        matches!(
            self,
            PhotoWork::UploadMetadata
                | PhotoWork::UploadThumbnail
                | PhotoWork::UploadMedium
                | PhotoWork::UploadFull
                | PhotoWork::UploadOriginal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpisodeWork {
    Upload,
}

impl WorkUnit for EpisodeWork {
    const ALL: &'static [Self] = &[EpisodeWork::Upload];

    fn bit(self) -> u32 {
        1
    }

    fn name(self) -> &'static str {
        "upload_episode"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityWork {
    Upload,
}

impl WorkUnit for ActivityWork {
    const ALL: &'static [Self] = &[ActivityWork::Upload];

    fn bit(self) -> u32 {
        1
    }

    fn name(self) -> &'static str {
        "upload_activity"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewpointWork {
    UpdateMetadata,
    UpdateFollower,
    UpdateViewedSeq,
}

impl WorkUnit for ViewpointWork {
    const ALL: &'static [Self] = &[
        ViewpointWork::UpdateMetadata,
        ViewpointWork::UpdateFollower,
        ViewpointWork::UpdateViewedSeq,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    fn name(self) -> &'static str {
        match self {
            ViewpointWork::UpdateMetadata => "update_metadata",
            ViewpointWork::UpdateFollower => "update_follower_metadata",
            ViewpointWork::UpdateViewedSeq => "update_viewed_seq",
        }
    }
}

/// 预签名的对象存储上传地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    /// 过期时间（UTC 毫秒）
    pub expires_at: i64,
}

impl PresignedUrl {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub photo_id: i64,
    pub server_id: Option<String>,
    pub episode_id: Option<i64>,
    pub timestamp: f64,
    pub caption: Option<String>,
    pub aspect_ratio: Option<f64>,
    /// 每次业务修改递增，用于判断飞行中的更新是否过期
    pub revision: u64,
    pub upload_urls: BTreeMap<ImageSize, PresignedUrl>,
    pub intent: IntentState,
    pub queue: Option<QueuePointer>,
}

impl PhotoRecord {
    pub fn new(photo_id: i64) -> Self {
        Self {
            photo_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_id: i64,
    pub server_id: Option<String>,
    pub viewpoint_id: Option<i64>,
    pub timestamp: f64,
    pub photo_ids: Vec<i64>,
    pub intent: IntentState,
    pub queue: Option<QueuePointer>,
}

impl EpisodeRecord {
    pub fn new(episode_id: i64) -> Self {
        Self {
            episode_id,
            ..Default::default()
        }
    }
}

/// 活动内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityContent {
    ShareNew { photo_ids: Vec<i64>, contact_user_ids: Vec<u64> },
    ShareExisting { photo_ids: Vec<i64> },
    AddFollowers { user_ids: Vec<u64> },
    PostComment { message: String },
    RemoveFollowers { user_ids: Vec<u64> },
    SavePhotos { photo_ids: Vec<i64> },
    Unshare { photo_ids: Vec<i64> },
}

impl ActivityContent {
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityContent::ShareNew { .. } => "share_new",
            ActivityContent::ShareExisting { .. } => "share_existing",
            ActivityContent::AddFollowers { .. } => "add_followers",
            ActivityContent::PostComment { .. } => "post_comment",
            ActivityContent::RemoveFollowers { .. } => "remove_followers",
            ActivityContent::SavePhotos { .. } => "save_photos",
            ActivityContent::Unshare { .. } => "unshare",
        }
    }

    /// 活动引用的照片（需要先上传元数据）
    pub fn photo_ids(&self) -> &[i64] {
        match self {
            ActivityContent::ShareNew { photo_ids, .. }
            | ActivityContent::ShareExisting { photo_ids }
            | ActivityContent::SavePhotos { photo_ids }
            | ActivityContent::Unshare { photo_ids } => photo_ids,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: i64,
    pub server_id: String,
    pub viewpoint_id: i64,
    pub timestamp: f64,
    pub content: ActivityContent,
    /// 服务端确认的时间戳
    pub server_timestamp: Option<f64>,
    pub intent: IntentState,
    pub queue: Option<QueuePointer>,
}

impl ActivityRecord {
    pub fn new(activity_id: i64, viewpoint_id: i64, content: ActivityContent) -> Self {
        Self {
            activity_id,
            server_id: format!("a{}", activity_id),
            viewpoint_id,
            timestamp: 0.0,
            content,
            server_timestamp: None,
            intent: IntentState::default(),
            queue: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewpointRecord {
    pub viewpoint_id: i64,
    pub server_id: String,
    pub title: Option<String>,
    pub labels: Vec<String>,
    pub viewed_seq: u64,
    pub revision: u64,
    pub intent: IntentState,
    pub queue: Option<QueuePointer>,
}

impl ViewpointRecord {
    pub fn new(viewpoint_id: i64) -> Self {
        Self {
            viewpoint_id,
            server_id: format!("v{}", viewpoint_id),
            ..Default::default()
        }
    }
}
