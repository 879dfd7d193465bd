//! 队列优先级
//!
//! 数值越小越先处理。优先级决定了实体在操作日志中的位置：
//! - UI 段（1..=9）：用户正在看或刚刚操作的内容，暂停后台同步时仍然允许
//! - 后台段（10..）：下载先于上传，原图放在最后
//!
//! 同一动作的交互式版本总是高于后台版本。

use serde::{Deserialize, Serialize};

use crate::queue::operation::OpFamily;
use crate::storage::entities::{PhotoWork, ViewpointWork};

pub const PRIORITY_UI_THUMBNAIL: u32 = 1;
pub const PRIORITY_UI_FULL: u32 = 2;
pub const PRIORITY_UI_ORIGINAL: u32 = 3;
pub const PRIORITY_UI_ACTIVITY: u32 = 4;
pub const PRIORITY_UI_UPLOAD_PHOTO: u32 = 5;
/// UI 段上界（包含）
pub const PRIORITY_UI_MAX: u32 = 9;

pub const PRIORITY_DOWNLOAD_THUMBNAIL: u32 = 10;
pub const PRIORITY_DOWNLOAD_FULL: u32 = 15;
pub const PRIORITY_UPDATE_VIEWPOINT: u32 = 20;
pub const PRIORITY_UPLOAD_ACTIVITY: u32 = 25;
pub const PRIORITY_UPLOAD_EPISODE: u32 = 30;
pub const PRIORITY_REMOVE_PHOTOS: u32 = 35;
pub const PRIORITY_UPDATE_PHOTO: u32 = 40;
/// 原图下载仅限 Wi-Fi（或用户显式允许蜂窝网络）
pub const PRIORITY_DOWNLOAD_ORIGINAL: u32 = 45;
pub const PRIORITY_UPLOAD_PHOTO: u32 = 50;
/// 只剩原图待上传的照片
pub const PRIORITY_UPLOAD_PHOTO_ORIGINAL: u32 = 60;

/// 用户可调的同步策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// 允许在蜂窝网络下后台上传照片
    pub cellular_uploads: bool,
    /// 允许在蜂窝网络下下载原图
    pub cellular_original_downloads: bool,
    /// 是否在云端保存原图；关闭后待上传的原图视为已满足
    pub store_originals: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            cellular_uploads: true,
            cellular_original_downloads: false,
            store_originals: true,
        }
    }
}

/// 物化时用于跳过整段优先级的策略视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandPolicy {
    pub on_wifi: bool,
    pub cellular_uploads: bool,
    pub cellular_original_downloads: bool,
}

impl BandPolicy {
    pub fn new(policy: &QueuePolicy, on_wifi: bool) -> Self {
        Self {
            on_wifi,
            cellular_uploads: policy.cellular_uploads,
            cellular_original_downloads: policy.cellular_original_downloads,
        }
    }

    pub fn unrestricted() -> Self {
        Self {
            on_wifi: true,
            cellular_uploads: true,
            cellular_original_downloads: true,
        }
    }

    /// 某个优先级段当前是否可以处理
    pub fn band_enabled(&self, priority: u32) -> bool {
        if self.on_wifi {
            return true;
        }
        match priority {
            PRIORITY_UPLOAD_PHOTO => self.cellular_uploads,
            PRIORITY_UPLOAD_PHOTO_ORIGINAL => false,
            PRIORITY_DOWNLOAD_ORIGINAL => self.cellular_original_downloads,
            _ => true,
        }
    }
}

pub fn is_ui_priority(priority: u32) -> bool {
    priority <= PRIORITY_UI_MAX
}

pub fn is_download_priority(priority: u32) -> bool {
    matches!(
        priority,
        PRIORITY_UI_THUMBNAIL
            | PRIORITY_UI_FULL
            | PRIORITY_UI_ORIGINAL
            | PRIORITY_DOWNLOAD_THUMBNAIL
            | PRIORITY_DOWNLOAD_FULL
            | PRIORITY_DOWNLOAD_ORIGINAL
    )
}

pub fn is_upload_priority(priority: u32) -> bool {
    matches!(
        priority,
        PRIORITY_UI_UPLOAD_PHOTO | PRIORITY_UPLOAD_PHOTO | PRIORITY_UPLOAD_PHOTO_ORIGINAL
    )
}

/// 照片工作单元的优先级与操作族
pub fn photo_unit(unit: PhotoWork, interactive: bool) -> (u32, OpFamily) {
    match unit {
        PhotoWork::DownloadThumbnail => (
            pick(interactive, PRIORITY_UI_THUMBNAIL, PRIORITY_DOWNLOAD_THUMBNAIL),
            OpFamily::DownloadPhoto,
        ),
        PhotoWork::DownloadFull => (
            pick(interactive, PRIORITY_UI_FULL, PRIORITY_DOWNLOAD_FULL),
            OpFamily::DownloadPhoto,
        ),
        PhotoWork::DownloadOriginal => (
            pick(interactive, PRIORITY_UI_ORIGINAL, PRIORITY_DOWNLOAD_ORIGINAL),
            OpFamily::DownloadPhoto,
        ),
        PhotoWork::UploadMetadata
        | PhotoWork::UploadThumbnail
        | PhotoWork::UploadMedium
        | PhotoWork::UploadFull => (
            pick(interactive, PRIORITY_UI_UPLOAD_PHOTO, PRIORITY_UPLOAD_PHOTO),
            OpFamily::UploadPhoto,
        ),
        PhotoWork::UploadOriginal => (PRIORITY_UPLOAD_PHOTO_ORIGINAL, OpFamily::UploadPhoto),
        PhotoWork::UpdateMetadata => (PRIORITY_UPDATE_PHOTO, OpFamily::UpdatePhoto),
        PhotoWork::Remove => (PRIORITY_REMOVE_PHOTOS, OpFamily::RemovePhotos),
    }
}

pub fn episode_priority(interactive: bool) -> u32 {
    pick(interactive, PRIORITY_UI_UPLOAD_PHOTO, PRIORITY_UPLOAD_EPISODE)
}

pub fn activity_priority(interactive: bool) -> u32 {
    pick(interactive, PRIORITY_UI_ACTIVITY, PRIORITY_UPLOAD_ACTIVITY)
}

pub fn viewpoint_priority(_unit: ViewpointWork, interactive: bool) -> u32 {
    pick(interactive, PRIORITY_UI_ACTIVITY, PRIORITY_UPDATE_VIEWPOINT)
}

fn pick(interactive: bool, ui: u32, background: u32) -> u32 {
    if interactive {
        ui
    } else {
        background
    }
}
