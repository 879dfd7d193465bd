//! 宿主协作方
//!
//! 调度器只关心"下一次要发什么"与"响应如何落地"，具体请求构造与响应解析由宿主实现。
//! 所有方法都在调度上下文中同步调用（图片重算除外），实现不应阻塞。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SnapSyncError};
use crate::net::request::{NetRequest, NetResponse, RequestTag};
use crate::storage::entities::ImageSize;

/// 元数据追赶的步骤，严格按声明顺序执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefreshStep {
    Notifications,
    User,
    /// 仅在首次本地内容扫描完成后执行
    Episodes,
    Contacts,
}

impl RefreshStep {
    pub const ALL: [RefreshStep; 4] = [
        RefreshStep::Notifications,
        RefreshStep::User,
        RefreshStep::Episodes,
        RefreshStep::Contacts,
    ];
}

/// ping 响应携带的网络指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingStatus {
    /// 服务端是否允许客户端继续发起其他流量
    pub network_allowed: bool,
}

pub trait PingSource: Send + Sync {
    fn next_request(&self) -> Option<NetRequest> {
        None
    }

    fn handle_response(&self, _response: &NetResponse) -> Result<PingStatus> {
        Ok(PingStatus {
            network_allowed: true,
        })
    }
}

pub trait NotificationSource: Send + Sync {
    fn next_request(&self) -> Option<NetRequest> {
        None
    }

    fn handle_response(&self, _response: &NetResponse) -> Result<()> {
        Ok(())
    }
}

pub trait RefreshSource: Send + Sync {
    fn next_request(&self, _step: RefreshStep) -> Option<NetRequest> {
        None
    }

    fn handle_response(&self, _step: RefreshStep, _response: &NetResponse) -> Result<()> {
        Ok(())
    }
}

/// 账号相关的 Sync 类请求：诊断日志、设备/订阅元数据、联系人
pub trait AccountSource: Send + Sync {
    fn log_upload_request(&self, _urgent: bool) -> Option<NetRequest> {
        None
    }

    fn metadata_request(&self) -> Option<NetRequest> {
        None
    }

    fn contacts_request(&self) -> Option<NetRequest> {
        None
    }

    fn handle_response(&self, _tag: RequestTag, _response: &NetResponse) -> Result<()> {
        Ok(())
    }
}

/// 本地图片缓存的查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLookup {
    Ready,
    /// 可以从原图重新生成，需要异步计算
    NeedsRecompute,
    /// 永久不可得
    Missing,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    fn lookup(&self, photo_id: i64, size: ImageSize) -> ImageLookup;

    fn load(&self, photo_id: i64, size: ImageSize) -> Result<Bytes>;

    fn store(&self, photo_id: i64, size: ImageSize, data: &[u8]) -> Result<()>;

    /// 重新生成派生尺寸，在调度上下文之外执行
    async fn recompute(&self, photo_id: i64, size: ImageSize) -> Result<()>;
}

/// 什么都不做的协作方
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSource;

impl PingSource for IdleSource {}
impl NotificationSource for IdleSource {}
impl RefreshSource for IdleSource {}
impl AccountSource for IdleSource {}

/// 基于文件系统的图片缓存：`{root}/{photo_id}_{size}.jpg`
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, photo_id: i64, size: ImageSize) -> PathBuf {
        self.root.join(format!("{}_{}.jpg", photo_id, size.as_str()))
    }
}

/// 派生尺寸的最长边；原图不缩放
fn max_edge(size: ImageSize) -> Option<u32> {
    match size {
        ImageSize::Thumbnail => Some(120),
        ImageSize::Medium => Some(480),
        ImageSize::Full => Some(960),
        ImageSize::Original => None,
    }
}

/// 横图以宽对标 max_edge，竖图以高对标，另一边等比缩放；不放大
fn scale_to_max_edge(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width.max(1), height.max(1));
    }
    if width >= height {
        let new_w = width.min(max_edge);
        let new_h = ((height as u64) * (new_w as u64) / (width as u64)) as u32;
        (new_w, new_h.max(1))
    } else {
        let new_h = height.min(max_edge);
        let new_w = ((width as u64) * (new_h as u64) / (height as u64)) as u32;
        (new_w.max(1), new_h)
    }
}

/// 从原图生成派生尺寸并写入 output_path（JPEG），返回 (width, height)
fn resample_sync(source_path: &Path, output_path: &Path, max_edge: u32, quality: u8) -> Result<(u32, u32)> {
    use image::codecs::jpeg::JpegEncoder;
    use image::ImageReader;
    use std::io::BufWriter;

    let img = ImageReader::open(source_path)
        .map_err(|e| SnapSyncError::IO(format!("打开原图失败: {}", e)))?
        .with_guessed_format()
        .map_err(|e| SnapSyncError::IO(format!("识别图片格式失败: {}", e)))?
        .decode()
        .map_err(|e| SnapSyncError::InvalidData(format!("解码原图失败: {}", e)))?;

    let (target_w, target_h) = scale_to_max_edge(img.width(), img.height(), max_edge);
    let resized = img.resize_exact(target_w, target_h, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // 先写临时文件再改名，lookup 不会看到写了一半的图片
    let tmp_path = output_path.with_extension("jpg.tmp");
    let file = std::fs::File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)
        .map_err(|e| SnapSyncError::IO(format!("写入派生图片失败: {}", e)))?;
    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp_path, output_path)?;

    Ok((rgb.width(), rgb.height()))
}

#[async_trait]
impl ImageStore for FsImageStore {
    fn lookup(&self, photo_id: i64, size: ImageSize) -> ImageLookup {
        if self.path(photo_id, size).is_file() {
            ImageLookup::Ready
        } else if size != ImageSize::Original && self.path(photo_id, ImageSize::Original).is_file() {
            ImageLookup::NeedsRecompute
        } else {
            ImageLookup::Missing
        }
    }

    fn load(&self, photo_id: i64, size: ImageSize) -> Result<Bytes> {
        Ok(Bytes::from(std::fs::read(self.path(photo_id, size))?))
    }

    fn store(&self, photo_id: i64, size: ImageSize, data: &[u8]) -> Result<()> {
        std::fs::write(self.path(photo_id, size), data)?;
        Ok(())
    }

    async fn recompute(&self, photo_id: i64, size: ImageSize) -> Result<()> {
        let Some(edge) = max_edge(size) else {
            return Err(SnapSyncError::InvalidArgument("原图不能重算".to_string()));
        };
        let source = self.path(photo_id, ImageSize::Original);
        if !source.is_file() {
            return Err(SnapSyncError::NotFound(format!("photo {} 没有原图", photo_id)));
        }
        let output = self.path(photo_id, size);
        let (w, h) = tokio::task::spawn_blocking(move || resample_sync(&source, &output, edge, 85))
            .await
            .map_err(|e| SnapSyncError::IO(format!("重算任务异常退出: {}", e)))??;
        debug!(photo_id, size = size.as_str(), width = w, height = h, "🖼️ 派生图片已生成");
        Ok(())
    }
}

/// 调度器使用的全部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub ping: Arc<dyn PingSource>,
    pub notifications: Arc<dyn NotificationSource>,
    pub refresh: Arc<dyn RefreshSource>,
    pub account: Arc<dyn AccountSource>,
    pub images: Arc<dyn ImageStore>,
}

impl Collaborators {
    /// 只有图片缓存，其余协作方空闲
    pub fn with_images(images: Arc<dyn ImageStore>) -> Self {
        Self {
            ping: Arc::new(IdleSource),
            notifications: Arc::new(IdleSource),
            refresh: Arc::new(IdleSource),
            account: Arc::new(IdleSource),
            images,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
