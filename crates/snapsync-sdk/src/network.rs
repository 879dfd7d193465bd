use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::utils::time::{format_millis, now_millis};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 离线
    Offline,
    /// Wi-Fi（不受蜂窝流量策略限制）
    Wifi,
    /// 蜂窝网络
    Cellular,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, NetworkStatus::Offline)
    }

    pub fn is_wifi(&self) -> bool {
        matches!(self, NetworkStatus::Wifi)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 从离线恢复到任意在线状态
    pub fn regained_connectivity(&self) -> bool {
        !self.old_status.is_online() && self.new_status.is_online()
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Offline)),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                *current_status.write().await = event.new_status;
                let _ = status_sender.send(event);
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态（宿主自行探测时使用）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return;
        }
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        info!(
            "🌐 网络状态变化: {:?} -> {:?} at {}",
            old_status,
            new_status,
            format_millis(event.timestamp)
        );
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

/// 没有平台监听器时使用：状态只能通过 `set_status` 改变
#[derive(Debug)]
pub struct ManualNetworkListener {
    initial: NetworkStatus,
}

impl ManualNetworkListener {
    pub fn new(initial: NetworkStatus) -> Self {
        Self { initial }
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        self.initial
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (tx, rx) = broadcast::channel(1);
        // 发送端随函数返回而关闭，转发任务立即结束
        drop(tx);
        Ok(rx)
    }

    async fn stop_monitoring(&self) {}
}
