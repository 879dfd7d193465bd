//! 事件系统模块 - 同步引擎对外发布的信号
//!
//! 功能包括：
//! - 操作已暂存 / 请求结束
//! - 实体隔离（单条目错误标记）
//! - 网络降级提示、鉴权失效
//! - 退避调度、排空完成
//! - 事件广播和回调监听
//!
//! 监听器在调用前先做快照（copy-on-notify），监听器内部再增删监听器不会影响本次通知。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::net::TrafficClass;
use crate::queue::operation::OpFamily;
use crate::storage::entities::EntityRef;

/// UI 优先级可用的粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiPriorityLevel {
    /// 只有全尺寸图片级别的 UI 请求
    FullResolution,
    /// 任意 UI 触发的请求
    Everything,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 某个族的操作进入 In-Flight 槽位
    OperationStaged {
        family: OpFamily,
        target: EntityRef,
        priority: u32,
    },
    /// 某个流量类别的请求结束
    RequestFinished {
        class: TrafficClass,
        success: bool,
    },
    /// 实体被隔离，UI 显示单条目错误标记
    EntityQuarantined { target: EntityRef },
    /// 网络状况不佳，UI 显示临时系统横幅
    NetworkDegraded { class: TrafficClass, failures: u32 },
    UiPriorityAvailable { level: UiPriorityLevel },
    AuthRequired,
    BackoffScheduled { class: TrafficClass, delay: Duration },
    /// 排空模式下最后一个请求结束
    Drained,
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::OperationStaged { .. } => "operation_staged",
            SyncEvent::RequestFinished { .. } => "request_finished",
            SyncEvent::EntityQuarantined { .. } => "entity_quarantined",
            SyncEvent::NetworkDegraded { .. } => "network_degraded",
            SyncEvent::UiPriorityAvailable { .. } => "ui_priority_available",
            SyncEvent::AuthRequired => "auth_required",
            SyncEvent::BackoffScheduled { .. } => "backoff_scheduled",
            SyncEvent::Drained => "drained",
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 监听器句柄，用于移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 事件类型 → 监听器；"*" 表示通用监听器
    listeners: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
    next_listener_id: AtomicU64,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件（同步，可在事务提交回调里直接调用）
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let snapshot: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(event.event_type())
                .into_iter()
                .chain(listeners.get("*"))
                .flat_map(|v| v.iter().map(|(_, l)| l.clone()))
                .collect()
        };
        for listener in snapshot {
            listener(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器，event_type 为 "*" 时接收所有事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(lid, _)| *lid != id);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, v| !v.is_empty());
        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        removed
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
