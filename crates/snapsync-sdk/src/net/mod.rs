//! 网络层：请求模型、传输、重试分类、退避与多队列调度

pub mod backoff;
pub mod dispatcher;
pub mod request;
pub mod retry_policy;
pub mod sources;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use request::{NetRequest, NetResponse, RequestTag, TransportError};
pub use retry_policy::FailureClass;
pub use transport::{HttpTransport, Transport};

/// 流量类别，按调度顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrafficClass {
    /// 保活 / 系统消息
    Ping,
    /// 长轮询通知
    Notification,
    /// 元数据追赶
    Refresh,
    /// 批量内容同步
    Sync,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::Ping,
        TrafficClass::Notification,
        TrafficClass::Refresh,
        TrafficClass::Sync,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Ping => "ping",
            TrafficClass::Notification => "notification",
            TrafficClass::Refresh => "refresh",
            TrafficClass::Sync => "sync",
        }
    }
}

impl std::fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
