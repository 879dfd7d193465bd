//! 请求 / 响应模型
//!
//! 具体操作的线格式对调度核心是不透明的：这里只描述一次 HTTP 往返所需的最小信息，
//! 以及用于把完成回调路由回正确流量类别和槽位的标签。

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::net::sources::RefreshStep;
use crate::net::TrafficClass;
use crate::queue::operation::OpFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// 请求用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTag {
    Ping,
    Notification,
    Refresh(RefreshStep),
    /// 来自 In-Flight 槽位的操作
    Staged(OpFamily),
    AccountMetadata,
    Contacts,
    LogUpload { urgent: bool },
}

impl RequestTag {
    pub fn class(&self) -> TrafficClass {
        match self {
            RequestTag::Ping => TrafficClass::Ping,
            RequestTag::Notification => TrafficClass::Notification,
            RequestTag::Refresh(_) => TrafficClass::Refresh,
            RequestTag::Staged(_)
            | RequestTag::AccountMetadata
            | RequestTag::Contacts
            | RequestTag::LogUpload { .. } => TrafficClass::Sync,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetRequest {
    /// 由调度器分配，用于匹配完成回调
    pub id: u64,
    pub tag: RequestTag,
    pub method: HttpMethod,
    /// 以 `/` 开头时拼接到 API 地址，否则视为绝对地址（对象存储预签名 URL）
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl NetRequest {
    pub fn new(tag: RequestTag, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: 0,
            tag,
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn bytes(mut self, bytes: Bytes) -> Self {
        self.body = RequestBody::Bytes(bytes);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn class(&self) -> TrafficClass {
        self.tag.class()
    }

    /// 是否直接发往对象存储（而不是 API 服务）
    pub fn is_object_storage(&self) -> bool {
        !self.url.starts_with('/')
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetResponse {
    pub status: u16,
    pub body: Bytes,
}

impl NetResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(value: serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 解析 JSON 对象；空响应体视为 `{}`
    pub fn json_object(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        if self.body.iter().all(|b| b.is_ascii_whitespace()) {
            return Some(serde_json::Map::new());
        }
        match serde_json::from_slice::<serde_json::Value>(&self.body) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// 传输层错误（超时由传输层负责，作为普通失败上报）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}
