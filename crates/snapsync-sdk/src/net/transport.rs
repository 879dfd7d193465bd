//! 传输层
//!
//! 调度核心只依赖 `Transport` trait；默认实现基于 reqwest。
//! 超时由传输层负责，和连接失败一样作为普通失败上报。

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, info};

use crate::error::{Result, SnapSyncError};
use crate::net::request::{HttpMethod, NetRequest, NetResponse, RequestBody, TransportError};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: NetRequest) -> std::result::Result<NetResponse, TransportError>;
}

/// reqwest 客户端配置
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpTransport {
    client: Client,
    base_url: String,
    /// 会话 token，登录后由宿主设置
    auth_token: RwLock<Option<String>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("base_url", &self.base_url).finish()
    }
}

impl HttpTransport {
    pub fn new(config: &HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SnapSyncError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        info!("✅ HTTP 传输已创建 (base_url: {})", config.base_url);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: RwLock::new(None),
        })
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    /// API 请求拼接到 base_url，对象存储的绝对地址原样使用
    fn resolve_url(&self, request: &NetRequest) -> String {
        if request.is_object_storage() {
            request.url.clone()
        } else {
            format!("{}{}", self.base_url, request.url)
        }
    }
}

fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: NetRequest) -> std::result::Result<NetResponse, TransportError> {
        let url = self.resolve_url(&request);
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        debug!(id = request.id, tag = ?request.tag, %url, "📤 发送请求");

        let mut builder = self.client.request(method, &url);
        // 预签名地址自带鉴权，不附加会话 token
        if !request.is_object_storage() {
            if let Some(token) = self.auth_token.read().clone() {
                builder = builder.bearer_auth(token);
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes(bytes) => builder.body(bytes),
        };

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_error)?;
        debug!(id = request.id, status, bytes = body.len(), "📥 收到响应");
        Ok(NetResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::request::RequestTag;

    #[test]
    fn test_resolve_url() {
        let transport = HttpTransport::new(&HttpTransportConfig {
            base_url: "https://api.example/".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        })
        .unwrap();

        let api = NetRequest::new(RequestTag::Ping, HttpMethod::Get, "/service/ping");
        assert_eq!(transport.resolve_url(&api), "https://api.example/service/ping");

        let upload = NetRequest::new(RequestTag::Ping, HttpMethod::Put, "https://bucket.example/p1_tn");
        assert_eq!(transport.resolve_url(&upload), "https://bucket.example/p1_tn");
    }
}
