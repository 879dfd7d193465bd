//! 请求失败分类
//!
//! 任何失败都会让所属流量类别进入退避；分类只决定请求是否保留以及实体如何标记。
//!
//! - Transient: 5xx、传输超时 / 连接失败，退避后原样重发
//! - TerminalClient: 4xx（鉴权除外），本次放弃，设置 sticky error，第二次隔离
//! - Protocol: 响应体无法解析，本次放弃但不设置 sticky error
//! - Auth: 401/403，关闭鉴权状态，等待重新登录

use serde::{Deserialize, Serialize};

use crate::net::request::{NetRequest, NetResponse, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    Transient,
    TerminalClient,
    Protocol,
    Auth,
}

impl FailureClass {
    /// 失败后是否保留原请求，退避结束后原样重发
    pub fn retains_request(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }

    /// 是否在实体上记录 sticky error
    pub fn marks_entity(&self) -> bool {
        matches!(self, FailureClass::TerminalClient)
    }
}

/// 单个请求的完成结果
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success(NetResponse),
    Failed(FailureClass),
}

/// 根据 HTTP 状态码分类；2xx 返回 None
pub fn classify_status(status: u16, object_storage: bool) -> Option<FailureClass> {
    match status {
        200..=299 => None,
        // 对象存储的 403 通常是预签名过期，由重新获取地址解决，不代表会话失效
        401 | 403 if !object_storage => Some(FailureClass::Auth),
        408 | 429 => Some(FailureClass::Transient),
        400..=499 => Some(FailureClass::TerminalClient),
        500..=599 => Some(FailureClass::Transient),
        // 1xx / 3xx 出现在最终响应里说明协议不匹配
        _ => Some(FailureClass::Protocol),
    }
}

pub fn classify_transport_error(_error: &TransportError) -> FailureClass {
    FailureClass::Transient
}

/// 把一次传输结果归类为成功或某类失败
pub fn classify(request: &NetRequest, result: Result<NetResponse, TransportError>) -> RequestOutcome {
    match result {
        Ok(response) => match classify_status(response.status, request.is_object_storage()) {
            None => RequestOutcome::Success(response),
            Some(class) => RequestOutcome::Failed(class),
        },
        Err(e) => RequestOutcome::Failed(classify_transport_error(&e)),
    }
}
