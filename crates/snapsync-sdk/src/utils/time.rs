//! 时间处理工具
//!
//! 存储层与事件中的时间字段统一使用 UTC 毫秒时间戳。

use chrono::{DateTime, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳格式化为 RFC 3339（日志用）；超出范围时返回原始数字
pub fn format_millis(timestamp_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        Some(dt) => dt.to_rfc3339(),
        None => timestamp_ms.to_string(),
    }
}
