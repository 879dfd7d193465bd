//! 键编码
//!
//! 所有数据放在同一个 sled Tree 中，用前缀区分表：
//! - `oq/` 操作日志：`oq/` ++ ordered(priority) ++ ordered(sequence)
//! - `ph/` `ep/` `ac/` `vp/` 实体表：前缀 ++ ordered(local_id 翻转符号位)
//! - `m/`  元数据（next_sequence 计数器等）
//!
//! ordered(n) 是保序变长整数：首字节为有效字节数，后跟大端字节。
//! 字节数越多数值越大，因此原始字节序与数值序一致，范围扫描无需反序列化。

use crate::error::{Result, SnapSyncError};

pub const OP_LOG_PREFIX: &[u8] = b"oq/";
pub const PHOTO_PREFIX: &[u8] = b"ph/";
pub const EPISODE_PREFIX: &[u8] = b"ep/";
pub const ACTIVITY_PREFIX: &[u8] = b"ac/";
pub const VIEWPOINT_PREFIX: &[u8] = b"vp/";
pub const NEXT_SEQUENCE_KEY: &[u8] = b"m/next_sequence";

/// 追加保序编码的无符号整数
pub fn put_ordered_u64(buf: &mut Vec<u8>, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.push((bytes.len() - skip) as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

/// 读取一个保序编码整数，返回 (值, 剩余字节)
pub fn take_ordered_u64(input: &[u8]) -> Result<(u64, &[u8])> {
    let (&len, rest) = input
        .split_first()
        .ok_or_else(|| SnapSyncError::InvalidData("ordered varint: empty input".to_string()))?;
    let len = len as usize;
    if len > 8 || rest.len() < len {
        return Err(SnapSyncError::InvalidData(format!(
            "ordered varint: bad length {} (remaining {})",
            len,
            rest.len()
        )));
    }
    let value = rest[..len].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    Ok((value, &rest[len..]))
}

/// 操作日志键
pub fn op_log_key(priority: u32, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(OP_LOG_PREFIX.len() + 14);
    key.extend_from_slice(OP_LOG_PREFIX);
    put_ordered_u64(&mut key, priority as u64);
    put_ordered_u64(&mut key, sequence);
    key
}

/// 某个优先级段的起始键（包含该段）
pub fn op_log_priority_start(priority: u32) -> Vec<u8> {
    let mut key = OP_LOG_PREFIX.to_vec();
    put_ordered_u64(&mut key, priority as u64);
    key
}

/// 操作日志区间的结束键（不包含）
pub fn op_log_end() -> Vec<u8> {
    prefix_end(OP_LOG_PREFIX)
}

pub fn decode_op_log_key(key: &[u8]) -> Result<(u32, u64)> {
    let body = key.strip_prefix(OP_LOG_PREFIX).ok_or_else(|| {
        SnapSyncError::InvalidData("key is not an operation log key".to_string())
    })?;
    let (priority, rest) = take_ordered_u64(body)?;
    let (sequence, rest) = take_ordered_u64(rest)?;
    if !rest.is_empty() {
        return Err(SnapSyncError::InvalidData("trailing bytes in operation log key".to_string()));
    }
    let priority = u32::try_from(priority)
        .map_err(|_| SnapSyncError::InvalidData(format!("priority out of range: {}", priority)))?;
    Ok((priority, sequence))
}

/// 有符号整数翻转符号位后按无符号编码，负数排在非负数之前
pub fn put_ordered_i64(buf: &mut Vec<u8>, value: i64) {
    put_ordered_u64(buf, (value as u64) ^ SIGN_BIT);
}

pub fn take_ordered_i64(input: &[u8]) -> Result<(i64, &[u8])> {
    let (raw, rest) = take_ordered_u64(input)?;
    Ok(((raw ^ SIGN_BIT) as i64, rest))
}

const SIGN_BIT: u64 = 1 << 63;

pub fn entity_key(prefix: &[u8], local_id: i64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    put_ordered_i64(&mut key, local_id);
    key
}

/// 从实体键中取回本地 id
pub fn decode_entity_key(prefix: &[u8], key: &[u8]) -> Result<i64> {
    let body = key.strip_prefix(prefix).ok_or_else(|| {
        SnapSyncError::InvalidData("key does not match entity prefix".to_string())
    })?;
    let (id, rest) = take_ordered_i64(body)?;
    if !rest.is_empty() {
        return Err(SnapSyncError::InvalidData("trailing bytes in entity key".to_string()));
    }
    Ok(id)
}

/// 前缀区间的上界：最后一个字节加一
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end
}
