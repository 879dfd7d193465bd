use sled::transaction::{ConflictableTransactionError, TransactionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapSyncError {
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Config error: {0}")]
    Config(String),
    /// 2xx 响应体格式不符合预期
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    /// 队列状态被破坏（负的 in-flight 计数、覆盖非空槽位等），不可恢复
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<sled::Error> for SnapSyncError {
    fn from(error: sled::Error) -> Self {
        SnapSyncError::KvStore(error.to_string())
    }
}

impl From<TransactionError<SnapSyncError>> for SnapSyncError {
    fn from(error: TransactionError<SnapSyncError>) -> Self {
        match error {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => SnapSyncError::KvStore(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SnapSyncError {
    fn from(error: serde_json::Error) -> Self {
        SnapSyncError::JsonError(error.to_string())
    }
}

impl From<bincode::Error> for SnapSyncError {
    fn from(error: bincode::Error) -> Self {
        SnapSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SnapSyncError {
    fn from(error: std::io::Error) -> Self {
        SnapSyncError::IO(error.to_string())
    }
}

impl From<SnapSyncError> for ConflictableTransactionError<SnapSyncError> {
    fn from(error: SnapSyncError) -> Self {
        ConflictableTransactionError::Abort(error)
    }
}

pub type Result<T> = std::result::Result<T, SnapSyncError>;

/// 事务闭包内部使用的结果类型：冲突由 sled 重试，业务错误中止事务
pub type TxResult<T> = std::result::Result<T, ConflictableTransactionError<SnapSyncError>>;
