//! 存储层：sled 上的操作日志、实体表与事务

pub mod dao;
pub mod entities;
pub mod keys;
pub mod kv;
pub mod txn;

pub use dao::StoredEntity;
pub use kv::{CommitHook, KvStore};
pub use txn::{Txn, TxnEffects};
