//! 操作日志
//!
//! 持久化、全序的 (priority, sequence) → OperationRecord 表。
//! 写入只发生在 `Txn` 中，和实体意图位的修改同属一个事务；
//! 读取直接走 sled 的有序区间扫描，不需要反序列化 value 就能得到正确顺序。

use sled::Tree;
use tracing::trace;

use crate::error::{Result, SnapSyncError, TxResult};
use crate::queue::operation::OperationRecord;
use crate::storage::keys;
use crate::storage::txn::Txn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLogEntry {
    pub priority: u32,
    pub sequence: u64,
    pub record: OperationRecord,
}

/// 追加一个条目，分配新的序号
pub fn add(txn: &mut Txn<'_>, priority: u32, record: &OperationRecord) -> TxResult<u64> {
    let sequence = txn.next_sequence()?;
    put(txn, priority, sequence, record)?;
    Ok(sequence)
}

/// 以指定序号写入（重新入队时复用旧序号）
pub fn put(txn: &mut Txn<'_>, priority: u32, sequence: u64, record: &OperationRecord) -> TxResult<()> {
    let key = keys::op_log_key(priority, sequence);
    if txn.get_raw(&key)?.is_some() {
        return Err(SnapSyncError::InvariantViolation(format!(
            "operation log key ({}, {}) already occupied",
            priority, sequence
        ))
        .into());
    }
    txn.insert_raw(&key, record.encode()?)?;
    txn.record_stats(priority, record.stat_units());
    trace!(priority, sequence, op = ?record.operation, "操作日志追加");
    Ok(())
}

/// 删除条目并扣减统计；条目不存在时返回 None
pub fn remove(txn: &mut Txn<'_>, priority: u32, sequence: u64) -> TxResult<Option<OperationRecord>> {
    let key = keys::op_log_key(priority, sequence);
    match txn.remove_raw(&key)? {
        Some(bytes) => {
            let record = OperationRecord::decode(&bytes)?;
            txn.record_stats(priority, -record.stat_units());
            trace!(priority, sequence, "操作日志删除");
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub fn get(txn: &Txn<'_>, priority: u32, sequence: u64) -> TxResult<Option<OperationRecord>> {
    match txn.get_raw(&keys::op_log_key(priority, sequence))? {
        Some(bytes) => Ok(Some(OperationRecord::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// 日志中最靠前条目的优先级
pub fn top_priority(tree: &Tree) -> Result<Option<u32>> {
    match tree.range(keys::OP_LOG_PREFIX.to_vec()..keys::op_log_end()).next() {
        Some(item) => {
            let (key, _) = item?;
            let (priority, _) = keys::decode_op_log_key(&key)?;
            Ok(Some(priority))
        }
        None => Ok(None),
    }
}

pub fn len(tree: &Tree) -> usize {
    tree.range(keys::OP_LOG_PREFIX.to_vec()..keys::op_log_end()).count()
}

/// 按 (priority, sequence) 升序遍历
///
/// 每一步都重新从游标处开始区间扫描，遍历过程中删除条目是安全的。
pub struct OpLogIter<'a> {
    tree: &'a Tree,
    cursor: Vec<u8>,
    end: Vec<u8>,
    ceiling: Option<u32>,
    done: bool,
}

impl<'a> OpLogIter<'a> {
    pub fn new(tree: &'a Tree) -> Self {
        Self {
            tree,
            cursor: keys::OP_LOG_PREFIX.to_vec(),
            end: keys::op_log_end(),
            ceiling: None,
            done: false,
        }
    }

    /// 只遍历优先级不超过 ceiling 的条目
    pub fn with_ceiling(mut self, ceiling: Option<u32>) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// 跳过当前优先级段的剩余条目
    pub fn skip_to_next_priority(&mut self, priority: u32) {
        match priority.checked_add(1) {
            Some(next) => self.cursor = keys::op_log_priority_start(next),
            None => self.done = true,
        }
    }

    fn advance(&mut self) -> Result<Option<OpLogEntry>> {
        if self.done {
            return Ok(None);
        }
        let item = self.tree.range(self.cursor.clone()..self.end.clone()).next();
        let (key, value) = match item {
            Some(item) => item?,
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        let (priority, sequence) = keys::decode_op_log_key(&key)?;
        if self.ceiling.map_or(false, |c| priority > c) {
            self.done = true;
            return Ok(None);
        }
        // 游标移到当前键之后
        self.cursor = key.to_vec();
        self.cursor.push(0);
        let record = OperationRecord::decode(&value)?;
        Ok(Some(OpLogEntry {
            priority,
            sequence,
            record,
        }))
    }
}

impl Iterator for OpLogIter<'_> {
    type Item = Result<OpLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
