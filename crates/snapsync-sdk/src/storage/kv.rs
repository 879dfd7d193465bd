//! KV 存储模块 - 基于 sled 的操作日志与实体表
//!
//! 本模块提供：
//! - 用户隔离的命名空间（每个用户一个 Tree）
//! - 原子事务，事务内同时修改实体意图位与操作日志
//! - 提交后钩子：修改过日志的事务提交后恰好触发一次
//! - 统计缓存的懒加载与增量维护

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sled::{Db, Tree};
use tracing::{debug, info, warn};

use crate::error::{Result, SnapSyncError, TxResult};
use crate::events::EventManager;
use crate::queue::operation::OperationRecord;
use crate::queue::stats::{StatsCell, StatsMap};
use crate::storage::dao::StoredEntity;
use crate::storage::keys;
use crate::storage::txn::Txn;
use crate::utils::time::now_millis;

/// 事务提交后的回调
pub trait CommitHook: Send + Sync {
    fn on_log_committed(&self);
}

impl<F> CommitHook for F
where
    F: Fn() + Send + Sync,
{
    fn on_log_committed(&self) {
        self()
    }
}

/// KV 存储组件
pub struct KvStore {
    db: Db,
    tree: Tree,
    /// 串行化写事务：统计重建与增量不会交错
    commit_lock: Mutex<()>,
    stats: StatsCell,
    events: Arc<EventManager>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl KvStore {
    /// 打开（或创建）某个用户的存储
    pub async fn open(base_path: &Path, uid: &str, events: Arc<EventManager>) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SnapSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 切换账号或进程重启后旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        warn!("sled 数据库被占用，{}ms 后重试 (attempt {})", delay_ms, attempt + 1);
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SnapSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let store = Self::with_db(db, uid, events)?;
        info!("用户 KV Tree 初始化完成: {}", uid);
        Ok(store)
    }

    /// 内存临时库（测试与无持久化场景）
    pub fn temporary(uid: &str, events: Arc<EventManager>) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, uid, events)
    }

    fn with_db(db: Db, uid: &str, events: Arc<EventManager>) -> Result<Self> {
        let tree = db
            .open_tree(format!("user_{}", uid))
            .map_err(|e| SnapSyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
        Ok(Self {
            db,
            tree,
            commit_lock: Mutex::new(()),
            stats: StatsCell::new(),
            events,
            hooks: RwLock::new(Vec::new()),
        })
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// 注册提交后钩子
    pub fn add_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().push(hook);
    }

    /// 执行一个写事务
    ///
    /// 闭包可能被 sled 重跑多次，必须只通过 `Txn` 读写。
    /// 提交成功后依次：应用统计增量、发布事件、（若日志被修改）调用一次提交钩子。
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut Txn<'_>) -> TxResult<T>,
    {
        let (value, effects) = {
            let _guard = self.commit_lock.lock();
            self.stats.ensure(|| self.rebuild_stats())?;
            let now_ms = now_millis();
            let (value, effects) = self.tree.transaction(|tt| {
                let mut txn = Txn::new(tt, now_ms);
                let value = f(&mut txn)?;
                Ok((value, txn.into_effects()))
            })?;
            self.stats.apply(&effects.stats_deltas);
            (value, effects)
        };

        for event in effects.events {
            self.events.emit(event);
        }
        if effects.log_mutated {
            // 快照后调用，钩子内部注册新钩子不影响本次
            let hooks: Vec<Arc<dyn CommitHook>> = self.hooks.read().clone();
            debug!("操作日志已提交，通知 {} 个钩子", hooks.len());
            for hook in hooks {
                hook.on_log_committed();
            }
        }
        Ok(value)
    }

    /// 非事务读取单个实体
    pub fn get_entity<E: StoredEntity>(&self, local_id: i64) -> Result<Option<E>> {
        match self.tree.get(keys::entity_key(E::PREFIX, local_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 扫描某类实体的全部本地 id
    pub fn entity_ids<E: StoredEntity>(&self) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        for item in self.tree.scan_prefix(E::PREFIX) {
            let (key, _) = item?;
            ids.push(keys::decode_entity_key(E::PREFIX, &key)?);
        }
        Ok(ids)
    }

    /// 当前统计快照（细粒度锁，不阻塞调度路径）
    pub fn stats(&self) -> Result<StatsMap> {
        self.stats.snapshot(|| self.rebuild_stats())
    }

    /// 丢弃内存统计，下次访问时从日志全量重建
    pub fn invalidate_stats(&self) {
        self.stats.invalidate();
    }

    /// 全量扫描操作日志重建统计
    pub fn rebuild_stats(&self) -> Result<StatsMap> {
        let mut stats = StatsMap::new();
        for item in self.tree.range(keys::OP_LOG_PREFIX.to_vec()..keys::op_log_end()) {
            let (key, value) = item?;
            let (priority, _) = keys::decode_op_log_key(&key)?;
            let record = OperationRecord::decode(&value)?;
            stats.add(priority, record.stat_units());
        }
        Ok(stats)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
