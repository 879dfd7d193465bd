//! 队列统计：priority → 分数计数
//!
//! 内部以千分之一为单位的整数累加，保证增量维护与全量重建得到完全相同的结果。

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;

/// 一个完整条目对应的计数单位
pub const STAT_UNIT: i64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsMap {
    counts: BTreeMap<u32, i64>,
}

impl StatsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, priority: u32, units: i64) {
        let entry = self.counts.entry(priority).or_insert(0);
        *entry += units;
        if *entry == 0 {
            self.counts.remove(&priority);
        }
    }

    /// 指定优先级的剩余数量
    pub fn count(&self, priority: u32) -> f64 {
        self.counts.get(&priority).copied().unwrap_or(0) as f64 / STAT_UNIT as f64
    }

    pub fn units(&self, priority: u32) -> i64 {
        self.counts.get(&priority).copied().unwrap_or(0)
    }

    /// 区间 [low, high] 内所有优先级的合计
    pub fn sum_range(&self, low: u32, high: u32) -> f64 {
        let units: i64 = self.counts.range(low..=high).map(|(_, v)| *v).sum();
        units as f64 / STAT_UNIT as f64
    }

    pub fn total(&self) -> f64 {
        let units: i64 = self.counts.values().sum();
        units as f64 / STAT_UNIT as f64
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<u32, f64> {
        self.counts
            .iter()
            .map(|(p, v)| (*p, *v as f64 / STAT_UNIT as f64))
            .collect()
    }
}

/// 统计缓存：独立的细粒度锁，读进度不阻塞调度路径
///
/// 内存副本缺失时（例如重启后）通过全量扫描懒加载。
#[derive(Debug, Default)]
pub struct StatsCell {
    inner: Mutex<Option<StatsMap>>,
}

impl StatsCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// 确保内存副本存在；必须在任何修改日志的事务提交前调用
    pub fn ensure<F>(&self, rebuild: F) -> Result<()>
    where
        F: FnOnce() -> Result<StatsMap>,
    {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            *guard = Some(rebuild()?);
        }
        Ok(())
    }

    pub fn apply(&self, deltas: &[(u32, i64)]) {
        let mut guard = self.inner.lock();
        if let Some(stats) = guard.as_mut() {
            for (priority, units) in deltas {
                stats.add(*priority, *units);
            }
        }
    }

    pub fn snapshot<F>(&self, rebuild: F) -> Result<StatsMap>
    where
        F: FnOnce() -> Result<StatsMap>,
    {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            *guard = Some(rebuild()?);
        }
        Ok(guard.clone().unwrap_or_default())
    }

    pub fn invalidate(&self) {
        *self.inner.lock() = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().is_some()
    }
}
