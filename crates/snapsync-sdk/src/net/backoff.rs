//! 流量类别的并发与退避状态
//!
//! 每个类别同时最多一个请求在飞行。失败后进入退避：`backoff_count` 置位，
//! 定时器到期时恢复；下一次失败的延迟翻倍，直到上限。成功把延迟重置为下限。
//! 退避延迟不持久化，进程重启后从下限开始。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// 退避延迟配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// 下限（第一次失败后的延迟）
    pub min_delay: Duration,
    /// 上限
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// 请求结束后调度方需要执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// 正常结束，重新调度即可
    Continue,
    /// 成功结束了一段退避，类别立即恢复
    Resumed,
    /// 进入退避：在 `delay` 后携带 `generation` 回调 `on_timer`
    ScheduleTimer { delay: Duration, generation: u64 },
}

#[derive(Debug, Clone)]
pub struct QueueState {
    network_count: u32,
    backoff_count: u32,
    backoff_delay: Duration,
    /// 每次安排或取消定时器都会递增，过期的定时器回调会被忽略
    generation: u64,
    /// 连续失败次数
    consecutive_failures: u32,
}

impl QueueState {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            network_count: 0,
            backoff_count: 0,
            backoff_delay: config.min_delay,
            generation: 0,
            consecutive_failures: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.network_count > 0 || self.backoff_count > 0
    }

    pub fn network_count(&self) -> u32 {
        self.network_count
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff_count > 0
    }

    /// 下一次失败将使用的延迟
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn start_request(&mut self) {
        self.network_count += 1;
    }

    /// 请求结束；任何失败都进入退避
    pub fn finish_request(&mut self, success: bool, config: &BackoffConfig) -> FinishAction {
        if self.network_count == 0 {
            panic!("network_count underflow: finish_request without a matching start_request");
        }
        self.network_count -= 1;

        if success {
            self.backoff_delay = config.min_delay;
            self.consecutive_failures = 0;
            if self.backoff_count > 0 {
                self.backoff_count -= 1;
                self.generation += 1;
                return FinishAction::Resumed;
            }
            return FinishAction::Continue;
        }

        self.consecutive_failures += 1;
        self.backoff_count += 1;
        self.generation += 1;
        let delay = self.backoff_delay;
        self.backoff_delay = (delay * 2).min(config.max_delay).max(config.min_delay);
        debug!(
            delay_ms = delay.as_millis() as u64,
            next_ms = self.backoff_delay.as_millis() as u64,
            "进入退避"
        );
        FinishAction::ScheduleTimer {
            delay,
            generation: self.generation,
        }
    }

    /// 退避定时器到期；返回类别是否因此恢复
    pub fn on_timer(&mut self, generation: u64) -> bool {
        if self.backoff_count == 0 || generation != self.generation {
            return false;
        }
        self.backoff_count -= 1;
        true
    }

    /// 手动重置（回到前台、网络恢复）：取消未到期的定时器，延迟回到下限
    pub fn reset(&mut self, config: &BackoffConfig) -> bool {
        let was_backing_off = self.backoff_count > 0;
        self.backoff_count = 0;
        self.backoff_delay = config.min_delay;
        self.generation += 1;
        was_backing_off
    }
}
