//! 调度运行时
//!
//! `Dispatcher` 只在一个 tokio 任务里被访问：所有状态变化都以命令的形式进入该任务，
//! 传输请求和图片重算在独立任务中执行，完成后再把结果投递回来。
//! 一批命令处理完之后统一调度一次，重复的 Dispatch 信号自然合并。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SnapSyncError};
use crate::net::dispatcher::{BackoffTimer, Dispatcher};
use crate::net::request::{NetRequest, NetResponse, TransportError};
use crate::net::sources::ImageStore;
use crate::net::transport::Transport;
use crate::net::TrafficClass;
use crate::network::NetworkStatus;
use crate::queue::materializer::Suspension;
use crate::queue::operation::OpFamily;
use crate::queue::priority::{self, QueuePolicy};
use crate::queue::stats::StatsMap;
use crate::storage::kv::KvStore;

enum Command {
    Dispatch,
    Complete {
        request_id: u64,
        result: std::result::Result<NetResponse, TransportError>,
    },
    RecomputeDone {
        family: OpFamily,
        success: bool,
    },
    ResetBackoff,
    SetAuthenticated(bool),
    SetNetworkStatus(NetworkStatus),
    SetFirstScanComplete,
    SetPolicy {
        policy: QueuePolicy,
        reply: oneshot::Sender<Result<usize>>,
    },
    PauseNonInteractive,
    ResumeNonInteractive,
    Snapshot(oneshot::Sender<RuntimeSnapshot>),
    Drain(oneshot::Sender<()>),
    Shutdown,
}

/// 某个流量类别的即时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSnapshot {
    pub class: TrafficClass,
    pub in_flight: u32,
    pub in_backoff: bool,
    pub next_delay: Duration,
}

/// 运行时状态快照（调试 / 宿主 UI）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub authenticated: bool,
    pub network_allowed: bool,
    pub draining: bool,
    pub classes: Vec<ClassSnapshot>,
}

/// 运行时句柄，可以在任意线程克隆和使用
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    store: Arc<KvStore>,
    network_gauge: Arc<AtomicU32>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("network_count", &self.network_count())
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl SyncHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SnapSyncError::ShuttingDown("调度运行时已停止".to_string()))
    }

    /// 投机地请求一次调度
    pub fn dispatch(&self) -> Result<()> {
        self.send(Command::Dispatch)
    }

    pub fn reset_backoff(&self) -> Result<()> {
        self.send(Command::ResetBackoff)
    }

    pub fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        self.send(Command::SetAuthenticated(authenticated))
    }

    pub fn set_network_status(&self, status: NetworkStatus) -> Result<()> {
        self.send(Command::SetNetworkStatus(status))
    }

    pub fn set_first_scan_complete(&self) -> Result<()> {
        self.send(Command::SetFirstScanComplete)
    }

    pub fn pause_non_interactive(&self) -> Result<()> {
        self.send(Command::PauseNonInteractive)
    }

    pub fn resume_non_interactive(&self) -> Result<()> {
        self.send(Command::ResumeNonInteractive)
    }

    /// 更新同步策略并重建日志，返回被重建的实体数
    pub async fn set_policy(&self, policy: QueuePolicy) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetPolicy { policy, reply })?;
        rx.await
            .map_err(|_| SnapSyncError::ShuttingDown("调度运行时已停止".to_string()))?
    }

    pub async fn snapshot(&self) -> Result<RuntimeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await
            .map_err(|_| SnapSyncError::ShuttingDown("调度运行时已停止".to_string()))
    }

    /// 停止发起新请求，等待飞行中的请求全部结束
    pub async fn drain(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Drain(reply))?;
        rx.await
            .map_err(|_| SnapSyncError::ShuttingDown("调度运行时已停止".to_string()))
    }

    /// 飞行中的请求数（无锁读取）
    pub fn network_count(&self) -> u32 {
        self.network_gauge.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Result<StatsMap> {
        self.store.stats()
    }

    /// 待下载的图片数（含 UI 触发的）
    pub fn download_count(&self) -> Result<f64> {
        let stats = self.store.stats()?;
        Ok(stats
            .to_map()
            .into_iter()
            .filter(|(p, _)| priority::is_download_priority(*p))
            .map(|(_, count)| count)
            .sum())
    }

    /// 待上传的照片数，可能带小数（部分尺寸已上传）
    pub fn upload_count(&self) -> Result<f64> {
        let stats = self.store.stats()?;
        Ok(stats
            .to_map()
            .into_iter()
            .filter(|(p, _)| priority::is_upload_priority(*p))
            .map(|(_, count)| count)
            .sum())
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

/// 调度运行时
pub struct SyncRuntime {
    handle: SyncHandle,
    task: JoinHandle<()>,
}

impl SyncRuntime {
    /// 启动运行时任务；必须在 tokio 运行时内调用
    pub fn spawn(
        store: Arc<KvStore>,
        dispatcher: Dispatcher,
        transport: Arc<dyn Transport>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        // 日志有变化就投机调度一次
        let hook_tx = tx.clone();
        store.add_commit_hook(Arc::new(move || {
            let _ = hook_tx.send(Command::Dispatch);
        }));

        let handle = SyncHandle {
            commands: tx.clone(),
            store,
            network_gauge: dispatcher.network_gauge(),
        };
        let actor = Actor {
            dispatcher,
            transport,
            images,
            commands: tx,
            timers: DelayQueue::new(),
            drain_waiters: Vec::new(),
        };
        let task = tokio::spawn(actor.run(rx));
        info!("✅ 调度运行时已启动");
        Self { handle, task }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// 排空后停止运行时任务
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.handle.drain().await {
            warn!("排空失败: {}", e);
        }
        let _ = self.handle.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| SnapSyncError::InvariantViolation(format!("调度任务异常退出: {}", e)))?;
        self.handle.flush().await?;
        info!("🛑 调度运行时已停止");
        Ok(())
    }
}

struct Actor {
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    images: Arc<dyn ImageStore>,
    /// 投递给传输 / 重算任务，用于回送结果
    commands: mpsc::UnboundedSender<Command>,
    timers: DelayQueue<(TrafficClass, u64)>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    #[instrument(name = "sync_runtime", skip_all)]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        break;
                    }
                    // 合并已经排队的命令，最后只调度一次
                    let mut stop = false;
                    while let Ok(command) = rx.try_recv() {
                        if !self.handle(command) {
                            stop = true;
                            break;
                        }
                    }
                    if stop {
                        break;
                    }
                }
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let (class, generation) = expired.into_inner();
                    self.dispatcher.on_backoff_elapsed(class, generation);
                }
            }
            self.run_dispatch();
            self.notify_drained();
        }
        debug!("调度任务退出");
    }

    /// 返回 false 表示停止
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Dispatch => {}
            Command::Complete { request_id, result } => {
                if let Some(timer) = self.dispatcher.on_complete(request_id, result) {
                    self.schedule(timer);
                }
            }
            Command::RecomputeDone { family, success } => self.dispatcher.resume_suspension(family, success),
            Command::ResetBackoff => {
                self.dispatcher.reset_backoff();
            }
            Command::SetAuthenticated(authenticated) => self.dispatcher.set_authenticated(authenticated),
            Command::SetNetworkStatus(status) => self.dispatcher.set_network_status(status),
            Command::SetFirstScanComplete => self.dispatcher.set_first_scan_complete(),
            Command::SetPolicy { policy, reply } => {
                let _ = reply.send(self.dispatcher.set_policy(policy));
            }
            Command::PauseNonInteractive => self.dispatcher.pause_non_interactive(),
            Command::ResumeNonInteractive => self.dispatcher.resume_non_interactive(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Drain(reply) => {
                self.dispatcher.drain();
                self.drain_waiters.push(reply);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn schedule(&mut self, timer: BackoffTimer) {
        debug!(class = %timer.class, delay_ms = timer.delay.as_millis() as u64, "安排退避定时器");
        self.timers.insert((timer.class, timer.generation), timer.delay);
    }

    fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            authenticated: self.dispatcher.is_authenticated(),
            network_allowed: self.dispatcher.is_network_allowed(),
            draining: self.dispatcher.is_draining(),
            classes: TrafficClass::ALL
                .iter()
                .map(|&class| {
                    let state = self.dispatcher.queue_state(class);
                    ClassSnapshot {
                        class,
                        in_flight: state.network_count(),
                        in_backoff: state.in_backoff(),
                        next_delay: state.backoff_delay(),
                    }
                })
                .collect(),
        }
    }

    fn run_dispatch(&mut self) {
        let plan = self.dispatcher.dispatch();
        for request in plan.requests {
            self.spawn_request(request);
        }
        for suspension in plan.recomputes {
            self.spawn_recompute(suspension);
        }
    }

    fn spawn_request(&self, request: NetRequest) {
        let transport = self.transport.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let request_id = request.id;
            let result = transport.send(request).await;
            let _ = commands.send(Command::Complete { request_id, result });
        });
    }

    fn spawn_recompute(&self, suspension: Suspension) {
        let images = self.images.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let success = match images.recompute(suspension.photo_id, suspension.size).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(photo_id = suspension.photo_id, size = suspension.size.as_str(), "图片重算失败: {}", e);
                    false
                }
            };
            let _ = commands.send(Command::RecomputeDone {
                family: suspension.family,
                success,
            });
        });
    }

    fn notify_drained(&mut self) {
        if self.drain_waiters.is_empty() || !self.dispatcher.is_idle() {
            return;
        }
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
