//! 多队列调度器
//!
//! 四个流量类别按固定顺序调度：Ping → Notification → Refresh → Sync。
//! 每个类别同时最多一个请求；忙（飞行中或退避中）的类别本轮跳过。
//! `dispatch` 可以被重复、投机地调用，只有空闲且有材料的类别才会真正发出请求。
//!
//! 调度器本身是同步状态机，不做 I/O：`dispatch` 返回待发送的请求和需要异步执行的重算，
//! 请求完成后由运行时调用 `on_complete`，返回需要安排的退避定时器。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SnapSyncError};
use crate::events::{EventManager, SyncEvent, UiPriorityLevel};
use crate::net::backoff::{BackoffConfig, FinishAction, QueueState};
use crate::net::request::{NetRequest, NetResponse, RequestTag, TransportError};
use crate::net::retry_policy::{classify, FailureClass, RequestOutcome};
use crate::net::sources::{Collaborators, RefreshStep};
use crate::net::TrafficClass;
use crate::network::NetworkStatus;
use crate::queue::applier::Applier;
use crate::queue::intent::{self, RequeueContext, SequencePolicy};
use crate::queue::materializer::{Materializer, StageOutcome, Suspension};
use crate::queue::op_log;
use crate::queue::operation::OpFamily;
use crate::queue::priority::{self, BandPolicy, QueuePolicy, PRIORITY_UI_FULL, PRIORITY_UI_MAX};
use crate::queue::slots::InFlightSlots;
use crate::queue::staged::StagedRequest;
use crate::storage::kv::KvStore;

/// Sync 类别内部的操作族顺序
const SYNC_LADDER: [OpFamily; 7] = [
    OpFamily::DownloadPhoto,
    OpFamily::UploadPhoto,
    OpFamily::RemovePhotos,
    OpFamily::UploadEpisode,
    OpFamily::UploadActivity,
    OpFamily::UpdatePhoto,
    OpFamily::UpdateViewpoint,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub backoff: BackoffConfig,
    pub policy: QueuePolicy,
    pub sequence_policy: SequencePolicy,
    /// 连续失败达到该次数后发布 NetworkDegraded
    pub degraded_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            policy: QueuePolicy::default(),
            sequence_policy: SequencePolicy::default(),
            degraded_threshold: 3,
        }
    }
}

/// 退避结束后需要重发的内容
#[derive(Debug, Clone)]
enum Retry {
    Request(NetRequest),
    /// 槽位中保留的暂存操作
    Slot(OpFamily),
}

/// 一次调度的产出
#[derive(Debug, Default)]
pub struct DispatchPlan {
    pub requests: Vec<NetRequest>,
    /// 需要在调度上下文之外执行的图片重算
    pub recomputes: Vec<Suspension>,
}

impl DispatchPlan {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.recomputes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffTimer {
    pub class: TrafficClass,
    pub delay: Duration,
    pub generation: u64,
}

pub struct Dispatcher {
    store: Arc<KvStore>,
    sources: Collaborators,
    config: DispatcherConfig,
    queues: [QueueState; 4],
    slots: InFlightSlots,
    in_flight: HashMap<u64, NetRequest>,
    retry: [Option<Retry>; 4],
    suspensions: [Option<Suspension>; 7],
    next_request_id: u64,
    authenticated: bool,
    network_allowed: bool,
    network_status: NetworkStatus,
    first_scan_complete: bool,
    pause_count: u32,
    draining: bool,
    drained_emitted: bool,
    /// 上一个 Sync 请求是否失败（决定是否优先上传诊断日志）
    last_sync_failed: bool,
    refresh_drained: bool,
    ui_signal: Option<UiPriorityLevel>,
    network_gauge: Arc<AtomicU32>,
    /// 与 SDK 共享；策略切换持有写锁直到全部实体重建完成
    requeue_ctx: Arc<RwLock<RequeueContext>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.in_flight.len())
            .field("authenticated", &self.authenticated)
            .field("network_allowed", &self.network_allowed)
            .field("network_status", &self.network_status)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<KvStore>, sources: Collaborators, config: DispatcherConfig) -> Self {
        let queues = std::array::from_fn(|_| QueueState::new(&config.backoff));
        let requeue_ctx = Arc::new(RwLock::new(RequeueContext {
            policy: config.policy,
            sequence_policy: config.sequence_policy,
        }));
        Self {
            store,
            sources,
            config,
            queues,
            slots: InFlightSlots::new(),
            in_flight: HashMap::new(),
            retry: Default::default(),
            suspensions: [None; 7],
            next_request_id: 1,
            authenticated: false,
            network_allowed: true,
            network_status: NetworkStatus::Wifi,
            first_scan_complete: false,
            pause_count: 0,
            draining: false,
            drained_emitted: false,
            last_sync_failed: false,
            refresh_drained: false,
            ui_signal: None,
            network_gauge: Arc::new(AtomicU32::new(0)),
            requeue_ctx,
        }
    }

    fn events(&self) -> &Arc<EventManager> {
        self.store.events()
    }

    pub fn requeue_context(&self) -> RequeueContext {
        *self.requeue_ctx.read()
    }

    /// 业务写入与策略切换共用的上下文
    pub fn shared_requeue_context(&self) -> Arc<RwLock<RequeueContext>> {
        self.requeue_ctx.clone()
    }

    fn band(&self) -> BandPolicy {
        BandPolicy::new(&self.requeue_context().policy, self.network_status.is_wifi())
    }

    fn queue(&self, class: TrafficClass) -> &QueueState {
        &self.queues[class.index()]
    }

    pub fn queue_state(&self, class: TrafficClass) -> &QueueState {
        self.queue(class)
    }

    pub fn slots(&self) -> &InFlightSlots {
        &self.slots
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_network_allowed(&self) -> bool {
        self.network_allowed
    }

    /// 所有类别飞行中的请求数
    pub fn network_count(&self) -> u32 {
        self.queues.iter().map(|q| q.network_count()).sum()
    }

    /// 供其他线程无锁读取的飞行请求计数
    pub fn network_gauge(&self) -> Arc<AtomicU32> {
        self.network_gauge.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.network_count() == 0
    }

    pub fn dispatch(&mut self) -> DispatchPlan {
        let mut plan = DispatchPlan::default();
        if self.draining {
            return plan;
        }
        if !self.network_status.is_online() {
            debug!("网络不可用，跳过调度");
            return plan;
        }

        self.dispatch_ping(&mut plan);
        // ping 飞行期间阻塞其他所有类别
        if self.queue(TrafficClass::Ping).network_count() > 0 {
            return plan;
        }
        if !self.network_allowed || !self.authenticated {
            return plan;
        }

        self.dispatch_notification(&mut plan);
        let was_drained = self.refresh_drained;
        self.dispatch_refresh(&mut plan);
        if self.refresh_drained && !was_drained {
            self.dispatch_notification(&mut plan);
        }
        self.dispatch_sync(&mut plan);

        if !plan.requests.is_empty() {
            debug!(requests = plan.requests.len(), in_flight = self.in_flight.len(), "调度完成");
        }
        plan
    }

    fn start(&mut self, mut request: NetRequest, plan: &mut DispatchPlan) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        request.id = id;
        let class = request.class();
        self.queues[class.index()].start_request();
        self.network_gauge.fetch_add(1, Ordering::Relaxed);
        debug!(id, %class, tag = ?request.tag, "🚀 开始请求");
        self.in_flight.insert(id, request.clone());
        plan.requests.push(request);
        id
    }

    fn take_retry_request(&mut self, class: TrafficClass) -> Option<NetRequest> {
        match self.retry[class.index()].take() {
            Some(Retry::Request(request)) => Some(request),
            Some(slot @ Retry::Slot(_)) => {
                self.retry[class.index()] = Some(slot);
                None
            }
            None => None,
        }
    }

    fn dispatch_ping(&mut self, plan: &mut DispatchPlan) {
        if self.queue(TrafficClass::Ping).is_busy() {
            return;
        }
        let request = self
            .take_retry_request(TrafficClass::Ping)
            .or_else(|| self.sources.ping.next_request());
        if let Some(request) = request {
            self.start(request, plan);
        }
    }

    fn dispatch_notification(&mut self, plan: &mut DispatchPlan) {
        if self.queue(TrafficClass::Notification).is_busy() {
            return;
        }
        // 元数据追赶完成之前不挂长轮询
        if !self.refresh_drained || self.queue(TrafficClass::Refresh).is_busy() {
            return;
        }
        let request = self
            .take_retry_request(TrafficClass::Notification)
            .or_else(|| self.sources.notifications.next_request());
        if let Some(request) = request {
            self.start(request, plan);
        }
    }

    fn dispatch_refresh(&mut self, plan: &mut DispatchPlan) {
        if self.queue(TrafficClass::Refresh).is_busy() {
            self.refresh_drained = false;
            return;
        }
        if let Some(request) = self.take_retry_request(TrafficClass::Refresh) {
            self.refresh_drained = false;
            self.start(request, plan);
            return;
        }
        for step in RefreshStep::ALL {
            if step == RefreshStep::Episodes && !self.first_scan_complete {
                continue;
            }
            if let Some(request) = self.sources.refresh.next_request(step) {
                debug!(?step, "元数据追赶");
                self.refresh_drained = false;
                self.start(request, plan);
                return;
            }
        }
        self.refresh_drained = true;
    }

    fn dispatch_sync(&mut self, plan: &mut DispatchPlan) {
        if self.queue(TrafficClass::Sync).is_busy() {
            return;
        }

        let interactive_only = self.pause_count > 0;
        match self.retry[TrafficClass::Sync.index()].take() {
            // 账号类请求都是非交互的，暂停期间留到恢复后再发
            Some(retry @ Retry::Request(_)) if interactive_only => {
                self.retry[TrafficClass::Sync.index()] = Some(retry);
            }
            Some(Retry::Request(request)) => {
                self.start(request, plan);
                return;
            }
            Some(Retry::Slot(family)) if !self.slot_allowed(family) => {
                self.retry[TrafficClass::Sync.index()] = Some(Retry::Slot(family));
            }
            Some(Retry::Slot(family)) => {
                if self.start_staged(family, plan) {
                    return;
                }
            }
            None => {}
        }

        if !interactive_only {
            if self.last_sync_failed {
                if let Some(request) = self.sources.account.log_upload_request(true) {
                    self.start(request, plan);
                    return;
                }
            }
            if let Some(request) = self.sources.account.metadata_request() {
                self.start(request, plan);
                return;
            }
        }

        self.signal_ui_priority();

        for family in SYNC_LADDER {
            if self.stage_family(family, plan) {
                return;
            }
        }

        if !interactive_only {
            if let Some(request) = self.sources.account.contacts_request() {
                self.start(request, plan);
                return;
            }
            if let Some(request) = self.sources.account.log_upload_request(false) {
                self.start(request, plan);
            }
        }
    }

    /// 日志头部落在 UI 段时通知宿主，粒度变化才发布
    fn signal_ui_priority(&mut self) {
        let level = match op_log::top_priority(self.store.tree()) {
            Ok(Some(p)) if p <= PRIORITY_UI_FULL => Some(UiPriorityLevel::FullResolution),
            Ok(Some(p)) if priority::is_ui_priority(p) => Some(UiPriorityLevel::Everything),
            Ok(_) => None,
            Err(e) => {
                warn!("读取日志头部失败: {}", e);
                return;
            }
        };
        if level != self.ui_signal {
            self.ui_signal = level;
            if let Some(level) = level {
                self.events().emit(SyncEvent::UiPriorityAvailable { level });
            }
        }
    }

    /// 暂停期间只允许发送 UI 段的暂存操作
    fn slot_allowed(&self, family: OpFamily) -> bool {
        self.pause_count == 0
            || self
                .slots
                .get(family)
                .map_or(true, |entry| entry.op.priority <= PRIORITY_UI_MAX)
    }

    /// 发送槽位中尚未发送的暂存操作
    fn start_staged(&mut self, family: OpFamily, plan: &mut DispatchPlan) -> bool {
        let Some(op) = self.slots.unsent(family) else {
            return false;
        };
        let request = op.build_request();
        let id = self.start(request, plan);
        self.slots.mark_sent(family, id);
        true
    }

    fn stage_family(&mut self, family: OpFamily, plan: &mut DispatchPlan) -> bool {
        if let Some(entry) = self.slots.get(family) {
            if entry.request_id.is_some() || !self.slot_allowed(family) {
                return false;
            }
            return self.start_staged(family, plan);
        }
        if self.suspensions[family.index()].is_some() {
            return false;
        }

        let ctx = self.requeue_context();
        let band = self.band();
        let ceiling = (self.pause_count > 0).then_some(PRIORITY_UI_MAX);
        let outcome = Materializer::new(&self.store, &*self.sources.images, ctx, band).maybe_queue(
            family,
            ceiling,
            &mut self.slots,
        );

        match outcome {
            Ok(StageOutcome::Staged) => self.start_staged(family, plan),
            Ok(StageOutcome::Yielded { prerequisite }) => self.start_staged(prerequisite, plan),
            Ok(StageOutcome::Suspended(suspension)) => {
                self.suspensions[family.index()] = Some(suspension);
                plan.recomputes.push(suspension);
                false
            }
            Ok(StageOutcome::Idle) => false,
            Err(e) => {
                error!(%family, "物化失败: {}", e);
                false
            }
        }
    }

    /// 图片重算结束，恢复被挂起的物化
    pub fn resume_suspension(&mut self, family: OpFamily, success: bool) {
        let Some(suspension) = self.suspensions[family.index()].take() else {
            warn!(%family, "没有挂起的物化");
            return;
        };
        if success {
            debug!(%family, photo_id = suspension.photo_id, "图片重算完成，恢复物化");
            return;
        }
        let ctx = self.requeue_context();
        let band = self.band();
        if let Err(e) = Materializer::new(&self.store, &*self.sources.images, ctx, band).abandon_suspension(&suspension) {
            error!(%family, photo_id = suspension.photo_id, "隔离照片失败: {}", e);
        }
    }

    /// 请求结束；返回需要安排的退避定时器
    pub fn on_complete(
        &mut self,
        request_id: u64,
        result: std::result::Result<NetResponse, TransportError>,
    ) -> Option<BackoffTimer> {
        let Some(request) = self.in_flight.remove(&request_id) else {
            warn!(request_id, "未知请求的完成回调");
            return None;
        };
        let class = request.class();
        let outcome = classify(&request, result);

        let failure = match request.tag {
            RequestTag::Staged(family) => self.complete_staged(family, &outcome),
            _ => self.complete_source(&request, &outcome),
        };

        if failure == Some(FailureClass::Auth) && self.authenticated {
            warn!(%class, "🔐 鉴权失效，暂停需要登录的流量");
            self.authenticated = false;
            self.events().emit(SyncEvent::AuthRequired);
        }
        if class == TrafficClass::Sync {
            self.last_sync_failed = failure.is_some();
        }
        if let Some(fc) = failure {
            if fc.retains_request() && !matches!(request.tag, RequestTag::Staged(_)) {
                self.retry[class.index()] = Some(Retry::Request(request.clone()));
            }
        }

        let success = failure.is_none();
        self.network_gauge.fetch_sub(1, Ordering::Relaxed);
        let action = self.queues[class.index()].finish_request(success, &self.config.backoff);

        let mut timer = None;
        match action {
            FinishAction::ScheduleTimer { delay, generation } => {
                let failures = self.queue(class).consecutive_failures();
                warn!(%class, delay_ms = delay.as_millis() as u64, failures, "请求失败，进入退避");
                self.events().emit(SyncEvent::BackoffScheduled { class, delay });
                if failures >= self.config.degraded_threshold {
                    self.events().emit(SyncEvent::NetworkDegraded { class, failures });
                }
                timer = Some(BackoffTimer {
                    class,
                    delay,
                    generation,
                });
            }
            FinishAction::Resumed => info!(%class, "请求成功，结束退避"),
            FinishAction::Continue => {}
        }

        self.events().emit(SyncEvent::RequestFinished { class, success });
        self.check_drained();
        timer
    }

    fn complete_staged(&mut self, family: OpFamily, outcome: &RequestOutcome) -> Option<FailureClass> {
        let Some(op) = self.slots.get(family).map(|entry| entry.op.clone()) else {
            warn!(%family, "槽位为空，忽略完成回调");
            return match outcome {
                RequestOutcome::Success(_) => None,
                RequestOutcome::Failed(fc) => Some(*fc),
            };
        };

        let ctx = self.requeue_context();
        let failure = match Applier::new(&self.store, &*self.sources.images, ctx).apply(&op, outcome) {
            Ok(failure) => failure,
            Err(e) => {
                error!(%family, target = %op.target(), "响应落地失败: {}", e);
                Some(FailureClass::Transient)
            }
        };

        // 槽位在事务提交之后才清空
        match failure {
            Some(fc) if fc.retains_request() => {
                self.slots.mark_unsent(family);
                // 暂停期间保留的重试不被覆盖；未发送的槽位会在阶梯上被重新找到
                self.retry[TrafficClass::Sync.index()].get_or_insert(Retry::Slot(family));
            }
            _ => {
                self.slots.take(family);
            }
        }
        failure
    }

    fn complete_source(&mut self, request: &NetRequest, outcome: &RequestOutcome) -> Option<FailureClass> {
        let response = match outcome {
            RequestOutcome::Success(response) => response,
            RequestOutcome::Failed(fc) => return Some(*fc),
        };
        let handled = match request.tag {
            RequestTag::Ping => match self.sources.ping.handle_response(response) {
                Ok(status) => {
                    self.set_network_allowed(status.network_allowed);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            RequestTag::Notification => self.sources.notifications.handle_response(response),
            RequestTag::Refresh(step) => self.sources.refresh.handle_response(step, response),
            RequestTag::AccountMetadata | RequestTag::Contacts | RequestTag::LogUpload { .. } => {
                self.sources.account.handle_response(request.tag, response)
            }
            RequestTag::Staged(_) => Ok(()),
        };
        match handled {
            Ok(()) => None,
            Err(SnapSyncError::Protocol(msg)) => {
                warn!(tag = ?request.tag, "响应格式不符合预期: {}", msg);
                Some(FailureClass::Protocol)
            }
            Err(e) => {
                warn!(tag = ?request.tag, "处理响应失败: {}", e);
                Some(FailureClass::Protocol)
            }
        }
    }

    /// 退避定时器到期；返回类别是否恢复
    pub fn on_backoff_elapsed(&mut self, class: TrafficClass, generation: u64) -> bool {
        let resumed = self.queues[class.index()].on_timer(generation);
        if resumed {
            debug!(%class, "退避结束");
        }
        resumed
    }

    /// 回到前台 / 网络恢复时调用：取消所有退避
    pub fn reset_backoff(&mut self) -> bool {
        let mut any = false;
        for class in TrafficClass::ALL {
            any |= self.queues[class.index()].reset(&self.config.backoff);
        }
        if any {
            info!("退避已重置");
        }
        any
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        if self.authenticated != authenticated {
            info!(authenticated, "鉴权状态变化");
            self.authenticated = authenticated;
        }
    }

    pub fn set_network_allowed(&mut self, allowed: bool) {
        if self.network_allowed != allowed {
            if allowed {
                info!("服务端允许恢复网络流量");
            } else {
                warn!("服务端禁止网络流量，仅保留 ping");
            }
            self.network_allowed = allowed;
        }
    }

    pub fn set_first_scan_complete(&mut self) {
        self.first_scan_complete = true;
    }

    /// 网络类型变化；从离线恢复时重置退避
    pub fn set_network_status(&mut self, status: NetworkStatus) {
        let old = self.network_status;
        if old == status {
            return;
        }
        self.network_status = status;
        if !old.is_online() && status.is_online() {
            self.reset_backoff();
        }
    }

    /// 同步策略变化：重建全部日志条目
    pub fn set_policy(&mut self, policy: QueuePolicy) -> Result<usize> {
        let mut ctx = self.requeue_ctx.write();
        ctx.policy = policy;
        self.config.policy = policy;
        intent::requeue_all(&self.store, &ctx)
    }

    /// 暂停非交互流量（引用计数），Sync 只处理 UI 段
    pub fn pause_non_interactive(&mut self) {
        self.pause_count += 1;
        debug!(pause_count = self.pause_count, "暂停非交互流量");
    }

    pub fn resume_non_interactive(&mut self) {
        if self.pause_count == 0 {
            warn!("resume_non_interactive 调用次数多于 pause");
            return;
        }
        self.pause_count -= 1;
        debug!(pause_count = self.pause_count, "恢复非交互流量");
    }

    /// 进入排空模式：之后的 dispatch 都是空操作，飞行中的请求自然结束
    pub fn drain(&mut self) {
        if !self.draining {
            info!(in_flight = self.in_flight.len(), "进入排空模式");
            self.draining = true;
        }
        self.check_drained();
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    fn check_drained(&mut self) {
        if self.draining && !self.drained_emitted && self.is_idle() {
            self.drained_emitted = true;
            info!("✅ 排空完成");
            self.events().emit(SyncEvent::Drained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::request::HttpMethod;
    use crate::queue::intent::Requeue;
    use crate::queue::priority::{PRIORITY_UI_UPLOAD_PHOTO, PRIORITY_UPLOAD_PHOTO};
    use crate::storage::entities::{ImageSize, PhotoRecord, PhotoWork, PresignedUrl, ViewpointRecord, ViewpointWork};
    use crate::test_support::{seed_photo_upload, MemoryImages, ScriptedSources};
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        store: Arc<KvStore>,
        sources: Arc<ScriptedSources>,
        images: Arc<MemoryImages>,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(KvStore::temporary("u", Arc::new(EventManager::new(256))).unwrap());
            Self::with_store(store)
        }

        fn with_store(store: Arc<KvStore>) -> Self {
            let sources = Arc::new(ScriptedSources::default());
            let images = Arc::new(MemoryImages::default());
            let mut dispatcher = Dispatcher::new(
                store.clone(),
                sources.collaborators(images.clone()),
                DispatcherConfig::default(),
            );
            dispatcher.set_authenticated(true);
            Self {
                store,
                sources,
                images,
                dispatcher,
            }
        }

        fn save<E: Requeue + Clone>(&self, entity: E) {
            let ctx = self.dispatcher.requeue_context();
            self.store
                .transact(|txn| intent::requeue(txn, &mut entity.clone(), &ctx))
                .unwrap();
        }

        fn upload_fixture(&self, photo_id: i64, unit: PhotoWork, interactive: bool) {
            let ctx = self.dispatcher.requeue_context();
            seed_photo_upload(&self.store, &self.images, &ctx, photo_id, unit, interactive);
        }

        fn photo(&self, id: i64) -> PhotoRecord {
            self.store.get_entity(id).unwrap().unwrap()
        }
    }

    fn ok() -> std::result::Result<NetResponse, TransportError> {
        Ok(NetResponse::new(200, ""))
    }

    fn status(code: u16) -> std::result::Result<NetResponse, TransportError> {
        Ok(NetResponse::new(code, ""))
    }

    #[test]
    fn test_interactive_thumbnail_upload_round_trip() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, true);
        assert_eq!(h.store.stats().unwrap().count(PRIORITY_UI_UPLOAD_PHOTO), 1.0);

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        let request = &plan.requests[0];
        assert_eq!(request.tag, RequestTag::Staged(OpFamily::UploadPhoto));
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.url, "https://bucket.example/p7_tn");

        // 飞行期间重复调度不会再发
        assert!(h.dispatcher.dispatch().requests.is_empty());

        assert_eq!(h.dispatcher.on_complete(request.id, ok()), None);
        let photo = h.photo(7);
        assert!(!photo.intent.needs(PhotoWork::UploadThumbnail));
        assert!(photo.queue.is_none());
        assert_eq!(h.store.stats().unwrap().count(PRIORITY_UI_UPLOAD_PHOTO), 0.0);
        assert!(h.dispatcher.slots().is_empty(OpFamily::UploadPhoto));
        assert!(h.dispatcher.dispatch().requests.is_empty());
    }

    #[test]
    fn test_server_errors_back_off_then_reset() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadFull, false);

        let mut delays = Vec::new();
        let mut sent = Vec::new();
        for _ in 0..2 {
            let plan = h.dispatcher.dispatch();
            assert_eq!(plan.requests.len(), 1);
            let request = plan.requests[0].clone();
            let timer = h.dispatcher.on_complete(request.id, status(503)).unwrap();
            assert_eq!(timer.class, TrafficClass::Sync);
            delays.push(timer.delay.as_secs());
            sent.push(request);

            // 退避期间不发请求
            assert!(h.dispatcher.dispatch().requests.is_empty());
            assert!(h.dispatcher.on_backoff_elapsed(timer.class, timer.generation));
        }
        assert_eq!(delays, vec![1, 2]);
        // 重发的是同一个操作
        let op_id = |r: &NetRequest| r.headers.iter().find(|(k, _)| k == "X-Operation-Id").cloned();
        assert_eq!(op_id(&sent[0]), op_id(&sent[1]));
        assert_eq!(sent[0].body, sent[1].body);

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(op_id(&plan.requests[0]), op_id(&sent[0]));
        assert_eq!(h.dispatcher.on_complete(plan.requests[0].id, ok()), None);

        assert!(!h.photo(7).intent.needs(PhotoWork::UploadFull));
        assert_eq!(
            h.dispatcher.queue_state(TrafficClass::Sync).backoff_delay(),
            Duration::from_secs(1)
        );
        let photo = h.photo(7);
        assert!(!photo.intent.has_error(PhotoWork::UploadFull));
    }

    #[test]
    fn test_fifo_and_single_flight_per_class() {
        let mut h = Harness::new();
        h.upload_fixture(20, PhotoWork::UploadThumbnail, false);
        h.upload_fixture(10, PhotoWork::UploadThumbnail, false);

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].url, "https://bucket.example/p20_tn");
        assert_eq!(h.dispatcher.network_count(), 1);
        h.dispatcher.on_complete(plan.requests[0].id, ok());

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests[0].url, "https://bucket.example/p10_tn");
    }

    #[test]
    fn test_terminal_failures_quarantine_and_stop_scheduling() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        let mut events = h.store.events().subscribe();

        let mut delays = Vec::new();
        for _ in 0..2 {
            let plan = h.dispatcher.dispatch();
            assert_eq!(plan.requests.len(), 1);
            // 终止性错误同样让 Sync 进入退避
            let timer = h.dispatcher.on_complete(plan.requests[0].id, status(404)).unwrap();
            assert_eq!(timer.class, TrafficClass::Sync);
            delays.push(timer.delay.as_secs());
            assert!(h.dispatcher.dispatch().requests.is_empty());
            assert!(h.dispatcher.on_backoff_elapsed(timer.class, timer.generation));
            // 预签名地址被丢弃，下次先重新上传元数据；这里直接补回地址
            h.store
                .transact(|txn| {
                    let mut photo: PhotoRecord = txn.get_entity(7)?.unwrap();
                    photo.upload_urls.insert(
                        ImageSize::Thumbnail,
                        PresignedUrl {
                            url: "https://bucket.example/p7_tn".into(),
                            expires_at: i64::MAX,
                        },
                    );
                    txn.put_entity(&photo)
                })
                .unwrap();
        }

        assert_eq!(delays, vec![1, 2]);
        let photo = h.photo(7);
        assert!(photo.intent.is_quarantined());
        assert!(photo.intent.flags_exclusive());
        assert!(photo.queue.is_none());
        assert!(h.dispatcher.dispatch().requests.is_empty());

        let mut quarantined = 0;
        loop {
            match events.try_recv() {
                Ok(SyncEvent::EntityQuarantined { .. }) => quarantined += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("unexpected receive error {:?}", e),
            }
        }
        assert_eq!(quarantined, 1);

        intent::unquarantine::<PhotoRecord>(&h.store, 7, &h.dispatcher.requeue_context()).unwrap();
        assert_eq!(h.dispatcher.dispatch().requests.len(), 1);
    }

    #[test]
    fn test_staged_work_survives_restart() {
        let store = Arc::new(KvStore::temporary("u", Arc::new(EventManager::new(64))).unwrap());
        {
            let mut h = Harness::with_store(store.clone());
            h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
            let plan = h.dispatcher.dispatch();
            assert_eq!(plan.requests.len(), 1);
            // 进程在响应落地前退出
        }

        let mut h = Harness::with_store(store);
        h.images.put(7, ImageSize::Thumbnail, b"jpeg");
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].url, "https://bucket.example/p7_tn");
    }

    #[test]
    fn test_ping_blocks_other_classes_and_controls_network() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        h.sources.push_ping();

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].tag, RequestTag::Ping);

        // 服务端禁止网络
        h.dispatcher
            .on_complete(plan.requests[0].id, Ok(NetResponse::ok_json(serde_json::json!({"network_allowed": false}))));
        assert!(!h.dispatcher.is_network_allowed());
        assert!(h.dispatcher.dispatch().requests.is_empty());

        h.sources.push_ping();
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].tag, RequestTag::Ping);
        h.dispatcher.on_complete(plan.requests[0].id, ok());
        assert!(h.dispatcher.is_network_allowed());

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].tag, RequestTag::Staged(OpFamily::UploadPhoto));
    }

    #[test]
    fn test_refresh_steps_run_in_order_before_notification() {
        let mut h = Harness::new();
        h.sources.push_refresh(RefreshStep::Contacts);
        h.sources.push_refresh(RefreshStep::Episodes);
        h.sources.push_refresh(RefreshStep::Notifications);
        h.sources.push_notification();

        let mut tags = Vec::new();
        for _ in 0..4 {
            let plan = h.dispatcher.dispatch();
            for request in &plan.requests {
                tags.push(request.tag);
            }
            for request in plan.requests {
                h.dispatcher.on_complete(request.id, ok());
            }
        }
        // Episodes 需要首次扫描完成
        assert_eq!(
            tags,
            vec![
                RequestTag::Refresh(RefreshStep::Notifications),
                RequestTag::Refresh(RefreshStep::Contacts),
                RequestTag::Notification,
            ]
        );

        h.dispatcher.set_first_scan_complete();
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests[0].tag, RequestTag::Refresh(RefreshStep::Episodes));
    }

    #[test]
    fn test_auth_failure_stops_authenticated_traffic() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        let mut vp = ViewpointRecord::new(3);
        vp.intent.request(ViewpointWork::UpdateViewedSeq);
        h.save(vp);
        let mut events = h.store.events().subscribe();

        // 阶梯上照片上传排在 viewpoint 更新之前
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests[0].tag, RequestTag::Staged(OpFamily::UploadPhoto));
        h.dispatcher.on_complete(plan.requests[0].id, ok());

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests[0].tag, RequestTag::Staged(OpFamily::UpdateViewpoint));
        let timer = h.dispatcher.on_complete(plan.requests[0].id, status(401)).unwrap();
        assert!(!h.dispatcher.is_authenticated());
        assert!(h.dispatcher.on_backoff_elapsed(timer.class, timer.generation));
        assert!(h.dispatcher.dispatch().requests.is_empty());

        let mut saw_auth = false;
        while let Ok(event) = events.try_recv() {
            saw_auth |= event == SyncEvent::AuthRequired;
        }
        assert!(saw_auth);

        // 鉴权失败不设置 sticky error
        let vp: ViewpointRecord = h.store.get_entity(3).unwrap().unwrap();
        assert!(!vp.intent.has_error(ViewpointWork::UpdateViewedSeq));
        h.dispatcher.set_authenticated(true);
        assert_eq!(h.dispatcher.dispatch().requests.len(), 1);
    }

    #[test]
    fn test_pause_limits_sync_to_ui_priorities() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        h.sources.push_metadata();

        h.dispatcher.pause_non_interactive();
        h.dispatcher.pause_non_interactive();
        assert!(h.dispatcher.dispatch().requests.is_empty());

        h.upload_fixture(8, PhotoWork::UploadThumbnail, true);
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].url, "https://bucket.example/p8_tn");
        h.dispatcher.on_complete(plan.requests[0].id, ok());

        h.dispatcher.resume_non_interactive();
        assert!(h.dispatcher.dispatch().requests.is_empty());
        h.dispatcher.resume_non_interactive();
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests[0].tag, RequestTag::AccountMetadata);
    }

    #[test]
    fn test_pause_holds_retained_background_operation() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadFull, false);

        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        let first = plan.requests[0].clone();
        h.dispatcher.pause_non_interactive();
        let timer = h.dispatcher.on_complete(first.id, status(503)).unwrap();
        assert!(h.dispatcher.on_backoff_elapsed(timer.class, timer.generation));

        // 保留的后台操作在暂停期间不重发
        assert!(h.dispatcher.dispatch().requests.is_empty());
        assert!(h.dispatcher.slots().unsent(OpFamily::UploadPhoto).is_some());

        h.dispatcher.resume_non_interactive();
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        let op_id = |r: &NetRequest| r.headers.iter().find(|(k, _)| k == "X-Operation-Id").cloned();
        assert_eq!(op_id(&plan.requests[0]), op_id(&first));
    }

    #[test]
    fn test_drain_lets_in_flight_finish() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        let mut events = h.store.events().subscribe();

        let plan = h.dispatcher.dispatch();
        h.dispatcher.drain();
        h.upload_fixture(8, PhotoWork::UploadThumbnail, true);
        assert!(h.dispatcher.dispatch().requests.is_empty());

        h.dispatcher.on_complete(plan.requests[0].id, ok());
        assert!(h.dispatcher.is_idle());
        let mut drained = 0;
        while let Ok(event) = events.try_recv() {
            if event == SyncEvent::Drained {
                drained += 1;
            }
        }
        assert_eq!(drained, 1);
        h.dispatcher.drain();
        assert!(h.dispatcher.dispatch().requests.is_empty());
    }

    #[test]
    fn test_recompute_suspends_family_until_resumed() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadMedium, false);
        h.images.clear(7, ImageSize::Medium);
        h.images.put(7, ImageSize::Original, b"raw");

        let plan = h.dispatcher.dispatch();
        assert!(plan.requests.is_empty());
        assert_eq!(plan.recomputes.len(), 1);
        // 挂起期间不重复发起重算
        assert!(h.dispatcher.dispatch().is_empty());

        h.images.put(7, ImageSize::Medium, b"med");
        h.dispatcher.resume_suspension(OpFamily::UploadPhoto, true);
        let plan = h.dispatcher.dispatch();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].url, "https://bucket.example/p7_med");
    }

    #[test]
    fn test_cellular_policy_skips_bulk_uploads() {
        let mut h = Harness::new();
        h.upload_fixture(7, PhotoWork::UploadThumbnail, false);
        h.dispatcher
            .set_policy(QueuePolicy {
                cellular_uploads: false,
                ..Default::default()
            })
            .unwrap();
        h.dispatcher.set_network_status(NetworkStatus::Cellular);
        assert!(h.dispatcher.dispatch().requests.is_empty());
        assert_eq!(h.store.stats().unwrap().count(PRIORITY_UPLOAD_PHOTO), 1.0);

        h.dispatcher.set_network_status(NetworkStatus::Wifi);
        assert_eq!(h.dispatcher.dispatch().requests.len(), 1);
    }

    #[test]
    fn test_policy_change_visible_through_shared_context() {
        let mut h = Harness::new();
        let shared = h.dispatcher.shared_requeue_context();
        assert!(shared.read().policy.cellular_uploads);

        let policy = QueuePolicy {
            cellular_uploads: false,
            ..Default::default()
        };
        h.dispatcher.set_policy(policy).unwrap();
        assert_eq!(shared.read().policy, policy);
        assert_eq!(h.dispatcher.requeue_context(), *shared.read());
    }
}
