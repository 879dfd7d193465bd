//! 离线操作队列
//!
//! 持久化的优先级操作日志 + 实体意图状态机 + 每族一个的 In-Flight 槽位。
//! 业务逻辑只修改实体的意图位并调用 `intent::requeue`；
//! 物化器把日志条目解析成可发送的暂存操作，响应经由 applier 写回。

pub mod applier;
pub mod intent;
pub mod materializer;
pub mod op_log;
pub mod operation;
pub mod priority;
pub mod slots;
pub mod staged;
pub mod stats;

pub use applier::Applier;
pub use intent::{Requeue, RequeueContext, SequencePolicy};
pub use materializer::{Materializer, StageOutcome, Suspension};
pub use operation::{OpFamily, Operation, OperationHeader, OperationRecord};
pub use priority::{BandPolicy, QueuePolicy};
pub use slots::InFlightSlots;
pub use staged::{StagedKind, StagedOp, StagedRequest};
pub use stats::StatsMap;
