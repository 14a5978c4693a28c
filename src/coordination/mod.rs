//! File-based, event-sourced task coordination.
//!
//! The event log is the only durable authority. The task queue and agent registry are
//! projections that can be thrown away and rebuilt at any time.

pub mod errors;
pub mod event_log;
pub mod events;
pub mod lock;
pub mod projections;
pub mod protocol;
pub mod types;

pub use errors::{CoordinationError, LockError};
pub use event_log::{EventLog, LogScan, LOG_LOCK};
pub use events::{Event, EventKind};
pub use lock::{Backoff, LockGuard, LockInfo, LockManager};
pub use projections::{CoordinationState, Projections};
pub use protocol::{
    new_agent_id, AgentRegistration, CoordinationPaths, CoordinationProtocol, NewTask,
    ProjectionHealth, ProtocolOptions, RebuildReport, ReleasedTasks, ReapOutcome, TaskOutcome,
};
pub use types::{AgentRecord, AgentStatus, DeregisterReason, Task, TaskStatus};
