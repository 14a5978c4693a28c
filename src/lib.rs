// TaskHive Library - File-based multi-process task coordination
// This exposes the core components for workers, tooling and testing

pub mod cli;
pub mod client;
pub mod config;
pub mod coordination;
pub mod fs;
pub mod orchestrator;
pub mod repair;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use client::{AgentClient, Completion, FollowUpTask};
pub use config::{TaskHiveConfig, WorkerDescriptor};
pub use coordination::{
    AgentRecord, AgentStatus, CoordinationError, CoordinationProtocol, Event, EventKind,
    LockError, LockManager, NewTask, ProtocolOptions, Task, TaskStatus,
};
pub use orchestrator::process::{CommandLauncher, ProcessLauncher, SpawnSpec, WorkerProcess};
pub use orchestrator::{InstanceLock, Orchestrator, SystemStatus, TickReport};
pub use repair::{DiagnosticReport, RepairTool};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_coordination_span, init_telemetry, shutdown_telemetry};
