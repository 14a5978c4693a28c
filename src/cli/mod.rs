use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::repair::OutputFormat;

pub mod commands;

#[derive(Parser)]
#[command(name = "taskhive")]
#[command(version)]
#[command(about = "File-based multi-process task coordination")]
#[command(long_about = "TaskHive coordinates independent worker processes through a shared directory: \
                       an append-only event log is the only authority, task queue and agent registry \
                       files are projections rebuilt from it. Start with 'taskhive start --init'.")]
pub struct Cli {
    /// Coordination root; overrides coordination.base_path
    #[arg(long, global = true, help = "Coordination directory (defaults to config, then $TASKHIVE_BASE_PATH)")]
    pub base_path: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true, help = "Path to a TOML config file (default: ./taskhive.toml if present)")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator for this coordination root
    Start {
        /// Run without the interactive prompt until signalled
        #[arg(long, help = "Run in the foreground without a prompt until SIGINT/SIGTERM")]
        daemon: bool,
        /// Read commands from stdin while the orchestrator runs
        #[arg(long, conflicts_with = "daemon", help = "Accept status/task/agents/shutdown commands on stdin")]
        interactive: bool,
        /// Create the directory layout and a starter config, then exit
        #[arg(long, help = "Initialize the coordination directory and write a starter config")]
        init: bool,
    },
    /// Stop the running orchestrator
    Stop {
        #[arg(long, help = "Send SIGKILL instead of a graceful SIGTERM")]
        force: bool,
    },
    /// Show agents, tasks, health and recent events
    Monitor {
        #[arg(long, help = "Refresh continuously until Ctrl-C")]
        live: bool,
        #[arg(long, help = "Print the status as JSON")]
        json: bool,
        #[arg(long, default_value = "2", help = "Seconds between refreshes with --live")]
        interval: u64,
        #[arg(long, default_value = "10", help = "Number of recent events to show")]
        events: usize,
    },
    /// Diagnose and repair the coordination directory
    Repair(RepairArgs),
    /// Submit a new task
    Submit {
        /// Task type, matched against worker descriptors
        task_type: String,
        description: String,
        #[arg(long, default_value = "1", help = "Lower runs first")]
        priority: i32,
        #[arg(long = "depends-on", help = "Task id that must complete first (repeatable)")]
        depends_on: Vec<String>,
        #[arg(long, help = "Retries before the task fails for good")]
        max_retries: Option<u32>,
        #[arg(long, help = "Opaque context handed to the worker")]
        context: Option<String>,
    },
    /// Cancel a task that has not finished
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Worker-side commands; ids default to the TASKHIVE_* variables set for spawned workers
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RepairArgs {
    #[arg(long, help = "Run all checks without changing anything (default)")]
    pub diagnose: bool,
    #[arg(long, help = "Fix what can be fixed without losing events, then rebuild projections")]
    pub repair_all: bool,
    #[arg(long, help = "Structural validation only; non-zero exit on failure")]
    pub validate: bool,
    #[arg(long, help = "Back up and wipe all coordination state, then reinitialize")]
    pub emergency: bool,
    #[arg(short = 'y', long, help = "Confirm --emergency without prompting")]
    pub yes: bool,
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AgentCommands {
    /// Register this worker (no-op if the orchestrator already did)
    Register {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        agent_type: Option<String>,
        #[arg(long, help = "Worker pid (default: the calling process)")]
        pid: Option<u32>,
    },
    /// Send one heartbeat, or keep sending them with --every
    Heartbeat {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        task_id: Option<String>,
        /// Heartbeat every MS milliseconds until SIGTERM or the agent is declared dead
        /// (workers get the configured interval in TASKHIVE_HEARTBEAT_INTERVAL_MS)
        #[arg(long, value_name = "MS")]
        every: Option<u64>,
    },
    /// List tasks assigned to this agent
    Poll {
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Claim the best available task of this agent's type
    Claim {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        agent_type: Option<String>,
    },
    /// Mark an assigned task as in progress
    Start {
        task_id: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Complete a task with a JSON result; `next_tasks` in the result become follow-ups
    Complete {
        task_id: Option<String>,
        #[arg(long, default_value = "{}", help = "Result JSON")]
        result: String,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Report a task as failed
    Fail {
        task_id: Option<String>,
        #[arg(long)]
        error: String,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Print the result of a completed dependency
    Dependency { task_id: String },
}
