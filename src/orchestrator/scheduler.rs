//! Dispatch policy: which ready tasks may start now.
//!
//! Pure with respect to the filesystem: it looks at a [`CoordinationState`] and the
//! dispatch history it keeps in memory, and returns an ordered plan.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::TaskHiveConfig;
use crate::coordination::{CoordinationState, Task};

/// Concurrency cap and cooldown for one task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypePolicy {
    pub concurrency_limit: usize,
    pub cooldown: Duration,
}

/// A task selected for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub task_id: String,
    pub task_type: String,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct DispatchPlanner {
    policies: BTreeMap<String, TypePolicy>,
    default_policy: TypePolicy,
    last_dispatch: HashMap<String, Instant>,
}

impl DispatchPlanner {
    pub fn new(default_concurrency_limit: usize) -> Self {
        Self {
            policies: BTreeMap::new(),
            default_policy: TypePolicy {
                concurrency_limit: default_concurrency_limit,
                cooldown: Duration::ZERO,
            },
            last_dispatch: HashMap::new(),
        }
    }

    pub fn from_config(config: &TaskHiveConfig) -> Self {
        let mut planner = Self::new(config.orchestrator.default_concurrency_limit);
        for (task_type, worker) in &config.workers {
            planner = planner.with_policy(
                task_type,
                TypePolicy {
                    concurrency_limit: worker.concurrency_limit,
                    cooldown: worker.cooldown(),
                },
            );
        }
        planner
    }

    pub fn with_policy(mut self, task_type: impl Into<String>, policy: TypePolicy) -> Self {
        self.policies.insert(task_type.into(), policy);
        self
    }

    pub fn policy(&self, task_type: &str) -> TypePolicy {
        self.policies
            .get(task_type)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn cooling_down(&self, task_type: &str, now: Instant) -> bool {
        self.cooldown_remaining(task_type, now).is_some()
    }

    /// Remaining cooldown for a type, if any
    pub fn cooldown_remaining(&self, task_type: &str, now: Instant) -> Option<Duration> {
        let cooldown = self.policy(task_type).cooldown;
        let at = self.last_dispatch.get(task_type)?;
        let elapsed = now.saturating_duration_since(*at);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Tasks that may be dispatched now, in dispatch order.
    ///
    /// Ready tasks are ranked by priority then creation sequence, which is a total
    /// order. Each type is limited by its cap minus the tasks already Assigned or
    /// InProgress, and a type with a cooldown gets at most one dispatch per window.
    pub fn plan(&self, state: &CoordinationState, now: Instant) -> Vec<Dispatch> {
        let active = state.active_counts_by_type();
        let mut planned: HashMap<&str, usize> = HashMap::new();
        let mut plan = Vec::new();

        for task in state.ready_tasks() {
            if self.admits(task, &active, &planned, now) {
                *planned.entry(task.task_type.as_str()).or_insert(0) += 1;
                plan.push(Dispatch {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                    priority: task.priority,
                });
            }
        }
        plan
    }

    fn admits(
        &self,
        task: &Task,
        active: &HashMap<String, usize>,
        planned: &HashMap<&str, usize>,
        now: Instant,
    ) -> bool {
        let policy = self.policy(&task.task_type);
        let planned_here = planned.get(task.task_type.as_str()).copied().unwrap_or(0);
        let running = active.get(&task.task_type).copied().unwrap_or(0);

        if running + planned_here >= policy.concurrency_limit {
            return false;
        }
        if !policy.cooldown.is_zero() && (planned_here > 0 || self.cooling_down(&task.task_type, now)) {
            return false;
        }
        true
    }

    /// Start the cooldown window for a type
    pub fn record_dispatch(&mut self, task_type: &str, at: Instant) {
        self.last_dispatch.insert(task_type.to_string(), at);
    }
}
