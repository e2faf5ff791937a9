//! Run State
//!
//! Per-run bookkeeping owned by the engine: correlation metadata, the
//! shared variable scope, active step pointers and the terminal outcome.
//! Nothing here is persisted; a run's state is dropped once its
//! workflow-end report returns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::EngineError;
use crate::playbook::Variables;

/// Identifies the run and step a call belongs to.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub execution_id: Uuid,
    pub playbook_id: String,
    pub step_id: String,
}

impl Metadata {
    pub fn new(execution_id: Uuid, playbook_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            playbook_id: playbook_id.into(),
            step_id: String::new(),
        }
    }

    /// Returns a copy of this metadata scoped to one step.
    pub fn for_step(&self, step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..self.clone()
        }
    }
}

/// Correlation record handed to the caller once a run is accepted.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDetails {
    pub playbook_id: String,
    pub execution_id: Uuid,
}

/// Terminal (or current) state of a run.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        };
        f.write_str(label)
    }
}

/// Outcome of the most recent visit to a step.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// The first fatal error of a failed run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub step_id: Option<String>,
    pub message: String,
}

impl From<&EngineError> for RunFailure {
    fn from(error: &EngineError) -> Self {
        Self {
            step_id: error.step_id().map(str::to_string),
            message: error.to_string(),
        }
    }
}

/// Final result of one run.
#[derive(Serialize, Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub playbook_id: String,
    pub status: RunStatus,

    /// Run scope at termination
    pub variables: Variables,

    /// Variables produced by the run's steps
    pub outputs: Variables,

    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Wall-clock duration of the run in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// The run-wide variable scope shared by every branch.
///
/// Concurrent merges are serialized by the lock; when two branches write
/// the same name the last write wins.
#[derive(Debug, Default)]
pub struct Scope {
    variables: RwLock<Variables>,
}

impl Scope {
    pub fn new(variables: Variables) -> Self {
        Self {
            variables: RwLock::new(variables),
        }
    }

    /// Returns a copy of the current scope.
    pub async fn snapshot(&self) -> Variables {
        self.variables.read().await.clone()
    }

    pub async fn merge(&self, source: &Variables) {
        self.variables.write().await.merge(source);
    }
}

#[derive(Debug, Default)]
struct StateInner {
    active: HashMap<String, usize>,
    steps: HashMap<String, StepStatus>,
    visits: usize,
    failure: Option<EngineError>,
}

/// Tracks active step pointers and the first fatal error of a run.
#[derive(Debug, Default)]
pub struct ExecutionState {
    inner: Mutex<StateInner>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    // Every update is a single map write, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a pointer entering a step.
    pub fn enter_step(&self, step_id: &str) {
        let mut inner = self.lock();
        *inner.active.entry(step_id.to_string()).or_insert(0) += 1;
        inner.steps.insert(step_id.to_string(), StepStatus::Running);
        inner.visits += 1;
    }

    /// Records a pointer leaving a step.
    pub fn leave_step(&self, step_id: &str, succeeded: bool) {
        let mut inner = self.lock();
        if let Some(count) = inner.active.get_mut(step_id) {
            *count -= 1;
            if *count == 0 {
                inner.active.remove(step_id);
            }
        }
        let status = if succeeded {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        inner.steps.insert(step_id.to_string(), status);
    }

    /// Stores the run's fatal error. Returns false if one was already set.
    pub fn record_failure(&self, error: EngineError) -> bool {
        let mut inner = self.lock();
        if inner.failure.is_some() {
            return false;
        }
        inner.failure = Some(error);
        true
    }

    pub fn failure(&self) -> Option<EngineError> {
        self.lock().failure.clone()
    }

    /// Step IDs with at least one pointer inside them, sorted.
    pub fn active_steps(&self) -> Vec<String> {
        let mut steps: Vec<String> = self.lock().active.keys().cloned().collect();
        steps.sort();
        steps
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.lock().steps.get(step_id).copied()
    }

    /// Total number of step visits so far.
    pub fn visits(&self) -> usize {
        self.lock().visits
    }
}
