//! Lifecycle Reporting Module
//!
//! The engine notifies a [`LifecycleReporter`] at every workflow and step
//! transition. Reporters must accept calls from concurrent branches and
//! must not block the engine; slow work belongs behind the asynchronous
//! fan-out in [`dispatch`].
//!
//! # Components
//!
//! - [`Reporter`]: queues events for a set of downstream reporters
//! - [`ExecutionTimeline`]: in-memory downstream reporter with Gantt charts

pub mod dispatch;
pub mod timeline;

pub use dispatch::Reporter;
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::execution::EngineError;
use crate::playbook::{Playbook, Step, StepType, Variables};

/// Errors from the reporting layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("cannot register more than {0} downstream reporters")]
    TooManyReporters(usize),

    #[error("reporter '{name}' rejected the event: {message}")]
    Rejected { name: String, message: String },

    #[error("reporter queue is closed")]
    Closed,
}

/// Observer contract called by the engine.
pub trait LifecycleReporter: Send + Sync {
    fn report_workflow_start(&self, execution_id: Uuid, playbook: &Playbook, at: DateTime<Utc>);

    fn report_workflow_end(
        &self,
        execution_id: Uuid,
        playbook: &Playbook,
        error: Option<&EngineError>,
        at: DateTime<Utc>,
    );

    fn report_step_start(
        &self,
        execution_id: Uuid,
        step: &Step,
        variables: &Variables,
        at: DateTime<Utc>,
    );

    fn report_step_end(
        &self,
        execution_id: Uuid,
        step: &Step,
        variables: &Variables,
        error: Option<&EngineError>,
        at: DateTime<Utc>,
    );
}

/// A reporter that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

impl LifecycleReporter for SilentReporter {
    fn report_workflow_start(&self, _: Uuid, _: &Playbook, _: DateTime<Utc>) {}

    fn report_workflow_end(&self, _: Uuid, _: &Playbook, _: Option<&EngineError>, _: DateTime<Utc>) {}

    fn report_step_start(&self, _: Uuid, _: &Step, _: &Variables, _: DateTime<Utc>) {}

    fn report_step_end(
        &self,
        _: Uuid,
        _: &Step,
        _: &Variables,
        _: Option<&EngineError>,
        _: DateTime<Utc>,
    ) {
    }
}

/// An owned lifecycle event, as handed to downstream reporters.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    WorkflowStart {
        execution_id: Uuid,
        playbook_id: String,
        at: DateTime<Utc>,
    },
    WorkflowEnd {
        execution_id: Uuid,
        playbook_id: String,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    StepStart {
        execution_id: Uuid,
        step_id: String,
        step_type: StepType,
        variables: Variables,
        at: DateTime<Utc>,
    },
    StepEnd {
        execution_id: Uuid,
        step_id: String,
        step_type: StepType,
        variables: Variables,
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

impl ReportEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::WorkflowStart { execution_id, .. }
            | Self::WorkflowEnd { execution_id, .. }
            | Self::StepStart { execution_id, .. }
            | Self::StepEnd { execution_id, .. } => *execution_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::WorkflowStart { at, .. }
            | Self::WorkflowEnd { at, .. }
            | Self::StepStart { at, .. }
            | Self::StepEnd { at, .. } => *at,
        }
    }
}

/// A sink for lifecycle events, called from the fan-out task.
#[async_trait]
pub trait DownstreamReporter: Send + Sync {
    fn name(&self) -> &str;

    async fn report(&self, event: &ReportEvent) -> Result<(), ReportError>;
}
