//! Engine error taxonomy.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::capability::CapabilityError;
use crate::playbook::{ConditionError, StepType};

/// Errors signaled while a run walks its step graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("step '{step_id}' has type {actual} but was dispatched to the {expected} executor")]
    StepTypeMismatch {
        step_id: String,
        expected: &'static str,
        actual: StepType,
    },

    #[error("step '{step_id}': capability '{command_type}' is not available")]
    UnknownCapability {
        step_id: String,
        command_type: String,
    },

    #[error("step '{step_id}' ({command_type}) failed in execution {execution_id}: {source}")]
    Capability {
        execution_id: Uuid,
        step_id: String,
        command_type: String,
        #[source]
        source: CapabilityError,
    },

    #[error("step '{step_id}' has no transition: {reason}")]
    NoTransition { step_id: String, reason: String },

    #[error("step '{step_id}': sub-playbook '{playbook_id}' failed: {message}")]
    SubPlaybook {
        step_id: String,
        playbook_id: String,
        message: String,
    },

    #[error("step '{0}' does not exist in the playbook")]
    StepNotFound(String),

    #[error("step '{step_id}': {source}")]
    Condition {
        step_id: String,
        #[source]
        source: ConditionError,
    },

    #[error("execution exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("branch starting at '{step_id}' aborted: {message}")]
    Branch { step_id: String, message: String },
}

impl EngineError {
    /// The step that produced this error, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepTypeMismatch { step_id, .. }
            | Self::UnknownCapability { step_id, .. }
            | Self::Capability { step_id, .. }
            | Self::NoTransition { step_id, .. }
            | Self::SubPlaybook { step_id, .. }
            | Self::Condition { step_id, .. }
            | Self::Branch { step_id, .. } => Some(step_id),
            Self::StepNotFound(step_id) => Some(step_id),
            Self::Timeout(_) => None,
        }
    }

    /// Failures a step may recover from through its `on_failure` transition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Capability { .. } | Self::SubPlaybook { .. })
    }

    /// Contract or graph violations that are always fatal to the run.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            Self::StepTypeMismatch { .. }
                | Self::UnknownCapability { .. }
                | Self::NoTransition { .. }
                | Self::StepNotFound(_)
                | Self::Condition { .. }
                | Self::Branch { .. }
        )
    }
}
