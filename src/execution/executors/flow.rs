//! Start and parallel steps: transitions with no evaluation.

use super::ensure_type;
use crate::execution::error::EngineError;
use crate::playbook::{Step, StepType};

/// The step a `start` step transitions to.
pub fn start_transition(step: &Step) -> Result<String, EngineError> {
    ensure_type(step, &[StepType::Start], "start")?;

    step.on_completion
        .clone()
        .ok_or_else(|| EngineError::NoTransition {
            step_id: step.id.clone(),
            reason: "start step has no on_completion".into(),
        })
}

/// The branch heads a `parallel` step fans out to, in listed order.
pub fn parallel_branches(step: &Step) -> Result<Vec<String>, EngineError> {
    ensure_type(step, &[StepType::Parallel], "parallel")?;

    if step.next_steps.is_empty() {
        return Err(EngineError::NoTransition {
            step_id: step.id.clone(),
            reason: "parallel step has no next_steps".into(),
        });
    }
    Ok(step.next_steps.clone())
}
