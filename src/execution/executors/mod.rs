//! Step Executors
//!
//! One executor per step type. Each consumes a step plus the variables
//! visible to it and decides where the branch goes next; the engine owns
//! fan-out, loop-back and joins.

pub mod action;
pub mod condition;
pub mod flow;
pub mod playbook_action;
pub mod switch;

pub use action::ActionExecutor;
pub use condition::ConditionExecutor;
pub use flow::{parallel_branches, start_transition};
pub use playbook_action::{NestedRunner, PlaybookActionExecutor};
pub use switch::SwitchExecutor;

use log::error;

use super::error::EngineError;
use crate::playbook::{Step, StepType, Variables};

/// Next-step decision of a conditional executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next_step: Option<String>,

    /// True when a conditional target was chosen rather than `on_completion`
    pub branch_taken: bool,
}

impl Transition {
    pub fn branch(step_id: impl Into<String>) -> Self {
        Self {
            next_step: Some(step_id.into()),
            branch_taken: true,
        }
    }

    pub fn completion(step_id: Option<String>) -> Self {
        Self {
            next_step: step_id,
            branch_taken: false,
        }
    }
}

/// Result of an action or playbook-action step.
///
/// On failure `next_step` is the step's `on_failure` target when the error
/// is recoverable, and `None` when the run must fail.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub next_step: Option<String>,
    pub result: Result<Variables, EngineError>,
}

impl ActionOutcome {
    pub fn success(step: &Step, variables: Variables) -> Self {
        Self {
            next_step: step.on_success.clone().or_else(|| step.on_completion.clone()),
            result: Ok(variables),
        }
    }

    pub fn failure(step: &Step, error: EngineError) -> Self {
        let next_step = if error.is_recoverable() {
            step.on_failure.clone()
        } else {
            None
        };
        Self {
            next_step,
            result: Err(error),
        }
    }
}

/// Fails with `StepTypeMismatch` unless the step has one of `allowed` types.
pub(crate) fn ensure_type(
    step: &Step,
    allowed: &[StepType],
    expected: &'static str,
) -> Result<(), EngineError> {
    if allowed.contains(&step.step_type) {
        return Ok(());
    }
    error!(
        "Step '{}' of type {} is not compatible with the {} executor",
        step.id,
        step.step_type,
        expected
    );
    Err(EngineError::StepTypeMismatch {
        step_id: step.id.clone(),
        expected,
        actual: step.step_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_prefers_on_success() {
        let step = Step::new("a", StepType::Action).on_completion("end--1");
        let outcome = ActionOutcome::success(&step, Variables::new());
        assert_eq!(outcome.next_step.as_deref(), Some("end--1"));

        let mut step = step;
        step.on_success = Some("notify--1".into());
        let outcome = ActionOutcome::success(&step, Variables::new());
        assert_eq!(outcome.next_step.as_deref(), Some("notify--1"));
    }

    #[test]
    fn test_invariant_failure_has_no_next_step() {
        let step = Step::new("a", StepType::Action).on_failure("cleanup--1");
        let outcome = ActionOutcome::failure(&step, EngineError::StepNotFound("x".into()));
        assert!(outcome.next_step.is_none());
    }

    #[test]
    fn test_ensure_type() {
        let step = Step::new("s", StepType::Start);
        assert!(ensure_type(&step, &[StepType::Start], "start").is_ok());
        assert!(matches!(
            ensure_type(&step, &[StepType::Action], "action"),
            Err(EngineError::StepTypeMismatch { .. })
        ));
    }
}
