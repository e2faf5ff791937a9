//! Switch-condition executor.

use log::debug;

use super::{ensure_type, Transition};
use crate::execution::error::EngineError;
use crate::playbook::{Step, StepType, Variables};

/// Case key used when no other case matches.
pub const DEFAULT_CASE: &str = "default";

/// Picks the next step of a `switch-condition` step by case value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchExecutor;

impl SwitchExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Interpolates the switch expression and looks the value up in `cases`.
    ///
    /// A `default` case is tried next, then `on_completion`.
    pub fn execute(&self, step: &Step, variables: &Variables) -> Result<Transition, EngineError> {
        ensure_type(step, &[StepType::SwitchCondition], "switch")?;

        let expression = step.switch.as_deref().unwrap_or_default();
        let value = variables.interpolate(expression.trim());
        let value = value.trim_matches('\'');
        debug!("Switch '{}' of step '{}' resolved to '{}'", expression, step.id, value);

        if let Some(next) = step.cases.get(value) {
            return Ok(Transition::branch(next.clone()));
        }
        if let Some(next) = step.cases.get(DEFAULT_CASE) {
            return Ok(Transition::branch(next.clone()));
        }
        match &step.on_completion {
            Some(_) => Ok(Transition::completion(step.on_completion.clone())),
            None => Err(EngineError::NoTransition {
                step_id: step.id.clone(),
                reason: "no matching case and no default".into(),
            }),
        }
    }
}
