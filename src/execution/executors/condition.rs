//! If/while condition executor.

use std::sync::Arc;

use log::debug;

use super::{ensure_type, Transition};
use crate::execution::error::EngineError;
use crate::execution::state::Metadata;
use crate::playbook::{ConditionEvaluator, Step, StepType, Variables};

/// Evaluates `if-condition` and `while-condition` steps.
///
/// The executor only picks the next step. Looping back into a while step
/// is the engine's job.
#[derive(Clone)]
pub struct ConditionExecutor {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl ConditionExecutor {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }

    pub fn execute(
        &self,
        metadata: &Metadata,
        step: &Step,
        variables: &Variables,
    ) -> Result<Transition, EngineError> {
        ensure_type(
            step,
            &[StepType::IfCondition, StepType::WhileCondition],
            "condition",
        )?;

        let expression = step.condition.as_deref().unwrap_or_default();
        let outcome = self
            .evaluator
            .evaluate(expression, variables)
            .map_err(|source| EngineError::Condition {
                step_id: step.id.clone(),
                source,
            })?;

        debug!(
            "[{}] Condition '{}' of step '{}' evaluated to {}",
            metadata.execution_id, expression, step.id, outcome
        );

        let target = if outcome { &step.on_true } else { &step.on_false };
        match target {
            Some(next) => Ok(Transition::branch(next.clone())),
            None if step.on_completion.is_some() => {
                Ok(Transition::completion(step.on_completion.clone()))
            }
            None => Err(EngineError::NoTransition {
                step_id: step.id.clone(),
                reason: format!(
                    "condition is {} and neither on_{} nor on_completion is set",
                    outcome, outcome
                ),
            }),
        }
    }
}
