//! Playbook-action executor: runs a referenced playbook as a nested run.

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{error, info};

use super::{ensure_type, ActionOutcome};
use crate::execution::error::EngineError;
use crate::execution::state::{ExecutionReport, Metadata};
use crate::playbook::{Playbook, Step, StepType, Variables};
use crate::repository::PlaybookRepository;

/// Runs a playbook to completion on behalf of a playbook-action step.
pub trait NestedRunner: Send + Sync {
    fn run_nested(&self, playbook: Playbook) -> BoxFuture<'_, ExecutionReport>;
}

/// Executes `playbook-action` steps.
#[derive(Clone)]
pub struct PlaybookActionExecutor {
    repository: Arc<dyn PlaybookRepository>,
}

impl PlaybookActionExecutor {
    pub fn new(repository: Arc<dyn PlaybookRepository>) -> Self {
        Self { repository }
    }

    /// Reads the referenced playbook, seeds it with the step's scope and
    /// runs it. The sub-run's outputs become the step's result variables.
    pub async fn execute(
        &self,
        metadata: &Metadata,
        step: &Step,
        variables: &Variables,
        runner: &dyn NestedRunner,
    ) -> ActionOutcome {
        if let Err(e) = ensure_type(step, &[StepType::PlaybookAction], "playbook-action") {
            return ActionOutcome::failure(step, e);
        }

        match self.run(metadata, step, variables, runner).await {
            Ok(outputs) => ActionOutcome::success(step, outputs),
            Err(e) => {
                error!("{}", e);
                ActionOutcome::failure(step, e)
            }
        }
    }

    async fn run(
        &self,
        metadata: &Metadata,
        step: &Step,
        variables: &Variables,
        runner: &dyn NestedRunner,
    ) -> Result<Variables, EngineError> {
        let playbook_id = step.playbook_id.clone().unwrap_or_default();
        let sub_playbook_error = |message: String| EngineError::SubPlaybook {
            step_id: step.id.clone(),
            playbook_id: playbook_id.clone(),
            message,
        };

        if playbook_id.is_empty() {
            return Err(sub_playbook_error("step has no playbook_id".into()));
        }

        let mut playbook = self
            .repository
            .read(&playbook_id)
            .await
            .map_err(|e| sub_playbook_error(e.to_string()))?;
        playbook.playbook_variables.merge(variables);

        info!(
            "[{}] Step '{}' starting sub-playbook '{}'",
            metadata.execution_id, step.id, playbook_id
        );
        let report = runner.run_nested(playbook).await;

        if !report.succeeded() {
            let message = report
                .failure
                .map(|f| f.message)
                .unwrap_or_else(|| format!("sub-run ended {}", report.status));
            return Err(sub_playbook_error(message));
        }

        if step.out_args.is_empty() {
            Ok(report.outputs)
        } else {
            Ok(report.outputs.select(&step.out_args))
        }
    }
}
