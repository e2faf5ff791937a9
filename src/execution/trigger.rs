//! Trigger/Completion Bridge
//!
//! Starts runs on their own tokio task and hands the caller the run's
//! [`ExecutionDetails`] once the engine has accepted it. Only acceptance
//! is bounded by a timeout; the run itself continues in the background
//! and can be awaited through its [`ExecutionHandle`].

use std::time::Duration;

use log::{error, info};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine::Engine;
use super::state::{ExecutionDetails, ExecutionReport};
use crate::playbook::{apply_overrides, preflight, Playbook, ValidationError, Variables};
use crate::repository::RepositoryError;

/// Errors that stop a run from being started or awaited.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("playbook '{playbook_id}' was not accepted within {timeout:?}")]
    AcceptanceTimeout {
        playbook_id: String,
        timeout: Duration,
    },

    #[error("run of playbook '{0}' ended before it was accepted")]
    Dropped(String),

    #[error("execution {execution_id} aborted: {message}")]
    Aborted { execution_id: Uuid, message: String },
}

/// A run that has been accepted by the engine.
#[derive(Debug)]
pub struct ExecutionHandle {
    details: ExecutionDetails,
    handle: JoinHandle<ExecutionReport>,
}

impl ExecutionHandle {
    pub fn details(&self) -> &ExecutionDetails {
        &self.details
    }

    pub fn execution_id(&self) -> Uuid {
        self.details.execution_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run to terminate.
    ///
    /// A run that panicked surfaces as [`TriggerError::Aborted`].
    pub async fn wait(self) -> Result<ExecutionReport, TriggerError> {
        let execution_id = self.details.execution_id;
        self.handle.await.map_err(|e| {
            error!("[{}] Run aborted: {}", execution_id, e);
            TriggerError::Aborted {
                execution_id,
                message: e.to_string(),
            }
        })
    }
}

/// Entry point for starting runs by playbook ID or inline playbook.
#[derive(Clone)]
pub struct Trigger {
    engine: Engine,
    runtime: Option<Handle>,
}

impl Trigger {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            runtime: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Spawns runs on `runtime` instead of the caller's runtime.
    pub fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    /// Reads a playbook from the engine's repository and starts it.
    pub async fn execute_by_id(
        &self,
        playbook_id: &str,
        overrides: &Variables,
    ) -> Result<ExecutionHandle, TriggerError> {
        let playbook = self.engine.repository().read(playbook_id).await?;
        self.execute_playbook(playbook, overrides).await
    }

    /// Validates overrides and capabilities, then starts the run.
    ///
    /// Returns once the run is accepted. Nothing is started when
    /// validation fails.
    pub async fn execute_playbook(
        &self,
        mut playbook: Playbook,
        overrides: &Variables,
    ) -> Result<ExecutionHandle, TriggerError> {
        apply_overrides(&mut playbook, overrides)?;
        preflight(&playbook, self.engine.capabilities())?;

        let playbook_id = playbook.id.clone();
        let (accepted, acceptance) = oneshot::channel();
        let engine = self.engine.clone();
        let run = async move { engine.execute_async(playbook, Some(accepted)).await };
        let handle = match &self.runtime {
            Some(runtime) => runtime.spawn(run),
            None => tokio::spawn(run),
        };

        let limit = self.engine.config().acceptance_timeout;
        match tokio::time::timeout(limit, acceptance).await {
            Ok(Ok(details)) => {
                info!(
                    "Playbook '{}' accepted as execution {}",
                    details.playbook_id, details.execution_id
                );
                Ok(ExecutionHandle { details, handle })
            }
            Ok(Err(_)) => {
                error!("Run of playbook '{}' ended before acceptance", playbook_id);
                Err(TriggerError::Dropped(playbook_id))
            }
            Err(_) => {
                error!("Async execution timed out for playbook '{}'", playbook_id);
                Err(TriggerError::AcceptanceTimeout {
                    playbook_id,
                    timeout: limit,
                })
            }
        }
    }
}
