//! Local Shell Capability
//!
//! Runs a command through `bash -c` on the machine hosting the engine.
//! Standard output is returned as the `__soarca_bash_result__` variable.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, error};
use tokio::process::Command as Process;

use super::{Capability, CapabilityContext, CapabilityError};
use crate::execution::Metadata;
use crate::playbook::{Variable, Variables};

/// Command type served by [`BashCapability`].
pub const BASH_COMMAND_TYPE: &str = "bash";

/// Result variable holding the command's standard output.
pub const BASH_RESULT_VARIABLE: &str = "__soarca_bash_result__";

/// Executes commands with the local `bash`.
#[derive(Debug, Clone, Default)]
pub struct BashCapability {
    working_dir: Option<PathBuf>,
}

impl BashCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every command from the given directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Capability for BashCapability {
    fn command_type(&self) -> &str {
        BASH_COMMAND_TYPE
    }

    async fn execute(
        &self,
        metadata: &Metadata,
        context: CapabilityContext,
    ) -> Result<Variables, CapabilityError> {
        let command_text = &context.command.command;
        debug!(
            "[{}] Step '{}' running: {}",
            metadata.execution_id, metadata.step_id, command_text
        );

        let mut cmd = Process::new("bash");
        cmd.arg("-c")
            .arg(command_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| CapabilityError::Process(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.success() {
            debug!("Step '{}' completed successfully", metadata.step_id);
            return Ok(Variables::from_iter([Variable::string(
                BASH_RESULT_VARIABLE,
                stdout,
            )]));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Step '{}' failed with exit code: {:?}",
            metadata.step_id,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }

        Err(CapabilityError::Failed(format!(
            "bash exited with code {:?}: {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}
