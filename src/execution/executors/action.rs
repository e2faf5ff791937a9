//! Action step executor.
//!
//! Runs every command of an action step against every listed target,
//! through the capability registered for the command type.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error};

use super::{ensure_type, ActionOutcome};
use crate::capability::{CapabilityContext, CapabilityError, CapabilityRegistry};
use crate::execution::config::EngineConfig;
use crate::execution::error::EngineError;
use crate::execution::state::Metadata;
use crate::playbook::{AgentTarget, AuthenticationInfo, Command, Playbook, Step, StepType, Variables};

/// Executes `action` steps.
#[derive(Clone)]
pub struct ActionExecutor {
    capabilities: Arc<CapabilityRegistry>,
    config: Arc<EngineConfig>,
}

impl ActionExecutor {
    pub fn new(capabilities: Arc<CapabilityRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            capabilities,
            config,
        }
    }

    /// Runs the step's commands in listed order; the first error aborts the rest.
    ///
    /// `variables` is the scope visible to the step. Later commands see the
    /// results of earlier ones. The returned variables are the combined
    /// results, filtered by `out_args` when the step declares any.
    pub async fn execute(
        &self,
        metadata: &Metadata,
        step: &Step,
        playbook: &Playbook,
        variables: &Variables,
    ) -> ActionOutcome {
        if let Err(e) = ensure_type(step, &[StepType::Action], "action") {
            return ActionOutcome::failure(step, e);
        }

        match self.run_commands(metadata, step, playbook, variables).await {
            Ok(results) => ActionOutcome::success(step, results),
            Err(e) => {
                error!("Error executing command of step '{}': {}", step.id, e);
                ActionOutcome::failure(step, e)
            }
        }
    }

    async fn run_commands(
        &self,
        metadata: &Metadata,
        step: &Step,
        playbook: &Playbook,
        variables: &Variables,
    ) -> Result<Variables, EngineError> {
        let mut scope = variables.clone();
        let mut results = Variables::new();
        let targets = resolve_targets(metadata, step, playbook)?;

        for command in &step.commands {
            let capability_error = |source: CapabilityError| EngineError::Capability {
                execution_id: metadata.execution_id,
                step_id: step.id.clone(),
                command_type: command.command_type.clone(),
                source,
            };

            let capability = self.capabilities.get(&command.command_type).ok_or_else(|| {
                EngineError::UnknownCapability {
                    step_id: step.id.clone(),
                    command_type: command.command_type.clone(),
                }
            })?;

            let decoded = decode_command(command).map_err(capability_error)?;

            for target in &targets {
                let authentication = target
                    .as_ref()
                    .and_then(|t| t.authentication_info.as_ref())
                    .and_then(|id| playbook.authentication_info_definitions.get(id))
                    .map(|auth| interpolate_auth(auth, &scope));

                let context = CapabilityContext {
                    command: interpolate_command(&decoded, &scope),
                    authentication,
                    target: target.as_ref().map(|t| interpolate_target(t, &scope)),
                    variables: scope.clone(),
                };

                debug!(
                    "Step '{}' calling '{}' capability{}",
                    step.id,
                    command.command_type,
                    target
                        .as_ref()
                        .map(|t| format!(" on target '{}'", t.id))
                        .unwrap_or_default()
                );

                let call = capability.execute(metadata, context);
                let output = match self.config.step_timeout(step.timeout) {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(CapabilityError::Timeout(limit.as_secs())),
                    },
                    None => call.await,
                }
                .map_err(capability_error)?;

                let output = if step.out_args.is_empty() {
                    output
                } else {
                    output.select(&step.out_args)
                };

                scope.merge(&output);
                results.merge(&output);
            }
        }

        Ok(results)
    }
}

/// Looks up the step's targets, falling back to its agent, or a single
/// untargeted call when neither is set.
fn resolve_targets(
    metadata: &Metadata,
    step: &Step,
    playbook: &Playbook,
) -> Result<Vec<Option<AgentTarget>>, EngineError> {
    let lookup = |id: &String| {
        playbook
            .target_definitions
            .get(id)
            .or_else(|| playbook.agent_definitions.get(id))
            .cloned()
            .ok_or_else(|| EngineError::Capability {
                execution_id: metadata.execution_id,
                step_id: step.id.clone(),
                command_type: step
                    .commands
                    .first()
                    .map(|c| c.command_type.clone())
                    .unwrap_or_default(),
                source: CapabilityError::Failed(format!("unknown target '{}'", id)),
            })
    };

    if !step.targets.is_empty() {
        return step.targets.iter().map(|id| lookup(id).map(Some)).collect();
    }
    match &step.agent {
        Some(agent) => Ok(vec![Some(lookup(agent)?)]),
        None => Ok(vec![None]),
    }
}

/// Replaces empty plain fields with their base64-decoded counterparts.
fn decode_command(command: &Command) -> Result<Command, CapabilityError> {
    let mut decoded = command.clone();

    if decoded.command.is_empty() {
        if let Some(encoded) = &command.command_b64 {
            decoded.command = decode_base64(encoded, "command_b64")?;
        }
    }
    if decoded.content.is_none() {
        if let Some(encoded) = &command.content_b64 {
            decoded.content = Some(decode_base64(encoded, "content_b64")?);
        }
    }
    Ok(decoded)
}

fn decode_base64(encoded: &str, field: &str) -> Result<String, CapabilityError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CapabilityError::Failed(format!("invalid base64 in {}: {}", field, e)))?;
    String::from_utf8(bytes)
        .map_err(|_| CapabilityError::Failed(format!("{} is not valid UTF-8", field)))
}

fn interpolate_command(command: &Command, variables: &Variables) -> Command {
    let mut command = command.clone();
    command.command = variables.interpolate(&command.command);
    command.content = command.content.map(|c| variables.interpolate(&c));
    for values in command.headers.values_mut() {
        for value in values.iter_mut() {
            *value = variables.interpolate(value);
        }
    }
    command
}

fn interpolate_target(target: &AgentTarget, variables: &Variables) -> AgentTarget {
    let mut target = target.clone();
    for addresses in target.address.values_mut() {
        for address in addresses.iter_mut() {
            *address = variables.interpolate(address);
        }
    }
    target.port = target.port.map(|p| variables.interpolate(&p));
    target
}

fn interpolate_auth(auth: &AuthenticationInfo, variables: &Variables) -> AuthenticationInfo {
    let interpolate = |field: &Option<String>| field.as_ref().map(|v| variables.interpolate(v));

    AuthenticationInfo {
        username: interpolate(&auth.username),
        user_id: interpolate(&auth.user_id),
        password: interpolate(&auth.password),
        private_key: interpolate(&auth.private_key),
        token: interpolate(&auth.token),
        oauth_header: interpolate(&auth.oauth_header),
        ..auth.clone()
    }
}
