//! Playbook Validation
//!
//! Checks run before a playbook reaches the engine:
//! - Reference integrity (start, exception and transition targets exist)
//! - Capability coverage (every command type has a registered backend)
//! - Trigger-time variable overrides

use log::{debug, info, warn};
use thiserror::Error;

use super::model::Playbook;
use super::variables::{Variable, Variables};
use crate::capability::CapabilityRegistry;

/// Problems found before a run is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("playbook '{0}' has no steps")]
    EmptyPlaybook(String),

    #[error("workflow_start references unknown step '{0}'")]
    MissingStartStep(String),

    #[error("workflow_exception references unknown step '{0}'")]
    MissingExceptionStep(String),

    #[error("step '{step}' references unknown step '{target}'")]
    InvalidReference { step: String, target: String },

    #[error("step '{step}' uses command type '{command_type}' but no capability is registered for it")]
    UnknownCapability { step: String, command_type: String },

    #[error("provided variable '{name}' is not a valid subset of the variables for playbook '{playbook}'")]
    UnknownVariable { playbook: String, name: String },

    #[error("mismatch in variable type for '{name}': override type = {provided}, playbook type = {expected}")]
    TypeMismatch {
        name: String,
        provided: String,
        expected: String,
    },

    #[error("playbook variable '{0}' cannot be assigned because it is not marked as external")]
    NotExternal(String),
}

/// Collects every structural problem in a playbook.
///
/// When `registry` is given, command types are checked against it too.
pub fn check_playbook(
    playbook: &Playbook,
    registry: Option<&CapabilityRegistry>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if playbook.is_empty() {
        errors.push(ValidationError::EmptyPlaybook(playbook.id.clone()));
        return errors;
    }

    if playbook.get_step(&playbook.workflow_start).is_none() {
        errors.push(ValidationError::MissingStartStep(
            playbook.workflow_start.clone(),
        ));
    }

    if let Some(exception) = &playbook.workflow_exception {
        if playbook.get_step(exception).is_none() {
            errors.push(ValidationError::MissingExceptionStep(exception.clone()));
        }
    }

    // Sorted so the first reported problem is stable across runs
    let mut step_ids: Vec<&String> = playbook.workflow.keys().collect();
    step_ids.sort();

    for id in step_ids {
        let step = &playbook.workflow[id];
        for target in step.transition_targets() {
            if playbook.get_step(target).is_none() {
                errors.push(ValidationError::InvalidReference {
                    step: id.clone(),
                    target: target.to_string(),
                });
            }
        }

        if let Some(registry) = registry {
            for command in &step.commands {
                if !registry.has(&command.command_type) {
                    errors.push(ValidationError::UnknownCapability {
                        step: id.clone(),
                        command_type: command.command_type.clone(),
                    });
                }
            }
        }
    }

    errors
}

/// Verifies a playbook can be handed to the engine.
///
/// Returns the first problem found. Cycles and unreachable steps are not
/// checked.
pub fn preflight(playbook: &Playbook, registry: &CapabilityRegistry) -> Result<(), ValidationError> {
    debug!("Preflight check for playbook '{}'", playbook.id);

    let mut errors = check_playbook(playbook, Some(registry));
    if errors.is_empty() {
        return Ok(());
    }

    for error in &errors {
        warn!("{}", error);
    }
    Err(errors.remove(0))
}

/// Validates caller-supplied overrides against the playbook variables.
///
/// Every override must name an existing playbook variable that is marked
/// external and declares the same type.
pub fn validate_overrides(playbook: &Playbook, overrides: &Variables) -> Result<(), ValidationError> {
    for (name, provided) in overrides {
        let existing = playbook.playbook_variables.find(name).ok_or_else(|| {
            ValidationError::UnknownVariable {
                playbook: playbook.id.clone(),
                name: name.clone(),
            }
        })?;

        if provided.var_type != existing.var_type {
            return Err(ValidationError::TypeMismatch {
                name: name.clone(),
                provided: provided.var_type.clone(),
                expected: existing.var_type.clone(),
            });
        }

        if !existing.external {
            return Err(ValidationError::NotExternal(name.clone()));
        }
    }
    Ok(())
}

/// Validates overrides and writes their values into the playbook variables.
///
/// Only the value is taken from an override. Type, description and flags
/// stay as declared by the playbook. Nothing is written if any override is
/// rejected.
pub fn apply_overrides(playbook: &mut Playbook, overrides: &Variables) -> Result<(), ValidationError> {
    validate_overrides(playbook, overrides)?;

    for (name, provided) in overrides {
        if let Some(existing) = playbook.playbook_variables.find(name) {
            let updated = Variable {
                value: provided.value.clone(),
                ..existing.clone()
            };
            playbook.playbook_variables.insert_or_replace(updated);
        }
    }

    if !overrides.is_empty() {
        info!(
            "Applied {} variable override(s) to playbook '{}'",
            overrides.len(),
            playbook.id
        );
    }
    Ok(())
}
