//! Dry-run capability: logs each command instead of executing it.

use async_trait::async_trait;
use log::info;

use super::{Capability, CapabilityContext, CapabilityError};
use crate::execution::Metadata;
use crate::playbook::Variables;

/// Accepts any command, prints it and returns no variables.
///
/// Register it with [`CapabilityRegistry::register_as`](super::CapabilityRegistry::register_as)
/// for every command type a playbook uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunCapability;

impl DryRunCapability {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Capability for DryRunCapability {
    fn command_type(&self) -> &str {
        "dry-run"
    }

    async fn execute(
        &self,
        metadata: &Metadata,
        context: CapabilityContext,
    ) -> Result<Variables, CapabilityError> {
        info!("[DRY RUN] Step: {}", metadata.step_id);
        info!("  Type: {}", context.command.command_type);
        info!("  Command: {}", context.command.command);
        if let Some(target) = &context.target {
            info!("  Target: {} ({})", target.name, target.target_type);
        }
        Ok(Variables::new())
    }
}
