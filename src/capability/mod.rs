//! Capability Module
//!
//! Capabilities are the pluggable backends that perform the actual work of
//! an action step's command (an SSH session, an HTTP call, a local shell).
//! The engine selects one by exact match on `Command.command_type`.

pub mod dry_run;
pub mod shell;

pub use dry_run::DryRunCapability;
pub use shell::BashCapability;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::execution::Metadata;
use crate::playbook::{AgentTarget, AuthenticationInfo, Command, Variables};

/// Errors returned by a capability backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),

    #[error("capability call timed out after {0} s")]
    Timeout(u64),

    #[error("process error: {0}")]
    Process(String),
}

/// Everything a capability needs to execute one command.
///
/// The command, target and authentication are already interpolated
/// against the step scope.
#[derive(Debug, Clone, Default)]
pub struct CapabilityContext {
    pub command: Command,
    pub authentication: Option<AuthenticationInfo>,
    pub target: Option<AgentTarget>,
    pub variables: Variables,
}

/// A backend for one command type.
///
/// Implementations must be safe to call concurrently from parallel
/// branches and from several runs at once. Result variables are returned
/// to the caller, never written into the scope directly.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The command type this capability serves, e.g. `ssh`.
    fn command_type(&self) -> &str;

    async fn execute(
        &self,
        metadata: &Metadata,
        context: CapabilityContext,
    ) -> Result<Variables, CapabilityError>;
}

/// Registry of capabilities keyed by command type.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under its own command type.
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        let command_type = capability.command_type().to_string();
        self.capabilities.insert(command_type, Arc::new(capability));
    }

    /// Registers a shared capability under an explicit command type.
    pub fn register_as(&mut self, command_type: impl Into<String>, capability: Arc<dyn Capability>) {
        self.capabilities.insert(command_type.into(), capability);
    }

    pub fn get(&self, command_type: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(command_type).cloned()
    }

    pub fn has(&self, command_type: &str) -> bool {
        self.capabilities.contains_key(command_type)
    }

    /// Lists registered command types in sorted order.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("command_types", &self.list())
            .finish()
    }
}
