//! SoarFlow - Security Playbook Execution Engine
//!
//! Runs security orchestration playbooks: graphs of typed steps (actions,
//! conditions, loops, parallel fan-outs and nested playbooks) that drive
//! pluggable capability backends against a shared variable scope.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`playbook`]: Playbook model, variable scope, conditions and loading
//! - [`execution`]: Execution engine, step executors and trigger bridge
//! - [`capability`]: Capability contract, registry and local backends
//! - [`reporter`]: Lifecycle reporting and the execution timeline
//! - [`repository`]: Playbook storage contract and in-memory store
//!
//! # Example
//!
//! ```rust,no_run
//! use soarflow::capability::{BashCapability, CapabilityRegistry};
//! use soarflow::execution::{Engine, Trigger};
//! use soarflow::playbook::Variables;
//! use soarflow::load_playbook;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a playbook from JSON or YAML
//!     let playbook = load_playbook("playbook.json")?;
//!
//!     // Register the backends its commands need
//!     let mut registry = CapabilityRegistry::new();
//!     registry.register(BashCapability::new());
//!
//!     // Start the run and wait for it to finish
//!     let trigger = Trigger::new(Engine::new(registry));
//!     let handle = trigger.execute_playbook(playbook, &Variables::new()).await?;
//!     let report = handle.wait().await?;
//!     println!("{}", report.status);
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod execution;
pub mod playbook;
pub mod reporter;
pub mod repository;

// Re-export commonly used types
pub use capability::{Capability, CapabilityRegistry};
pub use execution::{Engine, EngineConfig, ExecutionReport, RunStatus, Trigger};
pub use playbook::model::{Playbook, Step, StepType};
pub use playbook::parser::load_playbook;
pub use playbook::variables::{Variable, Variables};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "SoarFlow";
