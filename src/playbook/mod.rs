//! Playbook Definition Module
//!
//! Provides the data structures, variable algebra and pre-run checks for
//! playbooks.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Playbook, Step, Command)
//! - [`variables`]: Variable scope with merge and interpolation
//! - [`condition`]: Condition expression evaluation
//! - [`parser`]: JSON/YAML loading
//! - [`validator`]: Reference checks and trigger-time override validation

pub mod condition;
pub mod model;
pub mod parser;
pub mod validator;
pub mod variables;

pub use condition::{ConditionError, ConditionEvaluator, StixComparison};
pub use model::{AgentTarget, AuthenticationInfo, Command, Playbook, Step, StepType};
pub use parser::{load_playbook, parse_playbook, PlaybookFormat};
pub use validator::{apply_overrides, preflight, validate_overrides, ValidationError};
pub use variables::{variable_type, Variable, Variables};
