//! Playbook Execution Module
//!
//! Provides the engine that runs playbooks, the per-run state it keeps,
//! and the trigger bridge callers use to start runs.
//!
//! # Architecture
//!
//! - [`engine`]: Walks a playbook's step graph for one run
//! - [`executors`]: One executor per step type
//! - [`trigger`]: Validates, starts and hands back accepted runs
//! - [`state`]: Run metadata, scope and terminal report
//! - [`config`]: Engine-wide settings
//! - [`error`]: Engine error taxonomy

pub mod config;
pub mod engine;
pub mod error;
pub mod executors;
pub mod state;
pub mod trigger;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use state::{ExecutionDetails, ExecutionReport, Metadata, RunFailure, RunStatus, StepStatus};
pub use trigger::{ExecutionHandle, Trigger, TriggerError};
