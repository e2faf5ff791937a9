//! Engine Configuration
//!
//! An explicit configuration value built once at startup and shared by the
//! engine, its executors and the trigger bridge.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

/// Default time the trigger waits for a run to be accepted.
pub const DEFAULT_ACCEPTANCE_TIMEOUT_SECS: u64 = 3;

/// Default cap on downstream reporters.
pub const DEFAULT_MAX_REPORTERS: usize = 10;

pub const ENV_ACCEPTANCE_TIMEOUT: &str = "SOARFLOW_ACCEPTANCE_TIMEOUT_SECS";
pub const ENV_EXECUTION_TIMEOUT: &str = "SOARFLOW_EXECUTION_TIMEOUT_SECS";
pub const ENV_STEP_TIMEOUT: &str = "SOARFLOW_STEP_TIMEOUT_SECS";
pub const ENV_MAX_REPORTERS: &str = "SOARFLOW_MAX_REPORTERS";
pub const ENV_CANCEL_SIBLINGS: &str = "SOARFLOW_CANCEL_SIBLINGS";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a trigger waits for the run to be accepted
    pub acceptance_timeout: Duration,

    /// Overall budget for one run; exceeding it yields `TimedOut`
    pub execution_timeout: Option<Duration>,

    /// Bound on a capability call when the step sets no timeout
    pub default_step_timeout: Option<Duration>,

    /// Maximum number of downstream reporters
    pub max_reporters: usize,

    /// Abort in-flight sibling branches when one parallel branch fails
    pub cancel_siblings_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acceptance_timeout: Duration::from_secs(DEFAULT_ACCEPTANCE_TIMEOUT_SECS),
            execution_timeout: None,
            default_step_timeout: None,
            max_reporters: DEFAULT_MAX_REPORTERS,
            cancel_siblings_on_failure: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `SOARFLOW_*` environment variables.
    ///
    /// Unset variables keep their default. Invalid values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_ACCEPTANCE_TIMEOUT) {
            config.acceptance_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_EXECUTION_TIMEOUT) {
            config.execution_timeout = non_zero(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_STEP_TIMEOUT) {
            config.default_step_timeout = non_zero(secs);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, ENV_MAX_REPORTERS) {
            config.max_reporters = max;
        }
        if let Some(cancel) = parse_var::<bool, _>(&lookup, ENV_CANCEL_SIBLINGS) {
            config.cancel_siblings_on_failure = cancel;
        }

        config
    }

    pub fn set_acceptance_timeout(&mut self, timeout: Duration) {
        self.acceptance_timeout = timeout;
    }

    pub fn set_execution_timeout(&mut self, timeout: Option<Duration>) {
        self.execution_timeout = timeout;
    }

    pub fn set_default_step_timeout(&mut self, timeout: Option<Duration>) {
        self.default_step_timeout = timeout;
    }

    pub fn set_max_reporters(&mut self, max: usize) {
        self.max_reporters = max;
    }

    pub fn set_cancel_siblings_on_failure(&mut self, cancel: bool) {
        self.cancel_siblings_on_failure = cancel;
    }

    /// Timeout for one capability call of a step.
    ///
    /// The step's own timeout (seconds) wins; 0 means the engine default applies.
    pub fn step_timeout(&self, step_timeout_secs: u64) -> Option<Duration> {
        if step_timeout_secs > 0 {
            Some(Duration::from_secs(step_timeout_secs))
        } else {
            self.default_step_timeout
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for {}", raw, key);
            None
        }
    }
}

fn non_zero(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
