//! Playbook Data Model
//!
//! Core data structures representing a playbook's step graph.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "id": "playbook--block-ip",
//!   "name": "Block IP",
//!   "workflow_start": "start--1",
//!   "workflow": {
//!     "start--1": { "type": "start", "on_completion": "action--block" },
//!     "action--block": {
//!       "type": "action",
//!       "commands": [{ "type": "ssh", "command": "iptables -A INPUT -s __ip__:value -j DROP" }],
//!       "on_completion": "end--1"
//!     },
//!     "end--1": { "type": "end" }
//!   },
//!   "playbook_variables": {
//!     "__ip__": { "type": "ipv4-addr", "value": "0.0.0.0", "external": true }
//!   }
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::variables::Variables;

/// The kind of a playbook step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Start,
    End,
    Action,
    PlaybookAction,
    Parallel,
    IfCondition,
    WhileCondition,
    SwitchCondition,
}

impl StepType {
    /// Returns the wire name of the step type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Action => "action",
            Self::PlaybookAction => "playbook-action",
            Self::Parallel => "parallel",
            Self::IfCondition => "if-condition",
            Self::WhileCondition => "while-condition",
            Self::SwitchCondition => "switch-condition",
        }
    }

    /// Returns true for step types whose transition depends on an expression.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            Self::IfCondition | Self::WhileCondition | Self::SwitchCondition
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command handed to a capability backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Command {
    /// Command type; selects the capability, e.g. `http-api`, `ssh`
    #[serde(rename = "type")]
    pub command_type: String,

    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Base64 encoded command, used when `command` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_b64: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
}

impl Command {
    /// Creates a plain-text command of the given type.
    pub fn new(command_type: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            command: command.into(),
            ..Default::default()
        }
    }
}

/// An agent or target a command is executed against.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AgentTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "type")]
    pub target_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Addresses keyed by kind (`ipv4`, `dname`, `url`, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub address: HashMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Key into the playbook's authentication definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_info: Option<String>,
}

/// Credentials used by a capability to reach a target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AuthenticationInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "type")]
    pub auth_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_header: Option<String>,
}

/// Represents a single node of a playbook's step graph.
///
/// Which transition fields are meaningful depends on [`StepType`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Step ID; filled in from the workflow map key when loading
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Delay before the step executes, in milliseconds
    #[serde(default)]
    pub delay: u64,

    /// Bound on each capability call, in seconds (0 = engine default)
    #[serde(default)]
    pub timeout: u64,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub step_variables: Variables,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_completion: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_args: Vec<String>,

    /// When set, only these result variables are kept
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cases: HashMap<String, String>,
}

impl Step {
    /// Creates a step with no transitions.
    ///
    /// # Example
    ///
    /// ```
    /// use soarflow::playbook::{Command, Step, StepType};
    ///
    /// let step = Step::new("action--block", StepType::Action)
    ///     .with_command(Command::new("ssh", "iptables -L"))
    ///     .on_completion("end--1");
    /// ```
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_type,
            id: id.into(),
            name: None,
            description: None,
            delay: 0,
            timeout: 0,
            step_variables: Variables::new(),
            on_completion: None,
            on_success: None,
            on_failure: None,
            commands: Vec::new(),
            agent: None,
            targets: Vec::new(),
            in_args: Vec::new(),
            out_args: Vec::new(),
            playbook_id: None,
            next_steps: Vec::new(),
            condition: None,
            on_true: None,
            on_false: None,
            switch: None,
            cases: HashMap::new(),
        }
    }

    pub fn on_completion(mut self, step_id: impl Into<String>) -> Self {
        self.on_completion = Some(step_id.into());
        self
    }

    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn on_true(mut self, step_id: impl Into<String>) -> Self {
        self.on_true = Some(step_id.into());
        self
    }

    pub fn on_false(mut self, step_id: impl Into<String>) -> Self {
        self.on_false = Some(step_id.into());
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_switch(mut self, expression: impl Into<String>) -> Self {
        self.switch = Some(expression.into());
        self
    }

    pub fn with_case(mut self, value: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.cases.insert(value.into(), step_id.into());
        self
    }

    pub fn with_next_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_playbook(mut self, playbook_id: impl Into<String>) -> Self {
        self.playbook_id = Some(playbook_id.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Returns every step ID this step can transition to.
    pub fn transition_targets(&self) -> Vec<&str> {
        let singles = [
            &self.on_completion,
            &self.on_success,
            &self.on_failure,
            &self.on_true,
            &self.on_false,
        ];

        singles
            .into_iter()
            .flatten()
            .map(String::as_str)
            .chain(self.next_steps.iter().map(String::as_str))
            .chain(self.cases.values().map(String::as_str))
            .collect()
    }
}

/// The immutable step-graph template for one response procedure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Playbook {
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<String>,

    /// ID of the step the run starts at
    pub workflow_start: String,

    /// ID of the cleanup step run when the playbook fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_exception: Option<String>,

    /// Steps keyed by step ID
    #[serde(default)]
    pub workflow: HashMap<String, Step>,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub playbook_variables: Variables,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub target_definitions: HashMap<String, AgentTarget>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agent_definitions: HashMap<String, AgentTarget>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub authentication_info_definitions: HashMap<String, AuthenticationInfo>,
}

impl Playbook {
    /// Creates an empty playbook starting at `workflow_start`.
    pub fn new(id: impl Into<String>, workflow_start: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow_start: workflow_start.into(),
            ..Default::default()
        }
    }

    /// Adds a step keyed by its ID, replacing any step with the same ID.
    pub fn with_step(mut self, step: Step) -> Self {
        self.workflow.insert(step.id.clone(), step);
        self
    }

    pub fn with_exception(mut self, step_id: impl Into<String>) -> Self {
        self.workflow_exception = Some(step_id.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.playbook_variables = variables;
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.workflow.get(id)
    }

    /// Copies map keys into the `id` fields of steps and definitions.
    pub fn normalize_ids(&mut self) {
        for (key, step) in self.workflow.iter_mut() {
            step.id = key.clone();
        }
        for (key, target) in self.target_definitions.iter_mut() {
            target.id = key.clone();
        }
        for (key, agent) in self.agent_definitions.iter_mut() {
            agent.id = key.clone();
        }
        for (key, auth) in self.authentication_info_definitions.iter_mut() {
            auth.id = key.clone();
        }
    }

    /// Returns the sorted set of command types used by action steps.
    pub fn command_types(&self) -> BTreeSet<String> {
        self.workflow
            .values()
            .filter(|step| step.step_type == StepType::Action)
            .flat_map(|step| step.commands.iter().map(|c| c.command_type.clone()))
            .collect()
    }

    /// Returns the number of steps in the playbook.
    pub fn len(&self) -> usize {
        self.workflow.len()
    }

    /// Returns true if the playbook has no steps.
    pub fn is_empty(&self) -> bool {
        self.workflow.is_empty()
    }
}
