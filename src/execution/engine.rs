//! Playbook Execution Engine
//!
//! The decomposer that walks a playbook's step graph for one run:
//! - Dispatch of every step to the executor for its type
//! - Nested sub-branches for taken conditional branches and while loops
//! - Concurrent fan-out of parallel steps with an implicit join
//! - Shared, lock-protected variable scope per run
//! - Lifecycle reporting around the workflow and every step visit
//! - Best-effort exception branch when a run fails

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::config::EngineConfig;
use super::error::EngineError;
use super::executors::{
    parallel_branches, start_transition, ActionExecutor, ActionOutcome, ConditionExecutor,
    NestedRunner, PlaybookActionExecutor, SwitchExecutor, Transition,
};
use super::state::{
    ExecutionDetails, ExecutionReport, ExecutionState, Metadata, RunFailure, RunStatus, Scope,
};
use crate::capability::CapabilityRegistry;
use crate::playbook::{ConditionEvaluator, Playbook, Step, StepType, StixComparison, Variables};
use crate::reporter::{LifecycleReporter, SilentReporter};
use crate::repository::{MemoryRepository, PlaybookRepository};

/// Playbook execution engine.
///
/// Cloning is cheap and every clone shares the same capabilities,
/// reporter and repository. Runs are independent of each other: one run's
/// fatal error never affects another.
///
/// # Example
///
/// ```rust,no_run
/// use soarflow::capability::{BashCapability, CapabilityRegistry};
/// use soarflow::execution::Engine;
/// use soarflow::load_playbook;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let playbook = load_playbook("playbook.json")?;
///     let mut registry = CapabilityRegistry::new();
///     registry.register(BashCapability::new());
///
///     let report = Engine::new(registry).execute(playbook).await;
///     println!("{}", report.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    capabilities: Arc<CapabilityRegistry>,
    reporter: Arc<dyn LifecycleReporter>,
    repository: Arc<dyn PlaybookRepository>,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl Engine {
    /// Creates an engine with a silent reporter, an empty in-memory
    /// repository and the STIX comparison evaluator.
    pub fn new(capabilities: CapabilityRegistry) -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            capabilities: Arc::new(capabilities),
            reporter: Arc::new(SilentReporter),
            repository: Arc::new(MemoryRepository::new()),
            evaluator: Arc::new(StixComparison::new()),
        }
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = Arc::new(config);
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn LifecycleReporter>) {
        self.reporter = reporter;
    }

    /// Sets the repository playbook-action steps resolve sub-playbooks from.
    pub fn set_repository(&mut self, repository: Arc<dyn PlaybookRepository>) {
        self.repository = repository;
    }

    pub fn set_evaluator(&mut self, evaluator: Arc<dyn ConditionEvaluator>) {
        self.evaluator = evaluator;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn repository(&self) -> Arc<dyn PlaybookRepository> {
        Arc::clone(&self.repository)
    }

    /// Runs a playbook to termination.
    pub async fn execute(&self, playbook: Playbook) -> ExecutionReport {
        self.execute_async(playbook, None).await
    }

    /// Runs a playbook to termination, announcing acceptance first.
    ///
    /// `accepted` receives the run's [`ExecutionDetails`] before the first
    /// step executes.
    pub async fn execute_async(
        &self,
        playbook: Playbook,
        accepted: Option<oneshot::Sender<ExecutionDetails>>,
    ) -> ExecutionReport {
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();

        if let Some(accepted) = accepted {
            let details = ExecutionDetails {
                playbook_id: playbook.id.clone(),
                execution_id,
            };
            if accepted.send(details).is_err() {
                warn!("[{}] Caller stopped waiting for acceptance", execution_id);
            }
        }

        info!("[{}] Starting playbook '{}'", execution_id, playbook.id);
        self.reporter
            .report_workflow_start(execution_id, &playbook, started_at);

        let run = Arc::new(Run {
            engine: self.clone(),
            metadata: Metadata::new(execution_id, playbook.id.clone()),
            scope: Scope::new(playbook.playbook_variables.clone()),
            outputs: Scope::default(),
            state: ExecutionState::new(),
            playbook: Arc::new(playbook),
        });

        let start = run.playbook.workflow_start.clone();
        let result = self
            .within_budget(Arc::clone(&run).execute_branch(start, Pointer::default()))
            .await;

        let status = match &result {
            Ok(()) => RunStatus::Succeeded,
            Err(EngineError::Timeout(_)) => RunStatus::TimedOut,
            Err(_) => RunStatus::Failed,
        };
        if let Err(e) = &result {
            run.state.record_failure(e.clone());
        }

        if status == RunStatus::Failed {
            if let Some(exception) = run.playbook.workflow_exception.clone() {
                info!("[{}] Running exception step '{}'", execution_id, exception);
                let cleanup = Arc::clone(&run).execute_branch(exception, Pointer::default());
                if let Err(e) = self.within_budget(cleanup).await {
                    warn!("[{}] Exception branch failed: {}", execution_id, e);
                }
            }
        }

        let failure = run.state.failure();
        let finished_at = Utc::now();
        self.reporter
            .report_workflow_end(execution_id, &run.playbook, failure.as_ref(), finished_at);

        match &failure {
            Some(e) => error!("[{}] Playbook '{}' {}: {}", execution_id, run.playbook.id, status, e),
            None => info!(
                "[{}] Playbook '{}' {} after {} step visits",
                execution_id,
                run.playbook.id,
                status,
                run.state.visits()
            ),
        }

        ExecutionReport {
            execution_id,
            playbook_id: run.playbook.id.clone(),
            status,
            variables: run.scope.snapshot().await,
            outputs: run.outputs.snapshot().await,
            failure: failure.as_ref().map(RunFailure::from),
            started_at,
            finished_at,
        }
    }

    /// Bounds a branch walk by the configured execution budget.
    async fn within_budget<F>(&self, walk: F) -> Result<(), EngineError>
    where
        F: Future<Output = Result<(), EngineError>>,
    {
        match self.config.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, walk)
                .await
                .unwrap_or_else(|_| Err(EngineError::Timeout(limit))),
            None => walk.await,
        }
    }
}

impl NestedRunner for Engine {
    fn run_nested(&self, playbook: Playbook) -> BoxFuture<'_, ExecutionReport> {
        self.execute(playbook).boxed()
    }
}

/// What a branch does after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Next(String),
    End,

    /// Run a sub-branch to its end, then continue at `then` (or stop).
    /// Inside the sub-branch, a transition back to `loop_step` ends it.
    Branch {
        head: String,
        then: Option<String>,
        loop_step: Option<String>,
    },

    /// Run every head concurrently, join, then continue at `then` (or stop)
    Fork {
        heads: Vec<String>,
        then: Option<String>,
    },
}

struct StepCompletion {
    flow: Flow,
    results: Variables,

    /// Error the step recovered from through `on_failure`
    recovered: Option<EngineError>,
}

impl StepCompletion {
    fn flow(flow: Flow) -> Self {
        Self {
            flow,
            results: Variables::new(),
            recovered: None,
        }
    }
}

/// Step IDs claimed by the branches of one fork, keyed to the branch index.
type Claims = Arc<Mutex<HashMap<String, usize>>>;

/// Where a branch walk sits within forks and loops.
#[derive(Debug, Clone, Default)]
struct Pointer {
    /// While step whose re-entry ends this branch
    loop_step: Option<String>,
    claims: Option<Claims>,
    branch: usize,
}

impl Pointer {
    /// Claims a step for this branch. A step first reached by a sibling
    /// branch of the same fork is lost.
    fn claim(&self, step_id: &str) -> bool {
        match &self.claims {
            Some(claims) => {
                let mut claims = claims.lock().unwrap_or_else(PoisonError::into_inner);
                *claims.entry(step_id.to_string()).or_insert(self.branch) == self.branch
            }
            None => true,
        }
    }

    fn ends_loop(&self, step_id: &str) -> bool {
        self.loop_step.as_deref() == Some(step_id)
    }
}

/// State of one run, shared by all of its branches.
struct Run {
    engine: Engine,
    playbook: Arc<Playbook>,
    metadata: Metadata,
    scope: Scope,
    outputs: Scope,
    state: ExecutionState,
}

impl Run {
    /// Walks steps from `head` until the branch reaches an end step.
    ///
    /// The first fatal error of the run is recorded in its state.
    fn execute_branch(
        self: Arc<Self>,
        head: String,
        pointer: Pointer,
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        async move {
            let result = self.walk(head, &pointer).await;
            if let Err(e) = &result {
                self.state.record_failure(e.clone());
            }
            result
        }
        .boxed()
    }

    async fn walk(self: &Arc<Self>, head: String, pointer: &Pointer) -> Result<(), EngineError> {
        let mut current = head;
        loop {
            if !pointer.claim(&current) {
                debug!(
                    "[{}] Step '{}' already taken by a sibling branch, branch ends",
                    self.metadata.execution_id, current
                );
                return Ok(());
            }

            let step = self
                .playbook
                .get_step(&current)
                .ok_or_else(|| EngineError::StepNotFound(current.clone()))?;

            let then = match self.execute_step(step).await? {
                Flow::End => return Ok(()),
                Flow::Next(next) => Some(next),
                Flow::Branch {
                    head,
                    then,
                    loop_step,
                } => {
                    let mut nested = pointer.clone();
                    if loop_step.is_some() {
                        nested.loop_step = loop_step;
                    }
                    Arc::clone(self).execute_branch(head, nested).await?;
                    then
                }
                Flow::Fork { heads, then } => {
                    self.join_branches(&step.id, heads, pointer).await?;
                    then
                }
            };

            match then {
                Some(next) if pointer.ends_loop(&next) => return Ok(()),
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
    }

    /// Runs every head as a concurrent branch and waits for all of them.
    ///
    /// A step reached by more than one branch runs once, in the branch
    /// that reaches it first; the others end there. Returns the first
    /// branch error. Remaining branches are aborted when
    /// `cancel_siblings_on_failure` is set and otherwise run to completion.
    async fn join_branches(
        self: &Arc<Self>,
        fork_id: &str,
        heads: Vec<String>,
        outer: &Pointer,
    ) -> Result<(), EngineError> {
        let claims = Claims::default();
        let mut branches = JoinSet::new();
        for (branch, head) in heads.into_iter().enumerate() {
            debug!("[{}] Step '{}' forking branch '{}'", self.metadata.execution_id, fork_id, head);
            let pointer = Pointer {
                loop_step: outer.loop_step.clone(),
                claims: Some(Arc::clone(&claims)),
                branch,
            };
            branches.spawn(Arc::clone(self).execute_branch(head, pointer));
        }

        let mut first_error = None;
        while let Some(joined) = branches.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(EngineError::Branch {
                    step_id: fork_id.to_string(),
                    message: e.to_string(),
                }),
            };

            if let Err(e) = result {
                if first_error.is_some() {
                    continue;
                }
                if self.engine.config.cancel_siblings_on_failure {
                    warn!(
                        "[{}] Branch of '{}' failed, aborting {} sibling branches",
                        self.metadata.execution_id,
                        fork_id,
                        branches.len()
                    );
                    branches.abort_all();
                }
                first_error = Some(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Executes one visit of a step, reporting start and end around it.
    async fn execute_step(&self, step: &Step) -> Result<Flow, EngineError> {
        if step.delay > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay)).await;
        }

        let mut variables = self.scope.snapshot().await;
        variables.merge(&step.step_variables);

        let execution_id = self.metadata.execution_id;
        let metadata = self.metadata.for_step(step.id.clone());
        debug!("[{}] Entering step '{}' ({})", execution_id, step.id, step.step_type);
        self.engine
            .reporter
            .report_step_start(execution_id, step, &variables, Utc::now());
        self.state.enter_step(&step.id);

        match self.dispatch(&metadata, step, &variables).await {
            Ok(completion) => {
                self.engine.reporter.report_step_end(
                    execution_id,
                    step,
                    &completion.results,
                    completion.recovered.as_ref(),
                    Utc::now(),
                );
                self.state
                    .leave_step(&step.id, completion.recovered.is_none());
                Ok(completion.flow)
            }
            Err(e) => {
                self.engine.reporter.report_step_end(
                    execution_id,
                    step,
                    &Variables::new(),
                    Some(&e),
                    Utc::now(),
                );
                self.state.leave_step(&step.id, false);
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        metadata: &Metadata,
        step: &Step,
        variables: &Variables,
    ) -> Result<StepCompletion, EngineError> {
        let engine = &self.engine;

        match step.step_type {
            StepType::Start => Ok(StepCompletion::flow(Flow::Next(start_transition(step)?))),
            StepType::End => Ok(StepCompletion::flow(Flow::End)),
            StepType::Action => {
                let executor =
                    ActionExecutor::new(Arc::clone(&engine.capabilities), Arc::clone(&engine.config));
                let outcome = executor
                    .execute(metadata, step, &self.playbook, variables)
                    .await;
                self.complete_action(step, outcome).await
            }
            StepType::PlaybookAction => {
                let executor = PlaybookActionExecutor::new(Arc::clone(&engine.repository));
                let outcome = executor.execute(metadata, step, variables, engine).await;
                self.complete_action(step, outcome).await
            }
            StepType::IfCondition => {
                let transition = ConditionExecutor::new(Arc::clone(&engine.evaluator))
                    .execute(metadata, step, variables)?;
                conditional_flow(step, transition).map(StepCompletion::flow)
            }
            StepType::SwitchCondition => {
                let transition = SwitchExecutor::new().execute(step, variables)?;
                conditional_flow(step, transition).map(StepCompletion::flow)
            }
            StepType::WhileCondition => {
                let transition = ConditionExecutor::new(Arc::clone(&engine.evaluator))
                    .execute(metadata, step, variables)?;
                while_flow(step, transition).map(StepCompletion::flow)
            }
            StepType::Parallel => Ok(StepCompletion::flow(Flow::Fork {
                heads: parallel_branches(step)?,
                then: step.on_completion.clone(),
            })),
        }
    }

    /// Merges an action's results into the run and picks the next step.
    async fn complete_action(
        &self,
        step: &Step,
        outcome: ActionOutcome,
    ) -> Result<StepCompletion, EngineError> {
        match (outcome.result, outcome.next_step) {
            (Ok(results), Some(next)) => {
                self.scope.merge(&results).await;
                self.outputs.merge(&results).await;
                Ok(StepCompletion {
                    flow: Flow::Next(next),
                    results,
                    recovered: None,
                })
            }
            (Ok(_), None) => Err(EngineError::NoTransition {
                step_id: step.id.clone(),
                reason: "action has neither on_success nor on_completion".into(),
            }),
            (Err(e), Some(next)) => {
                warn!(
                    "[{}] Step '{}' failed, continuing at '{}': {}",
                    self.metadata.execution_id, step.id, next, e
                );
                Ok(StepCompletion {
                    flow: Flow::Next(next),
                    results: Variables::new(),
                    recovered: Some(e),
                })
            }
            (Err(e), None) => Err(e),
        }
    }
}

/// A taken if/switch branch runs nested and joins at `on_completion`.
fn conditional_flow(step: &Step, transition: Transition) -> Result<Flow, EngineError> {
    match transition.next_step {
        Some(head) if transition.branch_taken => Ok(Flow::Branch {
            head,
            then: step.on_completion.clone(),
            loop_step: None,
        }),
        Some(next) => Ok(Flow::Next(next)),
        None => Err(missing_transition(step)),
    }
}

/// The `on_true` branch loops back into the while step; `on_false` runs
/// once and joins at `on_completion`. A body that transitions back to the
/// while step ends there so the loop re-evaluates one level up.
fn while_flow(step: &Step, transition: Transition) -> Result<Flow, EngineError> {
    let head = match transition.next_step {
        Some(head) => head,
        None => return Err(missing_transition(step)),
    };

    if head == step.id {
        return Ok(Flow::Next(head));
    }
    if !transition.branch_taken {
        return Ok(Flow::Next(head));
    }
    if step.on_true.as_deref() == Some(head.as_str()) {
        Ok(Flow::Branch {
            head,
            then: Some(step.id.clone()),
            loop_step: Some(step.id.clone()),
        })
    } else {
        Ok(Flow::Branch {
            head,
            then: step.on_completion.clone(),
            loop_step: Some(step.id.clone()),
        })
    }
}

fn missing_transition(step: &Step) -> EngineError {
    EngineError::NoTransition {
        step_id: step.id.clone(),
        reason: format!("{} step produced no next step", step.step_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityContext, CapabilityError};
    use crate::playbook::{variable_type, Command, Variable};
    use crate::reporter::{ExecutionTimeline, Reporter};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    /// Records the commands it runs and echoes them back as `__result__`.
    #[derive(Default)]
    struct Recording {
        commands: Mutex<Vec<String>>,
    }

    impl Recording {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Capability for Recording {
        fn command_type(&self) -> &str {
            "ssh"
        }

        async fn execute(
            &self,
            _metadata: &Metadata,
            context: CapabilityContext,
        ) -> Result<Variables, CapabilityError> {
            let command = context.command.command.clone();
            self.commands.lock().unwrap().push(command.clone());
            Ok(Variables::from_iter([Variable::string("__result__", command)]))
        }
    }

    struct Failing;

    #[async_trait]
    impl Capability for Failing {
        fn command_type(&self) -> &str {
            "http-api"
        }

        async fn execute(
            &self,
            _metadata: &Metadata,
            _context: CapabilityContext,
        ) -> Result<Variables, CapabilityError> {
            Err(CapabilityError::Failed("connection refused".into()))
        }
    }

    /// Increments the integer `__count__` it sees in its scope.
    struct Counter;

    #[async_trait]
    impl Capability for Counter {
        fn command_type(&self) -> &str {
            "count"
        }

        async fn execute(
            &self,
            _metadata: &Metadata,
            context: CapabilityContext,
        ) -> Result<Variables, CapabilityError> {
            let count: i64 = context
                .variables
                .find("__count__")
                .and_then(|v| v.value.parse().ok())
                .unwrap_or(0);
            Ok(Variables::from_iter([Variable::new(
                variable_type::INTEGER,
                "__count__",
                (count + 1).to_string(),
            )]))
        }
    }

    /// Sleeps for the number of milliseconds given as the command.
    struct Sleepy;

    #[async_trait]
    impl Capability for Sleepy {
        fn command_type(&self) -> &str {
            "sleep"
        }

        async fn execute(
            &self,
            _metadata: &Metadata,
            context: CapabilityContext,
        ) -> Result<Variables, CapabilityError> {
            let millis = context.command.command.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Variables::from_iter([Variable::string(
                format!("__slept_{}__", millis),
                "yes",
            )]))
        }
    }

    /// Captures lifecycle calls as short strings.
    #[derive(Default)]
    struct RecordingReporter {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl LifecycleReporter for RecordingReporter {
        fn report_workflow_start(&self, _: Uuid, playbook: &Playbook, _: DateTime<Utc>) {
            self.push(format!("workflow_start:{}", playbook.id));
        }

        fn report_workflow_end(
            &self,
            _: Uuid,
            playbook: &Playbook,
            error: Option<&EngineError>,
            _: DateTime<Utc>,
        ) {
            self.push(format!("workflow_end:{}:{}", playbook.id, error.is_some()));
        }

        fn report_step_start(&self, _: Uuid, step: &Step, _: &Variables, _: DateTime<Utc>) {
            self.push(format!("step_start:{}", step.id));
        }

        fn report_step_end(
            &self,
            _: Uuid,
            step: &Step,
            _: &Variables,
            error: Option<&EngineError>,
            _: DateTime<Utc>,
        ) {
            self.push(format!("step_end:{}:{}", step.id, error.is_some()));
        }
    }

    struct Harness {
        engine: Engine,
        recording: Arc<Recording>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness() -> Harness {
        let recording = Arc::new(Recording::default());
        let mut registry = CapabilityRegistry::new();
        registry.register_as("ssh", recording.clone());
        registry.register(Failing);
        registry.register(Counter);
        registry.register(Sleepy);

        let reporter = Arc::new(RecordingReporter::default());
        let mut engine = Engine::new(registry);
        engine.set_reporter(reporter.clone());

        Harness {
            engine,
            recording,
            reporter,
        }
    }

    fn action(id: &str, command_type: &str, command: &str) -> Step {
        Step::new(id, StepType::Action).with_command(Command::new(command_type, command))
    }

    fn end(id: &str) -> Step {
        Step::new(id, StepType::End)
    }

    fn linear_playbook() -> Playbook {
        Playbook::new("playbook--linear", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(action("action--1", "ssh", "block __ip__:value").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::new(
                variable_type::IPV4_ADDRESS,
                "__ip__",
                "10.0.0.9",
            )]))
    }

    #[tokio::test]
    async fn test_linear_run_succeeds() {
        let h = harness();
        let report = h.engine.execute(linear_playbook()).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.failure.is_none());
        assert_eq!(h.recording.commands(), vec!["block 10.0.0.9"]);
        assert_eq!(report.variables.find("__result__").unwrap().value, "block 10.0.0.9");
        assert_eq!(report.outputs.len(), 1);
        assert!(report.variables.contains("__ip__"));
    }

    #[tokio::test]
    async fn test_lifecycle_reported_once_per_visit() {
        let h = harness();
        h.engine.execute(linear_playbook()).await;

        assert_eq!(
            h.reporter.calls(),
            vec![
                "workflow_start:playbook--linear",
                "step_start:start--1",
                "step_end:start--1:false",
                "step_start:action--1",
                "step_end:action--1:false",
                "step_start:end--1",
                "step_end:end--1:false",
                "workflow_end:playbook--linear:false",
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_branches_all_reach_end() {
        let h = harness();
        let playbook = Playbook::new("playbook--parallel", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("parallel--1"))
            .with_step(Step::new("parallel--1", StepType::Parallel).with_next_steps(["D", "E"]))
            .with_step(action("D", "sleep", "40").on_completion("end--d"))
            .with_step(action("E", "sleep", "5").on_completion("end--e"))
            .with_step(end("end--d"))
            .with_step(end("end--e"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.variables.contains("__slept_40__"));
        assert!(report.variables.contains("__slept_5__"));

        let calls = h.reporter.calls();
        let workflow_end = calls.iter().position(|c| c.starts_with("workflow_end")).unwrap();
        for end_step in ["step_end:end--d:false", "step_end:end--e:false"] {
            let position = calls.iter().position(|c| c == end_step).unwrap();
            assert!(position < workflow_end);
        }
    }

    #[tokio::test]
    async fn test_parallel_join_continues_at_on_completion() {
        let h = harness();
        let playbook = Playbook::new("playbook--join", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("parallel--1"))
            .with_step(
                Step::new("parallel--1", StepType::Parallel)
                    .with_next_steps(["D", "E"])
                    .on_completion("report--1"),
            )
            .with_step(action("D", "sleep", "10").on_completion("end--1"))
            .with_step(action("E", "sleep", "1").on_completion("end--1"))
            .with_step(action("report--1", "ssh", "report").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["report"]);
    }

    #[tokio::test]
    async fn test_parallel_branches_share_successor_once() {
        let h = harness();
        let playbook = Playbook::new("playbook--converge", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("parallel--1"))
            .with_step(Step::new("parallel--1", StepType::Parallel).with_next_steps(["D", "E"]))
            .with_step(action("D", "sleep", "10").on_completion("F"))
            .with_step(action("E", "sleep", "1").on_completion("F"))
            .with_step(action("F", "ssh", "isolate host").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["isolate host"]);
        assert!(report.variables.contains("__slept_10__"));

        let visits = h
            .reporter
            .calls()
            .iter()
            .filter(|c| c.as_str() == "step_start:F")
            .count();
        assert_eq!(visits, 1);
    }

    #[tokio::test]
    async fn test_failure_runs_exception_step() {
        let h = harness();
        let playbook = Playbook::new("playbook--fail", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(action("action--1", "http-api", "GET /").on_completion("end--1"))
            .with_step(action("cleanup--1", "ssh", "cleanup").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_exception("cleanup--1");

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.step_id.as_deref(), Some("action--1"));
        assert!(failure.message.contains("connection refused"));
        assert_eq!(h.recording.commands(), vec!["cleanup"]);

        let calls = h.reporter.calls();
        assert!(calls.contains(&"step_end:action--1:true".to_string()));
        assert_eq!(calls.last().unwrap(), "workflow_end:playbook--fail:true");
    }

    #[tokio::test]
    async fn test_exception_branch_errors_do_not_change_outcome() {
        let h = harness();
        let playbook = Playbook::new("playbook--fail", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(action("action--1", "http-api", "GET /").on_completion("end--1"))
            .with_step(action("cleanup--1", "http-api", "DELETE /").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_exception("cleanup--1");

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.unwrap().step_id.as_deref(), Some("action--1"));
    }

    #[tokio::test]
    async fn test_on_failure_recovers() {
        let h = harness();
        let playbook = Playbook::new("playbook--recover", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(
                action("action--1", "http-api", "GET /")
                    .on_completion("end--1")
                    .on_failure("notify--1"),
            )
            .with_step(action("notify--1", "ssh", "notify").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["notify"]);
        // The recovered error is still reported on the failing step
        assert!(h
            .reporter
            .calls()
            .contains(&"step_end:action--1:true".to_string()));
    }

    #[tokio::test]
    async fn test_while_loop_reenters_until_false() {
        let h = harness();
        let playbook = Playbook::new("playbook--while", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("while--1"))
            .with_step(
                Step::new("while--1", StepType::WhileCondition)
                    .with_condition("__count__:value < 3")
                    .on_true("increment--1")
                    .on_completion("done--1"),
            )
            .with_step(action("increment--1", "count", "inc").on_completion("end--loop"))
            .with_step(end("end--loop"))
            .with_step(action("done--1", "ssh", "done __count__:value").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::new(
                variable_type::INTEGER,
                "__count__",
                "0",
            )]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.variables.find("__count__").unwrap().value, "3");
        assert_eq!(h.recording.commands(), vec!["done 3"]);

        let visits = h
            .reporter
            .calls()
            .iter()
            .filter(|c| c.as_str() == "step_start:while--1")
            .count();
        assert_eq!(visits, 4);
    }

    #[tokio::test]
    async fn test_while_body_returning_to_loop_step() {
        let h = harness();
        let playbook = Playbook::new("playbook--while", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("while--1"))
            .with_step(
                Step::new("while--1", StepType::WhileCondition)
                    .with_condition("__count__:value < 3")
                    .on_true("increment--1")
                    .on_completion("done--1"),
            )
            .with_step(action("increment--1", "count", "inc").on_completion("while--1"))
            .with_step(action("done--1", "ssh", "done __count__:value").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::new(
                variable_type::INTEGER,
                "__count__",
                "0",
            )]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.variables.find("__count__").unwrap().value, "3");
        assert_eq!(h.recording.commands(), vec!["done 3"]);

        let calls = h.reporter.calls();
        let visits = calls
            .iter()
            .filter(|c| c.as_str() == "step_start:while--1")
            .count();
        assert_eq!(visits, 4);
        let ends = calls.iter().filter(|c| c.as_str() == "step_start:end--1").count();
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn test_if_branch_joins_at_on_completion() {
        let h = harness();
        let playbook = Playbook::new("playbook--if", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("if--1"))
            .with_step(
                Step::new("if--1", StepType::IfCondition)
                    .with_condition("__ip__:value IN 10.0.0.0/8")
                    .on_true("block--1")
                    .on_false("allow--1")
                    .on_completion("report--1"),
            )
            .with_step(action("block--1", "ssh", "block").on_completion("end--branch"))
            .with_step(action("allow--1", "ssh", "allow").on_completion("end--branch"))
            .with_step(end("end--branch"))
            .with_step(action("report--1", "ssh", "report").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::new(
                variable_type::IPV4_ADDRESS,
                "__ip__",
                "10.20.30.40",
            )]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["block", "report"]);
    }

    #[tokio::test]
    async fn test_switch_selects_case() {
        let h = harness();
        let playbook = Playbook::new("playbook--switch", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("switch--1"))
            .with_step(
                Step::new("switch--1", StepType::SwitchCondition)
                    .with_switch("__severity__:value")
                    .with_case("high", "isolate--1")
                    .with_case("default", "notify--1"),
            )
            .with_step(action("isolate--1", "ssh", "isolate").on_completion("end--1"))
            .with_step(action("notify--1", "ssh", "notify").on_completion("end--1"))
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::string("__severity__", "high")]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["isolate"]);
    }

    #[tokio::test]
    async fn test_step_variables_overlay_run_scope() {
        let h = harness();
        let mut step = action("action--1", "ssh", "scan __target__:value").on_completion("end--1");
        step.step_variables = Variables::from_iter([Variable::string("__target__", "web-01")]);
        let playbook = Playbook::new("playbook--scoped", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(step)
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::string("__target__", "db-01")]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(h.recording.commands(), vec!["scan web-01"]);
        // Step variables never leak into the run scope
        assert_eq!(report.variables.find("__target__").unwrap().value, "db-01");
    }

    #[tokio::test]
    async fn test_missing_step_fails_run() {
        let h = harness();
        let playbook = Playbook::new("playbook--broken", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("missing--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.unwrap().step_id.as_deref(), Some("missing--1"));
    }

    #[tokio::test]
    async fn test_action_without_next_step_fails() {
        let h = harness();
        let playbook = Playbook::new("playbook--dangling", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(action("action--1", "ssh", "whoami"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.failure.unwrap().message.contains("no transition"));
    }

    #[tokio::test]
    async fn test_reruns_are_idempotent() {
        let h = harness();
        let first = h.engine.execute(linear_playbook()).await;
        let second = h.engine.execute(linear_playbook()).await;

        assert_ne!(first.execution_id, second.execution_id);
        assert_eq!(first.status, second.status);
        assert_eq!(first.variables, second.variables);
        assert_eq!(first.outputs, second.outputs);
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let mut h = harness();
        let mut config = EngineConfig::default();
        config.set_execution_timeout(Some(Duration::from_millis(50)));
        h.engine.set_config(config);

        let playbook = Playbook::new("playbook--slow", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("action--1"))
            .with_step(action("action--1", "sleep", "5000").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::TimedOut);
        assert!(report.failure.as_ref().unwrap().message.contains("50ms"));
        assert!(report.duration_ms() < 5000);
    }

    #[tokio::test]
    async fn test_cancel_siblings_on_failure() {
        let mut h = harness();
        let mut config = EngineConfig::default();
        config.set_cancel_siblings_on_failure(true);
        h.engine.set_config(config);

        let playbook = Playbook::new("playbook--cancel", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("parallel--1"))
            .with_step(Step::new("parallel--1", StepType::Parallel).with_next_steps(["D", "E"]))
            .with_step(action("D", "http-api", "GET /").on_completion("end--1"))
            .with_step(action("E", "sleep", "5000").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.duration_ms() < 5000);
        assert!(!report.variables.contains("__slept_5000__"));
    }

    #[tokio::test]
    async fn test_siblings_run_to_completion_by_default() {
        let h = harness();
        let playbook = Playbook::new("playbook--siblings", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("parallel--1"))
            .with_step(Step::new("parallel--1", StepType::Parallel).with_next_steps(["D", "E"]))
            .with_step(action("D", "http-api", "GET /").on_completion("end--1"))
            .with_step(action("E", "sleep", "20").on_completion("end--1"))
            .with_step(end("end--1"));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.unwrap().step_id.as_deref(), Some("D"));
        assert!(report.variables.contains("__slept_20__"));
    }

    #[tokio::test]
    async fn test_sub_playbook_outputs_merged() {
        let mut h = harness();
        let repository = Arc::new(MemoryRepository::new());
        repository
            .create(
                Playbook::new("playbook--child", "start--c")
                    .with_step(Step::new("start--c", StepType::Start).on_completion("action--c"))
                    .with_step(action("action--c", "ssh", "enrich __ip__:value").on_completion("end--c"))
                    .with_step(end("end--c")),
            )
            .await
            .unwrap();
        h.engine.set_repository(repository);

        let playbook = Playbook::new("playbook--parent", "start--1")
            .with_step(Step::new("start--1", StepType::Start).on_completion("sub--1"))
            .with_step(
                Step::new("sub--1", StepType::PlaybookAction)
                    .with_playbook("playbook--child")
                    .on_completion("end--1"),
            )
            .with_step(end("end--1"))
            .with_variables(Variables::from_iter([Variable::string("__ip__", "192.0.2.1")]));

        let report = h.engine.execute(playbook).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(h.recording.commands(), vec!["enrich 192.0.2.1"]);
        assert_eq!(
            report.variables.find("__result__").unwrap().value,
            "enrich 192.0.2.1"
        );

        let calls = h.reporter.calls();
        let starts = calls.iter().filter(|c| c.starts_with("workflow_start")).count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn test_acceptance_sent_before_run() {
        let h = harness();
        let (sender, receiver) = oneshot::channel();

        let report = h.engine.execute_async(linear_playbook(), Some(sender)).await;
        let details = receiver.await.unwrap();

        assert_eq!(details.execution_id, report.execution_id);
        assert_eq!(details.playbook_id, "playbook--linear");
    }

    #[tokio::test]
    async fn test_timeline_receives_run() {
        let h = harness();
        let timeline = Arc::new(ExecutionTimeline::new());
        let downstream: Vec<Arc<dyn crate::reporter::DownstreamReporter>> = vec![timeline.clone()];
        let reporter = Reporter::start(downstream, 10).unwrap();
        let mut engine = h.engine.clone();
        engine.set_reporter(Arc::new(reporter.clone()));

        let report = engine.execute(linear_playbook()).await;
        reporter.flush().await.unwrap();

        assert_eq!(timeline.executions(), vec![report.execution_id]);
        assert_eq!(timeline.get_events(report.execution_id).len(), 6);
        assert_eq!(timeline.status(report.execution_id), Some(RunStatus::Succeeded));
    }
}
