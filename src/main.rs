//! SoarFlow CLI Entry Point
//!
//! Provides a command-line interface for running a playbook file.
//!
//! # Usage
//!
//! ```bash
//! # Execute a playbook
//! soarflow playbook.json
//!
//! # Override external variables
//! soarflow playbook.yaml --var __ip__=198.51.100.7
//!
//! # Dry run mode (log commands instead of executing them)
//! soarflow playbook.json --dry-run
//!
//! # Bound the whole run
//! soarflow playbook.json --timeout 300
//! ```

use std::env;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use soarflow::capability::{BashCapability, CapabilityRegistry, DryRunCapability};
use soarflow::execution::{Engine, EngineConfig, ExecutionReport, RunStatus, Trigger};
use soarflow::playbook::{load_playbook, variable_type, Playbook, Variable, Variables};
use soarflow::reporter::{DownstreamReporter, ExecutionTimeline, Reporter};
use soarflow::repository::MemoryRepository;
use soarflow::{APP_NAME, VERSION};

/// Default playbook file used when none is specified.
const DEFAULT_PLAYBOOK: &str = "playbook.json";

/// Command-line configuration parsed from arguments.
#[derive(Debug, PartialEq)]
struct Config {
    playbook_path: String,
    variables: Vec<(String, String)>,
    dry_run: bool,
    timeout: Option<u64>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            playbook_path: DEFAULT_PLAYBOOK.to_string(),
            variables: Vec::new(),
            dry_run: false,
            timeout: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Security Playbook Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: soarflow [OPTIONS] <PLAYBOOK_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAYBOOK_FILE>     Path to playbook JSON or YAML file");
    println!();
    println!("Options:");
    println!("  --var NAME=VALUE    Override an external playbook variable (repeatable)");
    println!("  --dry-run           Log commands without executing them");
    println!("  --timeout SECS      Abort the run after SECS seconds");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  soarflow playbook.json");
    println!("  soarflow playbook.yaml --var __ip__=198.51.100.7");
    println!("  soarflow playbook.json --dry-run --timeout 300");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--var" => {
                i += 1;
                if i >= args.len() {
                    return Err("--var requires a NAME=VALUE argument".to_string());
                }
                config.variables.push(parse_assignment(&args[i])?);
            }
            "--timeout" => {
                i += 1;
                if i >= args.len() {
                    return Err("--timeout requires a number argument".to_string());
                }
                let secs: u64 = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", args[i]))?;
                config.timeout = (secs > 0).then_some(secs);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.playbook_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("Invalid variable assignment '{}', expected NAME=VALUE", raw)),
    }
}

/// Builds override variables, typed like the playbook variables they replace.
fn build_overrides(playbook: &Playbook, assignments: &[(String, String)]) -> Variables {
    assignments
        .iter()
        .map(|(name, value)| {
            let var_type = playbook
                .playbook_variables
                .find(name)
                .map(|v| v.var_type.clone())
                .unwrap_or_else(|| variable_type::STRING.to_string());
            Variable::new(var_type, name.clone(), value.clone())
        })
        .collect()
}

/// Registers the local backends, or the dry-run backend for every command type.
fn build_registry(playbook: &Playbook, dry_run: bool) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    if dry_run {
        let capability = Arc::new(DryRunCapability::new());
        for command_type in playbook.command_types() {
            registry.register_as(command_type, capability.clone());
        }
    } else {
        registry.register(BashCapability::new());
    }

    registry
}

/// Prints the terminal status, run time and timeline of a run.
fn print_summary(report: &ExecutionReport, timeline: &ExecutionTimeline) {
    let label = report.status.to_string();
    let status = match report.status {
        RunStatus::Succeeded => label.as_str().green().bold(),
        RunStatus::Running => label.as_str().yellow().bold(),
        RunStatus::Failed | RunStatus::TimedOut => label.as_str().red().bold(),
    };

    println!();
    println!("Playbook '{}' {}", report.playbook_id, status);
    println!(
        "Total execution time: {:.2?}",
        Duration::from_millis(report.duration_ms().max(0) as u64)
    );

    if let Some(failure) = &report.failure {
        println!("Failed step: {}", failure.step_id.as_deref().unwrap_or("-"));
        println!("Error: {}", failure.message);
    }

    println!("{}", timeline.gantt_chart(report.execution_id));
}

/// Loads the playbook into a repository and runs it through the trigger.
async fn execute(config: &Config, playbook: Playbook) -> Result<(), Box<dyn Error>> {
    let overrides = build_overrides(&playbook, &config.variables);
    let registry = build_registry(&playbook, config.dry_run);
    info!("Capabilities: {}", registry.list().join(", "));

    let mut engine_config = EngineConfig::from_env();
    if let Some(secs) = config.timeout {
        engine_config.set_execution_timeout(Some(Duration::from_secs(secs)));
    }

    let timeline = Arc::new(ExecutionTimeline::new());
    let downstream: Vec<Arc<dyn DownstreamReporter>> = vec![timeline.clone()];
    let reporter = Reporter::start(downstream, engine_config.max_reporters)?;

    let playbook_id = playbook.id.clone();
    let repository = Arc::new(MemoryRepository::new());
    repository.create(playbook).await?;

    let mut engine = Engine::new(registry);
    engine.set_config(engine_config);
    engine.set_reporter(Arc::new(reporter.clone()));
    engine.set_repository(repository);

    let trigger = Trigger::new(engine);
    let handle = trigger.execute_by_id(&playbook_id, &overrides).await?;
    info!("Execution ID: {}", handle.execution_id());

    let report = handle.wait().await?;
    reporter.flush().await?;

    print_summary(&report, &timeline);

    if report.succeeded() {
        Ok(())
    } else {
        Err(format!("Playbook '{}' {}", report.playbook_id, report.status).into())
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    // Load playbook
    let playbook = load_playbook(&config.playbook_path).map_err(|e| {
        error!("Failed to load playbook: {}", e);
        format!(
            "Could not load playbook from '{}': {}",
            config.playbook_path, e
        )
    })?;

    info!(
        "Playbook loaded: {} steps, {} variables",
        playbook.len(),
        playbook.playbook_variables.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(&config, playbook))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
