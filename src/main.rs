use anyhow::Context;
use checkflow::config::{validate_config, ConfigLoader, EngineConfig};
use checkflow::engine::{EventContext, RunOptions, RunOutcome, Selection, StateMachineRunner};
use checkflow::error::EngineError;
use checkflow::graph::DependencyGraph;
use checkflow::journal::ExecutionJournal;
use checkflow::provider::ProviderRegistry;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace};

/// Run a graph of checks with gates, fan-out and routing
#[derive(Parser)]
#[command(name = "checkflow")]
#[command(version, about = "Dependency-ordered check orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the checks of a configuration file
    Run {
        /// Path to the configuration file (.yaml, .json or .toml)
        config: PathBuf,

        /// Run only these checks and their dependencies
        #[arg(short = 'c', long = "check")]
        checks: Vec<String>,

        /// Run only checks carrying one of these tags
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Skip checks carrying one of these tags
        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,

        /// Name of the triggering event
        #[arg(short = 'e', long)]
        event: Option<String>,

        /// JSON file describing the event (pr, files, branch, payload)
        #[arg(long)]
        event_file: Option<PathBuf>,

        /// Maximum number of concurrent dispatches within a level
        #[arg(short = 'j', long)]
        max_parallelism: Option<usize>,

        /// Stop scheduling new work after the first blocking failure
        #[arg(long)]
        fail_fast: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a configuration file without running anything
    Validate {
        /// Path to the configuration file
        config: PathBuf,
    },
    /// Print the entries of a journal snapshot
    Inspect {
        /// Path to a snapshot written by a previous run
        snapshot: PathBuf,

        /// Show only entries of this check
        #[arg(short = 'c', long)]
        check: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info,checkflow=debug",
        2 => "debug,checkflow=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("checkflow started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::Run {
            config,
            checks,
            tags,
            exclude_tags,
            event,
            event_file,
            max_parallelism,
            fail_fast,
            json,
        } => {
            let selection = Selection {
                checks,
                include_tags: tags,
                exclude_tags,
            };
            run_checks(RunArgs {
                config,
                selection,
                event,
                event_file,
                max_parallelism,
                fail_fast,
                json,
            })
            .await
        }
        Commands::Validate { config } => validate(&config).await,
        Commands::Inspect { snapshot, check } => inspect(&snapshot, check.as_deref()).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            let code = e
                .downcast_ref::<EngineError>()
                .map(|engine| {
                    eprintln!("Error: {}", engine.user_message());
                    engine.exit_code()
                })
                .unwrap_or_else(|| {
                    eprintln!("Error: {e:#}");
                    1
                });
            std::process::exit(code);
        }
    }
}

struct RunArgs {
    config: PathBuf,
    selection: Selection,
    event: Option<String>,
    event_file: Option<PathBuf>,
    max_parallelism: Option<usize>,
    fail_fast: bool,
    json: bool,
}

async fn run_checks(args: RunArgs) -> anyhow::Result<i32> {
    let config = ConfigLoader::load(&args.config).await?;

    let mut event = match &args.event_file {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            serde_json::from_str::<EventContext>(&content)
                .with_context(|| format!("Failed to parse event file {}", path.display()))?
        }
        None => EventContext::default(),
    };
    if let Some(name) = args.event {
        event.name = name;
    }

    let options = RunOptions {
        selection: args.selection,
        event,
        max_parallelism: args.max_parallelism,
        fail_fast: args.fail_fast.then_some(true),
        ..Default::default()
    };
    let outcome = StateMachineRunner::new(config, ProviderRegistry::with_builtins())
        .with_options(options)
        .run()
        .await;

    if args.json {
        let rendered = serde_json::to_string_pretty(&outcome.summary()).context("Failed to render summary")?;
        println!("{}", rendered);
    } else {
        print_summary(&outcome);
    }
    Ok(outcome.exit_code())
}

fn print_summary(outcome: &RunOutcome) {
    let stats = &outcome.statistics;
    println!("Session {} finished in state {}", outcome.session_id, outcome.state);
    for check in &stats.per_check {
        println!(
            "  {:<24} runs={} ok={} failed={} skipped={} retries={} reruns={} issues={}",
            check.check_id,
            check.executions,
            check.successful,
            check.failed,
            check.skipped,
            check.retries,
            check.reruns,
            check.issues.total
        );
    }
    if !stats.not_run.is_empty() {
        println!("  not run: {}", stats.not_run.join(", "));
    }
    for issue in outcome.all_issues() {
        println!("  [{}] {}: {}", issue.severity, issue.rule_id, issue.message);
    }
    println!(
        "{} executions, {} successful, {} failed, {} skipped in {:?}",
        stats.total_executions,
        stats.successful,
        stats.failed,
        stats.skipped,
        stats.total_duration
    );
    if let Some(fatal) = &outcome.fatal {
        println!("Fatal: {}", fatal.user_message());
    }
}

async fn validate(path: &Path) -> anyhow::Result<i32> {
    let config: EngineConfig = ConfigLoader::load(path).await?;
    let registry = ProviderRegistry::with_builtins();
    validate_config(&config, &registry.names())?;
    registry.validate_checks(&config)?;
    let graph = DependencyGraph::build(&config.checks)?;
    let levels = graph.compute_waves(&config.checks.keys().cloned().collect());
    println!(
        "{}: {} checks in {} levels",
        path.display(),
        config.checks.len(),
        levels.len()
    );
    Ok(0)
}

async fn inspect(path: &Path, check: Option<&str>) -> anyhow::Result<i32> {
    let journal = ExecutionJournal::load_snapshot(path).await?;
    println!("Session {} ({} entries)", journal.session_id(), journal.size());
    for entry in journal
        .entries()
        .into_iter()
        .filter(|e| check.map_or(true, |id| e.check_id == id))
    {
        let status = match (&entry.result.error, entry.result.has_blocking_issue()) {
            (Some(_), _) => "error",
            (None, true) => "failed",
            (None, false) => "ok",
        };
        println!(
            "#{:<4} {:<24} {:<20} {:<6} issues={}",
            entry.commit_id,
            entry.check_id,
            entry.scope.to_string(),
            status,
            entry.result.issues.len()
        );
        if let Some(output) = &entry.result.output {
            println!("      output: {}", output);
        }
    }
    Ok(0)
}
