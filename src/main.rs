//! # VoxLogicA CLI
//!
//! Command-line driver: `run <file>` executes a program against the
//! configured result store, `repl` opens an interactive session,
//! `version` prints the crate version.
//!
//! Exit codes: 0 success, 1 reduction/execution failure, 2 usage error.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use voxlogica::config::Config;
use voxlogica::execution::{ExecutionEngine, Strategy};
use voxlogica::parser::parse_program;
use voxlogica::primitives::PrimitiveRegistry;
use voxlogica::reducer::reduce_program;
use voxlogica::repl::{ReplOutcome, ReplSession};
use voxlogica::store::MaterializationStore;

#[derive(Parser)]
#[command(name = "voxlogica", about = "VoxLogicA declarative image analysis", disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a VoxLogicA program file
    Run {
        /// Program file (.imgql)
        file: PathBuf,

        /// Execution strategy (strict, deferred; dask is an alias)
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Interactive session
    Repl,
    /// Print the version
    Version,
}

fn setup_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_engine(config: &Config) -> anyhow::Result<ExecutionEngine> {
    let store = MaterializationStore::open(&config.storage.db_path).with_context(|| {
        format!(
            "opening results database at {}",
            config.storage.db_path.display()
        )
    })?;
    Ok(ExecutionEngine::new(
        Arc::new(PrimitiveRegistry::new()),
        store,
        config.execution.num_workers,
    ))
}

fn run_file(config: &Config, file: &PathBuf, strategy: Option<&str>) -> anyhow::Result<bool> {
    let strategy: Strategy = strategy
        .unwrap_or(&config.execution.strategy)
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;

    let source = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let program = parse_program(&source)?;

    let engine = build_engine(config)?;
    let plan = reduce_program(&program, engine.registry())?;
    tracing::info!(
        nodes = plan.node_count(),
        goals = plan.goals.len(),
        strategy = strategy.as_str(),
        "executing plan"
    );

    let result = engine.execute_workplan(&plan, strategy);
    for failure in &result.failures {
        eprintln!(
            "goal '{}' failed: {}",
            failure.goal.name, failure.error
        );
    }
    tracing::info!(
        computed = result.cache_summary.computed,
        cached = result.cache_summary.cached_store,
        failed = result.cache_summary.failed,
        "run complete"
    );
    engine.store().close();
    Ok(result.success)
}

fn run_repl(config: &Config) -> anyhow::Result<()> {
    println!("VoxLogicA {} interactive session", env!("CARGO_PKG_VERSION"));
    println!("Commands: .load <file>  .help  .quit\n");

    let engine = build_engine(config)?;
    let strategy: Strategy = config
        .execution
        .strategy
        .parse()
        .unwrap_or(Strategy::Deferred);
    let mut session = ReplSession::new(engine, strategy);

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted | rustyline::error::ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if input == ".quit" || input == ".exit" {
            break;
        }
        if input == ".help" {
            println!(".load <file>  - load declarations from a file");
            println!(".quit         - exit");
            println!("Anything else is evaluated as VoxLogicA input.");
            continue;
        }
        if let Some(path) = input.strip_prefix(".load ") {
            match session.load_file(path.trim(), false) {
                Ok(loaded) => println!(
                    "loaded {} declarations ({} goals skipped)",
                    loaded.declarations_added, loaded.goals_skipped
                ),
                Err(err) => println!("error: {err}"),
            }
            continue;
        }

        match session.execute_input(input) {
            Ok(ReplOutcome::Value(value)) => {
                println!("{}", value.value.render());
            }
            Ok(ReplOutcome::Program(result)) => {
                if result.goals_executed == 0 {
                    println!("ok ({} declarations)", result.declarations_added);
                }
            }
            Err(err) => println!("error: {err}"),
        }
    }
    session.engine().store().close();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|err| {
        eprintln!("warning: configuration error ({err}), using defaults");
        Config::default()
    });
    setup_logging(&config);

    let outcome = match &cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
        Commands::Run { file, strategy } => run_file(&config, file, strategy.as_deref()),
        Commands::Repl => run_repl(&config).map(|()| true),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
