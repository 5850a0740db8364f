//! flowbench command line
//!
//! Runs a project's script against its persisted context, or prints the
//! dependency graph of a script.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use flowbench::{
    block::{execute_restricted, Block},
    config::{ProjectFile, WorkbenchSettings},
    context::{Context, ContextSerializer, JsonContextSerializer},
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "flowbench")]
#[command(about = "Run dataflow blocks against numeric contexts", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a project's script against its context
    Run {
        /// Project file
        project: PathBuf,

        /// Only run statements reachable from these names (comma separated)
        #[arg(long, value_delimiter = ',')]
        inputs: Option<Vec<String>>,

        /// Only run statements needed for these names (comma separated)
        #[arg(long, value_delimiter = ',')]
        outputs: Option<Vec<String>>,

        /// Write the context back to the project's context path
        #[arg(long)]
        save: bool,
    },

    /// Print statements in dependency order with their inputs and outputs
    Graph {
        /// Script file
        script: PathBuf,
    },
}

/// Failures mapped to exit codes.
enum Failure {
    ProjectLoad(anyhow::Error),
    Execution(anyhow::Error),
}

impl Failure {
    fn code(&self) -> u8 {
        match self {
            Failure::ProjectLoad(_) => 2,
            Failure::Execution(_) => 1,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Failure::ProjectLoad(e) | Failure::Execution(e) => e,
        }
    }
}

fn init_logging(filter: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().context("log file path has no file name")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn load_settings(path: Option<&Path>) -> Result<WorkbenchSettings> {
    match path {
        Some(path) => WorkbenchSettings::load(path).with_context(|| format!("loading settings {}", path.display())),
        None => Ok(WorkbenchSettings::load_or_default()),
    }
}

fn run(
    settings: &WorkbenchSettings,
    project_path: &Path,
    inputs: Option<Vec<String>>,
    outputs: Option<Vec<String>>,
    save: bool,
) -> std::result::Result<(), Failure> {
    let serializer = if settings.pretty_contexts {
        JsonContextSerializer::pretty()
    } else {
        JsonContextSerializer::new()
    };

    let (project, block, context) = (|| -> Result<(ProjectFile, Block, Context)> {
        let project = ProjectFile::load(project_path)?;
        let source = std::fs::read_to_string(&project.script_path)
            .with_context(|| format!("reading script {}", project.script_path.display()))?;
        let block = Block::parse(&source)?;
        let config = settings.context_config(&project.base_dir)?;
        let context = if project.context_path.exists() {
            serializer.load_from_path(&project.context_path, config)?
        } else {
            tracing::info!(path = %project.context_path.display(), "No persisted context, starting empty");
            Context::with_config("root", config)
        };
        Ok((project, block, context))
    })()
    .map_err(Failure::ProjectLoad)?;

    let inputs: Option<BTreeSet<String>> = inputs.map(|v| v.into_iter().collect());
    let outputs: Option<BTreeSet<String>> = outputs.map(|v| v.into_iter().collect());
    let report = execute_restricted(&block, &context, inputs.as_ref(), outputs.as_ref())
        .map_err(|e| Failure::Execution(e.into()))?;
    for label in &report.executed {
        println!("ran  {label}");
    }
    println!(
        "{} statement(s) executed, {} skipped in {:?}",
        report.executed.len(),
        report.skipped,
        report.elapsed
    );

    if save {
        serializer
            .save_to_path(&context, &project.context_path)
            .map_err(|e| Failure::Execution(e.into()))?;
        tracing::info!(path = %project.context_path.display(), "Context saved");
    }
    Ok(())
}

fn graph(script: &Path) -> Result<()> {
    let source =
        std::fs::read_to_string(script).with_context(|| format!("reading script {}", script.display()))?;
    let block = Block::parse(&source)?;
    let join = |names: &BTreeSet<String>| names.iter().cloned().collect::<Vec<_>>().join(", ");
    for (position, index) in block.topological_order()?.into_iter().enumerate() {
        let statement = &block.statements()[index];
        println!(
            "{position:>3}. {}\n     in:  {}\n     out: {}",
            statement.label(),
            join(&statement.inputs()),
            join(&statement.outputs())
        );
    }
    println!("block inputs:  {}", join(&block.inputs()?));
    println!("block outputs: {}", join(&block.outputs()));
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    let _guard = match init_logging(&settings.log_filter, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Run {
            project,
            inputs,
            outputs,
            save,
        } => run(&settings, &project, inputs, outputs, save),
        Commands::Graph { script } => graph(&script).map_err(Failure::Execution),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            tracing::error!(error = %failure.error(), "flowbench failed");
            eprintln!("error: {:#}", failure.error());
            ExitCode::from(failure.code())
        }
    }
}
