//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Provider-agnostic deployment pipeline orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CONVEYOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline definition
        #[arg(default_value = "conveyor.kdl")]
        path: PathBuf,
    },
    /// Show the stages and actions a run would execute
    Plan {
        #[arg(default_value = "conveyor.kdl")]
        path: PathBuf,
    },
    /// Run a pipeline
    Run {
        #[arg(default_value = "conveyor.kdl")]
        path: PathBuf,

        /// Approve every gated deployment without prompting
        #[arg(long, env = "CONVEYOR_APPROVE")]
        approve: bool,

        /// Custom variable available as ${name}
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Keep the artifacts of only the newest N runs
        #[arg(long, env = "CONVEYOR_KEEP_RUNS")]
        keep_runs: Option<usize>,

        /// Directory for workspaces and artifacts
        #[arg(long, env = "CONVEYOR_WORK_DIR")]
        work_dir: Option<PathBuf>,

        /// How often a self-mutating pipeline may restart
        #[arg(long, default_value = "3")]
        max_restarts: u32,
    },
    /// Deploy an image of a unit through environments in order
    Promote {
        /// Path to the pipeline definition declaring the unit and environments
        path: PathBuf,

        /// Deployable unit name
        unit: String,

        /// Image reference to deploy
        #[arg(long)]
        image: String,

        /// Target environments in promotion order (default: all, as declared)
        #[arg(long = "env")]
        environments: Vec<String>,

        /// Approve every gated deployment without prompting
        #[arg(long, env = "CONVEYOR_APPROVE")]
        approve: bool,
    },
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan { path } => {
            commands::plan(&path)?;
        }
        Commands::Run {
            path,
            approve,
            vars,
            keep_runs,
            work_dir,
            max_restarts,
        } => {
            let options = commands::run::RunOptions {
                approve,
                vars,
                keep_runs,
                work_dir: work_dir.unwrap_or_else(commands::default_work_dir),
                max_restarts,
            };
            commands::run::run(&path, options).await?;
        }
        Commands::Promote {
            path,
            unit,
            image,
            environments,
            approve,
        } => {
            commands::promote::promote(&path, &unit, &image, &environments, approve).await?;
        }
    }

    Ok(())
}
