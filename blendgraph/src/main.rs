//! Blendgraph CLI.
//!
//! `start` runs a task through the agent graph; a run that reaches the user
//! node suspends and prints its id, and `resume` feeds it a follow-up.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use blendgraph::coordinator::{Collaborators, Coordinator};
use blendgraph::exit_codes;
use blendgraph::io::brain::CommandBrain;
use blendgraph::io::checkpoint::FileCheckpointStore;
use blendgraph::io::config::{PipelineConfig, load_config};
use blendgraph::io::docs::JsonDocumentStore;
use blendgraph::io::init::{InitOptions, StatePaths, init_state_dir};
use blendgraph::io::render::BlenderRenderer;
use blendgraph::io::script::BlenderExecutor;
use blendgraph::logging;
use blendgraph::pipeline::{Pipeline, RunHandle};

#[derive(Parser)]
#[command(
    name = "blendgraph",
    version,
    about = "Multi-agent Blender script generation"
)]
struct Cli {
    /// Config file.
    #[arg(long, global = true, default_value = ".blendgraph/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.blendgraph/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a new task.
    Start {
        /// What to build, e.g. "a wooden chair with four legs".
        task: String,
    },
    /// Continue a suspended run. `q` or `quit` ends it.
    Resume { run_id: String, follow_up: String },
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Start { task } => {
            let mut pipeline = build_pipeline(&cli.config)?;
            let handle = pipeline.start(&task)?;
            Ok(report(&handle))
        }
        Command::Resume { run_id, follow_up } => {
            let mut pipeline = build_pipeline(&cli.config)?;
            let handle = pipeline.resume(&run_id, &follow_up)?;
            Ok(report(&handle))
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let state_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let paths = init_state_dir(state_dir, &InitOptions { force })?;
    println!("{}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn build_pipeline(config_path: &Path) -> Result<Pipeline<FileCheckpointStore>> {
    let config = load_config(config_path)?;
    let collaborators = collaborators(&config)?;
    let store = FileCheckpointStore::new(StatePaths::new(&config.state_dir).checkpoints_dir);
    Pipeline::new(&Coordinator::new(config, collaborators), store)
}

fn collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    Ok(Collaborators {
        brain: Some(Rc::new(CommandBrain::new(config.brain.clone()))),
        docs: Rc::new(JsonDocumentStore::load(&config.retriever.docs_path)?),
        executor: Rc::new(BlenderExecutor::new(config.blender.clone())),
        renderer: Rc::new(BlenderRenderer::new(
            BlenderExecutor::new(config.blender.clone()),
            config.critic.n_rendered_images,
            config.blender.no_error_sentinel.clone(),
        )),
    })
}

/// Print the outcome and pick the exit code.
fn report(handle: &RunHandle) -> i32 {
    match handle {
        RunHandle::Finished(report) => {
            println!("{}\t{}\t{}", report.run_id, report.status, report.message);
            exit_codes::for_status(report.status)
        }
        RunHandle::Suspended { run_id, .. } => {
            println!("{run_id}\tsuspended");
            eprintln!("continue with: blendgraph resume {run_id} \"<follow-up>\" (or \"q\" to stop)");
            exit_codes::SUSPENDED
        }
    }
}
