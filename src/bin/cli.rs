//! Embedded command-line driver (§6): submits and controls jobs against an
//! in-process [`Runtime`](workflow_orchestrator::bootstrap::Runtime) without
//! requiring the HTTP control surface to be running.
//!
//! Grounded on the teacher's `bin/admin.rs` `Parser`/`Subcommand` shape
//! (top-level `Cli` with a `#[command(subcommand)]`, `--confirm`-gated
//! destructive operations), generalized from NATS data maintenance to job
//! lifecycle control. Exit codes follow §6 exactly.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info};
use workflow_orchestrator::bootstrap::build_runtime;
use workflow_orchestrator::config::Config;
use workflow_orchestrator::engine::job_manager::{JobFilter, JobManagerError, JobSubmission};
use workflow_orchestrator::models::{JobId, JobStatus, WorkflowId};

const EXIT_SUCCESS: u8 = 0;
const EXIT_INVALID_USAGE: u8 = 2;
const EXIT_TEMPLATE_NOT_FOUND: u8 = 3;
const EXIT_INPUT_VALIDATION_FAILURE: u8 = 4;
const EXIT_JOB_FAILED: u8 = 5;
const EXIT_CANCELLED: u8 = 6;

#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Embedded CLI driver for the workflow orchestration engine")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and block until it reaches a terminal status
    Run {
        /// Workflow template id
        #[arg(long)]
        workflow: String,
        /// JSON object of entry inputs
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Optional tone config snapshot
        #[arg(long)]
        tone: Option<String>,
    },

    /// Submit a job and return immediately with its job id
    Submit {
        #[arg(long)]
        workflow: String,
        #[arg(long, default_value = "{}")]
        inputs: String,
    },

    /// List jobs
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        archived: bool,
    },

    /// Show one job's full record
    Get { job_id: String },

    /// Pause a running job
    Pause { job_id: String },

    /// Resume a paused job
    Resume { job_id: String },

    /// Issue one step-mode pulse
    Step { job_id: String },

    /// Cancel a job (best-effort-soon)
    Cancel { job_id: String },

    /// Retry a failed job from its latest resumable checkpoint
    Retry { job_id: String },

    /// Archive a terminal job
    Archive { job_id: String },

    /// Unarchive a job
    Unarchive { job_id: String },

    /// List the agent catalog
    Agents,

    /// List the workflow template catalog
    Workflows,

    /// List checkpoints for a job
    Checkpoints { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if dotenv().is_err() {
        eprintln!("no .env file found; reading configuration from the environment only");
    }
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = Config::from_env();
    let runtime = build_runtime(&config);

    match run(cli.command, &runtime).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(%err, "command failed");
            ExitCode::from(EXIT_INVALID_USAGE)
        }
    }
}

async fn run(
    command: Commands,
    runtime: &workflow_orchestrator::bootstrap::Runtime,
) -> Result<u8, Box<dyn std::error::Error>> {
    match command {
        Commands::Run { workflow, inputs, tone } => {
            let inputs: serde_json::Value = serde_json::from_str(&inputs)?;
            if runtime.templates.get(&WorkflowId::from(workflow.as_str())).is_none() {
                error!(%workflow, "unknown workflow template");
                return Ok(EXIT_TEMPLATE_NOT_FOUND);
            }
            let job_id = match runtime.job_manager.create(JobSubmission {
                workflow_id: WorkflowId::from(workflow),
                inputs,
                metadata: Default::default(),
                tone,
                perf: None,
            }) {
                Ok(id) => id,
                Err(JobManagerError::Orchestrator(
                    workflow_orchestrator::OrchestratorError::InvalidInputs(msg),
                )) => {
                    error!(%msg, "input validation failed");
                    return Ok(EXIT_INPUT_VALIDATION_FAILURE);
                }
                Err(err) => return Err(err.into()),
            };
            info!(%job_id, "job submitted, awaiting terminal status");
            await_terminal(runtime, job_id).await
        }

        Commands::Submit { workflow, inputs } => {
            let inputs: serde_json::Value = serde_json::from_str(&inputs)?;
            if runtime.templates.get(&WorkflowId::from(workflow.as_str())).is_none() {
                error!(%workflow, "unknown workflow template");
                return Ok(EXIT_TEMPLATE_NOT_FOUND);
            }
            match runtime.job_manager.create(JobSubmission {
                workflow_id: WorkflowId::from(workflow),
                inputs,
                metadata: Default::default(),
                tone: None,
                perf: None,
            }) {
                Ok(job_id) => {
                    println!("{job_id}");
                    Ok(EXIT_SUCCESS)
                }
                Err(JobManagerError::Orchestrator(
                    workflow_orchestrator::OrchestratorError::InvalidInputs(msg),
                )) => {
                    error!(%msg, "input validation failed");
                    Ok(EXIT_INPUT_VALIDATION_FAILURE)
                }
                Err(err) => Err(err.into()),
            }
        }

        Commands::List { status, archived } => {
            let status = status
                .map(|raw| serde_json::from_value::<JobStatus>(serde_json::Value::String(raw)))
                .transpose()?;
            let jobs = runtime.job_manager.list(JobFilter {
                status,
                include_archived: archived,
                limit: None,
                offset: 0,
            });
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(EXIT_SUCCESS)
        }

        Commands::Get { job_id } => {
            let job = runtime.job_manager.get(parse_job_id(&job_id)?)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(EXIT_SUCCESS)
        }

        Commands::Pause { job_id } => {
            runtime.job_manager.pause(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Resume { job_id } => {
            runtime.job_manager.resume(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Step { job_id } => {
            runtime.job_manager.step(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Cancel { job_id } => {
            runtime.job_manager.cancel(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Retry { job_id } => {
            runtime.job_manager.retry(parse_job_id(&job_id)?).await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Archive { job_id } => {
            runtime.job_manager.archive(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Unarchive { job_id } => {
            runtime.job_manager.unarchive(parse_job_id(&job_id)?)?;
            Ok(EXIT_SUCCESS)
        }

        Commands::Agents => {
            println!("{}", serde_json::to_string_pretty(&runtime.agents.list())?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Workflows => {
            println!("{}", serde_json::to_string_pretty(&runtime.templates.list())?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Checkpoints { job_id } => {
            let checkpoints = runtime.checkpoint_store.list(parse_job_id(&job_id)?).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, Box<dyn std::error::Error>> {
    let uuid: uuid::Uuid = raw.parse()?;
    Ok(JobId::from(uuid))
}

/// Poll until `job_id` reaches a terminal status, then map it onto the exit
/// codes in §6. Polling, not an event-bus subscription, matches the
/// `JobManager` test suite's own wait idiom (`engine::job_manager` tests) —
/// the simplest correct way to observe "done" from outside the scheduler's
/// own task.
async fn await_terminal(
    runtime: &workflow_orchestrator::bootstrap::Runtime,
    job_id: JobId,
) -> Result<u8, Box<dyn std::error::Error>> {
    loop {
        let job = runtime.job_manager.get(job_id)?;
        match job.status {
            JobStatus::Completed => {
                println!("{}", serde_json::to_string_pretty(&job)?);
                return Ok(EXIT_SUCCESS);
            }
            JobStatus::Failed => {
                error!(error = ?job.error, "job failed");
                return Ok(EXIT_JOB_FAILED);
            }
            JobStatus::Cancelled => {
                info!("job cancelled");
                return Ok(EXIT_CANCELLED);
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
        }
    }
}
