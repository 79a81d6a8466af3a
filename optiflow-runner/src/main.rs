use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use optiflow_common::error::Error;
use optiflow_common::kvfile;
use optiflow_common::model::{StageStatus, TaskRun, TaskRunStatus};
use optiflow_registry::TaskRegistry;
use optiflow_runner::submit::PipelineOutcome;
use optiflow_runner::{config, objectives, report, submit};
use tracing::{error, info, warn};
use uuid::Uuid;

const PIDS_FILE: &str = "optiflow-runner.pids";

/// Submit one optimization task run and wait for its terminal outcome.
#[derive(Parser, Debug)]
#[command(name = "optiflow-runner", version)]
struct Args {
    /// Document API endpoint URL for the task registry
    #[arg(long)]
    dynamo_docapi_endpoint: String,

    /// Object-store bucket name to use for task artifacts
    #[arg(long)]
    s3_bucket: String,

    /// YAML file with the pipeline stages configuration
    #[arg(long, default_value = "stages.yaml")]
    stages_config_file: PathBuf,

    /// Optimization task ID or name (use only symbols supported by the object store)
    #[arg(long)]
    task_id: String,

    /// File with the optimization task configuration
    #[arg(long, default_value = "optimization.in")]
    task_definition_file: PathBuf,

    /// File with optimization parameters for the run, in 'k=v' per line format
    #[arg(long, default_value = "params.in")]
    parameters_file: PathBuf,

    /// File where to write the calculated objective function value(s)
    #[arg(long)]
    output_file: PathBuf,

    /// Name of the dead-letter queue to watch for failed runs
    #[arg(long)]
    dlq_name: String,

    /// Objective names, in the order they must appear in the output file
    #[arg(long, value_delimiter = ',', required = true)]
    objectives: Vec<String>,

    /// Value written for objectives the run did not produce
    #[arg(long, default_value = "NaN")]
    missing_obj_value: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Error> {
    dump_process_id()?;

    // All inputs are validated before the first registry write.
    let parameters = kvfile::read_parameters_file(&args.parameters_file)?;
    std::fs::metadata(&args.task_definition_file).map_err(|e| {
        Error::Config(format!(
            "cannot stat task definition file {}: {e}",
            args.task_definition_file.display()
        ))
    })?;
    let stages_config = config::load_stages_config(&args.stages_config_file)?;

    let registry = TaskRegistry::connect(&args.dynamo_docapi_endpoint).await?;

    let run_uuid = Uuid::now_v7();
    let task_definition_key = registry
        .upload_file_for_task(
            &args.task_definition_file,
            &args.s3_bucket,
            &args.task_id,
            &run_uuid,
        )
        .await?;

    let task_run = TaskRun {
        task_id: args.task_id.clone(),
        run_uuid,
        parameters,
        results: None,
        task_definition: task_definition_key,
        creation_time: TaskRun::creation_time_of(&run_uuid),
        status: TaskRunStatus::Submitted,
    };

    let stages =
        config::create_stages(&registry, &task_run, &stages_config, &args.s3_bucket).await?;

    if let Err(e) = submit::seed_pipeline(&registry, &task_run, &stages).await {
        error!(error = %e, "failed starting the pipeline");
        fail_run_best_effort(&registry, &task_run).await;
        return Ok(ExitCode::FAILURE);
    }

    let outcome = match submit::wait_for_outcome(&registry, &task_run, &args.dlq_name).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "failed while waiting for the pipeline to finish");
            fail_run_best_effort(&registry, &task_run).await;
            return Ok(ExitCode::FAILURE);
        }
    };

    let finished_task = match registry.get_task_run(&task_run.run_uuid).await {
        Ok(task) => task,
        Err(e) => {
            error!(error = %e, "failed getting task run information from the registry");
            fail_run_best_effort(&registry, &task_run).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    let mut finished_stages = match registry.get_all_stages(&task_run.run_uuid).await {
        Ok(stages) => stages,
        Err(e) => {
            error!(error = %e, "failed getting stages information from the registry");
            fail_run_best_effort(&registry, &task_run).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    finished_stages.sort_by_key(|stage| stage.n_ord);

    report::print_task_report(&finished_task, &finished_stages);

    let results = finished_task.results.clone().unwrap_or_default();
    match outcome {
        PipelineOutcome::Cancelled => {
            println!("Task execution cancelled!");
            Ok(exit_minus_one())
        }
        PipelineOutcome::DeadLetter => {
            objectives::write_objectives_file(
                &args.output_file,
                &args.objectives,
                &results,
                &args.missing_obj_value,
            )?;
            println!("Written output to {}", args.output_file.display());
            set_status_best_effort(&registry, &task_run, TaskRunStatus::Failed).await;
            Ok(ExitCode::SUCCESS)
        }
        PipelineOutcome::Finished => {
            if report::all_stages_have_status(&finished_stages, StageStatus::Success) {
                println!("Pipeline finished successfully!");
                objectives::write_objectives_file(
                    &args.output_file,
                    &args.objectives,
                    &results,
                    &args.missing_obj_value,
                )?;
                println!("Written output to {}", args.output_file.display());
                set_status_best_effort(&registry, &task_run, TaskRunStatus::Finished).await;
                Ok(ExitCode::SUCCESS)
            } else {
                if report::any_stage_has_status(&finished_stages, StageStatus::Error) {
                    set_status_best_effort(&registry, &task_run, TaskRunStatus::Failed).await;
                }
                Ok(exit_minus_one())
            }
        }
    }
}

/// The historical contract is exit code -1, which the OS reports as 255.
fn exit_minus_one() -> ExitCode {
    ExitCode::from(255)
}

async fn fail_run_best_effort(registry: &TaskRegistry, task_run: &TaskRun) {
    set_status_best_effort(registry, task_run, TaskRunStatus::Failed).await;
}

async fn set_status_best_effort(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    status: TaskRunStatus,
) {
    if let Err(e) = registry.update_task_run_status(task_run, status).await {
        warn!(
            %status,
            run_uuid = %task_run.run_uuid,
            task_id = %task_run.task_id,
            error = %e,
            "failed setting status to the task run (non-critical error)"
        );
    }
}

/// Append this submitter's PID to the pids file, so operator tooling can
/// signal running submitters.
fn dump_process_id() -> Result<(), Error> {
    let pid = std::process::id();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(PIDS_FILE)
        .map_err(|e| Error::Internal(format!("couldn't open {PIDS_FILE}: {e}")))?;
    write!(file, "{pid} ").map_err(|e| Error::Internal(format!("couldn't write to {PIDS_FILE}: {e}")))?;
    info!(pid, "the task runner's PID appended to {PIDS_FILE}");
    Ok(())
}
