//! Pipeline seeding and the terminal-outcome wait: one success-queue
//! waiter, one dead-letter waiter, and the interrupt handler, multiplexed
//! until exactly one of them resolves the run.

use optiflow_common::error::Error;
use optiflow_common::model::{Stage, TaskRun, TaskRunStatus};
use optiflow_registry::{TaskRegistry, FINISHED_TASKS_QUEUE};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The run's UUID arrived on `finished-tasks`.
    Finished,
    /// The run's UUID surfaced on the dead-letter queue.
    DeadLetter,
    /// The operator interrupted the submitter; the run was cancelled.
    Cancelled,
}

/// Insert the run and its stages, then enqueue the first stage.
pub async fn seed_pipeline(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    stages: &[Stage],
) -> Result<(), Error> {
    registry.insert_task_run(task_run).await?;
    info!(
        run_uuid = %task_run.run_uuid,
        task_id = %task_run.task_id,
        "successfully inserted task run"
    );

    for stage in stages {
        registry.insert_stage(stage).await?;
        info!(n_ord = stage.n_ord, name = %stage.name, "successfully inserted stage");
    }

    registry.pass_task_to_stage(&stages[0]).await?;
    info!(
        run_uuid = %task_run.run_uuid,
        task_id = %task_run.task_id,
        "submitted task run"
    );
    Ok(())
}

/// Block until the pipeline reaches a terminal outcome: the success queue
/// delivers the run, the dead-letter queue delivers it, or the operator
/// sends SIGINT/SIGTERM (which cancels the run).
pub async fn wait_for_outcome(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    dlq_name: &str,
) -> Result<PipelineOutcome, Error> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Internal(format!("failed to install the SIGTERM handler: {e}")))?;

    info!("waiting for the pipeline to finish...");
    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => cancel_run(registry, task_run).await,
        _ = sigterm.recv() => cancel_run(registry, task_run).await,

        result = registry.wait_for_run_on_queue(
            FINISHED_TASKS_QUEUE,
            &task_run.task_id,
            &task_run.run_uuid,
        ) => {
            result?;
            info!(run_uuid = %task_run.run_uuid, "task run finished");
            Ok(PipelineOutcome::Finished)
        }

        result = registry.wait_for_run_on_queue(
            dlq_name,
            &task_run.task_id,
            &task_run.run_uuid,
        ) => {
            result?;
            info!(run_uuid = %task_run.run_uuid, "task run surfaced on the dead-letter queue");
            Ok(PipelineOutcome::DeadLetter)
        }
    }
}

async fn cancel_run(
    registry: &TaskRegistry,
    task_run: &TaskRun,
) -> Result<PipelineOutcome, Error> {
    info!("got interrupt, cancelling the task...");
    if let Err(e) = registry
        .update_task_run_status(task_run, TaskRunStatus::Cancelled)
        .await
    {
        error!(error = %e, "failed to cancel the task");
    }
    Ok(PipelineOutcome::Cancelled)
}
