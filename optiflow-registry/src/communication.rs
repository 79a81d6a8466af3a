//! Queue plumbing: stage handover messages, the terminal `finished-tasks`
//! send, and the long-polling waiter used by the submitter on both the
//! success queue and the dead-letter queue.

use std::time::Duration;

use optiflow_common::error::Error;
use optiflow_common::model::Stage;
use optiflow_common::store::QueueService;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{TaskRegistry, FINISHED_TASKS_QUEUE};

/// Long-poll window for a single receive.
pub const WAIT_TIME: Duration = Duration::from_secs(20);

/// Upper bound of the randomized backoff that breaks ties between
/// submitters competing on a shared queue.
const MAX_WAITER_BACKOFF_MS: u64 = 3000;

impl TaskRegistry {
    /// Enqueue the run on the queue named after the stage.
    pub async fn pass_task_to_stage(&self, stage: &Stage) -> Result<(), Error> {
        self.queues()
            .send_message(&stage.name, &stage.run_uuid.to_string())
            .await
            .map_err(|e| {
                Error::Transport(format!("error sending message to queue {:?}: {e}", stage.name))
            })?;
        info!(stage = %stage.name, "passed task to stage");
        Ok(())
    }

    /// Mark the run as finished by enqueueing it on `finished-tasks`.
    pub async fn finish_task_run(&self, run_uuid: &Uuid) -> Result<(), Error> {
        self.queues()
            .send_message(FINISHED_TASKS_QUEUE, &run_uuid.to_string())
            .await
            .map_err(|e| {
                Error::Transport(format!(
                    "error sending message to queue {FINISHED_TASKS_QUEUE:?}: {e}"
                ))
            })?;
        info!(%run_uuid, "task run is marked as finished");
        Ok(())
    }

    /// Long-poll `queue` until a message for `expected_run_uuid` arrives,
    /// then delete it and return.
    ///
    /// Messages belonging to other runs are released immediately (visibility
    /// reset to zero) so their own submitters can see them, followed by a
    /// randomized backoff so competing submitters do not keep snatching each
    /// other's messages in lockstep. Callers stop the wait by dropping the
    /// future (e.g. from a `select!` arm).
    pub async fn wait_for_run_on_queue(
        &self,
        queue: &str,
        task_id: &str,
        expected_run_uuid: &Uuid,
    ) -> Result<(), Error> {
        let expected = expected_run_uuid.to_string();
        info!(queue, "waiting for a pipeline outcome");
        loop {
            let messages = self.queues().receive_messages(queue, 1, WAIT_TIME).await?;

            if messages.is_empty() {
                self.log_status_report(task_id, expected_run_uuid).await;
                continue;
            }
            if messages.len() > 1 {
                warn!(queue, "received more than one message; only the first is taken");
            }
            let message = &messages[0];

            if message.body != expected {
                info!(
                    queue,
                    received = %message.body,
                    expected = %expected,
                    "message belongs to another run, keep waiting"
                );
                self.log_status_report(task_id, expected_run_uuid).await;
                if let Err(e) = self
                    .queues()
                    .change_visibility(queue, &message.receipt, Duration::ZERO)
                    .await
                {
                    warn!(queue, error = %e, "failed to release the message (non-critical)");
                }
                let backoff = rand::thread_rng().gen_range(0..MAX_WAITER_BACKOFF_MS);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                continue;
            }

            info!(queue, %expected_run_uuid, "received the expected run");
            if let Err(e) = self.queues().delete_message(queue, &message.receipt).await {
                warn!(queue, error = %e, "failed to remove the message from the queue (non-critical)");
            }
            return Ok(());
        }
    }

    async fn log_status_report(&self, task_id: &str, run_uuid: &Uuid) {
        match self.stages_status_report(run_uuid).await {
            Ok(report) => info!("{task_id} (run {run_uuid}): {report}"),
            Err(e) => warn!(error = %e, "failed to get stages status report (non-critical)"),
        }
    }

    /// One-line `name - status` summary of all stages, in pipeline order.
    pub async fn stages_status_report(&self, run_uuid: &Uuid) -> Result<String, Error> {
        let mut stages = self.get_all_stages(run_uuid).await?;
        stages.sort_by_key(|stage| stage.n_ord);
        Ok(stages
            .iter()
            .map(|stage| format!("{} - {}", stage.name, stage.status))
            .collect::<Vec<_>>()
            .join(", "))
    }
}
