//! Per-delivery state machine of the stage worker.
//!
//! Any failure between resolving the stage and finalizing it produces a 500
//! with an operator-readable message and a best-effort `Error` status on the
//! stage row. The registry call behind that status update is never retried:
//! at most one try per delivery, re-deliveries come from the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use optiflow_common::error::Error;
use optiflow_common::kvfile;
use optiflow_common::model::{Stage, StageStatus, TaskRun};
use optiflow_registry::TaskRegistry;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{materialize, request, subprocess, uploads};

pub struct WorkerConfig {
    /// Stage this worker executes; also the name of its queue.
    pub pipeline_stage: String,
    pub config_file_path: Option<PathBuf>,
    /// A trailing `/` asks for folder materialization of the input.
    pub input_file_path: String,
    pub output_file_path: Option<PathBuf>,
    pub command_file_path: PathBuf,
    pub extra_artifacts: Vec<PathBuf>,
    /// Extra artifacts are skipped when less than this much of the request
    /// budget remains.
    pub max_archiving_time: Duration,
    /// Request processing timeout imposed by the execution environment.
    pub request_timeout: Duration,
}

pub struct Worker {
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
}

#[derive(Debug)]
pub(crate) struct AppError {
    pub error: Error,
    pub message: String,
    pub status: StatusCode,
    pub stage: Option<Stage>,
}

impl AppError {
    pub(crate) fn without_stage(error: Error, message: &str, status: StatusCode) -> Self {
        Self {
            error,
            message: message.to_string(),
            status,
            stage: None,
        }
    }

    fn internal(error: Error, message: String, stage: &Stage) -> Self {
        Self {
            error,
            message,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            stage: Some(stage.clone()),
        }
    }
}

async fn handle(State(worker): State<Arc<Worker>>, body: String) -> Response {
    let (status, message) = worker.handle_delivery(&body).await;
    (status, message).into_response()
}

impl Worker {
    pub fn new(registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        Self { registry, config }
    }

    /// Serve `POST /` until the process is stopped. Non-POST methods get a
    /// 405 from the router.
    pub async fn serve(self: Arc<Self>, port: u16) -> Result<(), Error> {
        let app = Router::new().route("/", post(handle)).with_state(self);
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Transport(format!("could not bind port {port}: {e}")))?;
        info!(port, "starting server");
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Transport(format!("could not serve: {e}")))
    }

    /// Process one queue delivery end to end and report what the HTTP layer
    /// should answer.
    pub async fn handle_delivery(&self, request_body: &str) -> (StatusCode, String) {
        let started = Instant::now();
        match self.process(request_body, started).await {
            Ok(()) => (StatusCode::OK, "Success".to_string()),
            Err(app_error) => {
                error!("Error: {} ({})", app_error.message, app_error.error);
                if let Some(stage) = &app_error.stage {
                    info!(stage = %stage.name, "setting stage status to {}", StageStatus::Error);
                    if let Err(e) = self
                        .registry
                        .update_stage_status(stage, StageStatus::Error)
                        .await
                    {
                        error!(error = %e, "error updating stage status");
                    }
                }
                (app_error.status, app_error.message)
            }
        }
    }

    async fn process(&self, request_body: &str, started: Instant) -> Result<(), AppError> {
        let message_body = request::extract_message_body(request_body)?;
        if message_body.is_empty() {
            return Err(AppError::without_stage(
                Error::Internal("queue message body was empty".to_string()),
                "Expected a task run UUID in the queue message body but it was empty!",
                StatusCode::BAD_REQUEST,
            ));
        }
        let run_uuid = Uuid::parse_str(&message_body).map_err(|e| {
            AppError::without_stage(
                Error::Internal(format!("queue message body is not a run UUID: {e}")),
                "Queue message body is not a task run UUID",
                StatusCode::BAD_REQUEST,
            )
        })?;

        let stage = self
            .registry
            .get_stage_by_name(&run_uuid, &self.config.pipeline_stage)
            .await
            .map_err(|e| {
                AppError::without_stage(
                    e,
                    &format!(
                        "Unable to get stage {} for task {run_uuid}",
                        self.config.pipeline_stage
                    ),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?;

        let task_run = self.registry.get_task_run(&run_uuid).await.map_err(|e| {
            AppError::internal(
                e,
                format!("couldn't get task run {run_uuid} from the task registry"),
                &stage,
            )
        })?;

        match self.registry.is_cancelled(&run_uuid).await {
            Ok(true) => {
                self.mark_as_cancelled(&stage).await;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "couldn't check if the task run is cancelled, assuming it is not");
            }
        }

        self.start_stage(&stage).await?;

        if stage.config.is_some() {
            let config_path = self.config.config_file_path.as_deref().ok_or_else(|| {
                AppError::internal(
                    Error::Config("config file path is not specified in worker args".to_string()),
                    "config file path is not specified in worker args".to_string(),
                    &stage,
                )
            })?;
            self.registry
                .download_config_file(&stage, config_path)
                .await
                .map_err(|e| {
                    AppError::internal(
                        e,
                        format!(
                            "couldn't download config file to {} from bucket {:?}",
                            config_path.display(),
                            stage.s3_bucket
                        ),
                        &stage,
                    )
                })?;
        }

        if stage.input.is_some() {
            materialize::fetch_input(&self.registry, &stage, &self.config.input_file_path)
                .await
                .map_err(|e| {
                    AppError::internal(
                        e,
                        format!(
                            "couldn't materialize input at {} from bucket {:?}",
                            self.config.input_file_path, stage.s3_bucket
                        ),
                        &stage,
                    )
                })?;
        }

        subprocess::run_stage_command(
            self.registry.clone(),
            run_uuid,
            &self.config.command_file_path,
            &task_run.parameters,
        )
        .await
        .map_err(|e| AppError::internal(e, "stage command failed".to_string(), &stage))?;

        if self.registry.is_cancelled(&run_uuid).await.unwrap_or(false) {
            self.mark_as_cancelled(&stage).await;
            return Ok(());
        }

        let output_key = uploads::upload_output(
            &self.registry,
            &task_run,
            &stage,
            self.config.output_file_path.as_deref(),
        )
        .await
        .map_err(|e| {
            AppError::internal(
                e,
                format!("error uploading the stage output to bucket {:?}", stage.s3_bucket),
                &stage,
            )
        })?;

        self.handover(&stage, &task_run, output_key.as_deref()).await?;

        self.finish_stage(&stage, &task_run).await?;

        if !self.config.extra_artifacts.is_empty() {
            let deadline = self
                .config
                .request_timeout
                .saturating_sub(self.config.max_archiving_time);
            if started.elapsed() >= deadline {
                warn!("extra artifacts will not be uploaded due to timeout risk!");
            } else {
                uploads::upload_extras_and_comment(
                    &self.registry,
                    &task_run,
                    &stage,
                    &self.config.extra_artifacts,
                )
                .await;
            }
        }

        Ok(())
    }

    async fn start_stage(&self, stage: &Stage) -> Result<(), AppError> {
        self.registry
            .update_stage_status(stage, StageStatus::InProgress)
            .await
            .map_err(|e| {
                AppError::internal(
                    e,
                    format!(
                        "Unable to update status for stage {} for task {}",
                        stage.name, stage.run_uuid
                    ),
                    stage,
                )
            })?;
        self.registry
            .update_stage_start_time(stage, Utc::now())
            .await
            .map_err(|e| {
                AppError::internal(
                    e,
                    format!(
                        "Unable to update start time for stage {} for task {}",
                        stage.name, stage.run_uuid
                    ),
                    stage,
                )
            })
    }

    async fn finish_stage(
        &self,
        stage: &Stage,
        task_run: &TaskRun,
    ) -> Result<(), AppError> {
        self.registry
            .update_stage_status(stage, StageStatus::Success)
            .await
            .map_err(|e| {
                AppError::internal(
                    e,
                    format!("error setting successful status to this stage, task {}", task_run.run_uuid),
                    stage,
                )
            })?;
        self.registry
            .update_stage_finish_time(stage, Utc::now())
            .await
            .map_err(|e| {
                AppError::internal(
                    e,
                    format!(
                        "Unable to update finish time for stage {} for task {}",
                        stage.name, stage.run_uuid
                    ),
                    stage,
                )
            })
    }

    /// Hand the run over: enqueue every pending successor, or, for a
    /// terminal stage, read the objectives file and finish the run.
    async fn handover(
        &self,
        stage: &Stage,
        task_run: &TaskRun,
        output_key: Option<&str>,
    ) -> Result<(), AppError> {
        if stage.next.is_empty() {
            info!("this stage is terminal in the task pipeline, reading results");
            let output_path = self.config.output_file_path.as_deref().ok_or_else(|| {
                AppError::internal(
                    Error::Config("no output path is configured for the terminal stage".to_string()),
                    "error reading the output file to get results".to_string(),
                    stage,
                )
            })?;
            // One objective per line, `name=value`.
            let results = kvfile::read_key_value_file(output_path).map_err(|e| {
                AppError::internal(e, "error reading the output file to get results".to_string(), stage)
            })?;
            info!("read results: {results:?}");
            self.registry
                .put_task_run_results(task_run, &results)
                .await
                .map_err(|e| {
                    AppError::internal(
                        e,
                        format!("error setting results for the task run {}", task_run.run_uuid),
                        stage,
                    )
                })?;
            self.registry
                .finish_task_run(&task_run.run_uuid)
                .await
                .map_err(|e| {
                    AppError::internal(
                        e,
                        format!("error finishing the task run {}", task_run.run_uuid),
                        stage,
                    )
                })?;
            return Ok(());
        }

        for next_name in &stage.next {
            let next_stage = self
                .registry
                .get_stage_by_name(&stage.run_uuid, next_name)
                .await
                .map_err(|e| {
                    AppError::internal(e, "error getting the next stage".to_string(), stage)
                })?;

            // A retry delivery after an execution-environment timeout must
            // not fan the task out a second time.
            if next_stage.status != StageStatus::Pending {
                warn!(
                    next_stage = %next_stage.name,
                    status = %next_stage.status,
                    run_uuid = %task_run.run_uuid,
                    task_id = %task_run.task_id,
                    "the next stage is not pending; this stage was probably interrupted \
                     by timeout after it passed the task on, so it will not be passed again"
                );
                continue;
            }

            if let Some(key) = output_key {
                self.registry
                    .update_stage_input(&next_stage, key)
                    .await
                    .map_err(|e| {
                        AppError::internal(
                            e,
                            format!("error setting input for the next stage {}", next_stage.name),
                            stage,
                        )
                    })?;
            } else {
                info!("no output file was uploaded, so input for the next stage will be absent!");
            }

            self.registry.pass_task_to_stage(&next_stage).await.map_err(|e| {
                AppError::internal(
                    e,
                    format!("error passing the task to the next stage {}", next_stage.name),
                    stage,
                )
            })?;
        }
        Ok(())
    }

    async fn mark_as_cancelled(&self, stage: &Stage) {
        info!(
            stage = %stage.name,
            run_uuid = %stage.run_uuid,
            "setting cancelled status to the stage"
        );
        if let Err(e) = self
            .registry
            .update_stage_status(stage, StageStatus::Cancelled)
            .await
        {
            warn!(
                stage = %stage.name,
                error = %e,
                "unable to update the stage status (non-critical error)"
            );
        }
    }
}
