//! Typed document-store operations over task runs and stages.
//!
//! Every operation is an independent remote call; none is transactional with
//! any other. The single-attribute updates are conditional on the target row
//! existing, so a lost row surfaces as `NotFound` instead of a silent upsert.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use optiflow_common::error::Error;
use optiflow_common::model::{Stage, StageStatus, TaskRun, TaskRunStatus};
use optiflow_common::store::{Document, DocumentStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{TaskRegistry, STAGES_TABLE, STAGE_NAME_INDEX, TASKS_TABLE, TASK_RUN_UUID_INDEX};

fn to_document<T: Serialize>(value: &T) -> Result<Document, Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Internal(format!(
            "expected an object document, got {other}"
        ))),
    }
}

fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, Error> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

fn uuid_key(run_uuid: &Uuid) -> Value {
    Value::String(run_uuid.to_string())
}

impl TaskRegistry {
    pub async fn insert_task_run(&self, task: &TaskRun) -> Result<(), Error> {
        let doc = to_document(task)?;
        self.documents().put_item(TASKS_TABLE, doc).await
    }

    pub async fn insert_stage(&self, stage: &Stage) -> Result<(), Error> {
        let doc = to_document(stage)?;
        self.documents().put_item(STAGES_TABLE, doc).await
    }

    /// Look a run up by its UUID alone, via the `TaskRunUUIDIndex`.
    pub async fn get_task_run(&self, run_uuid: &Uuid) -> Result<TaskRun, Error> {
        let mut rows = self
            .documents()
            .query_index(TASKS_TABLE, TASK_RUN_UUID_INDEX, &uuid_key(run_uuid), None)
            .await?;
        match rows.len() {
            0 => Err(Error::NotFound {
                resource_type: "TaskRun".to_string(),
                resource_id: run_uuid.to_string(),
            }),
            1 => from_document(rows.remove(0)),
            _ => Err(Error::Ambiguous {
                resource_type: "TaskRun".to_string(),
                resource_id: run_uuid.to_string(),
            }),
        }
    }

    /// Point lookup by the full primary key. Absence is not an error here.
    pub async fn get_stage(&self, run_uuid: &Uuid, n_ord: i64) -> Result<Option<Stage>, Error> {
        let row = self
            .documents()
            .get_item(STAGES_TABLE, &uuid_key(run_uuid), &Value::from(n_ord))
            .await?;
        row.map(from_document).transpose()
    }

    /// Look a stage up by its name within a run, via the `StageNameIndex`.
    pub async fn get_stage_by_name(&self, run_uuid: &Uuid, name: &str) -> Result<Stage, Error> {
        let mut rows = self
            .documents()
            .query_index(
                STAGES_TABLE,
                STAGE_NAME_INDEX,
                &uuid_key(run_uuid),
                Some(&Value::String(name.to_string())),
            )
            .await?;
        match rows.len() {
            0 => Err(Error::NotFound {
                resource_type: "Stage".to_string(),
                resource_id: format!("{name} in task {run_uuid}"),
            }),
            1 => from_document(rows.remove(0)),
            _ => Err(Error::Ambiguous {
                resource_type: "Stage".to_string(),
                resource_id: format!("{name} in task {run_uuid}"),
            }),
        }
    }

    /// All stages of a run. Returned order is not guaranteed; callers that
    /// need the pipeline order sort by `n_ord`.
    pub async fn get_all_stages(&self, run_uuid: &Uuid) -> Result<Vec<Stage>, Error> {
        let rows = self
            .documents()
            .query_partition(STAGES_TABLE, &uuid_key(run_uuid))
            .await?;
        rows.into_iter().map(from_document).collect()
    }

    async fn update_stage_attribute(
        &self,
        stage: &Stage,
        attribute: &str,
        value: Value,
    ) -> Result<(), Error> {
        self.documents()
            .update_attribute(
                STAGES_TABLE,
                &uuid_key(&stage.run_uuid),
                &Value::from(stage.n_ord),
                attribute,
                value,
            )
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => e,
                other => Error::Store(format!(
                    "failed to update {attribute} for stage {}: {other}",
                    stage.name
                )),
            })
    }

    pub async fn update_stage_status(
        &self,
        stage: &Stage,
        status: StageStatus,
    ) -> Result<(), Error> {
        self.update_stage_attribute(stage, "status", serde_json::to_value(status)?)
            .await
    }

    pub async fn update_stage_input(&self, stage: &Stage, path: &str) -> Result<(), Error> {
        self.update_stage_attribute(stage, "input", Value::String(path.to_string()))
            .await
    }

    pub async fn update_stage_output(&self, stage: &Stage, path: &str) -> Result<(), Error> {
        self.update_stage_attribute(stage, "output", Value::String(path.to_string()))
            .await
    }

    pub async fn update_stage_comment(&self, stage: &Stage, comment: &str) -> Result<(), Error> {
        self.update_stage_attribute(stage, "comments", Value::String(comment.to_string()))
            .await
    }

    pub async fn update_stage_start_time(
        &self,
        stage: &Stage,
        t_start_utc: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.update_stage_attribute(stage, "t_start_utc", serde_json::to_value(t_start_utc)?)
            .await
    }

    pub async fn update_stage_finish_time(
        &self,
        stage: &Stage,
        t_finish_utc: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.update_stage_attribute(stage, "t_finish_utc", serde_json::to_value(t_finish_utc)?)
            .await
    }

    pub async fn update_task_run_status(
        &self,
        task: &TaskRun,
        status: TaskRunStatus,
    ) -> Result<(), Error> {
        self.documents()
            .update_attribute(
                TASKS_TABLE,
                &Value::String(task.task_id.clone()),
                &uuid_key(&task.run_uuid),
                "status",
                serde_json::to_value(status)?,
            )
            .await
    }

    pub async fn put_task_run_results(
        &self,
        task: &TaskRun,
        results: &HashMap<String, String>,
    ) -> Result<(), Error> {
        self.documents()
            .update_attribute(
                TASKS_TABLE,
                &Value::String(task.task_id.clone()),
                &uuid_key(&task.run_uuid),
                "results",
                serde_json::to_value(results)?,
            )
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => e,
                other => Error::Store(format!("failed to update task run results: {other}")),
            })
    }

    /// Whether the run has been cancelled by the submitter.
    pub async fn is_cancelled(&self, run_uuid: &Uuid) -> Result<bool, Error> {
        let task = self.get_task_run(run_uuid).await?;
        Ok(task.status == TaskRunStatus::Cancelled)
    }

    /// Task runs for the exporter: optionally filtered by task id (partition
    /// query) and by status. An empty status filter keeps everything.
    pub async fn list_task_runs(
        &self,
        task_id: Option<&str>,
        statuses: &[TaskRunStatus],
    ) -> Result<Vec<TaskRun>, Error> {
        let rows = match task_id {
            Some(task_id) => {
                self.documents()
                    .query_partition(TASKS_TABLE, &Value::String(task_id.to_string()))
                    .await?
            }
            None => self.documents().scan(TASKS_TABLE).await?,
        };
        let mut runs: Vec<TaskRun> = rows
            .into_iter()
            .map(from_document)
            .collect::<Result<_, _>>()?;
        if !statuses.is_empty() {
            runs.retain(|run| statuses.contains(&run.status));
        }
        runs.sort_by_key(|run| run.run_uuid);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_test_registry, sample_run, sample_stage};
    use optiflow_common::model::STAGE_INITIAL_STATUS;

    #[tokio::test]
    async fn task_run_round_trips_through_the_uuid_index() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("heat-sim");
        registry.insert_task_run(&run).await.unwrap();

        let fetched = registry.get_task_run(&run.run_uuid).await.unwrap();
        assert_eq!(fetched.task_id, "heat-sim");
        assert_eq!(fetched.run_uuid, run.run_uuid);
        assert_eq!(fetched.status, TaskRunStatus::Submitted);
        assert_eq!(fetched.parameters, run.parameters);
    }

    #[tokio::test]
    async fn missing_and_duplicated_runs_are_distinguished() {
        let (registry, _store) = new_test_registry().await;
        let unknown = Uuid::now_v7();
        assert!(registry.get_task_run(&unknown).await.unwrap_err().is_not_found());

        // Same run UUID under two task ids: the index lookup must refuse to pick.
        let run = sample_run("task-a");
        let mut twin = run.clone();
        twin.task_id = "task-b".to_string();
        registry.insert_task_run(&run).await.unwrap();
        registry.insert_task_run(&twin).await.unwrap();
        let err = registry.get_task_run(&run.run_uuid).await.unwrap_err();
        assert!(matches!(err, Error::Ambiguous { .. }));
    }

    #[tokio::test]
    async fn stages_round_trip_and_sort_by_order_index() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("pipeline");
        registry.insert_task_run(&run).await.unwrap();

        let names = ["prepare", "simulate", "evaluate", "collect"];
        // Insert out of order on purpose; the partition query guarantees nothing.
        for &i in &[2usize, 0, 3, 1] {
            let stage = sample_stage(&run, (i + 1) as i64, names[i]);
            registry.insert_stage(&stage).await.unwrap();
        }

        let mut stages = registry.get_all_stages(&run.run_uuid).await.unwrap();
        stages.sort_by_key(|s| s.n_ord);
        let got: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, names);

        let simulate = registry
            .get_stage_by_name(&run.run_uuid, "simulate")
            .await
            .unwrap();
        assert_eq!(simulate.n_ord, 2);
        assert_eq!(simulate.status, STAGE_INITIAL_STATUS);

        let missing = registry
            .get_stage_by_name(&run.run_uuid, "nonexistent")
            .await
            .unwrap_err();
        assert!(missing.is_not_found());

        assert!(registry.get_stage(&run.run_uuid, 2).await.unwrap().is_some());
        assert!(registry.get_stage(&run.run_uuid, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_attribute_updates_require_the_row() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("task");
        registry.insert_task_run(&run).await.unwrap();
        let stage = sample_stage(&run, 1, "only");

        // Not inserted yet: conditional updates must refuse.
        let err = registry
            .update_stage_status(&stage, StageStatus::InProgress)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        registry.insert_stage(&stage).await.unwrap();
        registry
            .update_stage_status(&stage, StageStatus::InProgress)
            .await
            .unwrap();
        let start = Utc::now();
        registry.update_stage_start_time(&stage, start).await.unwrap();
        registry.update_stage_input(&stage, "task-registry/t/r/1_only/in").await.unwrap();
        registry.update_stage_output(&stage, "task-registry/t/r/1_only/out").await.unwrap();
        registry.update_stage_comment(&stage, "note").await.unwrap();
        let finish = Utc::now();
        registry.update_stage_finish_time(&stage, finish).await.unwrap();

        let fetched = registry
            .get_stage_by_name(&run.run_uuid, "only")
            .await
            .unwrap();
        assert_eq!(fetched.status, StageStatus::InProgress);
        assert_eq!(fetched.input.as_deref(), Some("task-registry/t/r/1_only/in"));
        assert_eq!(fetched.output.as_deref(), Some("task-registry/t/r/1_only/out"));
        assert_eq!(fetched.comments.as_deref(), Some("note"));
        let t_start = fetched.t_start_utc.unwrap();
        let t_finish = fetched.t_finish_utc.unwrap();
        assert!(t_start <= t_finish);
        assert_eq!(t_start, start);
    }

    #[tokio::test]
    async fn results_and_cancellation_live_on_the_task_row() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("task");
        registry.insert_task_run(&run).await.unwrap();

        assert!(!registry.is_cancelled(&run.run_uuid).await.unwrap());

        let results = HashMap::from([
            ("obj1".to_string(), "1.0".to_string()),
            ("obj2".to_string(), "2.0".to_string()),
        ]);
        registry.put_task_run_results(&run, &results).await.unwrap();

        registry
            .update_task_run_status(&run, TaskRunStatus::Cancelled)
            .await
            .unwrap();
        assert!(registry.is_cancelled(&run.run_uuid).await.unwrap());

        let fetched = registry.get_task_run(&run.run_uuid).await.unwrap();
        assert_eq!(fetched.results.unwrap(), results);
        assert_eq!(fetched.status, TaskRunStatus::Cancelled);
    }

    #[tokio::test]
    async fn listing_filters_by_task_and_status() {
        let (registry, _store) = new_test_registry().await;
        let run_a = sample_run("alpha");
        let run_b = sample_run("alpha");
        let run_c = sample_run("beta");
        for run in [&run_a, &run_b, &run_c] {
            registry.insert_task_run(run).await.unwrap();
        }
        registry
            .update_task_run_status(&run_b, TaskRunStatus::Failed)
            .await
            .unwrap();

        let alpha = registry.list_task_runs(Some("alpha"), &[]).await.unwrap();
        assert_eq!(alpha.len(), 2);

        let failed = registry
            .list_task_runs(None, &[TaskRunStatus::Failed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_uuid, run_b.run_uuid);
    }
}
