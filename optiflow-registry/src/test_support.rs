use std::collections::HashMap;
use std::sync::Arc;

use optiflow_common::model::{Stage, TaskRun, TaskRunStatus, STAGE_INITIAL_STATUS};
use optiflow_common::store::memory::InMemoryStore;
use uuid::Uuid;

use crate::TaskRegistry;

pub(crate) async fn new_test_registry() -> (TaskRegistry, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let registry = TaskRegistry::new(store.clone(), store.clone(), store.clone())
        .await
        .expect("migration against the in-memory store cannot fail");
    (registry, store)
}

pub(crate) fn sample_run(task_id: &str) -> TaskRun {
    let run_uuid = Uuid::now_v7();
    TaskRun {
        task_id: task_id.to_string(),
        run_uuid,
        parameters: HashMap::from([("x".to_string(), "0.5".to_string())]),
        results: None,
        task_definition: format!("task-registry/{task_id}/{run_uuid}/optimization.in"),
        creation_time: TaskRun::creation_time_of(&run_uuid),
        status: TaskRunStatus::Submitted,
    }
}

pub(crate) fn sample_stage(run: &TaskRun, n_ord: i64, name: &str) -> Stage {
    Stage {
        run_uuid: run.run_uuid,
        n_ord,
        name: name.to_string(),
        status: STAGE_INITIAL_STATUS,
        config: None,
        input: None,
        output: None,
        t_start_utc: None,
        t_finish_utc: None,
        executor: None,
        s3_bucket: "test-bucket".to_string(),
        comments: None,
        next: vec![],
    }
}
