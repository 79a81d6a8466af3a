use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// One execution of a named optimization task.
///
/// `task_id` is the partition key (S3-safe charset), `run_uuid` the sort key.
/// The run UUID is a v7 UUID, so it is globally unique, time-sortable, and
/// carries the creation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub run_uuid: Uuid,

    /// Parameter vector for this run; exported into the stage subprocess
    /// environment by the worker.
    pub parameters: HashMap<String, String>,

    /// Objective values keyed by objective name; written by the terminal stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<String, String>>,

    /// Object-store path of the uploaded task definition blob.
    pub task_definition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    pub status: TaskRunStatus,
}

impl TaskRun {
    /// Creation time carried by a v7 run UUID, if the UUID has one.
    pub fn creation_time_of(run_uuid: &Uuid) -> Option<DateTime<Utc>> {
        let ts = run_uuid.get_timestamp()?;
        let (secs, nanos) = ts.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum TaskRunStatus {
    Submitted,
    Finished,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v7_uuid_carries_creation_time() {
        let id = Uuid::now_v7();
        let t = TaskRun::creation_time_of(&id).expect("v7 uuid has a timestamp");
        let now = Utc::now();
        assert!((now - t).num_seconds().abs() < 5);
    }

    #[test]
    fn status_round_trips_through_wire_spelling() {
        for (status, wire) in [
            (TaskRunStatus::Submitted, "Submitted"),
            (TaskRunStatus::Finished, "Finished"),
            (TaskRunStatus::Failed, "Failed"),
            (TaskRunStatus::Cancelled, "Cancelled"),
        ] {
            assert_eq!(status.to_string(), wire);
            assert_eq!(serde_json::to_value(status).unwrap(), wire);
        }
    }
}
