use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// One ordered step of a task run, executed by the worker listening on the
/// queue of the same name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub run_uuid: Uuid,

    /// Execution order index, dense from 1. Sort key of the stages table.
    pub n_ord: i64,

    /// Logical stage name; a queue of identical name must exist.
    pub name: String,

    pub status: StageStatus,

    /// Object-store paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_start_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_finish_utc: Option<DateTime<Utc>>,

    /// Free-form tag of where the stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    /// Object-store bucket used for this stage's artifacts.
    pub s3_bucket: String,

    /// Operator notes; the worker records partial extra-artifact failures here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    /// Names of successor stages. Empty means this stage is terminal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum StageStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Cancelled,
}

pub const STAGE_INITIAL_STATUS: StageStatus = StageStatus::Pending;

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Error | StageStatus::Cancelled
        )
    }

    /// Legal moves along the stage lifecycle:
    /// `Pending -> InProgress -> {Success, Error, Cancelled}`, with the
    /// `Cancelled` sink also reachable straight from `Pending`.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Success)
                | (InProgress, Error)
                | (InProgress, Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_lifecycle() {
        use StageStatus::*;
        let all = [Pending, InProgress, Success, Error, Cancelled];
        for from in all {
            for to in all {
                let legal = matches!(
                    (from, to),
                    (Pending, InProgress)
                        | (Pending, Cancelled)
                        | (InProgress, Success)
                        | (InProgress, Error)
                        | (InProgress, Cancelled)
                );
                assert_eq!(from.can_transition_to(to), legal, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        use StageStatus::*;
        for terminal in [Success, Error, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Pending, InProgress, Success, Error, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let stage = Stage {
            run_uuid: Uuid::now_v7(),
            n_ord: 1,
            name: "simulate".into(),
            status: STAGE_INITIAL_STATUS,
            config: None,
            input: None,
            output: None,
            t_start_utc: None,
            t_finish_utc: None,
            executor: None,
            s3_bucket: "bucket".into(),
            comments: None,
            next: vec![],
        };
        let value = serde_json::to_value(&stage).unwrap();
        let doc = value.as_object().unwrap();
        assert!(!doc.contains_key("input"));
        assert!(!doc.contains_key("t_start_utc"));
        assert!(!doc.contains_key("next"));
        assert_eq!(doc["status"], "Pending");
    }
}
