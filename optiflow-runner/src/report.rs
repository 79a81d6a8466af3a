//! Human report of a finished run: per-stage details and a timing summary.
//! This is user-facing terminal output, printed rather than logged.

use chrono::Utc;
use optiflow_common::model::{Stage, StageStatus, TaskRun};

pub fn all_stages_have_status(stages: &[Stage], status: StageStatus) -> bool {
    stages.iter().all(|stage| stage.status == status)
}

pub fn any_stage_has_status(stages: &[Stage], status: StageStatus) -> bool {
    stages.iter().any(|stage| stage.status == status)
}

/// Print the full report for a run. `stages` must already be in pipeline
/// order.
pub fn print_task_report(task: &TaskRun, stages: &[Stage]) {
    println!("Finished task run:");
    println!("  UUID: {}", task.run_uuid);
    println!("  Parameters: {:?}", task.parameters);
    println!("  Results: {:?}", task.results);
    println!("  Task Definition: [not shown here]");
    println!();

    if all_stages_have_status(stages, StageStatus::Success) {
        println!("All stages finished successfully!");
    } else if any_stage_has_status(stages, StageStatus::Error) {
        println!("Error on some stage(s)!");
    } else if any_stage_has_status(stages, StageStatus::InProgress) {
        println!("Some stage has status InProgress! This is probably an error!");
    } else if any_stage_has_status(stages, StageStatus::Pending) {
        println!("Some stage has status Pending! This is probably an error!");
    } else if any_stage_has_status(stages, StageStatus::Cancelled) {
        println!("The task was cancelled!");
    }

    println!("Stages:");
    println!();
    for stage in stages {
        println!("  - Name: {}", stage.name);
        println!("    NOrd: {}", stage.n_ord);
        println!("    Status: {}", stage.status);
        println!("    Config: {}", stage.config.as_deref().unwrap_or_default());
        println!("    Input: {}", stage.input.as_deref().unwrap_or_default());
        println!("    Output: {}", stage.output.as_deref().unwrap_or_default());
        println!("    S3Bucket: {}", stage.s3_bucket);
        println!("    Next: {:?}", stage.next);
        if let Some(t_start) = stage.t_start_utc {
            println!("    Start Time: {}", t_start.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(t_finish) = stage.t_finish_utc {
            println!("    Finish Time: {}", t_finish.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(executor) = &stage.executor {
            println!("    Executor: {executor}");
        }
        if let Some(comments) = &stage.comments {
            println!("    Comments: {comments}");
        }
        println!();
    }

    print_stage_time_summary(task, stages);
}

fn print_stage_time_summary(task: &TaskRun, stages: &[Stage]) {
    println!("Stages processing times:");
    let mut total = chrono::Duration::zero();
    let mut first_stage_start = None;
    let mut last_stage_finish = None;
    for (i, stage) in stages.iter().enumerate() {
        if i == 0 {
            first_stage_start = stage.t_start_utc;
        }
        match (stage.t_start_utc, stage.t_finish_utc) {
            (Some(start), Some(finish)) => {
                last_stage_finish = Some(finish);
                let duration = finish - start;
                total = total + duration;
                println!("    {}: {duration}", stage.name);
            }
            _ => println!("    {}: N/A", stage.name),
        }
    }

    println!("Total processing time: {total}");
    match (first_stage_start, last_stage_finish) {
        (Some(first), Some(last)) => {
            println!("Wall clock time since first stage start: {}", last - first);
        }
        _ => println!("Wall clock time since first stage start: N/A"),
    }
    match (task.creation_time, last_stage_finish) {
        (Some(created), Some(last)) => {
            println!("Wall clock time since task creation: {}", last - created);
        }
        (Some(created), None) => {
            println!(
                "Wall clock time since task creation (fallback using now): {}",
                Utc::now() - created
            );
        }
        (None, _) => println!("Wall clock time since task creation: N/A"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optiflow_common::model::STAGE_INITIAL_STATUS;
    use uuid::Uuid;

    fn stage(name: &str, status: StageStatus) -> Stage {
        Stage {
            run_uuid: Uuid::now_v7(),
            n_ord: 1,
            name: name.to_string(),
            status,
            config: None,
            input: None,
            output: None,
            t_start_utc: None,
            t_finish_utc: None,
            executor: None,
            s3_bucket: "bkt".to_string(),
            comments: None,
            next: vec![],
        }
    }

    #[test]
    fn aggregate_status_predicates() {
        let stages = vec![
            stage("a", StageStatus::Success),
            stage("b", StageStatus::Success),
        ];
        assert!(all_stages_have_status(&stages, StageStatus::Success));
        assert!(!any_stage_has_status(&stages, StageStatus::Error));

        let mixed = vec![
            stage("a", StageStatus::Success),
            stage("b", StageStatus::Error),
            stage("c", STAGE_INITIAL_STATUS),
        ];
        assert!(!all_stages_have_status(&mixed, StageStatus::Success));
        assert!(any_stage_has_status(&mixed, StageStatus::Error));
        assert!(any_stage_has_status(&mixed, StageStatus::Pending));
    }
}
