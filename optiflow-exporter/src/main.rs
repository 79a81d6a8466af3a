//! CSV dump of task runs: one row per run, with `param_*` and `obj_*`
//! columns collected across every exported run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::SecondsFormat;
use clap::Parser;
use optiflow_common::error::Error;
use optiflow_common::model::{TaskRun, TaskRunStatus};
use optiflow_registry::TaskRegistry;

/// Export task runs (parameters and objectives) to CSV.
#[derive(Parser, Debug)]
#[command(name = "optiflow-exporter", version)]
struct Args {
    /// Document API endpoint URL for the task registry
    #[arg(long)]
    dynamo_docapi_endpoint: String,

    /// Filter by task ID. If empty, export ALL task runs
    #[arg(long)]
    task_id: Option<String>,

    /// Comma-separated statuses to include (Submitted,Finished,Failed,Cancelled)
    #[arg(long)]
    status: Option<String>,

    /// Output CSV path
    #[arg(long, default_value = "export.csv")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let statuses = parse_statuses(args.status.as_deref().unwrap_or_default())?;

    let registry = TaskRegistry::connect(&args.dynamo_docapi_endpoint).await?;
    let runs = registry
        .list_task_runs(args.task_id.as_deref(), &statuses)
        .await?;

    write_csv(&args.output, &runs)?;
    println!("Wrote {} rows to {}", runs.len(), args.output.display());
    Ok(())
}

fn parse_statuses(statuses_csv: &str) -> Result<Vec<TaskRunStatus>, Error> {
    statuses_csv
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            TaskRunStatus::from_str(s)
                .map_err(|_| Error::Config(format!("unknown task run status {s:?}")))
        })
        .collect()
}

/// Column names for every key seen across the runs, prefixed and sorted.
fn prefixed_sorted_keys<'a, I>(keys: I, prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let unique: BTreeSet<&String> = keys.into_iter().collect();
    unique.into_iter().map(|k| format!("{prefix}{k}")).collect()
}

fn write_csv(path: &Path, runs: &[TaskRun]) -> Result<(), Error> {
    let param_cols = prefixed_sorted_keys(runs.iter().flat_map(|r| r.parameters.keys()), "param_");
    let obj_cols = prefixed_sorted_keys(
        runs.iter().flat_map(|r| r.results.iter().flatten().map(|(k, _)| k)),
        "obj_",
    );

    let mut header: Vec<&str> = vec!["task_id", "run_uuid", "status", "creation_time"];
    header.extend(param_cols.iter().map(String::as_str));
    header.extend(obj_cols.iter().map(String::as_str));

    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| Error::Internal(format!("failed to create {}: {e}", path.display())))?;
    writer
        .write_record(&header)
        .map_err(|e| Error::Internal(format!("failed to write CSV header: {e}")))?;

    for run in runs {
        let mut record = vec![
            run.task_id.clone(),
            run.run_uuid.to_string(),
            run.status.to_string(),
            run.creation_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        ];
        for col in &param_cols {
            let key = col.trim_start_matches("param_");
            record.push(run.parameters.get(key).cloned().unwrap_or_default());
        }
        for col in &obj_cols {
            let key = col.trim_start_matches("obj_");
            record.push(
                run.results
                    .as_ref()
                    .and_then(|r| r.get(key))
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        writer
            .write_record(&record)
            .map_err(|e| Error::Internal(format!("failed to write CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| Error::Internal(format!("failed to flush {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn run(task_id: &str, params: &[(&str, &str)], results: Option<&[(&str, &str)]>) -> TaskRun {
        TaskRun {
            task_id: task_id.to_string(),
            run_uuid: Uuid::now_v7(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            results: results.map(|r| {
                r.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>()
            }),
            task_definition: String::new(),
            creation_time: None,
            status: TaskRunStatus::Finished,
        }
    }

    #[test]
    fn statuses_parse_from_a_comma_list() {
        assert_eq!(
            parse_statuses("Finished, Failed").unwrap(),
            vec![TaskRunStatus::Finished, TaskRunStatus::Failed]
        );
        assert!(parse_statuses("").unwrap().is_empty());
        assert!(parse_statuses("Bogus").is_err());
    }

    #[test]
    fn columns_are_prefixed_sorted_and_gaps_left_empty() {
        let runs = vec![
            run("t", &[("beta", "2"), ("alpha", "1")], Some(&[("obj2", "y")])),
            run("t", &[("alpha", "3")], Some(&[("obj1", "x")])),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        write_csv(&path, &runs).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "task_id,run_uuid,status,creation_time,param_alpha,param_beta,obj_obj1,obj_obj2"
        );
        let first: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(&first[4..], &["1", "2", "", "y"]);
        let second: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(&second[4..], &["3", "", "x", ""]);
    }
}
