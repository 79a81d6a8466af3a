//! Stages configuration: a YAML sequence of `{name, config, executor, next}`
//! entries, in pipeline order. Validation happens before anything touches
//! the registry.

use std::path::Path;

use optiflow_common::error::Error;
use optiflow_common::model::{Stage, TaskRun, STAGE_INITIAL_STATUS};
use optiflow_registry::TaskRegistry;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub next: Vec<String>,
}

/// Parse the stages YAML and validate it: at least one stage, unique names,
/// every `next` reference resolving to a declared stage, and every declared
/// per-stage config file present on disk.
pub fn load_stages_config(path: &Path) -> Result<Vec<StageConfig>, Error> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let stages: Vec<StageConfig> = serde_yaml::from_str(&data).map_err(|e| {
        if let Some(location) = e.location() {
            Error::Config(format!(
                "invalid stages config at line {}, column {}: {e}",
                location.line(),
                location.column()
            ))
        } else {
            Error::Config(format!("invalid stages config: {e}"))
        }
    })?;

    if stages.is_empty() {
        return Err(Error::Config(format!(
            "stages config {} declares no stages",
            path.display()
        )));
    }

    let mut names = std::collections::HashSet::new();
    for stage in &stages {
        if !names.insert(stage.name.as_str()) {
            return Err(Error::Config(format!(
                "stage {:?} is declared more than once",
                stage.name
            )));
        }
    }
    let unknown: Vec<&str> = stages
        .iter()
        .flat_map(|stage| stage.next.iter())
        .map(String::as_str)
        .filter(|next| !names.contains(next))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Config(format!(
            "some stage(s) reference next stage(s) that were not found: {unknown:?}"
        )));
    }

    for stage in &stages {
        if let Some(config) = stage.config.as_deref().filter(|c| !c.is_empty()) {
            std::fs::metadata(config).map_err(|e| {
                Error::Config(format!(
                    "cannot stat config file {config:?} of stage {:?}: {e}",
                    stage.name
                ))
            })?;
        }
    }

    Ok(stages)
}

/// Turn the validated config into stage rows for the run, uploading each
/// per-stage config file to its stage-scoped object key. `n_ord` is dense
/// from 1 in declaration order.
pub async fn create_stages(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    stages_config: &[StageConfig],
    s3_bucket: &str,
) -> Result<Vec<Stage>, Error> {
    let mut stages = Vec::with_capacity(stages_config.len());
    for (i, stage_config) in stages_config.iter().enumerate() {
        let n_ord = (i + 1) as i64;
        let config_key = match stage_config.config.as_deref().filter(|c| !c.is_empty()) {
            Some(config) => Some(
                registry
                    .upload_file_for_stage(
                        Path::new(config),
                        s3_bucket,
                        task_run,
                        &stage_config.name,
                        n_ord,
                    )
                    .await?,
            ),
            None => None,
        };
        stages.push(Stage {
            run_uuid: task_run.run_uuid,
            n_ord,
            name: stage_config.name.clone(),
            status: STAGE_INITIAL_STATUS,
            config: config_key,
            input: None,
            output: None,
            t_start_utc: None,
            t_finish_utc: None,
            executor: stage_config.executor.clone(),
            s3_bucket: s3_bucket.to_string(),
            comments: None,
            next: stage_config.next.clone(),
        });
    }
    Ok(stages)
}
