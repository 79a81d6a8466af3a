//! Input materialization: bring a stage's input object to the local path the
//! stage command expects.
//!
//! An `input_path` ending in `/` asks for a folder: the object is downloaded
//! to a temporary file, probed for the 7z magic, and either extracted into
//! the folder or moved under it keeping its base name. A plain path is a
//! direct file download.

use std::path::Path;

use optiflow_common::error::Error;
use optiflow_common::model::Stage;
use optiflow_registry::TaskRegistry;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive;

pub async fn fetch_input(
    registry: &TaskRegistry,
    stage: &Stage,
    input_path: &str,
) -> Result<(), Error> {
    if input_path.is_empty() {
        return Err(Error::Config(
            "input file path is not specified in worker args".to_string(),
        ));
    }

    if !input_path.ends_with('/') {
        return registry.download_input_file(stage, Path::new(input_path)).await;
    }

    let temp = std::env::temp_dir().join(format!("stage-input-{}", Uuid::new_v4()));
    let result = materialize_folder(registry, stage, &temp, Path::new(input_path)).await;
    if let Err(e) = tokio::fs::remove_file(&temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(temp = %temp.display(), error = %e, "couldn't remove the temporary input file");
        }
    }
    result
}

async fn materialize_folder(
    registry: &TaskRegistry,
    stage: &Stage,
    temp: &Path,
    folder: &Path,
) -> Result<(), Error> {
    registry.download_input_file(stage, temp).await?;

    if archive::is_7z(temp)? {
        info!(folder = %folder.display(), "input object is a 7z archive, extracting");
        return archive::extract_7z(temp, folder);
    }

    tokio::fs::create_dir_all(folder)
        .await
        .map_err(|e| Error::Artifact(format!("couldn't create input folder {}: {e}", folder.display())))?;
    let base_name = stage
        .input
        .as_deref()
        .and_then(|key| key.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("input");
    let target = folder.join(base_name);
    tokio::fs::copy(temp, &target)
        .await
        .map_err(|e| Error::Artifact(format!("couldn't place input under {}: {e}", target.display())))?;
    info!(target = %target.display(), "input object placed into the input folder");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use optiflow_common::model::{TaskRun, TaskRunStatus, STAGE_INITIAL_STATUS};
    use optiflow_common::store::memory::InMemoryStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn registry_with_input(
        input_bytes: &[u8],
        key: &str,
    ) -> (Arc<TaskRegistry>, Stage, tempfile::TempDir) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(
            TaskRegistry::new(store.clone(), store.clone(), store.clone())
                .await
                .unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, input_bytes).await.unwrap();

        let run = TaskRun {
            task_id: "t".into(),
            run_uuid: Uuid::now_v7(),
            parameters: HashMap::new(),
            results: None,
            task_definition: String::new(),
            creation_time: None,
            status: TaskRunStatus::Submitted,
        };
        let uploaded = registry
            .upload_file_for_stage(&src, "bkt", &run, "stage", 1)
            .await
            .unwrap();
        assert!(uploaded.ends_with(key.rsplit('/').next().unwrap()));

        let stage = Stage {
            run_uuid: run.run_uuid,
            n_ord: 1,
            name: "stage".into(),
            status: STAGE_INITIAL_STATUS,
            config: None,
            input: Some(uploaded),
            output: None,
            t_start_utc: None,
            t_finish_utc: None,
            executor: None,
            s3_bucket: "bkt".into(),
            comments: None,
            next: vec![],
        };
        (registry, stage, dir)
    }

    #[tokio::test]
    async fn plain_path_downloads_the_file_directly() {
        let (registry, stage, dir) = registry_with_input(b"payload", "src.bin").await;
        let dest = dir.path().join("input.bin");
        fetch_input(&registry, &stage, dest.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn folder_path_moves_a_plain_object_under_its_base_name() {
        let (registry, stage, dir) = registry_with_input(b"payload", "src.bin").await;
        let folder = format!("{}/", dir.path().join("input-dir").display());
        fetch_input(&registry, &stage, &folder).await.unwrap();
        let placed = dir.path().join("input-dir").join("src.bin");
        assert_eq!(tokio::fs::read(&placed).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn empty_input_path_is_a_configuration_error() {
        let (registry, stage, _dir) = registry_with_input(b"x", "src.bin").await;
        let err = fetch_input(&registry, &stage, "").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
