//! Artifact routing through the object store.
//!
//! Key layout:
//! `task-registry/<task_id>/<run_uuid>/<basename>` for task-level inputs,
//! `task-registry/<task_id>/<run_uuid>/<n_ord>_<stage_name>/<basename>` for
//! stage artifacts. Extra stage artifacts go to the cold tier.

use std::path::Path;

use optiflow_common::error::Error;
use optiflow_common::model::{Stage, TaskRun};
use optiflow_common::store::{ObjectStore, StorageClass};
use tracing::info;
use uuid::Uuid;

use crate::{TaskRegistry, OBJECT_KEY_PREFIX};

fn basename(path: &Path) -> Result<&str, Error> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Artifact(format!("path {} has no usable file name", path.display())))
}

impl TaskRegistry {
    /// Upload a task-level file (e.g. the task definition blob).
    pub async fn upload_file_for_task(
        &self,
        file_path: &Path,
        bucket: &str,
        task_id: &str,
        run_uuid: &Uuid,
    ) -> Result<String, Error> {
        let key = format!(
            "{OBJECT_KEY_PREFIX}/{task_id}/{run_uuid}/{}",
            basename(file_path)?
        );
        self.objects()
            .put_object(bucket, &key, file_path, StorageClass::Standard)
            .await?;
        info!(key, "file uploaded to the object store");
        Ok(key)
    }

    /// Upload a stage artifact on the standard tier.
    pub async fn upload_file_for_stage(
        &self,
        file_path: &Path,
        bucket: &str,
        task_run: &TaskRun,
        stage_name: &str,
        stage_n_ord: i64,
    ) -> Result<String, Error> {
        self.upload_stage_object(
            file_path,
            bucket,
            task_run,
            stage_name,
            stage_n_ord,
            StorageClass::Standard,
        )
        .await
    }

    /// Upload an extra stage artifact. Cold storage is about 2x cheaper, so
    /// extras that stages may produce go there.
    pub async fn upload_extra_file_for_stage(
        &self,
        file_path: &Path,
        bucket: &str,
        task_run: &TaskRun,
        stage_name: &str,
        stage_n_ord: i64,
    ) -> Result<String, Error> {
        self.upload_stage_object(
            file_path,
            bucket,
            task_run,
            stage_name,
            stage_n_ord,
            StorageClass::StandardIa,
        )
        .await
    }

    async fn upload_stage_object(
        &self,
        file_path: &Path,
        bucket: &str,
        task_run: &TaskRun,
        stage_name: &str,
        stage_n_ord: i64,
        class: StorageClass,
    ) -> Result<String, Error> {
        let key = format!(
            "{OBJECT_KEY_PREFIX}/{}/{}/{stage_n_ord}_{stage_name}/{}",
            task_run.task_id,
            task_run.run_uuid,
            basename(file_path)?
        );
        self.objects().put_object(bucket, &key, file_path, class).await?;
        info!(key, "file uploaded to the object store");
        Ok(key)
    }

    /// Download a stage's config object to a local path.
    pub async fn download_config_file(
        &self,
        stage: &Stage,
        destination: &Path,
    ) -> Result<(), Error> {
        let key = stage.config.as_deref().ok_or_else(|| {
            Error::Artifact(format!("stage {} has no config object", stage.name))
        })?;
        self.download_file(&stage.s3_bucket, key, destination)
            .await
            .map_err(|e| {
                Error::Artifact(format!(
                    "failed to download config file {key:?} from bucket {:?} for stage {:?} \
                     of task {}: {e}",
                    stage.s3_bucket, stage.name, stage.run_uuid
                ))
            })
    }

    /// Download a stage's input object to a local path.
    pub async fn download_input_file(
        &self,
        stage: &Stage,
        destination: &Path,
    ) -> Result<(), Error> {
        let key = stage.input.as_deref().ok_or_else(|| {
            Error::Artifact(format!("stage {} has no input object", stage.name))
        })?;
        self.download_file(&stage.s3_bucket, key, destination)
            .await
            .map_err(|e| {
                Error::Artifact(format!(
                    "failed to download input file {key:?} from bucket {:?} for stage {:?} \
                     of task {}: {e}",
                    stage.s3_bucket, stage.name, stage.run_uuid
                ))
            })
    }

    /// Stream an object to a local file, creating or truncating it.
    pub async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), Error> {
        self.objects().get_object(bucket, key, destination).await?;
        info!(key, destination = %destination.display(), "downloaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_test_registry, sample_run, sample_stage};

    #[tokio::test]
    async fn stage_keys_carry_the_order_index_and_name() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("heat-sim");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("result.txt");
        tokio::fs::write(&file, b"obj=1").await.unwrap();

        let key = registry
            .upload_file_for_stage(&file, "bkt", &run, "simulate", 2)
            .await
            .unwrap();
        assert_eq!(
            key,
            format!("task-registry/heat-sim/{}/2_simulate/result.txt", run.run_uuid)
        );

        let key = registry
            .upload_file_for_task(&file, "bkt", "heat-sim", &run.run_uuid)
            .await
            .unwrap();
        assert_eq!(
            key,
            format!("task-registry/heat-sim/{}/result.txt", run.run_uuid)
        );
    }

    #[tokio::test]
    async fn stage_downloads_resolve_recorded_object_paths() {
        let (registry, _store) = new_test_registry().await;
        let run = sample_run("heat-sim");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        tokio::fs::write(&file, b"threads: 4").await.unwrap();

        let key = registry
            .upload_file_for_stage(&file, "bkt", &run, "simulate", 1)
            .await
            .unwrap();

        let mut stage = sample_stage(&run, 1, "simulate");
        stage.s3_bucket = "bkt".to_string();
        stage.config = Some(key);

        let dest = dir.path().join("downloaded.yaml");
        registry.download_config_file(&stage, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"threads: 4");

        // No input recorded: the wrapper refuses rather than fetching nothing.
        let err = registry
            .download_input_file(&stage, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }
}
