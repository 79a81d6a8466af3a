//! Output and extra-artifact upload. Directories are archived with the
//! external `7zz` binary first. Extra artifacts go to the cold storage tier
//! and never fail the request; their outcome is recorded to the stage
//! comments instead.

use std::path::{Path, PathBuf};

use optiflow_common::error::Error;
use optiflow_common::model::{Stage, TaskRun};
use optiflow_registry::TaskRegistry;
use tracing::{info, warn};

use crate::archive;

/// Upload the stage's output artifact, if one is configured, and record the
/// resulting object key in `stage.output`. Returns the key.
pub async fn upload_output(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    stage: &Stage,
    output_path: Option<&Path>,
) -> Result<Option<String>, Error> {
    let Some(output_path) = output_path else {
        info!("no output path is configured, nothing is uploaded from this stage");
        return Ok(None);
    };

    let metadata = tokio::fs::metadata(output_path).await.map_err(|e| {
        Error::Artifact(format!("unable to stat path {}: {e}", output_path.display()))
    })?;

    let (file_to_upload, archived) = if metadata.is_dir() {
        info!(
            path = %output_path.display(),
            "output artifact path points at a directory, archiving"
        );
        let archive_path = std::env::temp_dir().join(format!("{}-output.7z", stage.name));
        archive::create_7z(&archive_path, output_path).await?;
        (archive_path.clone(), Some(archive_path))
    } else {
        (output_path.to_path_buf(), None)
    };

    let uploaded = registry
        .upload_file_for_stage(
            &file_to_upload,
            &stage.s3_bucket,
            task_run,
            &stage.name,
            stage.n_ord,
        )
        .await;
    if let Some(archive_path) = archived {
        remove_archive(&archive_path).await;
    }
    let key = uploaded?;

    registry.update_stage_output(stage, &key).await?;
    Ok(Some(key))
}

/// Upload every extra artifact (archiving directories first) on the cold
/// tier, and record the outcome into the stage comments. Failures here are
/// reported through the comment, never through the request result.
pub async fn upload_extras_and_comment(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    stage: &Stage,
    extras: &[PathBuf],
) {
    let comment = match upload_extras(registry, task_run, stage, extras).await {
        Ok(uploaded) => format!(
            "Uploaded {} extra artifacts: {uploaded:?}",
            uploaded.len()
        ),
        Err((uploaded, e)) => format!(
            "Extra artifacts upload failed! Uploaded {} ({uploaded:?}) out of {} ({extras:?}) files, {e}",
            uploaded.len(),
            extras.len()
        ),
    };
    info!("{comment}");
    if let Err(e) = registry.update_stage_comment(stage, &comment).await {
        warn!(
            stage = %stage.name,
            error = %e,
            "error updating the stage comment"
        );
    }
}

async fn upload_extras(
    registry: &TaskRegistry,
    task_run: &TaskRun,
    stage: &Stage,
    extras: &[PathBuf],
) -> Result<Vec<String>, (Vec<String>, Error)> {
    let mut uploaded = Vec::with_capacity(extras.len());
    for extra in extras {
        let metadata = tokio::fs::metadata(extra).await.map_err(|e| {
            (
                uploaded.clone(),
                Error::Artifact(format!("unable to stat path {}: {e}", extra.display())),
            )
        })?;

        let (file_to_upload, archived) = if metadata.is_dir() {
            info!(path = %extra.display(), "extra artifact path points at a directory, archiving");
            let archive_path = PathBuf::from(format!("{}.7z", extra.display()));
            archive::create_7z(&archive_path, extra)
                .await
                .map_err(|e| (uploaded.clone(), e))?;
            (archive_path.clone(), Some(archive_path))
        } else {
            (extra.clone(), None)
        };

        let result = registry
            .upload_extra_file_for_stage(
                &file_to_upload,
                &stage.s3_bucket,
                task_run,
                &stage.name,
                stage.n_ord,
            )
            .await;
        if let Some(archive_path) = archived {
            remove_archive(&archive_path).await;
        }
        let key = result.map_err(|e| (uploaded.clone(), e))?;
        uploaded.push(key);
    }
    Ok(uploaded)
}

async fn remove_archive(archive_path: &Path) {
    match tokio::fs::remove_file(archive_path).await {
        Ok(()) => info!(archive = %archive_path.display(), "cleaned up the archive"),
        Err(e) => warn!(
            archive = %archive_path.display(),
            error = %e,
            "couldn't remove the archive"
        ),
    }
}
