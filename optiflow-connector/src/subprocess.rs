//! Stage command execution: spawn the shell command from the command file,
//! stream its stdio, and propagate task cancellation to the child.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use optiflow_common::error::Error;
use optiflow_registry::TaskRegistry;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// How often the watcher re-reads the run's cancellation status.
pub const CANCELLATION_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Run the stage command and wait for it.
///
/// The whole command file body goes to `/bin/sh -c`. The child environment
/// is composed from the task-run parameter map alone; nothing of the
/// worker's own environment leaks through. A watcher polls the registry
/// every [`CANCELLATION_POLL_PERIOD`] and SIGTERMs the child once the run is
/// cancelled; any exit after an observed cancellation counts as clean.
pub async fn run_stage_command(
    registry: Arc<TaskRegistry>,
    run_uuid: Uuid,
    command_file: &Path,
    parameters: &HashMap<String, String>,
) -> Result<(), Error> {
    let command = tokio::fs::read_to_string(command_file).await.map_err(|e| {
        Error::Execution(format!(
            "unable to read command file {}: {e}",
            command_file.display()
        ))
    })?;

    let mut child = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .env_clear()
        .envs(parameters)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::Execution(format!("unable to start shell subprocess {command:?}: {e}")))?;

    let pid = child.id();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let watcher = tokio::spawn(cancellation_watcher(registry.clone(), run_uuid, pid, stop_rx));

    let wait_result = child.wait().await;

    let _ = stop_tx.send(());
    let _ = watcher.await;

    match wait_result {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            if registry.is_cancelled(&run_uuid).await.unwrap_or(false) {
                info!(%status, "subprocess was interrupted and finished");
                Ok(())
            } else {
                Err(Error::Execution(format!(
                    "subprocess failed with exit status {status}"
                )))
            }
        }
        Err(e) => Err(Error::Execution(format!(
            "error waiting for the subprocess: {e}"
        ))),
    }
}

async fn cancellation_watcher(
    registry: Arc<TaskRegistry>,
    run_uuid: Uuid,
    pid: Option<u32>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => return,
            _ = tokio::time::sleep(CANCELLATION_POLL_PERIOD) => {
                match registry.is_cancelled(&run_uuid).await {
                    Ok(true) => {
                        let Some(pid) = pid else { return };
                        info!(%run_uuid, pid, "task run cancelled, sending SIGTERM to the stage command");
                        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                        if rc != 0 {
                            warn!(
                                pid,
                                error = %std::io::Error::last_os_error(),
                                "couldn't send SIGTERM to the job (will retry)"
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "couldn't check the task run cancellation (will retry)");
                    }
                }
            }
        }
    }
}
