//! The task registry: typed operations over the document store (task runs,
//! stages), the object store (artifact routing), and the queue service
//! (stage handover, terminal outcome delivery). Owns schema migration.

mod artifacts;
mod communication;
mod data;
mod migration;
#[cfg(test)]
pub(crate) mod test_support;

pub use communication::WAIT_TIME;

use std::sync::Arc;

use optiflow_common::error::Error;
use optiflow_common::store::local_fs::LocalFsStore;
use optiflow_common::store::{DocumentStore, ObjectStore, QueueService};
use tracing::info;

pub const TASKS_TABLE: &str = "task_runs";
pub const STAGES_TABLE: &str = "task_stages";
pub const TASK_RUN_UUID_INDEX: &str = "TaskRunUUIDIndex";
pub const STAGE_NAME_INDEX: &str = "StageNameIndex";

/// Common key prefix of every object the registry stores.
pub const OBJECT_KEY_PREFIX: &str = "task-registry";

/// Queue carrying the run UUIDs of successfully finished pipelines.
pub const FINISHED_TASKS_QUEUE: &str = "finished-tasks";

pub struct TaskRegistry {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    queues: Arc<dyn QueueService>,
}

impl TaskRegistry {
    /// Build a registry over explicit backends. Runs schema migration, so a
    /// freshly connected registry always has its tables.
    pub async fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        queues: Arc<dyn QueueService>,
    ) -> Result<Self, Error> {
        migration::migrate(documents.as_ref()).await?;
        Ok(Self {
            documents,
            objects,
            queues,
        })
    }

    /// Resolve a document-API endpoint into a registry.
    ///
    /// Only `file://<root>` endpoints (or a bare filesystem path) have a
    /// built-in backend; cloud backends implement the store traits and use
    /// [`TaskRegistry::new`] instead.
    pub async fn connect(endpoint: &str) -> Result<Self, Error> {
        let root = if let Some(path) = endpoint.strip_prefix("file://") {
            path
        } else if !endpoint.contains("://") {
            endpoint
        } else {
            return Err(Error::Config(format!(
                "unsupported document API endpoint {endpoint}: only file:// endpoints \
                 have a built-in backend"
            )));
        };
        let store = Arc::new(LocalFsStore::open(root).await?);
        info!(root, "connected to the local task registry backend");
        Self::new(store.clone(), store.clone(), store).await
    }

    pub(crate) fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    pub(crate) fn objects(&self) -> &dyn ObjectStore {
        self.objects.as_ref()
    }

    pub(crate) fn queues(&self) -> &dyn QueueService {
        self.queues.as_ref()
    }
}
