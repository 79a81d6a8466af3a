//! Schema migration: create the task and stage tables with their secondary
//! indexes when they are missing. Runs at registry construction time.

use optiflow_common::error::Error;
use optiflow_common::store::{BillingMode, DocumentStore, IndexSpec, Projection, TableSpec};
use tracing::info;

use crate::{STAGES_TABLE, STAGE_NAME_INDEX, TASKS_TABLE, TASK_RUN_UUID_INDEX};

fn tasks_table_spec() -> TableSpec {
    TableSpec {
        name: TASKS_TABLE.to_string(),
        partition_key: "task_id".to_string(),
        sort_key: "run_uuid".to_string(),
        indexes: vec![IndexSpec {
            name: TASK_RUN_UUID_INDEX.to_string(),
            partition_key: "run_uuid".to_string(),
            sort_key: None,
            projection: Projection::All,
        }],
        billing_mode: BillingMode::PayPerRequest,
    }
}

fn stages_table_spec() -> TableSpec {
    TableSpec {
        name: STAGES_TABLE.to_string(),
        partition_key: "run_uuid".to_string(),
        sort_key: "n_ord".to_string(),
        indexes: vec![IndexSpec {
            name: STAGE_NAME_INDEX.to_string(),
            partition_key: "run_uuid".to_string(),
            sort_key: Some("name".to_string()),
            projection: Projection::All,
        }],
        billing_mode: BillingMode::PayPerRequest,
    }
}

pub(crate) async fn migrate(store: &dyn DocumentStore) -> Result<(), Error> {
    for spec in [tasks_table_spec(), stages_table_spec()] {
        let created = store
            .ensure_table(&spec)
            .await
            .map_err(|e| Error::Store(format!("failed to create {:?} table: {e}", spec.name)))?;
        if created {
            info!(table = %spec.name, "table created");
        } else {
            info!(table = %spec.name, "table already exists");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use optiflow_common::store::memory::InMemoryStore;

    #[tokio::test]
    async fn migration_is_idempotent() {
        let store = InMemoryStore::new();
        migrate(&store).await.unwrap();
        migrate(&store).await.unwrap();
    }
}
