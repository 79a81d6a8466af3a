//! In-memory backend for all three store seams. Single-process only; the
//! test suites and local experiments run against it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Error;
use crate::store::{
    key_component, Document, DocumentStore, ObjectStore, QueueMessage, QueueService, StorageClass,
    TableSpec, DEFAULT_VISIBILITY_TIMEOUT,
};

const RECEIVE_POLL_TICK: Duration = Duration::from_millis(25);

struct TableState {
    spec: TableSpec,
    rows: HashMap<(String, String), Document>,
}

struct StoredMessage {
    id: String,
    body: String,
    visible_at: Instant,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, TableState>>,
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies currently stored in a queue, visible or not. Test helper.
    pub async fn queue_bodies(&self, queue: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

fn row_key(spec: &TableSpec, item: &Document) -> Result<(String, String), Error> {
    let pk = item
        .get(&spec.partition_key)
        .ok_or_else(|| Error::Store(format!("item is missing key attribute {}", spec.partition_key)))?;
    let sk = item
        .get(&spec.sort_key)
        .ok_or_else(|| Error::Store(format!("item is missing key attribute {}", spec.sort_key)))?;
    Ok((key_component(pk), key_component(sk)))
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn ensure_table(&self, spec: &TableSpec) -> Result<bool, Error> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(&spec.name) {
            return Ok(false);
        }
        tables.insert(
            spec.name.clone(),
            TableState {
                spec: spec.clone(),
                rows: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn put_item(&self, table: &str, item: Document) -> Result<(), Error> {
        let mut tables = self.tables.lock().await;
        let state = tables
            .get_mut(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        let key = row_key(&state.spec, &item)?;
        if state.rows.contains_key(&key) {
            return Err(Error::Store(format!(
                "row ({}, {}) already exists in table {table}",
                key.0, key.1
            )));
        }
        state.rows.insert(key, item);
        Ok(())
    }

    async fn get_item(
        &self,
        table: &str,
        pk: &Value,
        sk: &Value,
    ) -> Result<Option<Document>, Error> {
        let tables = self.tables.lock().await;
        let state = tables
            .get(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        let key = (key_component(pk), key_component(sk));
        Ok(state.rows.get(&key).cloned())
    }

    async fn query_partition(&self, table: &str, pk: &Value) -> Result<Vec<Document>, Error> {
        let tables = self.tables.lock().await;
        let state = tables
            .get(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        let pk = key_component(pk);
        Ok(state
            .rows
            .iter()
            .filter(|((row_pk, _), _)| *row_pk == pk)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn query_index(
        &self,
        table: &str,
        index: &str,
        pk: &Value,
        sk: Option<&Value>,
    ) -> Result<Vec<Document>, Error> {
        let tables = self.tables.lock().await;
        let state = tables
            .get(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        let index = state
            .spec
            .indexes
            .iter()
            .find(|ix| ix.name == index)
            .ok_or_else(|| Error::Store(format!("unknown index {index} on table {table}")))?;
        let matches = |doc: &Document| {
            if doc.get(&index.partition_key) != Some(pk) {
                return false;
            }
            match (sk, &index.sort_key) {
                (Some(want), Some(attr)) => doc.get(attr) == Some(want),
                (Some(_), None) => false,
                (None, _) => true,
            }
        };
        Ok(state.rows.values().filter(|doc| matches(doc)).cloned().collect())
    }

    async fn update_attribute(
        &self,
        table: &str,
        pk: &Value,
        sk: &Value,
        attribute: &str,
        value: Value,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().await;
        let state = tables
            .get_mut(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        let key = (key_component(pk), key_component(sk));
        let row = state.rows.get_mut(&key).ok_or_else(|| Error::NotFound {
            resource_type: table.to_string(),
            resource_id: format!("({}, {})", key.0, key.1),
        })?;
        row.insert(attribute.to_string(), value);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<Document>, Error> {
        let tables = self.tables.lock().await;
        let state = tables
            .get(table)
            .ok_or_else(|| Error::Store(format!("unknown table {table}")))?;
        Ok(state.rows.values().cloned().collect())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        _class: StorageClass,
    ) -> Result<(), Error> {
        let data = tokio::fs::read(source).await.map_err(|e| {
            Error::Artifact(format!("failed to read {} for upload: {e}", source.display()))
        })?;
        let mut objects = self.objects.lock().await;
        objects.insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), Error> {
        let data = {
            let objects = self.objects.lock().await;
            objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| {
                    Error::Artifact(format!("no object {key} in bucket {bucket}"))
                })?
        };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Artifact(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
            Error::Artifact(format!("failed to create {}: {e}", destination.display()))
        })?;
        file.write_all(&data).await.map_err(|e| {
            Error::Artifact(format!("failed to write {}: {e}", destination.display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl QueueService for InMemoryStore {
    async fn send_message(&self, queue: &str, body: &str) -> Result<(), Error> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().push(StoredMessage {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, Error> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut queues = self.queues.lock().await;
                let q = queues.entry(queue.to_string()).or_default();
                let now = Instant::now();
                let mut received = Vec::new();
                for msg in q.iter_mut() {
                    if msg.visible_at <= now {
                        msg.visible_at = now + DEFAULT_VISIBILITY_TIMEOUT;
                        received.push(QueueMessage {
                            body: msg.body.clone(),
                            receipt: msg.id.clone(),
                        });
                        if received.len() == max_messages {
                            break;
                        }
                    }
                }
                if !received.is_empty() {
                    return Ok(received);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_POLL_TICK).await;
        }
    }

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), Error> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::Transport(format!("unknown queue {queue}")))?;
        let before = q.len();
        q.retain(|msg| msg.id != receipt);
        if q.len() == before {
            return Err(Error::Transport(format!(
                "no message with receipt {receipt} in queue {queue}"
            )));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &str,
        visibility: Duration,
    ) -> Result<(), Error> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::Transport(format!("unknown queue {queue}")))?;
        let pos = q.iter().position(|msg| msg.id == receipt).ok_or_else(|| {
            Error::Transport(format!("no message with receipt {receipt} in queue {queue}"))
        })?;
        // Requeue at the back: receive order is not guaranteed, and this
        // keeps a released message from shadowing the rest of the queue.
        let mut msg = q.remove(pos);
        msg.visible_at = Instant::now() + visibility;
        q.push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BillingMode, IndexSpec, Projection};
    use serde_json::json;

    fn table_spec() -> TableSpec {
        TableSpec {
            name: "things".into(),
            partition_key: "pk".into(),
            sort_key: "sk".into(),
            indexes: vec![IndexSpec {
                name: "ByLabel".into(),
                partition_key: "pk".into(),
                sort_key: Some("label".into()),
                projection: Projection::All,
            }],
            billing_mode: BillingMode::PayPerRequest,
        }
    }

    fn doc(pk: &str, sk: i64, label: &str) -> Document {
        serde_json::from_value(json!({"pk": pk, "sk": sk, "label": label})).unwrap()
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let store = InMemoryStore::new();
        assert!(store.ensure_table(&table_spec()).await.unwrap());
        assert!(!store.ensure_table(&table_spec()).await.unwrap());
    }

    #[tokio::test]
    async fn put_is_create_only() {
        let store = InMemoryStore::new();
        store.ensure_table(&table_spec()).await.unwrap();
        store.put_item("things", doc("a", 1, "x")).await.unwrap();
        let err = store.put_item("things", doc("a", 1, "y")).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn update_requires_existing_row() {
        let store = InMemoryStore::new();
        store.ensure_table(&table_spec()).await.unwrap();
        let err = store
            .update_attribute("things", &json!("a"), &json!(1), "label", json!("z"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store.put_item("things", doc("a", 1, "x")).await.unwrap();
        store
            .update_attribute("things", &json!("a"), &json!(1), "label", json!("z"))
            .await
            .unwrap();
        let row = store
            .get_item("things", &json!("a"), &json!(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["label"], "z");
    }

    #[tokio::test]
    async fn index_query_filters_on_both_keys() {
        let store = InMemoryStore::new();
        store.ensure_table(&table_spec()).await.unwrap();
        store.put_item("things", doc("a", 1, "x")).await.unwrap();
        store.put_item("things", doc("a", 2, "y")).await.unwrap();
        store.put_item("things", doc("b", 1, "x")).await.unwrap();

        let rows = store
            .query_index("things", "ByLabel", &json!("a"), Some(&json!("y")))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["sk"], 2);

        let rows = store
            .query_index("things", "ByLabel", &json!("a"), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn received_messages_are_invisible_until_released() {
        let store = InMemoryStore::new();
        store.send_message("q", "m1").await.unwrap();

        let got = store
            .receive_messages("q", 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "m1");

        // Still leased: a second receive sees nothing.
        let empty = store
            .receive_messages("q", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(empty.is_empty());

        // Visibility zero releases it immediately.
        store
            .change_visibility("q", &got[0].receipt, Duration::ZERO)
            .await
            .unwrap();
        let again = store
            .receive_messages("q", 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);

        store.delete_message("q", &again[0].receipt).await.unwrap();
        assert!(store.queue_bodies("q").await.is_empty());
    }

    #[tokio::test]
    async fn objects_round_trip_through_files() {
        let store = InMemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        tokio::fs::write(&src, b"payload").await.unwrap();

        store
            .put_object("bkt", "some/key.txt", &src, StorageClass::Standard)
            .await
            .unwrap();

        let dst = dir.path().join("out.txt");
        store.get_object("bkt", "some/key.txt", &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");

        let err = store.get_object("bkt", "missing", &dst).await.unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }
}
