//! Filesystem-backed backend for all three store seams, so the control plane
//! can run on a single host without a cloud account: tables are directories
//! of JSON rows, queues are directories of message files with visibility
//! deadlines, objects are plain files.
//!
//! Key attributes must use an object-store-safe charset (no path
//! separators); row file names are derived from them directly. Concurrent
//! writers on the same row are resolved by last-rename-wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Error;
use crate::store::{
    key_component, Document, DocumentStore, ObjectStore, QueueMessage, QueueService, StorageClass,
    TableSpec, DEFAULT_VISIBILITY_TIMEOUT,
};

const RECEIVE_POLL_TICK: Duration = Duration::from_millis(50);

pub struct LocalFsStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct MessageFile {
    body: String,
    /// Epoch milliseconds after which the message is visible to consumers.
    visible_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl LocalFsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        for sub in ["tables", "queues", "objects"] {
            tokio::fs::create_dir_all(root.join(sub))
                .await
                .map_err(|e| {
                    Error::Store(format!("failed to create store root {}: {e}", root.display()))
                })?;
        }
        Ok(Self { root })
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join("tables").join(table)
    }

    fn row_path(&self, table: &str, pk: &Value, sk: &Value) -> PathBuf {
        self.table_dir(table)
            .join("items")
            .join(format!("{}#{}.json", key_component(pk), key_component(sk)))
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join("queues").join(queue)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join("objects").join(bucket).join(key)
    }

    async fn read_spec(&self, table: &str) -> Result<TableSpec, Error> {
        let path = self.table_dir(table).join("spec.json");
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::Store(format!("unknown table {table}")))?;
        serde_json::from_slice(&data).map_err(Error::from)
    }

    async fn read_all_rows(&self, table: &str) -> Result<Vec<Document>, Error> {
        // Validates the table exists.
        self.read_spec(table).await?;
        let items = self.table_dir(table).join("items");
        let mut rows = Vec::new();
        let mut entries = match tokio::fs::read_dir(&items).await {
            Ok(entries) => entries,
            Err(_) => return Ok(rows),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Store(format!("failed to list {}: {e}", items.display())))?
        {
            let data = tokio::fs::read(entry.path())
                .await
                .map_err(|e| Error::Store(format!("failed to read row file: {e}")))?;
            rows.push(serde_json::from_slice(&data)?);
        }
        Ok(rows)
    }

    async fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Store(format!("path {} has no parent", path.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Store(format!("failed to create {}: {e}", parent.display())))?;
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let data = serde_json::to_vec(value)?;
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Store(format!("failed to rename into {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for LocalFsStore {
    async fn ensure_table(&self, spec: &TableSpec) -> Result<bool, Error> {
        let spec_path = self.table_dir(&spec.name).join("spec.json");
        if tokio::fs::try_exists(&spec_path)
            .await
            .map_err(|e| Error::Store(format!("failed to stat {}: {e}", spec_path.display())))?
        {
            return Ok(false);
        }
        Self::write_json_atomically(&spec_path, spec).await?;
        tokio::fs::create_dir_all(self.table_dir(&spec.name).join("items"))
            .await
            .map_err(|e| Error::Store(format!("failed to create items dir: {e}")))?;
        Ok(true)
    }

    async fn put_item(&self, table: &str, item: Document) -> Result<(), Error> {
        let spec = self.read_spec(table).await?;
        let pk = item
            .get(&spec.partition_key)
            .cloned()
            .ok_or_else(|| Error::Store(format!("item is missing key attribute {}", spec.partition_key)))?;
        let sk = item
            .get(&spec.sort_key)
            .cloned()
            .ok_or_else(|| Error::Store(format!("item is missing key attribute {}", spec.sort_key)))?;
        let path = self.row_path(table, &pk, &sk);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Store(format!("failed to stat {}: {e}", path.display())))?
        {
            return Err(Error::Store(format!(
                "row ({}, {}) already exists in table {table}",
                key_component(&pk),
                key_component(&sk)
            )));
        }
        Self::write_json_atomically(&path, &item).await
    }

    async fn get_item(
        &self,
        table: &str,
        pk: &Value,
        sk: &Value,
    ) -> Result<Option<Document>, Error> {
        self.read_spec(table).await?;
        let path = self.row_path(table, pk, sk);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("failed to read {}: {e}", path.display()))),
        }
    }

    async fn query_partition(&self, table: &str, pk: &Value) -> Result<Vec<Document>, Error> {
        let spec = self.read_spec(table).await?;
        let rows = self.read_all_rows(table).await?;
        Ok(rows
            .into_iter()
            .filter(|doc| doc.get(&spec.partition_key) == Some(pk))
            .collect())
    }

    async fn query_index(
        &self,
        table: &str,
        index: &str,
        pk: &Value,
        sk: Option<&Value>,
    ) -> Result<Vec<Document>, Error> {
        let spec = self.read_spec(table).await?;
        let index = spec
            .indexes
            .iter()
            .find(|ix| ix.name == index)
            .ok_or_else(|| Error::Store(format!("unknown index {index} on table {table}")))?
            .clone();
        let rows = self.read_all_rows(table).await?;
        Ok(rows
            .into_iter()
            .filter(|doc| {
                if doc.get(&index.partition_key) != Some(pk) {
                    return false;
                }
                match (sk, &index.sort_key) {
                    (Some(want), Some(attr)) => doc.get(attr) == Some(want),
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            })
            .collect())
    }

    async fn update_attribute(
        &self,
        table: &str,
        pk: &Value,
        sk: &Value,
        attribute: &str,
        value: Value,
    ) -> Result<(), Error> {
        let mut row = self
            .get_item(table, pk, sk)
            .await?
            .ok_or_else(|| Error::NotFound {
                resource_type: table.to_string(),
                resource_id: format!("({}, {})", key_component(pk), key_component(sk)),
            })?;
        row.insert(attribute.to_string(), value);
        Self::write_json_atomically(&self.row_path(table, pk, sk), &row).await
    }

    async fn scan(&self, table: &str) -> Result<Vec<Document>, Error> {
        self.read_all_rows(table).await
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        _class: StorageClass,
    ) -> Result<(), Error> {
        let dest = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Artifact(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::copy(source, &dest).await.map_err(|e| {
            Error::Artifact(format!(
                "failed to store {} as {bucket}/{key}: {e}",
                source.display()
            ))
        })?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), Error> {
        let src = self.object_path(bucket, key);
        if !tokio::fs::try_exists(&src)
            .await
            .map_err(|e| Error::Artifact(format!("failed to stat {}: {e}", src.display())))?
        {
            return Err(Error::Artifact(format!("no object {key} in bucket {bucket}")));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Artifact(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::copy(&src, destination).await.map_err(|e| {
            Error::Artifact(format!(
                "failed to download {bucket}/{key} to {}: {e}",
                destination.display()
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl QueueService for LocalFsStore {
    async fn send_message(&self, queue: &str, body: &str) -> Result<(), Error> {
        let path = self.queue_dir(queue).join(format!("{}.json", Uuid::new_v4()));
        let msg = MessageFile {
            body: body.to_string(),
            visible_at_ms: now_ms(),
        };
        Self::write_json_atomically(&path, &msg)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, Error> {
        let dir = self.queue_dir(queue);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Transport(format!("failed to create {}: {e}", dir.display())))?;
        let deadline = Instant::now() + wait;
        loop {
            let mut received = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Transport(format!("failed to list {}: {e}", dir.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Transport(format!("failed to list {}: {e}", dir.display())))?
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(data) = tokio::fs::read(&path).await else {
                    continue; // deleted or mid-rename, skip
                };
                let Ok(mut msg) = serde_json::from_slice::<MessageFile>(&data) else {
                    continue;
                };
                if msg.visible_at_ms > now_ms() {
                    continue;
                }
                msg.visible_at_ms = now_ms() + DEFAULT_VISIBILITY_TIMEOUT.as_millis() as i64;
                Self::write_json_atomically(&path, &msg)
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                let receipt = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                received.push(QueueMessage {
                    body: msg.body,
                    receipt,
                });
                if received.len() == max_messages {
                    break;
                }
            }
            if !received.is_empty() {
                return Ok(received);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_POLL_TICK).await;
        }
    }

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), Error> {
        let path = self.queue_dir(queue).join(format!("{receipt}.json"));
        tokio::fs::remove_file(&path).await.map_err(|e| {
            Error::Transport(format!("no message with receipt {receipt} in queue {queue}: {e}"))
        })
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &str,
        visibility: Duration,
    ) -> Result<(), Error> {
        let path = self.queue_dir(queue).join(format!("{receipt}.json"));
        let data = tokio::fs::read(&path).await.map_err(|e| {
            Error::Transport(format!("no message with receipt {receipt} in queue {queue}: {e}"))
        })?;
        let mut msg: MessageFile =
            serde_json::from_slice(&data).map_err(|e| Error::Transport(e.to_string()))?;
        msg.visible_at_ms = now_ms() + visibility.as_millis() as i64;
        Self::write_json_atomically(&path, &msg)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
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

    #[tokio::test]
    async fn rows_survive_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalFsStore::open(dir.path()).await.unwrap();
            store.ensure_table(&table_spec()).await.unwrap();
            let doc = serde_json::from_value(json!({"pk": "a", "sk": 1, "label": "x"})).unwrap();
            store.put_item("things", doc).await.unwrap();
        }
        let store = LocalFsStore::open(dir.path()).await.unwrap();
        assert!(!store.ensure_table(&table_spec()).await.unwrap());
        let row = store
            .get_item("things", &json!("a"), &json!(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["label"], "x");
    }

    #[tokio::test]
    async fn queue_messages_lease_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::open(dir.path()).await.unwrap();
        store.send_message("stage-a", "run-1").await.unwrap();

        let got = store
            .receive_messages("stage-a", 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "run-1");

        let empty = store
            .receive_messages("stage-a", 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(empty.is_empty());

        store
            .change_visibility("stage-a", &got[0].receipt, Duration::ZERO)
            .await
            .unwrap();
        let again = store
            .receive_messages("stage-a", 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        store.delete_message("stage-a", &again[0].receipt).await.unwrap();
    }

    #[tokio::test]
    async fn objects_are_plain_files_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::open(dir.path()).await.unwrap();
        let src = dir.path().join("artifact.bin");
        tokio::fs::write(&src, b"bytes").await.unwrap();
        store
            .put_object("bkt", "task-registry/t/r/artifact.bin", &src, StorageClass::StandardIa)
            .await
            .unwrap();
        let dst = dir.path().join("back.bin");
        store
            .get_object("bkt", "task-registry/t/r/artifact.bin", &dst)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"bytes");
    }
}
