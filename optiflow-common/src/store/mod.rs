//! Seams for the external collaborators of the control plane: the key/value
//! document store, the object store, and the queue service.
//!
//! Concrete cloud backends live outside this workspace; they plug in by
//! implementing these traits. Two default backends ship here: an in-memory
//! one for tests and a filesystem-backed one for single-host runs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub mod local_fs;
pub mod memory;

/// A stored row: attribute name to JSON value.
pub type Document = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMode {
    PayPerRequest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    All,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
    pub projection: Projection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub partition_key: String,
    pub sort_key: String,
    pub indexes: Vec<IndexSpec>,
    pub billing_mode: BillingMode,
}

/// Canonical string form of a key attribute, used by the default backends
/// to address rows. Strings are taken verbatim, other scalars via their
/// JSON rendering.
pub(crate) fn key_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the table if it is missing. Idempotent; returns whether the
    /// table was created by this call. A table must be ensured before any
    /// other operation may address it.
    async fn ensure_table(&self, spec: &TableSpec) -> Result<bool, Error>;

    /// Create-only put: fails with a `Store` error if a row with the same
    /// primary key already exists.
    async fn put_item(&self, table: &str, item: Document) -> Result<(), Error>;

    async fn get_item(&self, table: &str, pk: &Value, sk: &Value)
        -> Result<Option<Document>, Error>;

    /// All rows sharing a partition key. Returned order is not guaranteed.
    async fn query_partition(&self, table: &str, pk: &Value) -> Result<Vec<Document>, Error>;

    /// Rows matching a secondary-index key condition.
    async fn query_index(
        &self,
        table: &str,
        index: &str,
        pk: &Value,
        sk: Option<&Value>,
    ) -> Result<Vec<Document>, Error>;

    /// Conditional single-attribute update; the target row must exist,
    /// otherwise `NotFound` is returned and nothing is written.
    async fn update_attribute(
        &self,
        table: &str,
        pk: &Value,
        sk: &Value,
        attribute: &str,
        value: Value,
    ) -> Result<(), Error>;

    /// Full table scan.
    async fn scan(&self, table: &str) -> Result<Vec<Document>, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    /// Cold tier, cheaper; used for extra stage artifacts.
    StandardIa,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file to `bucket` under `key`.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        class: StorageClass,
    ) -> Result<(), Error>;

    /// Stream an object into `destination`, creating or truncating it.
    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub body: String,
    /// Opaque handle for `delete_message` / `change_visibility`.
    pub receipt: String,
}

/// Visibility timeout applied to received messages until the consumer
/// deletes them or resets their visibility.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn send_message(&self, queue: &str, body: &str) -> Result<(), Error>;

    /// Long-poll receive: waits up to `wait` for at most `max_messages`.
    /// Received messages become invisible to other consumers for
    /// [`DEFAULT_VISIBILITY_TIMEOUT`].
    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, Error>;

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), Error>;

    /// Override the remaining visibility of a received message. A zero
    /// duration releases it immediately for other consumers.
    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &str,
        visibility: Duration,
    ) -> Result<(), Error>;
}
