//! The realtime document backend the client core talks to.
//!
//! Components never reach a global handle: they receive an `Arc<dyn Backend>`
//! and use only the primitives below, so the bundled in-memory and SQLite
//! stores are interchangeable with any hosted document service.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::common::error::{BackendResult, ChatError, ChatResult};

pub mod clock;
pub mod memory;
pub mod query;
pub mod registry;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use query::{Direction, OrderBy, Query};

pub type Fields = Map<String, Value>;

pub const MIN_PASSWORD_LENGTH: usize = 6;

const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Sentinel replaced by the backend with the commit time of the write.
pub fn server_timestamp() -> Value {
    let mut sentinel = Map::new();
    sentinel.insert(SERVER_TIMESTAMP_KEY.to_string(), Value::Bool(true));
    Value::Object(sentinel)
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|o| o.len() == 1 && o.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)))
        .unwrap_or(false)
}

/// Object values become their map; anything else yields empty fields.
pub fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(collection: &str, id: &str, fields: Fields) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        }
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> ChatResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| ChatError::Decode {
            collection: self.collection.clone(),
            key: self.id.clone(),
            source,
        })
    }
}

/// Full result set of a subscribed query at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub documents: Vec<Document>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { collection: String, key: String, fields: Fields },
    Append { collection: String, fields: Fields },
    Delete { collection: String, key: String },
}

impl WriteOp {
    pub fn set(collection: &str, key: &str, fields: Fields) -> Self {
        WriteOp::Set { collection: collection.to_string(), key: key.to_string(), fields }
    }

    pub fn delete(collection: &str, key: &str) -> Self {
        WriteOp::Delete { collection: collection.to_string(), key: key.to_string() }
    }

    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. }
            | WriteOp::Append { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

type CancelFn = Box<dyn FnOnce() + Send>;

struct CancelOnce(Mutex<Option<CancelFn>>);

/// Shareable handle that cancels a subscription from outside the task reading it.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelOnce>);

impl CancelHandle {
    fn new(cancel: CancelFn) -> Self {
        Self(Arc::new(CancelOnce(Mutex::new(Some(cancel)))))
    }

    /// Runs the cancellation the first time; later calls do nothing.
    pub fn cancel(&self) {
        let cancel = self.0 .0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0 .0.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Live query results. Yields a snapshot on subscribe and after every write
/// touching the collection. Cancelled exactly once, by `cancel`, by a
/// `CancelHandle`, or on drop.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Snapshot>,
    cancel: CancelHandle,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Snapshot>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { rx, cancel: CancelHandle::new(Box::new(cancel)) }
    }

    pub fn handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Session-changed notifications; the current value is the signed-in user.
    fn subscribe_session(&self) -> watch::Receiver<Option<AuthUser>>;

    fn current_user(&self) -> Option<AuthUser> {
        let rx = self.subscribe_session();
        let user = rx.borrow().clone();
        user
    }

    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> BackendResult<AuthUser>;

    async fn sign_in(&self, email: &str, password: &str) -> BackendResult<AuthUser>;

    async fn sign_out(&self) -> BackendResult<()>;

    async fn get_document(&self, collection: &str, key: &str) -> BackendResult<Option<Document>>;

    async fn query_equals(&self, query: &Query) -> BackendResult<Vec<Document>>;

    async fn subscribe_query(&self, query: Query) -> BackendResult<Subscription>;

    /// Creates or replaces `collection/key`.
    async fn write_document(&self, collection: &str, key: &str, fields: Fields) -> BackendResult<()>;

    /// Stores `fields` under a fresh key and returns the key.
    async fn append_document(&self, collection: &str, fields: Fields) -> BackendResult<String>;

    /// Deleting a missing key is not an error.
    async fn delete_document(&self, collection: &str, key: &str) -> BackendResult<()>;

    /// Applies `ops` in order. This default is not atomic: a failure part way
    /// leaves the earlier writes in place. Backends with batch support override it.
    async fn commit(&self, ops: Vec<WriteOp>) -> BackendResult<()> {
        for op in ops {
            match op {
                WriteOp::Set { collection, key, fields } => {
                    self.write_document(&collection, &key, fields).await?
                }
                WriteOp::Append { collection, fields } => {
                    self.append_document(&collection, fields).await?;
                }
                WriteOp::Delete { collection, key } => self.delete_document(&collection, &key).await?,
            }
        }
        Ok(())
    }
}

pub(crate) fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
