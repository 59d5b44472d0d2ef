use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::watch;

use super::clock::{format_timestamp, resolve_server_timestamps, TimestampClock};
use super::registry::SubscriptionRegistry;
use super::{
    new_document_id, AuthUser, Backend, Document, Fields, Query, Snapshot, Subscription, WriteOp,
    MIN_PASSWORD_LENGTH,
};
use crate::common::error::{BackendError, BackendResult};

struct Account {
    user: AuthUser,
    password: String,
}

#[derive(Default)]
struct StoreState {
    // collection -> key -> fields; key order is the default result order
    collections: HashMap<String, BTreeMap<String, Fields>>,
    // email -> account
    accounts: HashMap<String, Account>,
}

impl StoreState {
    fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(key, fields)| Document::new(collection, key, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn run(&self, query: &Query) -> Vec<Document> {
        query.apply(self.documents(&query.collection))
    }
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<StoreState>,
    registry: SubscriptionRegistry,
    clock: TimestampClock,
}

/// Process-local document store. Clones share the same data, so several
/// `MemoryBackend` sessions can talk to each other through one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock().documents(collection)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.count()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // All ops are applied under one lock, so a batch is atomic and listeners
    // see snapshots in commit order.
    fn apply(&self, ops: Vec<WriteOp>) -> Vec<String> {
        let mut state = self.lock();
        let stamp = format_timestamp(self.inner.clock.tick());
        let mut touched: Vec<String> = Vec::new();
        let mut appended = Vec::new();
        for op in ops {
            if !touched.iter().any(|c| c == op.collection()) {
                touched.push(op.collection().to_string());
            }
            match op {
                WriteOp::Set { collection, key, mut fields } => {
                    resolve_server_timestamps(&mut fields, &stamp);
                    state.collections.entry(collection).or_default().insert(key, fields);
                }
                WriteOp::Append { collection, mut fields } => {
                    resolve_server_timestamps(&mut fields, &stamp);
                    let key = new_document_id();
                    state.collections.entry(collection).or_default().insert(key.clone(), fields);
                    appended.push(key);
                }
                WriteOp::Delete { collection, key } => {
                    if let Some(docs) = state.collections.get_mut(&collection) {
                        docs.remove(&key);
                    }
                }
            }
        }
        for listener in self.inner.registry.listeners_for(touched.iter().map(String::as_str)) {
            if !listener.deliver(Snapshot { documents: state.run(&listener.query) }) {
                self.inner.registry.unregister(listener.id);
            }
        }
        appended
    }
}

/// One client session against a `MemoryStore`.
pub struct MemoryBackend {
    store: MemoryStore,
    session: watch::Sender<Option<AuthUser>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::connect(&MemoryStore::new())
    }

    pub fn connect(store: &MemoryStore) -> Self {
        let (session, _) = watch::channel(None);
        Self { store: store.clone(), session }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn require_session(&self) -> BackendResult<AuthUser> {
        self.current_user().ok_or(BackendError::Unauthenticated)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn subscribe_session(&self) -> watch::Receiver<Option<AuthUser>> {
        self.session.subscribe()
    }

    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> BackendResult<AuthUser> {
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(BackendError::WeakPassword(MIN_PASSWORD_LENGTH));
        }
        let email = email.trim().to_lowercase();
        let user = {
            let mut state = self.store.lock();
            if state.accounts.contains_key(&email) {
                return Err(BackendError::EmailInUse(email));
            }
            let user = AuthUser {
                uid: new_document_id(),
                email: email.clone(),
                display_name: display_name.to_string(),
            };
            state.accounts.insert(
                email,
                Account { user: user.clone(), password: password.to_string() },
            );
            user
        };
        info!("[BACKEND:MEMORY] Registered account {}", user.uid);
        self.session.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> BackendResult<AuthUser> {
        let email = email.trim().to_lowercase();
        let user = {
            let state = self.store.lock();
            match state.accounts.get(&email) {
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(BackendError::InvalidCredentials),
            }
        };
        info!("[BACKEND:MEMORY] Signed in {}", user.uid);
        self.session.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if let Some(user) = self.session.send_replace(None) {
            info!("[BACKEND:MEMORY] Signed out {}", user.uid);
        }
        Ok(())
    }

    async fn get_document(&self, collection: &str, key: &str) -> BackendResult<Option<Document>> {
        let state = self.store.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|fields| Document::new(collection, key, fields.clone())))
    }

    async fn query_equals(&self, query: &Query) -> BackendResult<Vec<Document>> {
        Ok(self.store.lock().run(query))
    }

    async fn subscribe_query(&self, query: Query) -> BackendResult<Subscription> {
        let state = self.store.lock();
        let (listener, subscription) = self.store.inner.registry.register(query);
        listener.deliver(Snapshot { documents: state.run(&listener.query) });
        debug!("[BACKEND:MEMORY] Subscription {} on {}", listener.id, listener.query.collection);
        Ok(subscription)
    }

    async fn write_document(&self, collection: &str, key: &str, fields: Fields) -> BackendResult<()> {
        self.commit(vec![WriteOp::set(collection, key, fields)]).await
    }

    async fn append_document(&self, collection: &str, fields: Fields) -> BackendResult<String> {
        self.require_session()?;
        let mut keys = self.store.apply(vec![WriteOp::Append {
            collection: collection.to_string(),
            fields,
        }]);
        keys.pop().ok_or(BackendError::Closed)
    }

    async fn delete_document(&self, collection: &str, key: &str) -> BackendResult<()> {
        self.commit(vec![WriteOp::delete(collection, key)]).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> BackendResult<()> {
        self.require_session()?;
        self.store.apply(ops);
        Ok(())
    }
}
