use std::str::FromStr;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::{watch, Mutex};

use super::clock::{format_timestamp, resolve_server_timestamps, TimestampClock};
use super::registry::SubscriptionRegistry;
use super::{
    new_document_id, AuthUser, Backend, Document, Fields, Query, Snapshot, Subscription, WriteOp,
    MIN_PASSWORD_LENGTH,
};
use crate::common::error::{BackendError, BackendResult};

const LAST_COMMIT_KEY: &str = "last_commit";

struct SqliteInner {
    pool: SqlitePool,
    registry: SubscriptionRegistry,
    clock: TimestampClock,
    // serializes commits with snapshot delivery so listeners see commit order
    write_gate: Mutex<()>,
    salt_length: usize,
}

/// Durable document store on SQLite. Subscriptions are pushed to listeners of
/// this process; writes made by other processes show up on the next local write.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteInner>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, salt_length: usize) -> BackendResult<Self> {
        info!("[BACKEND:SQLITE] Connecting to {}", database_url);
        let in_memory = database_url.contains(":memory:");

        if !in_memory {
            let path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| BackendError::Storage(sqlx::Error::Io(e)))?;
                    info!("[BACKEND:SQLITE] Created directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to :memory: opens its own database, so keep exactly one alive
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("[BACKEND:SQLITE] Connection failed: {}", e);
            e
        })?;

        let store = Self {
            inner: Arc::new(SqliteInner {
                pool,
                registry: SubscriptionRegistry::new(),
                clock: TimestampClock::new(),
                write_gate: Mutex::new(()),
                salt_length,
            }),
        };
        store.migrate().await?;
        store.restore_clock().await?;
        Ok(store)
    }

    async fn migrate(&self) -> BackendResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                fields TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            );
        "#,
        )
        .execute(&self.inner.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                uid TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.inner.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )
        .execute(&self.inner.pool)
        .await?;

        debug!("[BACKEND:SQLITE] Migrations applied");
        Ok(())
    }

    // keeps server timestamps increasing across restarts
    async fn restore_clock(&self) -> BackendResult<()> {
        let row = sqlx::query("SELECT value FROM store_meta WHERE key = ?")
            .bind(LAST_COMMIT_KEY)
            .fetch_optional(&self.inner.pool)
            .await?;
        if let Some(row) = row {
            let value: String = row.get("value");
            match DateTime::parse_from_rfc3339(&value) {
                Ok(ts) => self.inner.clock.observe(ts.with_timezone(&Utc)),
                Err(e) => warn!("[BACKEND:SQLITE] Ignoring unreadable last commit stamp '{}': {}", value, e),
            }
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub async fn documents(&self, collection: &str) -> BackendResult<Vec<Document>> {
        let rows = sqlx::query("SELECT doc_id, fields FROM documents WHERE collection = ? ORDER BY doc_id")
            .bind(collection)
            .fetch_all(&self.inner.pool)
            .await?;
        rows.iter()
            .map(|row| -> BackendResult<Document> {
                let id: String = row.get("doc_id");
                let raw: String = row.get("fields");
                let fields: Fields = serde_json::from_str(&raw)?;
                Ok(Document::new(collection, &id, fields))
            })
            .collect()
    }

    async fn run(&self, query: &Query) -> BackendResult<Vec<Document>> {
        Ok(query.apply(self.documents(&query.collection).await?))
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> BackendResult<Vec<String>> {
        let _gate = self.inner.write_gate.lock().await;
        let stamp = format_timestamp(self.inner.clock.tick());
        let mut touched: Vec<String> = Vec::new();
        let mut appended = Vec::new();

        let mut tx = self.inner.pool.begin().await?;
        for op in ops {
            if !touched.iter().any(|c| c == op.collection()) {
                touched.push(op.collection().to_string());
            }
            let (collection, key, fields) = match op {
                WriteOp::Set { collection, key, fields } => (collection, key, Some(fields)),
                WriteOp::Append { collection, fields } => {
                    let key = new_document_id();
                    appended.push(key.clone());
                    (collection, key, Some(fields))
                }
                WriteOp::Delete { collection, key } => (collection, key, None),
            };
            match fields {
                Some(mut fields) => {
                    resolve_server_timestamps(&mut fields, &stamp);
                    let raw = serde_json::to_string(&fields)?;
                    sqlx::query(
                        "INSERT INTO documents (collection, doc_id, fields, updated_at) VALUES (?, ?, ?, ?)
                         ON CONFLICT(collection, doc_id) DO UPDATE SET fields = excluded.fields, updated_at = excluded.updated_at",
                    )
                    .bind(&collection)
                    .bind(&key)
                    .bind(raw)
                    .bind(&stamp)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
                        .bind(&collection)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        sqlx::query(
            "INSERT INTO store_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_COMMIT_KEY)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        for listener in self.inner.registry.listeners_for(touched.iter().map(String::as_str)) {
            match self.run(&listener.query).await {
                Ok(documents) => {
                    if !listener.deliver(Snapshot { documents }) {
                        self.inner.registry.unregister(listener.id);
                    }
                }
                Err(e) => error!(
                    "[BACKEND:SQLITE] Failed to refresh subscription {} on {}: {}",
                    listener.id, listener.query.collection, e
                ),
            }
        }
        Ok(appended)
    }

    fn hash_password(&self, password: &str) -> BackendResult<String> {
        let mut salt_bytes = vec![0u8; self.inner.salt_length];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| BackendError::Hashing(e.to_string()))?;
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| BackendError::Hashing(e.to_string()))
    }
}

fn verify_password(hash: &str, password: &str) -> BackendResult<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| BackendError::Hashing(e.to_string()))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// One client session against a `SqliteStore`.
pub struct SqliteBackend {
    store: SqliteStore,
    session: watch::Sender<Option<AuthUser>>,
}

impl SqliteBackend {
    pub fn connect(store: &SqliteStore) -> Self {
        let (session, _) = watch::channel(None);
        Self { store: store.clone(), session }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn require_session(&self) -> BackendResult<AuthUser> {
        self.current_user().ok_or(BackendError::Unauthenticated)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn subscribe_session(&self) -> watch::Receiver<Option<AuthUser>> {
        self.session.subscribe()
    }

    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> BackendResult<AuthUser> {
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(BackendError::WeakPassword(MIN_PASSWORD_LENGTH));
        }
        let email = email.trim().to_lowercase();
        let pool = &self.store.inner.pool;
        let existing = sqlx::query("SELECT uid FROM accounts WHERE email = ?")
            .bind(&email)
            .fetch_optional(pool)
            .await?;
        if existing.is_some() {
            return Err(BackendError::EmailInUse(email));
        }

        let password_hash = self.store.hash_password(password)?;
        let user = AuthUser {
            uid: new_document_id(),
            email,
            display_name: display_name.to_string(),
        };
        sqlx::query(
            "INSERT INTO accounts (uid, email, display_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.uid)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(password_hash)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => BackendError::EmailInUse(user.email.clone()),
            other => BackendError::Storage(other),
        })?;

        info!("[BACKEND:SQLITE] Registered account {}", user.uid);
        self.session.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> BackendResult<AuthUser> {
        let email = email.trim().to_lowercase();
        let row = sqlx::query("SELECT uid, email, display_name, password_hash FROM accounts WHERE email = ?")
            .bind(&email)
            .fetch_optional(&self.store.inner.pool)
            .await?;
        let Some(row) = row else {
            return Err(BackendError::InvalidCredentials);
        };
        let hash: String = row.get("password_hash");
        if !verify_password(&hash, password)? {
            warn!("[BACKEND:SQLITE] Rejected sign-in for {}", email);
            return Err(BackendError::InvalidCredentials);
        }
        let user = AuthUser {
            uid: row.get("uid"),
            email: row.get("email"),
            display_name: row.get("display_name"),
        };
        info!("[BACKEND:SQLITE] Signed in {}", user.uid);
        self.session.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if let Some(user) = self.session.send_replace(None) {
            info!("[BACKEND:SQLITE] Signed out {}", user.uid);
        }
        Ok(())
    }

    async fn get_document(&self, collection: &str, key: &str) -> BackendResult<Option<Document>> {
        let row = sqlx::query("SELECT fields FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.store.inner.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get("fields");
                Ok(Some(Document::new(collection, key, serde_json::from_str(&raw)?)))
            }
            None => Ok(None),
        }
    }

    async fn query_equals(&self, query: &Query) -> BackendResult<Vec<Document>> {
        self.store.run(query).await
    }

    async fn subscribe_query(&self, query: Query) -> BackendResult<Subscription> {
        let _gate = self.store.inner.write_gate.lock().await;
        let (listener, subscription) = self.store.inner.registry.register(query);
        let documents = self.store.run(&listener.query).await?;
        listener.deliver(Snapshot { documents });
        debug!("[BACKEND:SQLITE] Subscription {} on {}", listener.id, listener.query.collection);
        Ok(subscription)
    }

    async fn write_document(&self, collection: &str, key: &str, fields: Fields) -> BackendResult<()> {
        self.commit(vec![WriteOp::set(collection, key, fields)]).await
    }

    async fn append_document(&self, collection: &str, fields: Fields) -> BackendResult<String> {
        self.require_session()?;
        let mut keys = self
            .store
            .apply(vec![WriteOp::Append { collection: collection.to_string(), fields }])
            .await?;
        keys.pop().ok_or(BackendError::Closed)
    }

    async fn delete_document(&self, collection: &str, key: &str) -> BackendResult<()> {
        self.commit(vec![WriteOp::delete(collection, key)]).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> BackendResult<()> {
        self.require_session()?;
        self.store.apply(ops).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{into_fields, server_timestamp, Direction};
    use serde_json::json;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 16).await.unwrap()
    }

    #[tokio::test]
    async fn test_sign_up_then_sign_in() {
        let store = memory_store().await;
        let a = SqliteBackend::connect(&store);
        let user = a.sign_up("Ada@Example.com", "secret123", "Ada").await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.uid.len(), 32);

        let b = SqliteBackend::connect(&store);
        assert!(matches!(
            b.sign_in("ada@example.com", "nope-nope").await,
            Err(BackendError::InvalidCredentials)
        ));
        let again = b.sign_in("ada@example.com", "secret123").await.unwrap();
        assert_eq!(again, user);
        assert!(matches!(
            b.sign_up("ada@example.com", "secret123", "Twin").await,
            Err(BackendError::EmailInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_documents_persist_and_replace() {
        let store = memory_store().await;
        let a = SqliteBackend::connect(&store);
        a.sign_up("ada@example.com", "secret123", "Ada").await.unwrap();

        a.write_document("users", "u1", into_fields(json!({"uid": "u1", "name": "Ada"})))
            .await
            .unwrap();
        a.write_document("users", "u1", into_fields(json!({"uid": "u1", "name": "Ada L."})))
            .await
            .unwrap();
        let doc = a.get_document("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc.get_str("name"), Some("Ada L."));
        assert_eq!(store.documents("users").await.unwrap().len(), 1);

        a.delete_document("users", "u1").await.unwrap();
        a.delete_document("users", "u1").await.unwrap();
        assert!(a.get_document("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_and_ordered_messages() {
        let store = memory_store().await;
        let a = SqliteBackend::connect(&store);
        a.sign_up("ada@example.com", "secret123", "Ada").await.unwrap();

        let query = Query::collection("messages/ba/chat").order_by("timestamp", Direction::Ascending);
        let mut sub = a.subscribe_query(query).await.unwrap();
        assert!(sub.next_snapshot().await.unwrap().is_empty());

        for text in ["first", "second"] {
            a.append_document(
                "messages/ba/chat",
                into_fields(json!({"from": "a", "to": "b", "text": text, "timestamp": server_timestamp()})),
            )
            .await
            .unwrap();
        }
        sub.next_snapshot().await.unwrap();
        let snap = sub.next_snapshot().await.unwrap();
        let texts: Vec<_> = snap.documents.iter().map(|d| d.get_str("text").unwrap()).collect();
        assert_eq!(texts, vec!["first", "second"]);

        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_file_store_survives_reconnect_and_keeps_clock() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/chatdesk.db").display());
        let chat = "messages/ba/chat";

        let store = SqliteStore::connect(&url, 16).await.unwrap();
        let a = SqliteBackend::connect(&store);
        a.sign_up("ada@example.com", "secret123", "Ada").await.unwrap();
        let first = a
            .append_document(chat, into_fields(json!({"text": "before", "timestamp": server_timestamp()})))
            .await
            .unwrap();
        // pretend the last commit happened far ahead of the wall clock
        let future = "2999-01-01T00:00:00.000000000Z";
        sqlx::query("UPDATE store_meta SET value = ? WHERE key = ?")
            .bind(future)
            .bind(LAST_COMMIT_KEY)
            .execute(&store.inner.pool)
            .await
            .unwrap();
        store.inner.pool.close().await;
        drop(a);
        drop(store);

        let store = SqliteStore::connect(&url, 16).await.unwrap();
        let b = SqliteBackend::connect(&store);
        let user = b.sign_in("ada@example.com", "secret123").await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        let doc = b.get_document(chat, &first).await.unwrap().unwrap();
        assert_eq!(doc.get_str("text"), Some("before"));

        let second = b
            .append_document(chat, into_fields(json!({"text": "after", "timestamp": server_timestamp()})))
            .await
            .unwrap();
        let doc = b.get_document(chat, &second).await.unwrap().unwrap();
        let stamp = doc.get_str("timestamp").unwrap();
        assert!(stamp > future, "{} should follow {}", stamp, future);
    }

    #[tokio::test]
    async fn test_unauthenticated_commit_rejected() {
        let store = memory_store().await;
        let a = SqliteBackend::connect(&store);
        let err = a.commit(vec![WriteOp::delete("friends", "x")]).await.unwrap_err();
        assert!(matches!(err, BackendError::Unauthenticated));
    }
}
