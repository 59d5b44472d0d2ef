use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::backend::{Backend, CancelHandle, Query, Snapshot};
use crate::common::error::ChatResult;
use crate::common::models::{FriendshipEdge, User, FRIEND_REQUESTS, USERS};

/// Directory minus self, friends and users with a pending request from `me`,
/// in directory order.
pub fn filter_suggestions(
    directory: &[User],
    me: &str,
    friends: &HashSet<String>,
    pending: &HashSet<String>,
) -> Vec<User> {
    directory
        .iter()
        .filter(|u| u.uid != me && !friends.contains(&u.uid) && !pending.contains(&u.uid))
        .cloned()
        .collect()
}

/// Users `me` has already sent a request to, read from the backend.
pub async fn outgoing_pending_ids(backend: &dyn Backend, me: &str) -> ChatResult<HashSet<String>> {
    let docs = backend
        .query_equals(&Query::collection(FRIEND_REQUESTS).where_eq("from", me))
        .await?;
    Ok(docs.iter().filter_map(|d| d.get_str("to").map(str::to_string)).collect())
}

pub fn directory_view(snapshot: &Snapshot) -> Vec<User> {
    snapshot
        .documents
        .iter()
        .filter_map(|doc| match User::from_document(doc) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("[SUGGESTIONS] Skipping directory entry: {}", e);
                None
            }
        })
        .collect()
}

/// Recomputes the suggestion list whenever the friends view or the directory
/// changes, or a refresh is requested. Every recompute is a full one.
pub struct SuggestionSync {
    suggestions: watch::Receiver<Vec<User>>,
    directory: watch::Receiver<Vec<User>>,
    refresh: Arc<Notify>,
    directory_handle: Option<CancelHandle>,
    task: Option<JoinHandle<()>>,
}

impl SuggestionSync {
    pub async fn start(
        backend: Arc<dyn Backend>,
        me: &str,
        mut friends: watch::Receiver<Vec<FriendshipEdge>>,
    ) -> ChatResult<Self> {
        let mut directory_sub = backend.subscribe_query(Query::collection(USERS)).await?;
        let directory_handle = directory_sub.handle();
        let (suggestions_tx, suggestions) = watch::channel(Vec::new());
        let (directory_tx, directory) = watch::channel(Vec::new());
        let refresh = Arc::new(Notify::new());

        let me = me.to_string();
        let wake = refresh.clone();
        let task = tokio::spawn(async move {
            let mut users: Vec<User> = Vec::new();
            loop {
                tokio::select! {
                    snapshot = directory_sub.next_snapshot() => match snapshot {
                        Some(snapshot) => {
                            users = directory_view(&snapshot);
                            directory_tx.send_replace(users.clone());
                        }
                        None => break,
                    },
                    changed = friends.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = wake.notified() => {}
                }

                let friend_ids: HashSet<String> =
                    friends.borrow_and_update().iter().map(|e| e.friend_id.clone()).collect();
                match outgoing_pending_ids(backend.as_ref(), &me).await {
                    Ok(pending) => {
                        let list = filter_suggestions(&users, &me, &friend_ids, &pending);
                        debug!("[SUGGESTIONS] {} candidates for {}", list.len(), me);
                        suggestions_tx.send_replace(list);
                    }
                    Err(e) => warn!("[SUGGESTIONS] Could not read outgoing requests: {}", e),
                }
            }
            debug!("[SUGGESTIONS] Stopped for {}", me);
        });
        info!("[SUGGESTIONS] Watching directory");

        Ok(Self {
            suggestions,
            directory,
            refresh,
            directory_handle: Some(directory_handle),
            task: Some(task),
        })
    }

    pub fn suggestions(&self) -> Vec<User> {
        self.suggestions.borrow().clone()
    }

    pub fn directory(&self) -> Vec<User> {
        self.directory.borrow().clone()
    }

    /// Display name of `uid`, or the uid itself when it is not in the directory.
    pub fn display_name(&self, uid: &str) -> String {
        self.directory
            .borrow()
            .iter()
            .find(|u| u.uid == uid)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn watch(&self) -> watch::Receiver<Vec<User>> {
        self.suggestions.clone()
    }

    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.directory_handle.take() {
            handle.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SuggestionSync {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryStore};
    use crate::common::models::FriendRequest;
    use std::time::Duration;

    fn user(uid: &str) -> User {
        User::new_profile(uid, &uid.to_uppercase(), &format!("{}@example.com", uid))
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn uids(users: &[User]) -> Vec<&str> {
        users.iter().map(|u| u.uid.as_str()).collect()
    }

    #[test]
    fn test_filter_excludes_self_friends_and_pending() {
        let directory: Vec<User> = ["u1", "u2", "u3", "u4", "u5"].iter().map(|u| user(u)).collect();
        let out = filter_suggestions(&directory, "u1", &set(&["u2"]), &set(&["u4"]));
        assert_eq!(uids(&out), vec!["u3", "u5"]);
    }

    #[test]
    fn test_filter_never_returns_self() {
        let directory = vec![user("me")];
        let out = filter_suggestions(&directory, "me", &HashSet::new(), &HashSet::new());
        assert!(out.is_empty());
    }

    #[test]
    fn test_filter_with_empty_sets_is_directory_minus_self() {
        let directory: Vec<User> = ["a", "b", "c"].iter().map(|u| user(u)).collect();
        let out = filter_suggestions(&directory, "b", &HashSet::new(), &HashSet::new());
        assert_eq!(uids(&out), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_sync_tracks_directory_and_refresh() {
        let store = MemoryStore::new();
        let backend = Arc::new(MemoryBackend::connect(&store));
        let me = backend.sign_up("ada@example.com", "secret123", "Ada").await.unwrap();
        for uid in [me.uid.as_str(), "u2", "u3"] {
            backend
                .write_document(USERS, uid, user(uid).to_fields().unwrap())
                .await
                .unwrap();
        }

        let (_friends_tx, friends_rx) = watch::channel(Vec::new());
        let mut sync = SuggestionSync::start(backend.clone(), &me.uid, friends_rx).await.unwrap();
        let mut rx = sync.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sync.display_name("u2"), "U2");
        assert_eq!(sync.display_name("ghost"), "ghost");

        backend
            .append_document(FRIEND_REQUESTS, FriendRequest::pending_fields(&me.uid, "u2"))
            .await
            .unwrap();
        sync.refresh();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.len() == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uids(&sync.suggestions()), vec!["u3"]);

        sync.stop();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_reacts_to_friends_change() {
        let backend = Arc::new(MemoryBackend::new());
        let me = backend.sign_up("ada@example.com", "secret123", "Ada").await.unwrap();
        for uid in ["u2", "u3"] {
            backend
                .write_document(USERS, uid, user(uid).to_fields().unwrap())
                .await
                .unwrap();
        }
        let (friends_tx, friends_rx) = watch::channel(Vec::new());
        let sync = SuggestionSync::start(backend.clone(), &me.uid, friends_rx).await.unwrap();
        let mut rx = sync.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.len() == 2))
            .await
            .unwrap()
            .unwrap();

        friends_tx.send_replace(vec![FriendshipEdge::new(&me.uid, "u3")]);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.len() == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uids(&sync.suggestions()), vec!["u2"]);
    }
}
