use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{Backend, CancelHandle, Document, Query, Snapshot, Subscription};
use crate::common::error::ChatResult;
use crate::common::models::{FriendRequest, FriendshipEdge, FRIENDS, FRIEND_REQUESTS};

/// Keeps one entry per key. A later item replaces an earlier one with the same
/// key but keeps the position where the key first appeared.
pub fn dedupe_by_key<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let k = key(&item).to_string();
        match index.get(&k) {
            Some(&pos) => out[pos] = item,
            None => {
                index.insert(k, out.len());
                out.push(item);
            }
        }
    }
    out
}

fn decode_all<T>(snapshot: &Snapshot, decode: fn(&Document) -> ChatResult<T>) -> Vec<T> {
    snapshot
        .documents
        .iter()
        .filter_map(|doc| match decode(doc) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("[RELATIONSHIPS] Skipping document: {}", e);
                None
            }
        })
        .collect()
}

pub fn requests_view(snapshot: &Snapshot) -> Vec<FriendRequest> {
    dedupe_by_key(decode_all(snapshot, FriendRequest::from_document), |r| r.from.as_str())
}

pub fn friends_view(snapshot: &Snapshot) -> Vec<FriendshipEdge> {
    dedupe_by_key(decode_all(snapshot, FriendshipEdge::from_document), |e| e.friend_id.as_str())
}

// Replaces the view with each snapshot until the subscription ends.
fn spawn_view<T>(
    mut subscription: Subscription,
    tx: watch::Sender<Vec<T>>,
    label: &'static str,
    project: fn(&Snapshot) -> Vec<T>,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(snapshot) = subscription.next_snapshot().await {
            let view = project(&snapshot);
            debug!("[RELATIONSHIPS] {} view now has {} entries", label, view.len());
            tx.send_replace(view);
        }
        debug!("[RELATIONSHIPS] {} subscription ended", label);
    })
}

/// Live views of the incoming friend requests and confirmed friendships of
/// one user. Both subscriptions stay open until `stop` or drop.
pub struct RelationshipSync {
    uid: String,
    requests: watch::Receiver<Vec<FriendRequest>>,
    friends: watch::Receiver<Vec<FriendshipEdge>>,
    handles: Vec<CancelHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelationshipSync {
    pub async fn start(backend: Arc<dyn Backend>, uid: &str) -> ChatResult<Self> {
        let incoming = backend
            .subscribe_query(Query::collection(FRIEND_REQUESTS).where_eq("to", uid))
            .await?;
        let friendships = backend
            .subscribe_query(Query::collection(FRIENDS).where_eq("userId", uid))
            .await?;

        let (requests_tx, requests) = watch::channel(Vec::new());
        let (friends_tx, friends) = watch::channel(Vec::new());
        let handles = vec![incoming.handle(), friendships.handle()];
        let tasks = vec![
            spawn_view(incoming, requests_tx, "requests", requests_view),
            spawn_view(friendships, friends_tx, "friends", friends_view),
        ];
        info!("[RELATIONSHIPS] Watching requests and friends of {}", uid);

        Ok(Self {
            uid: uid.to_string(),
            requests,
            friends,
            handles,
            tasks,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn incoming_requests(&self) -> Vec<FriendRequest> {
        self.requests.borrow().clone()
    }

    pub fn friends(&self) -> Vec<FriendshipEdge> {
        self.friends.borrow().clone()
    }

    pub fn friend_ids(&self) -> HashSet<String> {
        self.friends.borrow().iter().map(|e| e.friend_id.clone()).collect()
    }

    /// The newest incoming request from `from`, if any.
    pub fn request_from(&self, from: &str) -> Option<FriendRequest> {
        self.requests.borrow().iter().find(|r| r.from == from).cloned()
    }

    pub fn watch_requests(&self) -> watch::Receiver<Vec<FriendRequest>> {
        self.requests.clone()
    }

    pub fn watch_friends(&self) -> watch::Receiver<Vec<FriendshipEdge>> {
        self.friends.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            handle.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("[RELATIONSHIPS] Stopped watching {}", self.uid);
    }
}

impl Drop for RelationshipSync {
    fn drop(&mut self) {
        self.stop();
    }
}
