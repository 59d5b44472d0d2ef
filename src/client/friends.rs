use log::info;

use crate::backend::{Backend, Query, WriteOp};
use crate::common::error::{ChatResult, ValidationError};
use crate::common::models::{edge_key, FriendRequest, FriendshipEdge, FRIENDS, FRIEND_REQUESTS, USERS};

/// Files a pending request from `me` to `to` and returns the new request key.
pub async fn send_request(backend: &dyn Backend, me: &str, to: &str) -> ChatResult<String> {
    let to = to.trim();
    if me.is_empty() || to.is_empty() {
        return Err(ValidationError::EmptyIdentifier.into());
    }
    if me == to {
        return Err(ValidationError::SelfRequest.into());
    }

    let existing = backend
        .query_equals(&Query::collection(FRIEND_REQUESTS).where_eq("from", me).where_eq("to", to))
        .await?;
    if !existing.is_empty() {
        return Err(ValidationError::DuplicateRequest.into());
    }
    if backend.get_document(FRIENDS, &edge_key(me, to)).await?.is_some() {
        return Err(ValidationError::AlreadyFriends.into());
    }
    if backend.get_document(USERS, to).await?.is_none() {
        return Err(ValidationError::UnknownUser(to.to_string()).into());
    }

    let id = backend
        .append_document(FRIEND_REQUESTS, FriendRequest::pending_fields(me, to))
        .await?;
    info!("[FRIENDS] Request {} sent from {} to {}", id, me, to);
    Ok(id)
}

/// Writes both friendship edges and removes the request in one commit.
pub async fn accept_request(backend: &dyn Backend, me: &str, request: &FriendRequest) -> ChatResult<()> {
    if request.to != me {
        return Err(ValidationError::NotAddressee.into());
    }
    let theirs = FriendshipEdge::new(&request.from, me);
    let mine = FriendshipEdge::new(me, &request.from);
    backend
        .commit(vec![
            WriteOp::set(FRIENDS, &theirs.doc_key(), theirs.to_fields()),
            WriteOp::set(FRIENDS, &mine.doc_key(), mine.to_fields()),
            WriteOp::delete(FRIEND_REQUESTS, &request.id),
        ])
        .await?;
    info!("[FRIENDS] {} accepted request from {}", me, request.from);
    Ok(())
}

pub async fn reject_request(backend: &dyn Backend, me: &str, request: &FriendRequest) -> ChatResult<()> {
    if request.to != me {
        return Err(ValidationError::NotAddressee.into());
    }
    backend.delete_document(FRIEND_REQUESTS, &request.id).await?;
    info!("[FRIENDS] {} rejected request from {}", me, request.from);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryStore};
    use crate::client::session::register;
    use crate::common::error::ChatError;

    async fn two_users(store: &MemoryStore) -> (MemoryBackend, String, MemoryBackend, String) {
        let a = MemoryBackend::connect(store);
        let ua = register(&a, "Ada", "ada@example.com", "secret123").await.unwrap().uid;
        let b = MemoryBackend::connect(store);
        let ub = register(&b, "Bob", "bob@example.com", "secret123").await.unwrap().uid;
        (a, ua, b, ub)
    }

    fn validation(err: ChatError) -> ValidationError {
        match err {
            ChatError::Validation(v) => v,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    async fn pending_from(store: &MemoryStore, from: &str) -> FriendRequest {
        store
            .documents(FRIEND_REQUESTS)
            .iter()
            .map(|d| FriendRequest::from_document(d).unwrap())
            .find(|r| r.from == from)
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_request_creates_pending_document() {
        let store = MemoryStore::new();
        let (a, ua, _b, ub) = two_users(&store).await;
        let id = send_request(&a, &ua, &ub).await.unwrap();

        let docs = store.documents(FRIEND_REQUESTS);
        assert_eq!(docs.len(), 1);
        let req = FriendRequest::from_document(&docs[0]).unwrap();
        assert_eq!(req.id, id);
        assert_eq!((req.from.as_str(), req.to.as_str()), (ua.as_str(), ub.as_str()));
        assert!(req.created_at.is_some());
    }

    #[tokio::test]
    async fn test_send_request_rejections() {
        let store = MemoryStore::new();
        let (a, ua, _b, ub) = two_users(&store).await;

        let err = send_request(&a, &ua, &ua).await.unwrap_err();
        assert_eq!(validation(err), ValidationError::SelfRequest);
        assert_eq!(
            send_request(&a, &ua, "  ").await.unwrap_err().to_string(),
            "participant identifier is empty"
        );
        let err = send_request(&a, &ua, "ghost").await.unwrap_err();
        assert_eq!(validation(err), ValidationError::UnknownUser("ghost".to_string()));

        send_request(&a, &ua, &ub).await.unwrap();
        let err = send_request(&a, &ua, &ub).await.unwrap_err();
        assert_eq!(err.to_string(), "request already sent");
        assert_eq!(store.documents(FRIEND_REQUESTS).len(), 1);
    }

    #[tokio::test]
    async fn test_accept_writes_two_edges_and_removes_request() {
        let store = MemoryStore::new();
        let (a, ua, b, ub) = two_users(&store).await;
        send_request(&a, &ua, &ub).await.unwrap();
        let req = pending_from(&store, &ua).await;

        accept_request(&b, &ub, &req).await.unwrap();

        assert!(store.documents(FRIEND_REQUESTS).is_empty());
        let edges: Vec<FriendshipEdge> = store
            .documents(FRIENDS)
            .iter()
            .map(|d| FriendshipEdge::from_document(d).unwrap())
            .collect();
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&FriendshipEdge::new(&ua, &ub)));
        assert!(edges.contains(&FriendshipEdge::new(&ub, &ua)));

        let err = send_request(&a, &ua, &ub).await.unwrap_err();
        assert_eq!(validation(err), ValidationError::AlreadyFriends);
    }

    #[tokio::test]
    async fn test_only_addressee_may_answer() {
        let store = MemoryStore::new();
        let (a, ua, _b, ub) = two_users(&store).await;
        send_request(&a, &ua, &ub).await.unwrap();
        let req = pending_from(&store, &ua).await;

        let err = accept_request(&a, &ua, &req).await.unwrap_err();
        assert_eq!(validation(err), ValidationError::NotAddressee);
        let err = reject_request(&a, &ua, &req).await.unwrap_err();
        assert_eq!(validation(err), ValidationError::NotAddressee);
        assert_eq!(store.documents(FRIEND_REQUESTS).len(), 1);
    }

    #[tokio::test]
    async fn test_reject_deletes_request_only() {
        let store = MemoryStore::new();
        let (a, ua, b, ub) = two_users(&store).await;
        send_request(&a, &ua, &ub).await.unwrap();
        let req = pending_from(&store, &ua).await;

        reject_request(&b, &ub, &req).await.unwrap();
        assert!(store.documents(FRIEND_REQUESTS).is_empty());
        assert!(store.documents(FRIENDS).is_empty());
        send_request(&a, &ua, &ub).await.unwrap();
    }
}
