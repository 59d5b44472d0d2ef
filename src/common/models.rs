use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::{into_fields, server_timestamp, Document, Fields};
use crate::common::error::ChatResult;

pub const USERS: &str = "users";
pub const FRIEND_REQUESTS: &str = "friendRequests";
pub const FRIENDS: &str = "friends";

/// Directory profile written at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: String,
}

impl User {
    pub fn new_profile(uid: &str, name: &str, email: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            avatar: String::new(),
        }
    }

    pub fn from_document(doc: &Document) -> ChatResult<Self> {
        doc.decode()
    }

    pub fn to_fields(&self) -> ChatResult<Fields> {
        Ok(into_fields(serde_json::to_value(self).map_err(crate::common::BackendError::from)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    /// Document key, not stored in the fields.
    #[serde(skip)]
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub status: RequestStatus,
    // older documents carry the creation stamp under `timestamp`
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl FriendRequest {
    pub fn from_document(doc: &Document) -> ChatResult<Self> {
        let mut req: FriendRequest = doc.decode()?;
        req.id = doc.id.clone();
        Ok(req)
    }

    pub fn pending_fields(from: &str, to: &str) -> Fields {
        into_fields(json!({
            "from": from,
            "to": to,
            "status": RequestStatus::Pending,
            "createdAt": server_timestamp(),
        }))
    }
}

/// One directed friendship record. A usable friendship is two of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipEdge {
    pub user_id: String,
    pub friend_id: String,
}

impl FriendshipEdge {
    pub fn new(user_id: &str, friend_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            friend_id: friend_id.to_string(),
        }
    }

    pub fn doc_key(&self) -> String {
        edge_key(&self.user_id, &self.friend_id)
    }

    pub fn from_document(doc: &Document) -> ChatResult<Self> {
        doc.decode()
    }

    pub fn to_fields(&self) -> Fields {
        into_fields(json!({
            "userId": self.user_id,
            "friendId": self.friend_id,
        }))
    }
}

pub fn edge_key(user_id: &str, friend_id: &str) -> String {
    format!("{}_{}", user_id, friend_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn from_document(doc: &Document) -> ChatResult<Self> {
        doc.decode()
    }

    pub fn outgoing_fields(from: &str, to: &str, text: &str) -> Fields {
        into_fields(json!({
            "from": from,
            "to": to,
            "text": text,
            "timestamp": server_timestamp(),
        }))
    }

    pub fn is_from(&self, uid: &str) -> bool {
        self.from == uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn doc(collection: &str, id: &str, value: Value) -> Document {
        Document::new(collection, id, into_fields(value))
    }

    #[test]
    fn test_friend_request_takes_id_from_key() {
        let d = doc(
            FRIEND_REQUESTS,
            "req-1",
            json!({"from": "a", "to": "b", "status": "pending", "createdAt": "2024-05-01T10:00:00Z"}),
        );
        let req = FriendRequest::from_document(&d).unwrap();
        assert_eq!(req.id, "req-1");
        assert_eq!(req.from, "a");
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.created_at.is_some());
    }

    #[test]
    fn test_friend_request_accepts_legacy_timestamp_field() {
        let d = doc(
            FRIEND_REQUESTS,
            "req-2",
            json!({"from": "a", "to": "b", "status": "pending", "timestamp": "2024-05-01T10:00:00Z"}),
        );
        let req = FriendRequest::from_document(&d).unwrap();
        assert!(req.created_at.is_some());
    }

    #[test]
    fn test_user_missing_avatar_defaults_to_empty() {
        let d = doc(USERS, "u1", json!({"uid": "u1", "name": "Ada", "email": "ada@example.com"}));
        let user = User::from_document(&d).unwrap();
        assert_eq!(user.avatar, "");
    }

    #[test]
    fn test_malformed_edge_reports_location() {
        let d = doc(FRIENDS, "x_y", json!({"userId": 3}));
        let err = FriendshipEdge::from_document(&d).unwrap_err();
        assert!(err.to_string().contains("friends/x_y"));
    }

    #[test]
    fn test_pending_fields_carry_server_timestamp_sentinel() {
        let fields = FriendRequest::pending_fields("a", "b");
        assert_eq!(fields["status"], json!("pending"));
        assert_eq!(fields["createdAt"], server_timestamp());
    }
}
