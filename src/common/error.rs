use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures detected locally, before any backend call is issued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("participant identifier is empty")]
    EmptyIdentifier,

    #[error("you can't chat with yourself")]
    SelfChat,

    #[error("you can't send request to yourself")]
    SelfRequest,

    #[error("request already sent")]
    DuplicateRequest,

    #[error("you are already friends")]
    AlreadyFriends,

    #[error("user {0} not found")]
    UnknownUser(String),

    #[error("no pending request from {0}")]
    NoSuchRequest(String),

    #[error("this request is not addressed to you")]
    NotAddressee,

    #[error("no conversation selected")]
    NoPartner,

    #[error("not signed in")]
    NotSignedIn,

    #[error("message too long ({len} > {max} characters)")]
    MessageTooLong { len: usize, max: usize },
}

/// Failures reported by a backend primitive.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("email already in use: {0}")]
    EmailInUse(String),

    #[error("password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("password hashing error: {0}")]
    Hashing(String),

    #[error("backend closed")]
    Closed,
}

/// Any failure of a client operation; its Display text is what the user sees.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("malformed document {collection}/{key}: {source}")]
    Decode {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ChatError {
    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::Validation(_))
    }
}
