use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use crate::backend::{AuthUser, Backend};
use crate::client::config::ClientConfig;
use crate::client::conversation::ConversationSync;
use crate::client::relationships::RelationshipSync;
use crate::client::suggestions::SuggestionSync;
use crate::client::{friends, session};
use crate::common::error::{BackendError, ChatResult, ValidationError};
use crate::common::models::{ChatMessage, FriendRequest, FriendshipEdge, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A message the front end must show before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, message: message.into() }
    }
}

// Everything that lives exactly as long as one login.
struct ActiveSession {
    user: AuthUser,
    relationships: RelationshipSync,
    suggestions: SuggestionSync,
    conversation: ConversationSync,
}

/// Wires the sync components to the signed-in user and runs the user's actions.
pub struct ChatApp {
    backend: Arc<dyn Backend>,
    config: ClientConfig,
    // session-changed notifications; the components follow this, not the actions
    session_rx: watch::Receiver<Option<AuthUser>>,
    session: Option<ActiveSession>,
    notices: Vec<Notice>,
}

impl ChatApp {
    pub fn new(backend: Arc<dyn Backend>, config: ClientConfig) -> Self {
        let session_rx = backend.subscribe_session();
        Self { backend, config, session_rx, session: None, notices: Vec::new() }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.session.as_ref().map(|s| &s.user)
    }

    /// Starts or tears down the per-login components for a session change.
    /// A repeated notification for the same user changes nothing.
    pub async fn on_session_changed(&mut self, user: Option<AuthUser>) -> ChatResult<()> {
        if self.user().map(|u| &u.uid) == user.as_ref().map(|u| &u.uid) {
            return Ok(());
        }
        self.teardown();

        let Some(user) = user else {
            return Ok(());
        };
        let relationships = RelationshipSync::start(self.backend.clone(), &user.uid).await?;
        let suggestions =
            SuggestionSync::start(self.backend.clone(), &user.uid, relationships.watch_friends()).await?;
        let conversation = ConversationSync::new(self.backend.clone(), &user.uid, self.config.max_message_length);
        info!("[APP] Session started for {}", user.uid);
        self.session = Some(ActiveSession { user, relationships, suggestions, conversation });
        Ok(())
    }

    /// Aligns the components with whatever the backend reports as signed in.
    pub async fn sync_session(&mut self) -> ChatResult<()> {
        let current = self.session_rx.borrow_and_update().clone();
        self.on_session_changed(current).await
    }

    /// Waits for the backend to report a session change without acting on it.
    /// Safe to cancel, so a front end can `select!` on it next to its input.
    pub async fn session_changed(&mut self) -> ChatResult<()> {
        self.session_rx.changed().await.map_err(|_| BackendError::Closed)?;
        Ok(())
    }

    /// Waits for the next session change and applies it.
    pub async fn next_session_change(&mut self) -> ChatResult<()> {
        self.session_changed().await?;
        self.sync_session().await
    }

    fn teardown(&mut self) {
        if let Some(mut active) = self.session.take() {
            active.conversation.close();
            active.suggestions.stop();
            active.relationships.stop();
            info!("[APP] Session ended for {}", active.user.uid);
        }
    }

    fn active(&self) -> ChatResult<&ActiveSession> {
        self.session.as_ref().ok_or_else(|| ValidationError::NotSignedIn.into())
    }

    fn active_mut(&mut self) -> ChatResult<&mut ActiveSession> {
        self.session.as_mut().ok_or_else(|| ValidationError::NotSignedIn.into())
    }

    pub async fn register(&mut self, name: &str, email: &str, password: &str) -> ChatResult<User> {
        let user = session::register(self.backend.as_ref(), name, email, password).await?;
        self.sync_session().await?;
        Ok(user)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> ChatResult<AuthUser> {
        let user = session::login(self.backend.as_ref(), email, password).await?;
        self.sync_session().await?;
        Ok(user)
    }

    pub async fn logout(&mut self) -> ChatResult<()> {
        session::logout(self.backend.as_ref()).await?;
        self.sync_session().await
    }

    pub async fn send_friend_request(&mut self, to: &str) -> ChatResult<String> {
        let active = self.active()?;
        let id = friends::send_request(self.backend.as_ref(), &active.user.uid, to).await?;
        active.suggestions.refresh();
        self.notices.push(Notice::info("Friend request sent."));
        Ok(id)
    }

    fn pending_request(&self, from: &str) -> ChatResult<(String, FriendRequest)> {
        let active = self.active()?;
        let request = active
            .relationships
            .request_from(from)
            .ok_or_else(|| ValidationError::NoSuchRequest(from.to_string()))?;
        Ok((active.user.uid.clone(), request))
    }

    pub async fn accept_request(&mut self, from: &str) -> ChatResult<()> {
        let (me, request) = self.pending_request(from)?;
        friends::accept_request(self.backend.as_ref(), &me, &request).await
    }

    pub async fn reject_request(&mut self, from: &str) -> ChatResult<()> {
        let (me, request) = self.pending_request(from)?;
        friends::reject_request(self.backend.as_ref(), &me, &request).await
    }

    pub async fn select_friend(&mut self, uid: &str) -> ChatResult<()> {
        self.active_mut()?.conversation.select_partner(uid).await
    }

    pub fn close_conversation(&mut self) {
        if let Some(active) = self.session.as_mut() {
            active.conversation.close();
        }
    }

    pub fn set_draft(&mut self, text: impl Into<String>) -> ChatResult<()> {
        self.active_mut()?.conversation.set_draft(text);
        Ok(())
    }

    pub async fn send_message(&mut self) -> ChatResult<Option<String>> {
        self.active_mut()?.conversation.send().await
    }

    pub fn partner(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.conversation.partner())
    }

    pub fn friends(&self) -> Vec<FriendshipEdge> {
        self.session.as_ref().map(|s| s.relationships.friends()).unwrap_or_default()
    }

    pub fn incoming_requests(&self) -> Vec<FriendRequest> {
        self.session
            .as_ref()
            .map(|s| s.relationships.incoming_requests())
            .unwrap_or_default()
    }

    pub fn suggestions(&self) -> Vec<User> {
        self.session.as_ref().map(|s| s.suggestions.suggestions()).unwrap_or_default()
    }

    pub fn directory(&self) -> Vec<User> {
        self.session.as_ref().map(|s| s.suggestions.directory()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.session.as_ref().map(|s| s.conversation.messages()).unwrap_or_default()
    }

    pub fn friend_name(&self, uid: &str) -> String {
        self.session
            .as_ref()
            .map(|s| s.suggestions.display_name(uid))
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn relationships(&self) -> Option<&RelationshipSync> {
        self.session.as_ref().map(|s| &s.relationships)
    }

    pub fn suggestion_sync(&self) -> Option<&SuggestionSync> {
        self.session.as_ref().map(|s| &s.suggestions)
    }

    pub fn conversation(&self) -> Option<&ConversationSync> {
        self.session.as_ref().map(|s| &s.conversation)
    }

    /// Turns a failed operation into an error notice carrying its raw message.
    pub fn report<T>(&mut self, result: ChatResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!("[APP] {}", e);
                self.notices.push(Notice::error(e.to_string()));
                None
            }
        }
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        self.teardown();
    }
}
