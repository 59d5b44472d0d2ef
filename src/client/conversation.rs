use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{Backend, CancelHandle, Direction, Query, Snapshot};
use crate::common::conversation::{conversation_id, messages_collection};
use crate::common::error::{ChatResult, ValidationError};
use crate::common::models::ChatMessage;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub partner: Option<String>,
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

pub fn messages_view(snapshot: &Snapshot) -> Vec<ChatMessage> {
    snapshot
        .documents
        .iter()
        .filter_map(|doc| match ChatMessage::from_document(doc) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("[CONVERSATION] Skipping message: {}", e);
                None
            }
        })
        .collect()
}

/// The open conversation of one user: at most one message subscription,
/// replaced whenever the partner changes, plus the draft being typed.
pub struct ConversationSync {
    backend: Arc<dyn Backend>,
    me: String,
    max_message_length: usize,
    draft: String,
    partner: Option<String>,
    // bumped on every partner change; snapshots from an older generation are dropped
    generation: Arc<AtomicU64>,
    view: Arc<watch::Sender<ConversationView>>,
    active: Option<(CancelHandle, JoinHandle<()>)>,
}

impl ConversationSync {
    pub fn new(backend: Arc<dyn Backend>, me: &str, max_message_length: usize) -> Self {
        let (view, _) = watch::channel(ConversationView::default());
        Self {
            backend,
            me: me.to_string(),
            max_message_length,
            draft: String::new(),
            partner: None,
            generation: Arc::new(AtomicU64::new(0)),
            view: Arc::new(view),
            active: None,
        }
    }

    pub async fn select_partner(&mut self, partner: &str) -> ChatResult<()> {
        let cid = conversation_id(&self.me, partner)?;
        if self.partner.as_deref() == Some(partner) && self.active.is_some() {
            return Ok(());
        }
        self.close();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let query = Query::collection(messages_collection(&cid)).order_by("timestamp", Direction::Ascending);
        let mut subscription = self.backend.subscribe_query(query).await?;
        // the initial snapshot waits in the subscription until the task below runs
        self.view.send_replace(ConversationView {
            partner: Some(partner.to_string()),
            conversation_id: Some(cid.clone()),
            messages: Vec::new(),
        });
        let handle = subscription.handle();
        let current = self.generation.clone();
        let view = self.view.clone();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = subscription.next_snapshot().await {
                let messages = messages_view(&snapshot);
                let accepted = view.send_if_modified(|v| {
                    if current.load(Ordering::SeqCst) != generation {
                        return false;
                    }
                    v.messages = messages;
                    true
                });
                if !accepted {
                    break;
                }
            }
            debug!("[CONVERSATION] Subscription generation {} ended", generation);
        });

        self.partner = Some(partner.to_string());
        self.active = Some((handle, task));
        info!("[CONVERSATION] Opened conversation {}", cid);
        Ok(())
    }

    /// Cancels the message subscription and clears the view.
    pub fn close(&mut self) {
        // bump before touching the view so a late snapshot cannot land after the reset
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some((handle, task)) = self.active.take() {
            handle.cancel();
            task.abort();
        }
        if self.partner.take().is_some() {
            self.view.send_replace(ConversationView::default());
        }
    }

    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.view.borrow().messages.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationView> {
        self.view.subscribe()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Sends the draft to the open conversation. A blank draft sends nothing
    /// and returns `None`. The message shows up through the subscription, not
    /// by local insertion.
    pub async fn send(&mut self) -> ChatResult<Option<String>> {
        if self.draft.trim().is_empty() {
            return Ok(None);
        }
        let partner = self.partner.clone().ok_or(ValidationError::NoPartner)?;
        let len = self.draft.chars().count();
        if len > self.max_message_length {
            return Err(ValidationError::MessageTooLong { len, max: self.max_message_length }.into());
        }
        let cid = conversation_id(&self.me, &partner)?;
        let id = self
            .backend
            .append_document(
                &messages_collection(&cid),
                ChatMessage::outgoing_fields(&self.me, &partner, &self.draft),
            )
            .await?;
        self.draft.clear();
        debug!("[CONVERSATION] Sent message {} to {}", id, partner);
        Ok(Some(id))
    }
}

impl Drop for ConversationSync {
    fn drop(&mut self) {
        if let Some((handle, task)) = self.active.take() {
            handle.cancel();
            task.abort();
        }
    }
}
