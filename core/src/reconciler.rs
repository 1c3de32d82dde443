/// Conversation reconciler.
///
/// Keeps the cached view of each conversation consistent with our own sends
/// and deletes and with events pushed by the relay. The rule is always the
/// same: the server's answer to a refetch is the truth, so every change is
/// applied by invalidating the cache entry, never by editing the list.
use crate::backend::Backend;
use crate::cache::{CacheEntry, CacheKey, CacheStore, ResourceKind};
use crate::error::{ClientError, Result};
use crate::model::{Conversation, Message, PushEvent};
use crate::push::{ChannelEvent, EventStream, PushChannel};
use crate::session::Session;
use crate::utils::Notifier;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of submitting a message
#[derive(Debug)]
pub enum SendOutcome {
    /// Blank content, nothing was sent
    Rejected,
    /// Accepted by the backend
    Settled(Message),
    Failed(ClientError),
}

impl SendOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, SendOutcome::Settled(_))
    }
}

pub struct ConversationReconciler<B: Backend> {
    backend: Arc<B>,
    session: Session,
    cache: Arc<CacheStore<Conversation>>,
    push: PushChannel,
    notifier: Notifier,
    request_timeout: Duration,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

/// A peer id we are willing to query for
pub fn is_valid_peer(peer_id: &str, self_id: &str) -> bool {
    let trimmed = peer_id.trim();
    !trimmed.is_empty() && trimmed == peer_id && peer_id != self_id
}

impl<B: Backend> ConversationReconciler<B> {
    pub fn new(
        backend: Arc<B>,
        session: Session,
        cache: Arc<CacheStore<Conversation>>,
        push: PushChannel,
        notifier: Notifier,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            session,
            cache,
            push,
            notifier,
            request_timeout,
            push_task: Mutex::new(None),
        }
    }

    /// Apply pushed events to the cache, once for every view of this session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_push(self: &Arc<Self>) {
        let mut task = self.push_task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let events = self.push.observe();
        *task = Some(tokio::spawn(apply_push_events(Arc::downgrade(self), events)));
    }

    pub fn cache(&self) -> &Arc<CacheStore<Conversation>> {
        &self.cache
    }

    pub fn push(&self) -> &PushChannel {
        &self.push
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Id of the logged-in user this reconciler acts for
    pub fn self_id(&self) -> Result<String> {
        match self.session.user_id() {
            Some(id) if id == self.push.self_id() => Ok(id),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    /// Whether the delete affordance should be offered for `message`
    pub fn can_delete(&self, message: &Message) -> bool {
        self.self_id()
            .map(|id| message.sender.id == id)
            .unwrap_or(false)
    }

    pub async fn cached(&self, peer_id: &str) -> Option<CacheEntry<Conversation>> {
        self.cache.get(&CacheKey::conversation(peer_id)).await
    }

    /// Fetch the conversation with `peer_id` from the backend into the cache.
    ///
    /// `Ok(None)` when the id disables the query; no request is made then.
    pub async fn fetch(&self, peer_id: &str) -> Result<Option<Conversation>> {
        let self_id = self.self_id()?;
        if !is_valid_peer(peer_id, &self_id) {
            debug!("Conversation fetch disabled for peer id {:?}", peer_id);
            return Ok(None);
        }

        let key = CacheKey::conversation(peer_id);
        let fetch = async {
            let conversation = self
                .bounded("fetch conversation", self.backend.conversation(peer_id))
                .await?;
            conversation.validate()?;
            Ok(conversation)
        };
        let conversation = self.cache.fetch_with(&key, fetch).await?;
        debug!(
            "Fetched conversation with {}: {} messages",
            peer_id,
            conversation.messages.len()
        );
        Ok(Some(conversation))
    }

    /// Send `content` to `peer_id`.
    ///
    /// On success the conversation is invalidated once and the relay is asked
    /// to notify the peer. On failure the cache is left alone.
    pub async fn send(&self, peer_id: &str, content: &str) -> SendOutcome {
        let content = content.trim();
        if content.is_empty() {
            debug!("Rejected blank message to {}", peer_id);
            return SendOutcome::Rejected;
        }

        let self_id = match self.self_id() {
            Ok(id) => id,
            Err(e) => {
                self.notifier.error(format!("Message could not be sent: {}", e));
                return SendOutcome::Failed(e);
            }
        };
        if !is_valid_peer(peer_id, &self_id) {
            let e = ClientError::Validation(format!("invalid recipient {:?}", peer_id));
            self.notifier.error(format!("Message could not be sent: {}", e));
            return SendOutcome::Failed(e);
        }

        info!("Sending message to {}", peer_id);
        match self
            .bounded("send message", self.backend.send_message(peer_id, content))
            .await
        {
            Ok(message) => {
                self.cache.invalidate(&CacheKey::conversation(peer_id)).await;
                if !self.push.notify_sent(&self_id, peer_id, content) {
                    warn!("Peer {} will only see the message on its next refetch", peer_id);
                }
                SendOutcome::Settled(message)
            }
            Err(e) => {
                self.notifier.error(format!("Message could not be sent: {}", e));
                SendOutcome::Failed(e)
            }
        }
    }

    /// Delete one of our messages in the conversation with `peer_id`.
    ///
    /// A rejection is reported and nothing is removed locally.
    pub async fn delete(&self, peer_id: &str, message_id: &str) -> Result<()> {
        self.self_id()?;
        info!("Deleting message {} in conversation with {}", message_id, peer_id);
        match self
            .bounded("delete message", self.backend.delete_message(message_id))
            .await
        {
            Ok(()) => {
                self.cache.invalidate(&CacheKey::conversation(peer_id)).await;
                Ok(())
            }
            Err(e) => {
                self.notifier.error(format!("Message could not be deleted: {}", e));
                Err(e)
            }
        }
    }

    /// React to a pushed "message received" event.
    ///
    /// Returns whether a cached conversation was invalidated. Echoes of our
    /// own sends are skipped, the send path already invalidated for them.
    pub async fn apply_push_event(&self, event: &PushEvent) -> bool {
        let Ok(self_id) = self.self_id() else {
            return false;
        };
        if event.sender_id == self_id {
            debug!("Ignoring echo of our own message to {}", event.receiver_id);
            return false;
        }
        if event.receiver_id != self_id {
            warn!(
                "Push event addressed to {} delivered to {}",
                event.receiver_id, self_id
            );
            return false;
        }
        let counterpart = event.counterpart(&self_id);
        self.cache.invalidate(&CacheKey::conversation(counterpart)).await
    }

    /// Force the next read of `peer_id`'s conversation to refetch
    pub async fn mark_stale(&self, peer_id: &str) -> bool {
        self.cache.invalidate(&CacheKey::conversation(peer_id)).await
    }

    /// Invalidate every cached conversation (e.g. after missed events)
    pub async fn mark_all_stale(&self) -> usize {
        let mut count = 0;
        for key in self.cache.keys_of(ResourceKind::Conversation).await {
            if self.cache.invalidate(&key).await {
                count += 1;
            }
        }
        count
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(self.request_timeout, fut).await.map_err(|_| {
            ClientError::Timeout(format!("{} took longer than {:?}", what, self.request_timeout))
        })?
    }
}

impl<B: Backend> Drop for ConversationReconciler<B> {
    fn drop(&mut self) {
        let task = self.push_task.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

async fn apply_push_events<B: Backend>(reconciler: Weak<ConversationReconciler<B>>, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        let Some(reconciler) = reconciler.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::MessageReceived(event) => {
                reconciler.apply_push_event(&event).await;
            }
            ChannelEvent::Lagged { missed } => {
                let count = reconciler.mark_all_stale().await;
                debug!("Missed {} push events, {} conversations marked stale", missed, count);
            }
            ChannelEvent::Unreachable { attempts } => {
                reconciler.notifier.error(format!(
                    "Live updates unavailable after {} attempts, still retrying",
                    attempts
                ));
            }
            ChannelEvent::Connected { .. } => {}
        }
    }
}
