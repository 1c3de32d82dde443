/// Conversation view: a scoped resource bound to one peer.
///
/// Opening a view takes a push subscription and starts a task that keeps the
/// published `ViewState` in line with the cache. Dropping (or closing) the view
/// stops that task and releases the subscription, so nothing is ever applied
/// to a disposed view.
use crate::backend::Backend;
use crate::cache::{CacheEvent, CacheKey};
use crate::error::{ClientError, Result};
use crate::model::{Conversation, Identity, Message};
use crate::push::{ChannelEvent, EventStream, Subscription};
use crate::reconciler::{is_valid_peer, ConversationReconciler, SendOutcome};
use chrono::{DateTime, Utc};
use futures_util::stream::{unfold, Stream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLine {
    pub id: String,
    pub sender: Identity,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Sent by the logged-in user
    pub mine: bool,
    /// Offer the delete affordance
    pub deletable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub peer_id: String,
    pub peer: Option<Identity>,
    pub me: Option<Identity>,
    /// Server order, oldest first
    pub lines: Vec<MessageLine>,
}

impl ConversationSnapshot {
    pub fn build(peer_id: &str, self_id: &str, conversation: &Conversation) -> Self {
        let lines = conversation
            .messages
            .iter()
            .map(|m: &Message| {
                let mine = m.sender.id == self_id;
                MessageLine {
                    id: m.id.clone(),
                    sender: m.sender.clone(),
                    content: m.content.clone(),
                    created_at: m.created_at,
                    mine,
                    deletable: mine,
                }
            })
            .collect();
        Self {
            peer_id: peer_id.to_string(),
            peer: conversation.peer_of(self_id).cloned(),
            me: conversation.me(self_id).cloned(),
            lines,
        }
    }

    /// Title shown above the thread
    pub fn title(&self) -> &str {
        self.peer
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or(&self.peer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    /// No usable peer id; nothing is fetched
    Disabled,
    Loading,
    /// The fetch settled with no messages: "start the conversation"
    Empty { peer_id: String, peer: Option<Identity> },
    Ready(ConversationSnapshot),
    /// Last fetch failed. `last_good` keeps whatever was displayed before.
    Error {
        message: String,
        retryable: bool,
        last_good: Option<ConversationSnapshot>,
    },
}

impl ViewState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ViewState::Loading)
    }

    pub fn snapshot(&self) -> Option<&ConversationSnapshot> {
        match self {
            ViewState::Ready(snapshot) => Some(snapshot),
            ViewState::Error { last_good, .. } => last_good.as_ref(),
            _ => None,
        }
    }
}

/// Progress of the message composer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending { in_flight: usize },
    Settled { message_id: String },
    Failed { reason: String },
}

/// The text input of a conversation
#[derive(Clone)]
pub struct Composer {
    text: Arc<watch::Sender<String>>,
}

impl Composer {
    pub fn new() -> Self {
        let (text, _) = watch::channel(String::new());
        Self {
            text: Arc::new(text),
        }
    }

    pub fn set(&self, text: impl Into<String>) {
        self.text.send_replace(text.into());
    }

    pub fn text(&self) -> String {
        self.text.borrow().clone()
    }

    pub fn clear(&self) {
        self.text.send_replace(String::new());
    }
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConversationView<B: Backend> {
    peer_id: String,
    reconciler: Arc<ConversationReconciler<B>>,
    state: watch::Receiver<ViewState>,
    send_state: watch::Sender<SendState>,
    in_flight: Arc<AtomicUsize>,
    retry_tx: mpsc::UnboundedSender<()>,
    task: Option<JoinHandle<()>>,
    _subscription: Option<Subscription>,
}

impl<B: Backend> ConversationView<B> {
    /// Enter the conversation with `peer_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(reconciler: Arc<ConversationReconciler<B>>, peer_id: &str) -> Result<Self> {
        let self_id = reconciler.self_id()?;
        let (send_state, _) = watch::channel(SendState::Idle);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        if !is_valid_peer(peer_id, &self_id) {
            debug!("Opening disabled conversation view for {:?}", peer_id);
            let (_, state) = watch::channel(ViewState::Disabled);
            return Ok(Self {
                peer_id: peer_id.to_string(),
                reconciler,
                state,
                send_state,
                in_flight: Arc::new(AtomicUsize::new(0)),
                retry_tx,
                task: None,
                _subscription: None,
            });
        }

        reconciler.watch_push();
        let subscription = reconciler.push().subscribe();
        let (state_tx, state) = watch::channel(ViewState::Loading);
        let ctx = ViewTask {
            reconciler: reconciler.clone(),
            peer_id: peer_id.to_string(),
            self_id,
            key: CacheKey::conversation(peer_id),
            state: state_tx,
            fetched_epoch: None,
        };
        let cache_events = reconciler.cache().subscribe();
        let push_events = subscription.stream();
        let task = tokio::spawn(ctx.run(cache_events, push_events, retry_rx));
        info!("Opened conversation view for {}", peer_id);

        Ok(Self {
            peer_id: peer_id.to_string(),
            reconciler,
            state,
            send_state,
            in_flight: Arc::new(AtomicUsize::new(0)),
            retry_tx,
            task: Some(task),
            _subscription: Some(subscription),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    pub fn send_state(&self) -> SendState {
        self.send_state.borrow().clone()
    }

    /// Wait until the published state satisfies `pred`
    pub async fn wait_for<F>(&self, pred: F) -> Result<ViewState>
    where
        F: FnMut(&ViewState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(pred)
            .await
            .map_err(|_| ClientError::Protocol("conversation view is closed".to_string()))?;
        Ok(state.clone())
    }

    /// Stream of state changes
    pub fn updates(&self) -> impl Stream<Item = ViewState> {
        unfold(self.state.clone(), |mut rx| async move {
            rx.changed().await.ok()?;
            let state = rx.borrow_and_update().clone();
            Some((state, rx))
        })
    }

    /// Refetch after an error (or whenever the user asks)
    pub fn retry(&self) {
        let _ = self.retry_tx.send(());
    }

    /// Send the composer's text. The composer is cleared once the send settles,
    /// whether it succeeded or not; blank input is left untouched.
    pub async fn submit(&self, composer: &Composer) -> SendOutcome {
        let content = composer.text();
        if content.trim().is_empty() {
            return SendOutcome::Rejected;
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_state.send_replace(SendState::Sending { in_flight });

        let outcome = self.reconciler.send(&self.peer_id, &content).await;
        composer.clear();

        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        let next = match &outcome {
            _ if remaining > 0 => SendState::Sending { in_flight: remaining },
            SendOutcome::Settled(message) => SendState::Settled {
                message_id: message.id.clone(),
            },
            SendOutcome::Failed(e) => SendState::Failed {
                reason: e.to_string(),
            },
            SendOutcome::Rejected => SendState::Idle,
        };
        self.send_state.send_replace(next);
        outcome
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        self.reconciler.delete(&self.peer_id, message_id).await
    }

    /// Leave the view
    pub fn close(self) {}
}

impl<B: Backend> Drop for ConversationView<B> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Closed conversation view for {}", self.peer_id);
        }
    }
}

struct ViewTask<B: Backend> {
    reconciler: Arc<ConversationReconciler<B>>,
    peer_id: String,
    self_id: String,
    key: CacheKey,
    state: watch::Sender<ViewState>,
    /// Push epoch that was joined when the last fetch started
    fetched_epoch: Option<u64>,
}

impl<B: Backend> ViewTask<B> {
    async fn run(
        mut self,
        mut cache_events: broadcast::Receiver<CacheEvent>,
        mut push_events: EventStream,
        mut retry_rx: mpsc::UnboundedReceiver<()>,
    ) {
        // Show what we have, but always go to the server on entry
        self.publish_cached().await;
        self.refetch().await;

        let mut push_open = true;
        loop {
            tokio::select! {
                event = cache_events.recv() => match event {
                    Ok(CacheEvent::Invalidated(key)) if key == self.key => {
                        if self.reconciler.cache().is_stale(&key).await {
                            self.refetch().await;
                        }
                    }
                    Ok(CacheEvent::Updated(key)) if key == self.key => self.publish_cached().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Conversation view for {} lagged {} cache events", self.peer_id, n);
                        self.refetch().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                // Pushed messages reach the cache through the reconciler; a view
                // only has to catch up on what it may have missed before a join
                event = push_events.recv(), if push_open => match event {
                    Some(ChannelEvent::Connected { epoch }) => {
                        if self.fetched_epoch.map_or(true, |seen| seen < epoch) {
                            debug!("Push channel joined (epoch {}), refreshing {}", epoch, self.peer_id);
                            self.reconciler.mark_stale(&self.peer_id).await;
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!("Push channel closed; {} now updates only on demand", self.peer_id);
                        push_open = false;
                    }
                },
                request = retry_rx.recv() => match request {
                    Some(()) => self.refetch().await,
                    None => break,
                },
            }
        }
    }

    async fn publish_cached(&self) {
        if let Some(conversation) = self.reconciler.cache().value(&self.key).await {
            self.state.send_replace(self.render(&conversation));
        }
    }

    fn render(&self, conversation: &Conversation) -> ViewState {
        let snapshot = ConversationSnapshot::build(&self.peer_id, &self.self_id, conversation);
        if conversation.is_empty() {
            ViewState::Empty {
                peer_id: self.peer_id.clone(),
                peer: snapshot.peer,
            }
        } else {
            ViewState::Ready(snapshot)
        }
    }

    async fn refetch(&mut self) {
        self.fetched_epoch = self.reconciler.push().connected_epoch();
        match self.reconciler.fetch(&self.peer_id).await {
            Ok(Some(conversation)) => {
                self.state.send_replace(self.render(&conversation));
            }
            Ok(None) => {
                self.state.send_replace(ViewState::Disabled);
            }
            Err(e) => {
                let last_good = self
                    .reconciler
                    .cache()
                    .value(&self.key)
                    .await
                    .filter(|c| !c.is_empty())
                    .map(|c| ConversationSnapshot::build(&self.peer_id, &self.self_id, &c));
                warn!("Conversation with {} failed to load: {}", self.peer_id, e);
                self.reconciler
                    .notifier()
                    .error(format!("Conversation could not be loaded: {}", e));
                self.state.send_replace(ViewState::Error {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                    last_good,
                });
            }
        }
    }
}
