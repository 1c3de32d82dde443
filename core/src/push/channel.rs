/// Push channel: one long-lived relay connection shared by every view of a session.
///
/// Views take a `Subscription` on entry and drop it on exit. The connection task
/// starts with the first subscription, reconnects with backoff when the relay
/// goes away, and re-announces our identity after every connect.
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::model::PushEvent;
use crate::push::protocol::{read_message, write_message, PushMessage, PROTOCOL_VERSION};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 128;
const OUTGOING_CAPACITY: usize = 64;

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection task running
    Idle,
    /// Attempting to connect
    Connecting,
    /// Joined; `epoch` counts successful connects over the channel's lifetime
    Connected { epoch: u64 },
    /// Lost the connection, waiting before the next attempt
    Disconnected,
    /// Shut down explicitly
    Closed,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    MessageReceived(PushEvent),
    /// Joined the relay. Events sent before this were never delivered to us,
    /// whether this is the first connect or a reconnect.
    Connected { epoch: u64 },
    /// This subscriber fell behind and events were dropped
    Lagged { missed: u64 },
    /// Reconnecting keeps failing
    Unreachable { attempts: u32 },
}

struct Shared {
    config: Config,
    self_id: String,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    outgoing_tx: mpsc::Sender<PushMessage>,
    outgoing_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PushMessage>>>,
    listeners: Mutex<HashSet<Uuid>>,
    task: Mutex<Option<JoinHandle<()>>>,
    epochs: Arc<AtomicU64>,
}

impl Shared {
    fn stop_task(&self, next_state: ChannelState) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
            info!("Push channel for {} stopped", self.self_id);
        }
        self.state.send_replace(next_state);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct PushChannel {
    shared: Arc<Shared>,
}

impl PushChannel {
    pub fn new(config: &Config, self_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ChannelState::Idle);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                self_id: self_id.into(),
                events,
                state,
                outgoing_tx,
                outgoing_rx: Arc::new(tokio::sync::Mutex::new(outgoing_rx)),
                listeners: Mutex::new(HashSet::new()),
                task: Mutex::new(None),
                epochs: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.shared.self_id
    }

    /// Register a listener, starting (or reusing) the connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let events = self.shared.events.subscribe();
        lock(&self.shared.listeners).insert(id);
        self.ensure_running();
        debug!("Push subscription {} registered", id);
        Subscription {
            id,
            events,
            shared: self.shared.clone(),
        }
    }

    /// Event receiver that does not count as a listener and never starts
    /// the connection
    pub fn observe(&self) -> EventStream {
        EventStream {
            id: Uuid::new_v4(),
            events: self.shared.events.subscribe(),
        }
    }

    /// Epoch of the current connection, if joined
    pub fn connected_epoch(&self) -> Option<u64> {
        match *self.shared.state.borrow() {
            ChannelState::Connected { epoch } => Some(epoch),
            _ => None,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.task)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Ask the relay to notify `receiver_id`. Best effort: queued while disconnected,
    /// dropped (with a warning) when the queue is full.
    pub fn notify_sent(&self, sender_id: &str, receiver_id: &str, content: &str) -> bool {
        let msg = PushMessage::SendMessage {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
        };
        match self.shared.outgoing_tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping send notification for {}: {}", receiver_id, e);
                false
            }
        }
    }

    pub fn shutdown(&self) {
        self.shared.stop_task(ChannelState::Closed);
    }

    fn ensure_running(&self) {
        let mut task = lock(&self.shared.task);
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let ctx = ConnectionContext {
            config: self.shared.config.clone(),
            self_id: self.shared.self_id.clone(),
            events: self.shared.events.clone(),
            state: self.shared.state.clone(),
            outgoing: self.shared.outgoing_rx.clone(),
            epochs: self.shared.epochs.clone(),
        };
        info!("Starting push channel for {} -> {}", ctx.self_id, ctx.config.push_addr);
        *task = Some(tokio::spawn(run_connection(ctx)));
    }
}

/// Listener handle; dropping it unsubscribes
pub struct Subscription {
    id: Uuid,
    events: broadcast::Receiver<ChannelEvent>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event; `None` once the channel itself is gone
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        next_event(self.id, &mut self.events).await
    }

    /// A receiver that can be moved into a task while this handle keeps the registration
    pub fn stream(&self) -> EventStream {
        EventStream {
            id: self.id,
            events: self.events.resubscribe(),
        }
    }
}

/// Event receiver detached from its `Subscription`
pub struct EventStream {
    id: Uuid,
    events: broadcast::Receiver<ChannelEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        next_event(self.id, &mut self.events).await
    }
}

async fn next_event(id: Uuid, events: &mut broadcast::Receiver<ChannelEvent>) -> Option<ChannelEvent> {
    match events.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!("Push subscription {} lagged {} events", id, missed);
            Some(ChannelEvent::Lagged { missed })
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remaining = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.remove(&self.id);
            listeners.len()
        };
        debug!("Push subscription {} dropped ({} left)", self.id, remaining);
        if remaining == 0 && self.shared.config.close_push_when_idle {
            self.shared.stop_task(ChannelState::Idle);
        }
    }
}

struct ConnectionContext {
    config: Config,
    self_id: String,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    outgoing: Arc<tokio::sync::Mutex<mpsc::Receiver<PushMessage>>>,
    epochs: Arc<AtomicU64>,
}

/// Delay before the next attempt after `failures` consecutive failures
pub fn backoff_delay(config: &Config, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = config
        .reconnect_initial_backoff
        .saturating_mul(1u32 << exp)
        .min(config.reconnect_max_backoff);
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    base.mul_f64(factor)
}

async fn run_connection(ctx: ConnectionContext) {
    let mut outgoing = ctx.outgoing.lock().await;
    let mut failures: u32 = 0;

    loop {
        ctx.state.send_replace(ChannelState::Connecting);

        match timeout(ctx.config.connect_timeout, TcpStream::connect(ctx.config.push_addr)).await {
            Ok(Ok(stream)) => {
                failures = 0;
                let epoch = ctx.epochs.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Push channel connected to {} (epoch {})", ctx.config.push_addr, epoch);

                if let Err(e) = run_session(&ctx, stream, epoch, &mut outgoing).await {
                    warn!("Push connection lost: {}", e);
                }
                ctx.state.send_replace(ChannelState::Disconnected);
            }
            Ok(Err(e)) => {
                failures += 1;
                warn!("Failed to connect to push relay {}: {}", ctx.config.push_addr, e);
                ctx.state.send_replace(ChannelState::Disconnected);
            }
            Err(_) => {
                failures += 1;
                warn!("Connection timeout to push relay {}", ctx.config.push_addr);
                ctx.state.send_replace(ChannelState::Disconnected);
            }
        }

        if failures > 0 && failures == ctx.config.max_reconnect_attempts {
            let _ = ctx.events.send(ChannelEvent::Unreachable { attempts: failures });
        }

        sleep(backoff_delay(&ctx.config, failures.max(1))).await;
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_session(
    ctx: &ConnectionContext,
    stream: TcpStream,
    epoch: u64,
    outgoing: &mut mpsc::Receiver<PushMessage>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let join = PushMessage::Join {
        user_id: ctx.self_id.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    write_message(&mut writer, &join).await?;
    ctx.state.send_replace(ChannelState::Connected { epoch });
    let _ = ctx.events.send(ChannelEvent::Connected { epoch });

    let (frames_tx, mut frames_rx) = mpsc::channel(OUTGOING_CAPACITY);
    let _reader = AbortOnDrop(tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(msg)) => {
                    if frames_tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frames_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    }));

    let mut keepalive = interval(ctx.config.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(Ok(msg)) => handle_incoming(ctx, &mut writer, msg).await?,
                Some(Err(e)) => return Err(ClientError::Io(e)),
                None => return Err(ClientError::PushChannel("connection closed by relay".to_string())),
            },
            out = outgoing.recv() => match out {
                Some(msg) => {
                    debug!("Push -> {}", msg);
                    write_message(&mut writer, &msg).await?;
                }
                None => return Ok(()),
            },
            _ = keepalive.tick() => {
                let ping = PushMessage::Ping { timestamp: chrono::Utc::now().timestamp() };
                write_message(&mut writer, &ping).await?;
            }
        }
    }
}

async fn handle_incoming(
    ctx: &ConnectionContext,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    msg: PushMessage,
) -> Result<()> {
    match msg {
        PushMessage::ReceiveMessage {
            sender_id,
            receiver_id,
            content,
        } => {
            debug!("Push event: message from {} to {}", sender_id, receiver_id);
            let _ = ctx.events.send(ChannelEvent::MessageReceived(PushEvent {
                sender_id,
                receiver_id,
                content,
            }));
        }
        PushMessage::Ping { timestamp } => {
            write_message(writer, &PushMessage::Pong { timestamp }).await?;
        }
        PushMessage::Pong { .. } => debug!("Received pong from relay"),
        PushMessage::Joined { user_id } => debug!("Relay confirmed join for {}", user_id),
        PushMessage::Close { reason } => {
            return Err(ClientError::PushChannel(format!("relay closed connection: {}", reason)));
        }
        other => debug!("Ignoring unexpected {} from relay", other),
    }
    Ok(())
}
