//! Test doubles shared by the integration tests:
//! an in-memory backend and a push relay speaking the real wire protocol.
#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proconnect_core::backend::Backend;
use proconnect_core::error::{ClientError, Result};
use proconnect_core::model::{ConnectionSummary, Conversation, Identity, Message};
use proconnect_core::push::protocol::{read_message, write_message};
use proconnect_core::push::{ChannelState, PushMessage, Subscription};
use proconnect_core::{Client, Config};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const PASSWORD: &str = "secret";

pub fn email_of(user_id: &str) -> String {
    format!("{}@proconnect.test", user_id)
}

struct Stored {
    message: Message,
    receiver_id: String,
}

/// Server-side state shared by every fake session
#[derive(Default)]
pub struct World {
    users: Mutex<HashMap<String, Identity>>,
    companies: Mutex<HashMap<String, Identity>>,
    messages: Mutex<Vec<Stored>>,
    next_id: AtomicU64,
    fetches: Mutex<HashMap<(String, String), usize>>,
    pub sends: AtomicUsize,
    pub deletes: AtomicUsize,
    fail_fetches: AtomicUsize,
    fail_sends: AtomicUsize,
    fetch_delay_ms: AtomicU64,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_user(&self, id: &str, name: &str) {
        self.users
            .lock()
            .unwrap()
            .insert(id.to_string(), Identity::new(id, name));
    }

    pub fn add_company(&self, id: &str, name: &str) {
        self.companies
            .lock()
            .unwrap()
            .insert(id.to_string(), Identity::new(id, name));
    }

    /// Conversation fetches made by `user_id` for `peer_id`
    pub fn fetch_count(&self, user_id: &str, peer_id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), peer_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Store a message as if `sender_id` had sent it from another device
    pub fn insert_message(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message> {
        let sender = self
            .users
            .lock()
            .unwrap()
            .get(sender_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("user {}", sender_id)))?;
        if !self.users.lock().unwrap().contains_key(receiver_id) {
            return Err(ClientError::NotFound(format!("user {}", receiver_id)));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let message = Message {
            id: format!("m{}", n + 1),
            sender,
            content: content.to_string(),
            created_at: base + ChronoDuration::seconds(n as i64),
        };
        self.messages.lock().unwrap().push(Stored {
            message: message.clone(),
            receiver_id: receiver_id.to_string(),
        });
        Ok(message)
    }

    fn conversation_between(&self, user_id: &str, peer_id: &str) -> Conversation {
        let messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                (s.message.sender.id == user_id && s.receiver_id == peer_id)
                    || (s.message.sender.id == peer_id && s.receiver_id == user_id)
            })
            .map(|s| s.message.clone())
            .collect();
        if messages.is_empty() {
            return Conversation::default();
        }
        let users = self.users.lock().unwrap();
        // Peer first: position in the list means nothing
        let participants = [peer_id, user_id]
            .iter()
            .filter_map(|id| users.get(*id).cloned())
            .collect();
        Conversation {
            participants,
            messages,
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One client's session against the `World`
pub struct FakeBackend {
    world: Arc<World>,
    user: Mutex<Option<String>>,
    company: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn anonymous(world: &Arc<World>) -> Self {
        Self {
            world: world.clone(),
            user: Mutex::new(None),
            company: Mutex::new(None),
        }
    }

    pub fn as_user(world: &Arc<World>, user_id: &str) -> Self {
        let backend = Self::anonymous(world);
        *backend.user.lock().unwrap() = Some(user_id.to_string());
        backend
    }

    pub fn as_company(world: &Arc<World>, company_id: &str) -> Self {
        let backend = Self::anonymous(world);
        *backend.company.lock().unwrap() = Some(company_id.to_string());
        backend
    }

    fn session_user(&self) -> Result<String> {
        self.user
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Unauthorized("no session".to_string()))
    }
}

impl Backend for FakeBackend {
    async fn authenticated_user(&self) -> Result<Option<Identity>> {
        let Some(id) = self.user.lock().unwrap().clone() else {
            return Ok(None);
        };
        Ok(self.world.users.lock().unwrap().get(&id).cloned())
    }

    async fn authenticated_company(&self) -> Result<Option<Identity>> {
        let Some(id) = self.company.lock().unwrap().clone() else {
            return Ok(None);
        };
        Ok(self.world.companies.lock().unwrap().get(&id).cloned())
    }

    async fn login_user(&self, email: &str, password: &str) -> Result<()> {
        let found = self
            .world
            .users
            .lock()
            .unwrap()
            .keys()
            .find(|id| email_of(id) == email)
            .cloned();
        match found {
            Some(id) if password == PASSWORD => {
                *self.user.lock().unwrap() = Some(id);
                Ok(())
            }
            _ => Err(ClientError::Unauthorized("Invalid email or password".to_string())),
        }
    }

    async fn logout(&self, company: bool) -> Result<()> {
        if company {
            *self.company.lock().unwrap() = None;
        } else {
            *self.user.lock().unwrap() = None;
        }
        Ok(())
    }

    async fn connections(&self) -> Result<Vec<ConnectionSummary>> {
        let me = self.session_user()?;
        let users = self.world.users.lock().unwrap();
        let mut list: Vec<ConnectionSummary> = users
            .values()
            .filter(|u| u.id != me)
            .map(|u| ConnectionSummary {
                connection_id: format!("c-{}-{}", me, u.id),
                next_user_id: u.id.clone(),
                fullname: u.display_name.clone(),
                headline: None,
                status: Some("accepted".to_string()),
                avatar: None,
            })
            .collect();
        list.sort_by(|a, b| a.next_user_id.cmp(&b.next_user_id));
        Ok(list)
    }

    async fn conversation(&self, peer_id: &str) -> Result<Conversation> {
        let me = self.session_user()?;
        *self
            .world
            .fetches
            .lock()
            .unwrap()
            .entry((me.clone(), peer_id.to_string()))
            .or_default() += 1;

        let delay = self.world.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if World::take_failure(&self.world.fail_fetches) {
            return Err(ClientError::Transport("connection reset by peer".to_string()));
        }
        Ok(self.world.conversation_between(&me, peer_id))
    }

    async fn send_message(&self, peer_id: &str, content: &str) -> Result<Message> {
        let me = self.session_user()?;
        self.world.sends.fetch_add(1, Ordering::SeqCst);
        if World::take_failure(&self.world.fail_sends) {
            return Err(ClientError::Server {
                status: 500,
                message: "Internal server error".to_string(),
            });
        }
        if content.trim().is_empty() {
            return Err(ClientError::Validation("Message content is required".to_string()));
        }
        self.world.insert_message(&me, peer_id, content)
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let me = self.session_user()?;
        self.world.deletes.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.world.messages.lock().unwrap();
        let Some(pos) = messages.iter().position(|s| s.message.id == message_id) else {
            return Err(ClientError::NotFound("Message not found".to_string()));
        };
        if messages[pos].message.sender.id != me {
            return Err(ClientError::Forbidden(
                "You can only delete your own messages".to_string(),
            ));
        }
        messages.remove(pos);
        Ok(())
    }
}

type Routes = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<PushMessage>)>>>>;

/// Push relay: routes `send_message` to the receiver's joined connections
pub struct Relay {
    addr: SocketAddr,
    routes: Routes,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    joins: Arc<AtomicUsize>,
    accept: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Self {
        Self::start_at("127.0.0.1:0".parse().unwrap()).await
    }

    /// Relay on a fixed address, e.g. one a client is already retrying
    pub async fn start_at(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let joins = Arc::new(AtomicUsize::new(0));

        let accept = {
            let routes = routes.clone();
            let connections = connections.clone();
            let joins = joins.clone();
            tokio::spawn(async move {
                let mut next_conn = 0u64;
                while let Ok((stream, _)) = listener.accept().await {
                    next_conn += 1;
                    let handle = tokio::spawn(serve_connection(
                        stream,
                        next_conn,
                        routes.clone(),
                        joins.clone(),
                    ));
                    connections.lock().unwrap().push(handle);
                }
            })
        };

        Self {
            addr,
            routes,
            connections,
            joins,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Total joins seen, reconnects included
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// Currently joined connections for `user_id`
    pub fn connected(&self, user_id: &str) -> usize {
        self.routes
            .lock()
            .unwrap()
            .get(user_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Deliver an event as if another client had sent it
    pub fn inject(&self, sender_id: &str, receiver_id: &str, content: &str) {
        route(&self.routes, sender_id, receiver_id, content);
    }

    /// Kill every open connection; clients are expected to reconnect
    pub fn drop_all(&self) {
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.routes.lock().unwrap().clear();
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_all();
    }
}

fn route(routes: &Routes, sender_id: &str, receiver_id: &str, content: &str) {
    let event = PushMessage::ReceiveMessage {
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        content: content.to_string(),
    };
    if let Some(targets) = routes.lock().unwrap().get(receiver_id) {
        for (_, tx) in targets {
            let _ = tx.send(event.clone());
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn serve_connection(stream: TcpStream, conn: u64, routes: Routes, joins: Arc<AtomicUsize>) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let _reader = AbortOnDrop(tokio::spawn(async move {
        while let Ok(Some(msg)) = read_message(&mut reader).await {
            if frames_tx.send(msg).is_err() {
                break;
            }
        }
    }));

    let mut joined: Option<String> = None;
    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(PushMessage::Join { user_id, .. }) => {
                    routes
                        .lock()
                        .unwrap()
                        .entry(user_id.clone())
                        .or_default()
                        .push((conn, tx.clone()));
                    joins.fetch_add(1, Ordering::SeqCst);
                    let ack = PushMessage::Joined { user_id: user_id.clone() };
                    joined = Some(user_id);
                    if write_message(&mut writer, &ack).await.is_err() {
                        break;
                    }
                }
                Some(PushMessage::SendMessage { sender_id, receiver_id, content }) => {
                    route(&routes, &sender_id, &receiver_id, &content);
                }
                Some(PushMessage::Ping { timestamp }) => {
                    if write_message(&mut writer, &PushMessage::Pong { timestamp }).await.is_err() {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
            out = rx.recv() => match out {
                Some(msg) => {
                    if write_message(&mut writer, &msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Some(user_id) = joined {
        if let Some(list) = routes.lock().unwrap().get_mut(&user_id) {
            list.retain(|(id, _)| *id != conn);
        }
    }
}

pub fn test_config(relay: SocketAddr) -> Config {
    Config {
        push_addr: relay,
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        reconnect_initial_backoff: Duration::from_millis(20),
        reconnect_max_backoff: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Client with a restored session for `user_id`
pub async fn user_client(world: &Arc<World>, relay: &Relay, user_id: &str) -> Client<FakeBackend> {
    let client = Client::new(test_config(relay.addr()), FakeBackend::as_user(world, user_id));
    client.restore_session().await.unwrap();
    client
}

/// Join the client's push channel and wait until the relay routes to it.
/// Views opened while the returned handle lives start out joined.
pub async fn join_push(client: &Client<FakeBackend>, relay: &Relay) -> Subscription {
    let push = client.reconciler().unwrap().push().clone();
    let subscription = push.subscribe();
    let mut state = push.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, ChannelState::Connected { .. })),
    )
    .await
    .expect("push channel never connected")
    .unwrap();
    let user_id = client.session().user_id().unwrap();
    assert!(eventually(|| relay.connected(&user_id) > 0).await);
    subscription
}

/// Ada ("a"), Bea ("b") and Cy ("c")
pub fn sample_world() -> Arc<World> {
    let world = World::new();
    world.add_user("a", "Ada Lovelace");
    world.add_user("b", "Bea Arthur");
    world.add_user("c", "Cy Twombly");
    world
}

/// Poll `cond` until it holds or a few seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}
