/// Key-addressed cache of server responses.
///
/// Every entry carries a generation counter. `invalidate` bumps it, and a
/// fetch that started under an older generation may still store its value
/// (last settled wins) but leaves the entry stale, so the next read refetches.
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Conversation,
    Connections,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl CacheKey {
    pub fn conversation(peer_id: &str) -> Self {
        Self {
            kind: ResourceKind::Conversation,
            id: peer_id.to_string(),
        }
    }

    pub fn connections(owner_id: &str) -> Self {
        Self {
            kind: ResourceKind::Connections,
            id: owner_id.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// Snapshot of one cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Last known good server response
    pub value: Option<V>,
    pub stale: bool,
    pub generation: u64,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed fetch, cleared by the next success
    pub last_error: Option<String>,
    pub invalidations: u64,
}

impl<V> CacheEntry<V> {
    fn placeholder() -> Self {
        Self {
            value: None,
            stale: true,
            generation: 0,
            fetched_at: None,
            last_error: None,
            invalidations: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Invalidated(CacheKey),
    Updated(CacheKey),
    Failed { key: CacheKey, error: String },
}

impl CacheEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            CacheEvent::Invalidated(key) | CacheEvent::Updated(key) => key,
            CacheEvent::Failed { key, .. } => key,
        }
    }
}

/// Proof that a fetch started under a given generation
#[derive(Debug)]
pub struct FetchTicket {
    key: CacheKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

pub struct CacheStore<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl<V: Clone + Send + Sync> CacheStore<V> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn value(&self, key: &CacheKey) -> Option<V> {
        self.entries.read().await.get(key).and_then(|e| e.value.clone())
    }

    /// Absent entries count as stale
    pub async fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.read().await.get(key).map(|e| e.stale).unwrap_or(true)
    }

    pub async fn keys_of(&self, kind: ResourceKind) -> Vec<CacheKey> {
        self.entries
            .read()
            .await
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Mark an entry stale. Returns false (and does nothing) for unknown keys.
    pub(crate) async fn invalidate(&self, key: &CacheKey) -> bool {
        {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(key) else {
                debug!("Invalidate on unknown cache key {}", key);
                return false;
            };
            entry.generation += 1;
            entry.invalidations += 1;
            entry.stale = true;
            debug!("Invalidated {} (generation {})", key, entry.generation);
        }
        let _ = self.events.send(CacheEvent::Invalidated(key.clone()));
        true
    }

    pub(crate) async fn begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::placeholder);
        FetchTicket {
            key: key.clone(),
            generation: entry.generation,
        }
    }

    /// Apply the outcome of a fetch. A failure never touches the stored value.
    pub(crate) async fn settle(&self, ticket: FetchTicket, outcome: Result<V>) -> Result<V> {
        let event = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(ticket.key.clone())
                .or_insert_with(CacheEntry::placeholder);
            match &outcome {
                Ok(value) => {
                    entry.value = Some(value.clone());
                    entry.fetched_at = Some(Utc::now());
                    entry.last_error = None;
                    if entry.generation == ticket.generation {
                        entry.stale = false;
                    } else {
                        debug!(
                            "Fetch for {} settled under generation {} (now {}), staying stale",
                            ticket.key, ticket.generation, entry.generation
                        );
                    }
                    CacheEvent::Updated(ticket.key)
                }
                Err(e) => {
                    entry.last_error = Some(e.to_string());
                    CacheEvent::Failed {
                        key: ticket.key,
                        error: e.to_string(),
                    }
                }
            }
        };
        let _ = self.events.send(event);
        outcome
    }

    pub(crate) async fn fetch_with<F>(&self, key: &CacheKey, fetch: F) -> Result<V>
    where
        F: Future<Output = Result<V>>,
    {
        let ticket = self.begin_fetch(key).await;
        let outcome = fetch.await;
        self.settle(ticket, outcome).await
    }

    pub(crate) async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl<V: Clone + Send + Sync> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
