//! Shared cache / pub-sub backplane.
//!
//! Several server processes act as one messaging cluster by keeping the
//! recent-history cache in a shared service and replicating every push-path
//! event through its pub/sub channel.  [`Backplane`] is the seam;
//! [`MemoryBackplane`] is the in-process implementation used for
//! single-node deployments and tests.  [`BackplaneGuard`] wraps any
//! implementation with a cached reachability verdict so a dead backplane
//! degrades the cluster features instead of failing the chat path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use rencontre_shared::{ChatId, MessageId, MessagePayload, UserId};

/// Buffer size of the in-process event channel.
const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event replicated to every sibling process.
///
/// `origin` identifies the publishing process; consumers skip events
/// carrying their own id so local deliveries are never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneEvent {
    pub origin: Uuid,
    #[serde(flatten)]
    pub kind: BackplaneEventKind,
}

/// Everything the push path replicates across processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackplaneEventKind {
    /// A message accepted by a sibling process, to be fanned out to local
    /// connections viewing the chat.
    MessageBroadcast {
        chat_id: ChatId,
        message: MessagePayload,
    },
    /// A read receipt whose original sender may be connected elsewhere.
    ReadReceipt {
        chat_id: ChatId,
        message_id: MessageId,
        sender_id: UserId,
    },
    /// A user went online or offline somewhere in the cluster.
    PresenceChanged { user_id: UserId, online: bool },
    /// An automated dialog was stopped; the answerer must be told wherever
    /// they are connected.
    DialogEnded { questioner: UserId, answerer: UserId },
}

/// Errors surfaced by backplane implementations.
#[derive(Error, Debug)]
pub enum BackplaneError {
    #[error("Backplane unreachable: {0}")]
    Unreachable(String),
}

// ---------------------------------------------------------------------------
// The seam
// ---------------------------------------------------------------------------

/// One cache list entry: an opaque payload plus the id the backplane uses
/// for its uniqueness check.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub id: String,
    pub payload: String,
}

/// Port covering the two concerns the chat core takes from its backplane:
/// bounded-list caching and cross-process pub/sub.
///
/// List payloads are opaque strings (serialized JSON); each travels with an
/// id so the implementation can keep the duplicate check and the push
/// atomic on its side of the seam.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Push an entry onto the head of the list at `key`, trim it to `cap`
    /// entries, refresh its TTL.  An entry whose id is already in the list
    /// is skipped; check and push must be a single atomic step per key, so
    /// two concurrent pushes of one id can never both land.
    async fn list_push(
        &self,
        key: &str,
        entry: ListEntry,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), BackplaneError>;

    /// Read the payloads of the list at `key`, newest first.  `None` means
    /// the key is absent or expired.
    async fn list_read(&self, key: &str) -> Result<Option<Vec<String>>, BackplaneError>;

    /// Replace the list at `key` wholesale (cache repopulation after a
    /// miss), newest first, with a fresh TTL.
    async fn list_write(
        &self,
        key: &str,
        entries: Vec<ListEntry>,
        ttl: Duration,
    ) -> Result<(), BackplaneError>;

    /// Publish an event to every subscribed process, including this one.
    async fn publish(&self, event: BackplaneEvent) -> Result<(), BackplaneError>;

    /// Subscribe to the cross-process event stream.
    fn subscribe(&self) -> broadcast::Receiver<BackplaneEvent>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), BackplaneError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct CachedList {
    entries: VecDeque<ListEntry>,
    expires_at: Instant,
}

/// Single-process [`Backplane`].
///
/// Sharing one instance between several hubs in tests faithfully emulates a
/// multi-process cluster, pub/sub included.
pub struct MemoryBackplane {
    lists: DashMap<String, CachedList>,
    events: broadcast::Sender<BackplaneEvent>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            lists: DashMap::new(),
            events,
        }
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn list_push(
        &self,
        key: &str,
        entry: ListEntry,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), BackplaneError> {
        let mut list = self.lists.entry(key.to_string()).or_insert_with(|| CachedList {
            entries: VecDeque::new(),
            expires_at: Instant::now() + ttl,
        });
        // The entry guard is exclusive for this key: duplicate check and
        // push are one atomic step.
        if list.entries.iter().any(|cached| cached.id == entry.id) {
            return Ok(());
        }
        list.entries.push_front(entry);
        list.entries.truncate(cap.max(1));
        list.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn list_read(&self, key: &str) -> Result<Option<Vec<String>>, BackplaneError> {
        let expired = match self.lists.get(key) {
            Some(list) if list.expires_at > Instant::now() => {
                return Ok(Some(
                    list.entries.iter().map(|e| e.payload.clone()).collect(),
                ));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.lists.remove(key);
        }
        Ok(None)
    }

    async fn list_write(
        &self,
        key: &str,
        entries: Vec<ListEntry>,
        ttl: Duration,
    ) -> Result<(), BackplaneError> {
        self.lists.insert(
            key.to_string(),
            CachedList {
                entries: entries.into(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn publish(&self, event: BackplaneEvent) -> Result<(), BackplaneError> {
        // A send error only means nobody is subscribed right now.
        let _ = self.events.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackplaneEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), BackplaneError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reachability guard
// ---------------------------------------------------------------------------

struct Verdict {
    reachable: bool,
    checked_at: Instant,
}

/// Fail-open wrapper around a [`Backplane`] with a cached reachability
/// verdict.
///
/// After a failed call every guarded operation short-circuits until the
/// verdict expires; the next real call then doubles as the live probe.  A
/// dead backplane therefore costs one failed round trip per verdict window
/// instead of one per message.
pub struct BackplaneGuard {
    inner: Arc<dyn Backplane>,
    verdict: Mutex<Verdict>,
    ttl: Duration,
}

impl BackplaneGuard {
    pub fn new(inner: Arc<dyn Backplane>, ttl: Duration) -> Self {
        Self {
            inner,
            verdict: Mutex::new(Verdict {
                reachable: true,
                checked_at: Instant::now(),
            }),
            ttl,
        }
    }

    /// Whether calls should currently go through to the backplane.
    fn is_open(&self) -> bool {
        let verdict = self.verdict.lock();
        verdict.reachable || verdict.checked_at.elapsed() >= self.ttl
    }

    fn record(&self, reachable: bool) {
        let mut verdict = self.verdict.lock();
        verdict.reachable = reachable;
        verdict.checked_at = Instant::now();
    }

    /// The cached verdict, without probing.
    pub fn reachable_cached(&self) -> bool {
        self.verdict.lock().reachable
    }

    /// Guarded push; returns `true` when the entry was applied.
    pub async fn list_push(&self, key: &str, entry: ListEntry, cap: usize, ttl: Duration) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.inner.list_push(key, entry, cap, ttl).await {
            Ok(()) => {
                self.record(true);
                true
            }
            Err(e) => {
                debug!(key, error = %e, "backplane list push failed");
                self.record(false);
                false
            }
        }
    }

    /// Guarded read; `None` covers miss, expiry, and unreachability alike.
    pub async fn list_read(&self, key: &str) -> Option<Vec<String>> {
        if !self.is_open() {
            return None;
        }
        match self.inner.list_read(key).await {
            Ok(found) => {
                self.record(true);
                found
            }
            Err(e) => {
                debug!(key, error = %e, "backplane list read failed");
                self.record(false);
                None
            }
        }
    }

    /// Guarded wholesale write; returns `true` when applied.
    pub async fn list_write(&self, key: &str, entries: Vec<ListEntry>, ttl: Duration) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.inner.list_write(key, entries, ttl).await {
            Ok(()) => {
                self.record(true);
                true
            }
            Err(e) => {
                debug!(key, error = %e, "backplane list write failed");
                self.record(false);
                false
            }
        }
    }

    /// Guarded publish; returns `true` when the event went out.
    pub async fn publish(&self, event: BackplaneEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.inner.publish(event).await {
            Ok(()) => {
                self.record(true);
                true
            }
            Err(e) => {
                debug!(error = %e, "backplane publish failed");
                self.record(false);
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackplaneEvent> {
        self.inner.subscribe()
    }

    /// Live reachability check, refreshing the verdict.
    pub async fn probe(&self) -> bool {
        let reachable = self.inner.ping().await.is_ok();
        self.record(reachable);
        reachable
    }
}
