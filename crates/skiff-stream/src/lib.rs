// Real-time telemetry distribution engine.
//
// The engine serves many long-lived client sessions. Each session owns a
// bounded outbound queue, a set of independently-timed channel subscriptions,
// and one cancellation signal shared by its reader/writer/scheduler tasks.
// Delivery is best-effort: a slow consumer drops the freshest update locally
// instead of stalling the rest of the process.
use ahash::RandomState;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use skiff_common::ids::SessionId;
use skiff_common::{unix_millis, validate_channel};
use skiff_wire::{Capabilities, ChannelRequest, ClientKind, ServerMessage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

pub mod scheduler;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("outbound queue full for session {session} on {channel}")]
    QueueFull { session: SessionId, channel: String },
    #[error("session closed: {0}")]
    SessionClosed(SessionId),
}

pub const DEFAULT_MAX_SESSIONS: usize = 128;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Latest collected value for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub value: Value,
    // Unix milliseconds at publish time.
    pub captured_at: i64,
}

/// Latest-value cache written by collectors and read by every session.
///
/// Reads go through an `ArcSwap` snapshot so the scheduler hot path never
/// contends with publishers; the inner map is rebuilt under a mutex on each
/// publish. A read returns the most recent value for a channel or nothing at
/// all, never a torn value.
#[derive(Debug, Default)]
pub struct MetricStore {
    snapshot: ArcSwap<HashMap<String, Arc<Snapshot>, RandomState>>,
    inner: Mutex<HashMap<String, Arc<Snapshot>, RandomState>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, channel: impl Into<String>, value: Value) {
        let snapshot = Arc::new(Snapshot {
            value,
            captured_at: unix_millis(),
        });
        let mut inner = self.inner.lock();
        inner.insert(channel.into(), snapshot);
        self.snapshot.store(Arc::new(inner.clone()));
    }

    pub fn get(&self, channel: &str) -> Option<Arc<Snapshot>> {
        self.snapshot.load().get(channel).cloned()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.load().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Outcome of a delta comparison for one (session, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaDecision {
    // No baseline yet; send the full value.
    Full,
    // Value differs from the baseline; send it flagged as a delta.
    Delta,
    // Value matches the baseline; suppress the send.
    Unchanged,
}

/// Per-session delta baselines, keyed by channel.
///
/// Comparison is whole-value equality over a canonical JSON serialization:
/// "delta" means "send only when changed", not a field-level diff.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    baselines: HashMap<String, String, RandomState>,
}

impl DeltaTracker {
    pub fn observe(&mut self, channel: &str, value: &Value) -> DeltaDecision {
        let canonical = value.to_string();
        match self.baselines.get(channel) {
            None => {
                self.baselines.insert(channel.to_string(), canonical);
                DeltaDecision::Full
            }
            Some(prev) if *prev == canonical => DeltaDecision::Unchanged,
            Some(_) => {
                self.baselines.insert(channel.to_string(), canonical);
                DeltaDecision::Delta
            }
        }
    }

    // Record a full (non-delta) send as the new baseline.
    pub fn prime(&mut self, channel: &str, value: &Value) {
        self.baselines.insert(channel.to_string(), value.to_string());
    }

    pub fn clear(&mut self, channel: &str) {
        self.baselines.remove(channel);
    }
}

/// One client's request for a channel's updates at a chosen cadence.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub channel: String,
    pub interval: Duration,
    pub fields: Option<Vec<String>>,
    pub filters: Option<BTreeMap<String, Value>>,
    pub delta_only: bool,
    // None until the first send so a fresh subscription fires on the next tick.
    pub last_sent_at: Option<Instant>,
}

impl Subscription {
    pub fn from_request(request: ChannelRequest) -> Self {
        Self {
            channel: request.channel,
            // Intervals arrive as whole seconds on the wire; clamp to >= 1s.
            interval: Duration::from_secs(request.interval.max(1)),
            fields: request.fields,
            filters: request.filters,
            delta_only: request.delta_only,
            last_sent_at: None,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.last_sent_at
            .is_none_or(|at| now.duration_since(at) >= self.interval)
    }
}

/// Receiving ends handed to the session's writer and task loops.
#[derive(Debug)]
pub struct SessionReceivers {
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub cancel: watch::Receiver<bool>,
}

/// Shared state for one accepted connection.
///
/// The handle is shared by the session's reader, writer, and scheduler tasks
/// plus the [`ConnectionManager`] table. The subscriptions map and delta
/// baselines are mutex-protected; the outbound queue is the one hand-off
/// primitive that needs no external lock.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    // Negotiated once at connect; never mutated afterwards.
    identity: Mutex<Option<(ClientKind, Capabilities)>>,
    subscriptions: Mutex<HashMap<String, Subscription, RandomState>>,
    delta: Mutex<DeltaTracker>,
    outbound: mpsc::Sender<ServerMessage>,
    cancel_tx: watch::Sender<bool>,
    // Close-once guard; reader and writer error paths may both race here.
    closed: Mutex<bool>,
    sequence: AtomicU64,
}

impl SessionHandle {
    pub fn new(queue_capacity: usize) -> (Arc<Self>, SessionReceivers) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Arc::new(Self {
            id: SessionId::new(),
            identity: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::with_hasher(RandomState::new())),
            delta: Mutex::new(DeltaTracker::default()),
            outbound: outbound_tx,
            cancel_tx,
            closed: Mutex::new(false),
            sequence: AtomicU64::new(0),
        });
        (
            handle,
            SessionReceivers {
                outbound: outbound_rx,
                cancel: cancel_rx,
            },
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Records the negotiated identity. The first `connect` wins; repeats are
    /// ignored so capabilities stay immutable for the session's lifetime.
    pub fn connect(&self, client: ClientKind, capabilities: Capabilities) -> bool {
        let mut identity = self.identity.lock();
        if identity.is_some() {
            return false;
        }
        *identity = Some((client, capabilities));
        true
    }

    pub fn client_kind(&self) -> ClientKind {
        self.identity
            .lock()
            .as_ref()
            .map(|(client, _)| *client)
            .unwrap_or_default()
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.identity
            .lock()
            .as_ref()
            .map(|(_, capabilities)| *capabilities)
    }

    // A client that never negotiated capabilities still gets delta sends when
    // its subscription asks for them.
    fn delta_capable(&self) -> bool {
        self.identity
            .lock()
            .as_ref()
            .map(|(_, capabilities)| capabilities.delta)
            .unwrap_or(true)
    }

    /// Upserts one subscription per valid request and returns the accepted
    /// channel names. Re-subscribing replaces the prior record and resets its
    /// clock and baseline so the next tick sends a full value.
    pub fn subscribe(&self, requests: Vec<ChannelRequest>) -> Vec<String> {
        let mut subscriptions = self.subscriptions.lock();
        let mut delta = self.delta.lock();
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            if let Err(err) = validate_channel(&request.channel) {
                tracing::warn!(session = %self.id, error = %err, "rejected subscribe");
                continue;
            }
            let subscription = Subscription::from_request(request);
            delta.clear(&subscription.channel);
            accepted.push(subscription.channel.clone());
            subscriptions.insert(subscription.channel.clone(), subscription);
        }
        accepted
    }

    /// Removes the named subscriptions and their delta baselines.
    pub fn unsubscribe(&self, channels: &[String]) {
        let mut subscriptions = self.subscriptions.lock();
        let mut delta = self.delta.lock();
        for channel in channels {
            subscriptions.remove(channel);
            delta.clear(channel);
        }
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Non-blocking enqueue onto the outbound queue. A full queue drops the
    /// message and reports the drop; the session stays alive.
    pub fn enqueue(&self, message: ServerMessage) -> Result<()> {
        let channel = match &message {
            ServerMessage::Event { channel, .. } => channel.clone(),
            _ => String::new(),
        };
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("skiff_outbound_dropped_total").increment(1);
                Err(StreamError::QueueFull {
                    session: self.id,
                    channel,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(StreamError::SessionClosed(self.id))
            }
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fires the session's cancellation signal. Idempotent: returns true only
    /// for the call that actually performed the close.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        let _ = self.cancel_tx.send(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

/// Point-in-time view of the session table, copied under the read lock.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ManagerStats {
    pub sessions: usize,
    pub subscriptions_per_channel: BTreeMap<String, usize>,
    pub sessions_per_client: BTreeMap<String, usize>,
}

/// A reserved capacity slot handed out by [`ConnectionManager::try_admit`].
///
/// The slot stays held for as long as the permit lives: through registration
/// and the whole session lifetime, and it is released when the permit drops,
/// whether the session was ever registered or the upgrade died on the way.
/// Reservation at admission time is what keeps the table at or under the cap
/// even when many upgrades race between the check and their registration.
#[derive(Debug)]
pub struct AdmissionPermit {
    admitted: Arc<Mutex<usize>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut admitted = self.admitted.lock();
        *admitted = admitted.saturating_sub(1);
    }
}

/// Owns the session table and enforces the global session cap.
#[derive(Debug)]
pub struct ConnectionManager {
    sessions: RwLock<HashMap<SessionId, (Arc<SessionHandle>, AdmissionPermit), RandomState>>,
    // Reserved plus registered slots; permits decrement it on drop.
    admitted: Arc<Mutex<usize>>,
    max_sessions: usize,
}

impl ConnectionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::with_hasher(RandomState::new())),
            admitted: Arc::new(Mutex::new(0)),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Reject-before-accept capacity check. At capacity this returns `None`
    /// without side effects and the caller refuses the upgrade; otherwise the
    /// slot is reserved immediately, so a second upgrade racing in between
    /// this check and [`Self::register`] cannot push the table over the cap.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let mut admitted = self.admitted.lock();
        if *admitted >= self.max_sessions {
            metrics::counter!("skiff_admission_rejected_total").increment(1);
            return None;
        }
        *admitted += 1;
        Some(AdmissionPermit {
            admitted: Arc::clone(&self.admitted),
        })
    }

    /// Inserts the session, binding its reserved slot to the table entry so
    /// the slot is released when the session is removed.
    pub fn register(&self, session: Arc<SessionHandle>, permit: AdmissionPermit) {
        let mut sessions = self.sessions.write();
        sessions.insert(session.id(), (session, permit));
        metrics::gauge!("skiff_sessions").set(sessions.len() as f64);
    }

    /// Evicts and cancels a session, releasing its capacity slot. Removing an
    /// already-removed session is a no-op, and the cancellation fires at most
    /// once.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(&id);
            metrics::gauge!("skiff_sessions").set(sessions.len() as f64);
            removed
        };
        match removed {
            Some((session, _permit)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions = self.sessions.read();
        let mut stats = ManagerStats {
            sessions: sessions.len(),
            ..ManagerStats::default()
        };
        for (session, _) in sessions.values() {
            for channel in session.subscribed_channels() {
                *stats.subscriptions_per_channel.entry(channel).or_default() += 1;
            }
            *stats
                .sessions_per_client
                .entry(session.client_kind().as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    /// Cancels every live session; used on service shutdown.
    pub fn shutdown_all(&self) {
        let sessions: Vec<Arc<SessionHandle>> = self
            .sessions
            .read()
            .values()
            .map(|(session, _)| Arc::clone(session))
            .collect();
        for session in sessions {
            session.close();
        }
    }
}
