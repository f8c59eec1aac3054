//! Session Registry
//!
//! The one authoritative table of sessions. Both the lifecycle manager and
//! the pool look sessions up here by id; whether a session is pooled is a
//! flag on its entry, never a second copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::types::{PoolKey, Residency, SessionState, SessionStats};
use crate::events::{EventSink, SessionEvent};
use crate::ssh::{ConnectionConfig, SshError, TransportSession, TransportStats};

const NO_LATENCY: u64 = u64::MAX;

/// Mutable part of a session. Guarded by the entry's mutex, which is the
/// session's serialized execution context; it is never held across `.await`.
pub(crate) struct SessionInner {
    pub state: SessionState,
    pub residency: Residency,
    pub retry_count: u32,
    /// Bumped for every connect attempt; stale continuations compare it
    pub attempt: u64,
    pub transport: Option<TransportSession>,
    pub sink: Arc<dyn EventSink>,
    /// In-flight connect cycle or pending reconnect timer
    pub task: Option<JoinHandle<()>>,
    /// Completion of the caller's initial `create_connection`
    pub initial: Option<oneshot::Sender<Result<(), SshError>>>,
    pub last_error: Option<String>,
}

pub struct SessionEntry {
    pub id: String,
    pub config: ConnectionConfig,
    pub pool_key: PoolKey,
    pub created_at: DateTime<Utc>,
    created: Instant,
    stats: Arc<TransportStats>,
    errors: AtomicU64,
    reconnects: AtomicU64,
    latency_ms: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl SessionEntry {
    pub(crate) fn new(id: String, config: ConnectionConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            pool_key: PoolKey::for_config(&config),
            config,
            created_at: Utc::now(),
            created: Instant::now(),
            stats: Arc::new(TransportStats::new()),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            latency_ms: AtomicU64::new(NO_LATENCY),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                residency: Residency::Active,
                retry_count: 0,
                attempt: 0,
                transport: None,
                sink,
                task: None,
                initial: None,
                last_error: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn residency(&self) -> Residency {
        self.inner.lock().residency
    }

    pub(crate) fn transport_stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    /// Emit to the session's current sink
    pub fn emit(&self, event: SessionEvent) {
        let sink = self.inner.lock().sink.clone();
        sink.emit(&self.id, event);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, latency: std::time::Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self.stats.touch();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.stats.idle_for()
    }

    /// Mark the session closed and detach everything that keeps it alive.
    /// Returns the transport so the caller can close it outside the lock.
    pub(crate) fn shut(&self) -> Option<TransportSession> {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.initial.take();
        inner.transport.take()
    }

    /// `shut` and close the transport
    pub(crate) async fn close(&self) {
        if let Some(transport) = self.shut() {
            transport.close().await;
        }
        debug!("Session {} closed", self.id);
    }

    pub fn stats(&self) -> SessionStats {
        let (state, retry_count, last_error) = {
            let inner = self.inner.lock();
            (inner.state, inner.retry_count, inner.last_error.clone())
        };
        let idle = self.stats.idle_for();
        let latency = self.latency_ms.load(Ordering::Relaxed);

        SessionStats {
            id: self.id.clone(),
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            state,
            created_at: self.created_at,
            last_activity: Utc::now()
                - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero()),
            uptime_ms: self.created.elapsed().as_millis() as u64,
            idle_ms: idle.as_millis() as u64,
            latency_ms: (latency != NO_LATENCY).then_some(latency),
            bytes_sent: self.stats.bytes_sent(),
            bytes_received: self.stats.bytes_received(),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            retry_count,
            last_error,
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `user@host:port-<created ms>-<seq>`
    pub(crate) fn next_id(&self, config: &ConnectionConfig) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}@{}:{}-{}-{}",
            config.username,
            config.host,
            config.port,
            Utc::now().timestamp_millis(),
            seq
        )
    }

    pub(crate) fn insert(&self, entry: Arc<SessionEntry>) {
        self.sessions.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    pub fn all(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Sessions in use by callers (not parked in the pool)
    pub fn active(&self) -> Vec<Arc<SessionEntry>> {
        self.all()
            .into_iter()
            .filter(|e| e.residency() == Residency::Active)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }
}
