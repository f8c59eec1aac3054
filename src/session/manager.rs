//! Connection Lifecycle Manager
//!
//! Drives every session through
//! `Idle → Connecting → Connected → Failed → Reconnecting → Connecting … → Closed`.
//!
//! All state changes for one session happen under that session's lock and
//! emit their event while still holding it, so a sink sees transitions in the
//! order they happened. Network work (connect, shell open, probe, close) runs
//! outside the lock; when it completes, the continuation re-checks the state
//! and the attempt/generation id and drops its result if the session moved on.
//! That is what lets an explicit close win against a reconnect that is
//! already in flight.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::pool::ConnectionPool;
use super::registry::{SessionEntry, SessionInner, SessionRegistry};
use super::types::{DisconnectOptions, PoolKey, Residency, SessionState, SessionStats};
use crate::events::{EventSink, NoopSink, SessionEvent};
use crate::ssh::{
    validate, RawConnectionConfig, ShellWriter, SignalKind, SshError, TransportHandle,
    TransportProvider, TransportSession, TransportSignal,
};

/// What a finished connect attempt leads to
enum AttemptOutcome {
    Connected,
    Retry(Duration),
    Terminal,
    /// The session was closed or restarted while the attempt was in flight
    Stale(Option<TransportSession>),
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    pool: Arc<ConnectionPool>,
    provider: Arc<dyn TransportProvider>,
    signals: mpsc::UnboundedSender<TransportSignal>,
}

impl SessionManager {
    /// Create the manager and start routing transport signals.
    /// Must be called from within a tokio runtime.
    pub fn new(provider: Arc<dyn TransportProvider>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let pool = Arc::new(ConnectionPool::new(registry.clone()));
        let (signals, rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            registry,
            pool,
            provider,
            signals,
        });
        tokio::spawn(route_signals(Arc::downgrade(&manager), rx));
        manager
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open a session, or reuse a pooled one for the same target.
    ///
    /// Resolves once the session is `Connected` (retries included). If the
    /// initial connect fails for good, the session is dropped and the last
    /// error is returned.
    pub async fn create_connection(
        self: &Arc<Self>,
        raw: &RawConnectionConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<String, SshError> {
        if let Some(entry) = self.pool.acquire(&PoolKey::for_raw(raw), sink.clone()).await {
            return Ok(entry.id.clone());
        }

        let config = validate(raw)?;
        let id = self.registry.next_id(&config);
        info!("Creating session {} ({} auth)", id, config.auth.label());

        let entry = Arc::new(SessionEntry::new(id.clone(), config, sink));
        let (tx, rx) = oneshot::channel();
        self.registry.insert(entry.clone());
        {
            let mut inner = entry.lock();
            inner.initial = Some(tx);
            inner.task = Some(self.spawn_cycle(entry.clone(), None));
        }

        // nobody else knows the id yet, so a dropped caller must not leave it behind
        let guard = PendingConnect {
            registry: self.registry.as_ref(),
            entry: Some(entry.clone()),
        };

        let result = match rx.await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => {
                self.discard(&entry).await;
                Err(e)
            }
            Err(_) => {
                // closed while the first connect was still running
                self.discard(&entry).await;
                Err(SshError::Disconnected)
            }
        };
        guard.disarm();
        result
    }

    /// Handshake and authenticate only, then close. Nothing is registered.
    pub async fn test_connection(&self, raw: &RawConnectionConfig) -> Result<(), SshError> {
        let config = validate(raw)?;
        let handle = match timeout(config.timeouts.connect, self.provider.connect(&config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SshError::ConnectTimeout(format!(
                    "connect to {} did not complete within {}ms",
                    config.address(),
                    config.timeouts.connect.as_millis()
                )))
            }
        };
        handle.close().await;
        info!("Test connection to {} succeeded", config.address());
        Ok(())
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SshError> {
        let writer = self.shell_writer(id)?;
        writer.write(data).await
    }

    pub async fn resize(&self, id: &str, cols: u32, rows: u32) -> Result<(), SshError> {
        let writer = self.shell_writer(id)?;
        writer.resize(cols, rows).await
    }

    /// Close a session, or park it in the pool when `options.pool` is set,
    /// the session is `Connected` and the pool has room.
    pub async fn disconnect(
        self: &Arc<Self>,
        id: &str,
        options: DisconnectOptions,
    ) -> Result<(), SshError> {
        let entry = self.active_entry(id)?;

        let transport = {
            let mut inner = entry.lock();
            if inner.residency != Residency::Active {
                return Err(SshError::SessionNotFound(id.to_string()));
            }
            if let Some(task) = inner.task.take() {
                task.abort();
            }

            if options.pool
                && inner.state == SessionState::Connected
                && self.pool.try_admit(&entry)
            {
                inner.residency = Residency::Pooled;
                let previous = std::mem::replace(&mut inner.sink, Arc::new(NoopSink));
                previous.emit(id, SessionEvent::Close);
                return Ok(());
            }

            inner.state = SessionState::Closed;
            inner.sink.emit(id, SessionEvent::state(SessionState::Closed));
            inner.sink.emit(id, SessionEvent::Close);
            inner.initial.take();
            inner.transport.take()
        };

        self.registry.remove(id);
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!("Session {} disconnected", id);
        Ok(())
    }

    /// Send a liveness probe. Success records the round trip; failure is
    /// handled like any other transport error, retry policy included.
    pub async fn probe(
        self: &Arc<Self>,
        id: &str,
        deadline: Duration,
    ) -> Result<Duration, SshError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| SshError::SessionNotFound(id.to_string()))?;
        let (handle, generation) = {
            let inner = entry.lock();
            match (&inner.transport, inner.state) {
                (Some(transport), SessionState::Connected) => {
                    (transport.handle(), transport.generation())
                }
                (_, state) => return Err(not_connected(id, state)),
            }
        };

        let started = Instant::now();
        let result = match timeout(deadline, handle.ping()).await {
            Ok(result) => result,
            Err(_) => Err(SshError::ConnectTimeout(format!(
                "liveness probe timed out after {}ms",
                deadline.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                entry.record_latency(latency);
                debug!("Probe for {} ok in {:?}", id, latency);
                Ok(latency)
            }
            Err(e) => {
                warn!("Probe for {} failed: {}", id, e);
                let message = e.to_string();
                self.handle_transport_failure(&entry, generation, e).await;
                Err(SshError::from_transport(message))
            }
        }
    }

    /// Active `Connected` sessions with no traffic for longer than `idle`
    pub fn stale_sessions(&self, idle: Duration) -> Vec<String> {
        self.registry
            .active()
            .into_iter()
            .filter(|e| e.state() == SessionState::Connected && e.idle_for() > idle)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Current transport of a `Connected` session. Tunnels and file
    /// sessions ask again for every new channel so they follow reconnects.
    pub fn connected_handle(&self, id: &str) -> Result<Arc<dyn TransportHandle>, SshError> {
        let entry = self.active_entry(id)?;
        let inner = entry.lock();
        match (&inner.transport, inner.state) {
            (Some(transport), SessionState::Connected) => Ok(transport.handle()),
            (_, state) => Err(not_connected(id, state)),
        }
    }

    /// Emit an event to the sink of an active session
    pub fn emit(&self, id: &str, event: SessionEvent) -> Result<(), SshError> {
        self.active_entry(id)?.emit(event);
        Ok(())
    }

    pub fn stats(&self, id: &str) -> Result<SessionStats, SshError> {
        Ok(self.active_entry(id)?.stats())
    }

    pub fn all_stats(&self) -> Vec<SessionStats> {
        self.registry.active().iter().map(|e| e.stats()).collect()
    }

    /// Close every session, pooled ones included
    pub async fn shutdown(self: &Arc<Self>) {
        let active = self.registry.active();
        info!("Shutting down {} active sessions", active.len());
        for entry in active {
            if let Err(e) = self.disconnect(&entry.id, DisconnectOptions::default()).await {
                debug!("Session {} already gone: {}", entry.id, e);
            }
        }

        let drained = self.pool.drain().await;
        if drained > 0 {
            info!("Closed {} pooled sessions", drained);
        }

        for entry in self.registry.all() {
            self.discard(&entry).await;
        }
    }

    fn active_entry(&self, id: &str) -> Result<Arc<SessionEntry>, SshError> {
        self.registry
            .get(id)
            .filter(|e| e.residency() == Residency::Active)
            .ok_or_else(|| SshError::SessionNotFound(id.to_string()))
    }

    fn shell_writer(&self, id: &str) -> Result<ShellWriter, SshError> {
        let entry = self.active_entry(id)?;
        let inner = entry.lock();
        match (&inner.transport, inner.state) {
            (Some(transport), SessionState::Connected) => Ok(transport.writer()),
            (_, state) => Err(not_connected(id, state)),
        }
    }

    async fn discard(&self, entry: &SessionEntry) {
        self.registry.remove(&entry.id);
        entry.close().await;
    }

    fn spawn_cycle(
        self: &Arc<Self>,
        entry: Arc<SessionEntry>,
        delay: Option<Duration>,
    ) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_cycle(entry, delay))
    }

    /// Connect attempts until one succeeds or the retry policy gives up.
    /// Runs as the session's `task`, so disconnect can abort it at any await.
    async fn run_cycle(self: Arc<Self>, entry: Arc<SessionEntry>, mut delay: Option<Duration>) {
        loop {
            if let Some(delay) = delay.take() {
                tokio::time::sleep(delay).await;
            }

            let Some(attempt) = begin_attempt(&entry) else {
                return;
            };

            let result = TransportSession::establish(
                self.provider.as_ref(),
                &entry.config,
                &entry.id,
                attempt,
                entry.transport_stats(),
                self.signals.clone(),
            )
            .await;

            match finish_attempt(&entry, attempt, result) {
                AttemptOutcome::Connected | AttemptOutcome::Terminal => return,
                AttemptOutcome::Retry(next) => delay = Some(next),
                AttemptOutcome::Stale(transport) => {
                    if let Some(transport) = transport {
                        debug!("Dropping transport of stale attempt {} for {}", attempt, entry.id);
                        transport.close().await;
                    }
                    return;
                }
            }
        }
    }

    /// `Connected → Failed` for the transport of `generation`.
    ///
    /// Pooled sessions are evicted instead of reconnected. Anything that is
    /// no longer the current connected transport is ignored.
    async fn handle_transport_failure(
        self: &Arc<Self>,
        entry: &Arc<SessionEntry>,
        generation: u64,
        err: SshError,
    ) {
        let (old, evict) = {
            let mut inner = entry.lock();
            let current = inner.transport.as_ref().map(TransportSession::generation);
            if inner.state != SessionState::Connected || current != Some(generation) {
                debug!(
                    "Ignoring failure of generation {} for {} ({})",
                    generation, entry.id, inner.state
                );
                return;
            }

            let old = inner.transport.take();
            if inner.residency == Residency::Pooled {
                inner.state = SessionState::Closed;
                (old, true)
            } else {
                if let Some(delay) = fail_locked(entry, &mut inner, err) {
                    inner.task = Some(self.spawn_cycle(entry.clone(), Some(delay)));
                }
                (old, false)
            }
        };

        if evict {
            info!("Pooled session {} lost its transport, evicting", entry.id);
            self.pool.forget(&entry.pool_key, &entry.id);
            self.registry.remove(&entry.id);
        }
        if let Some(transport) = old {
            transport.close().await;
        }
    }

    fn on_signal(self: &Arc<Self>, signal: TransportSignal) {
        let Some(entry) = self.registry.get(&signal.session_id) else {
            return;
        };

        let err = match signal.kind {
            SignalKind::Data(data) => {
                let inner = entry.lock();
                let current = inner.transport.as_ref().map(TransportSession::generation);
                if current == Some(signal.generation) {
                    inner.sink.emit(&entry.id, SessionEvent::Data { data });
                }
                return;
            }
            SignalKind::Closed => SshError::Channel("shell channel closed by remote".to_string()),
            SignalKind::Error(e) => e,
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager
                .handle_transport_failure(&entry, signal.generation, err)
                .await;
        });
    }
}

/// Tears down a session whose `create_connection` future was dropped
/// before it resolved
struct PendingConnect<'a> {
    registry: &'a SessionRegistry,
    entry: Option<Arc<SessionEntry>>,
}

impl PendingConnect<'_> {
    fn disarm(mut self) {
        self.entry = None;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        info!("Caller of create_connection went away, dropping {}", entry.id);
        self.registry.remove(&entry.id);
        if let Some(transport) = entry.shut() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { transport.close().await });
            }
        }
    }
}

async fn route_signals(
    manager: Weak<SessionManager>,
    mut rx: mpsc::UnboundedReceiver<TransportSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_signal(signal);
    }
    debug!("Signal router stopped");
}

fn not_connected(id: &str, state: SessionState) -> SshError {
    SshError::NotConnected {
        id: id.to_string(),
        state: state.to_string(),
    }
}

/// `Idle | Reconnecting → Connecting`; `None` if the session moved on.
fn begin_attempt(entry: &SessionEntry) -> Option<u64> {
    let mut inner = entry.lock();
    if !matches!(inner.state, SessionState::Idle | SessionState::Reconnecting) {
        return None;
    }
    inner.attempt += 1;
    inner.state = SessionState::Connecting;
    inner
        .sink
        .emit(&entry.id, SessionEvent::state(SessionState::Connecting));
    info!(
        "Connecting {} to {} (attempt {})",
        entry.id,
        entry.config.address(),
        inner.attempt
    );
    Some(inner.attempt)
}

fn finish_attempt(
    entry: &SessionEntry,
    attempt: u64,
    result: Result<TransportSession, SshError>,
) -> AttemptOutcome {
    let mut inner = entry.lock();
    if inner.state != SessionState::Connecting || inner.attempt != attempt {
        return AttemptOutcome::Stale(result.ok());
    }

    match result {
        Ok(transport) => {
            inner.transport = Some(transport);
            inner.state = SessionState::Connected;
            inner.retry_count = 0;
            inner.task = None;
            inner
                .sink
                .emit(&entry.id, SessionEvent::state(SessionState::Connected));
            inner.sink.emit(&entry.id, SessionEvent::Ready);
            if let Some(initial) = inner.initial.take() {
                let _ = initial.send(Ok(()));
            }
            info!("Session {} connected", entry.id);
            AttemptOutcome::Connected
        }
        Err(e) => match fail_locked(entry, &mut inner, e) {
            Some(delay) => AttemptOutcome::Retry(delay),
            None => {
                inner.task = None;
                AttemptOutcome::Terminal
            }
        },
    }
}

/// `→ Failed`, then `→ Reconnecting` if the policy allows another attempt.
/// Returns the backoff delay when a retry is due.
fn fail_locked(entry: &SessionEntry, inner: &mut SessionInner, err: SshError) -> Option<Duration> {
    let kind = err.kind();
    let message = err.to_string();
    let policy = &entry.config.retry;
    let retry = policy.should_retry(kind, inner.retry_count);

    entry.record_error();
    inner.last_error = Some(message.clone());
    inner.state = SessionState::Failed;
    warn!(
        "Session {} failed ({}): {}{}",
        entry.id,
        kind,
        message,
        if retry { "" } else { " [terminal]" }
    );

    inner.sink.emit(
        &entry.id,
        SessionEvent::State {
            state: SessionState::Failed,
            attempt: None,
            delay_ms: None,
            terminal: !retry,
        },
    );
    inner.sink.emit(
        &entry.id,
        SessionEvent::Error {
            message,
            kind,
            terminal: !retry,
        },
    );

    if !retry {
        if let Some(initial) = inner.initial.take() {
            let _ = initial.send(Err(err));
        }
        return None;
    }

    let delay = policy.delay_for(inner.retry_count);
    inner.retry_count += 1;
    entry.record_reconnect();
    inner.state = SessionState::Reconnecting;
    inner.sink.emit(
        &entry.id,
        SessionEvent::State {
            state: SessionState::Reconnecting,
            attempt: Some(inner.retry_count),
            delay_ms: Some(delay.as_millis() as u64),
            terminal: false,
        },
    );
    info!(
        "Reconnecting {} in {:?} (retry {}/{})",
        entry.id, delay, inner.retry_count, policy.max_retries
    );
    Some(delay)
}
