//! Connection Pool
//!
//! Parks idle-but-open sessions by (host, port, username) so a later
//! `create_connection` for the same target can skip the handshake. The pool
//! only stores session ids; the entries themselves stay in the registry with
//! their residency flag set to [`Residency::Pooled`].
//!
//! Lock order: a caller may hold a session's lock while calling into the
//! pool, so the pool never takes a session lock while holding its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::registry::{SessionEntry, SessionRegistry};
use super::types::{PoolKey, Residency, SessionState};
use crate::events::{EventSink, SessionEvent};

struct PooledSlot {
    session_id: String,
    pooled_at: Instant,
    idle_timer: JoinHandle<()>,
}

pub struct ConnectionPool {
    registry: Arc<SessionRegistry>,
    slots: Mutex<HashMap<PoolKey, VecDeque<PooledSlot>>>,
}

impl ConnectionPool {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .values()
            .any(|q| q.iter().any(|s| s.session_id == session_id))
    }

    /// Admit `entry` if the pool holds fewer than its `poolSize` sessions,
    /// arming the idle eviction timer. The caller has already checked the
    /// session is `Connected` and flips its residency on success.
    pub(crate) fn try_admit(self: &Arc<Self>, entry: &SessionEntry) -> bool {
        let mut slots = self.slots.lock();
        let pooled: usize = slots.values().map(VecDeque::len).sum();
        if pooled >= entry.config.pool.size {
            debug!(
                "Pool full ({}/{}), not pooling session {}",
                pooled, entry.config.pool.size, entry.id
            );
            return false;
        }

        let idle_timeout = entry.config.pool.idle_timeout;
        let key = entry.pool_key.clone();
        let session_id = entry.id.clone();
        let idle_timer = {
            let pool = Arc::clone(self);
            let key = key.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                info!("Pooled session {} idle for {:?}, evicting", session_id, idle_timeout);
                pool.evict(&key, &session_id).await;
            })
        };

        slots.entry(key).or_default().push_back(PooledSlot {
            session_id,
            pooled_at: Instant::now(),
            idle_timer,
        });
        info!("Session {} returned to pool ({} pooled)", entry.id, pooled + 1);
        true
    }

    fn take_slot(&self, key: &PoolKey, session_id: &str) -> Option<PooledSlot> {
        let mut slots = self.slots.lock();
        let queue = slots.get_mut(key)?;
        let pos = queue.iter().position(|s| s.session_id == session_id)?;
        let slot = queue.remove(pos);
        if queue.is_empty() {
            slots.remove(key);
        }
        slot
    }

    fn pop_slot(&self, key: &PoolKey) -> Option<PooledSlot> {
        let mut slots = self.slots.lock();
        let queue = slots.get_mut(key)?;
        let slot = queue.pop_front();
        if queue.is_empty() {
            slots.remove(key);
        }
        slot
    }

    /// Take a pooled session for `key` and hand it to `sink`.
    ///
    /// Only a session that is still `Connected` is returned; anything else
    /// found along the way is closed and dropped.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        sink: Arc<dyn EventSink>,
    ) -> Option<Arc<SessionEntry>> {
        while let Some(slot) = self.pop_slot(key) {
            slot.idle_timer.abort();
            let Some(entry) = self.registry.get(&slot.session_id) else {
                continue;
            };

            {
                let mut inner = entry.lock();
                if inner.state == SessionState::Connected && inner.residency == Residency::Pooled {
                    inner.residency = Residency::Active;
                    inner.sink = sink;
                    inner.sink.emit(&entry.id, SessionEvent::Ready);
                    drop(inner);
                    info!("Reusing pooled session {} for {}", entry.id, key);
                    return Some(entry);
                }
            }

            debug!("Discarding pooled session {} ({})", entry.id, entry.state());
            self.registry.remove(&entry.id);
            entry.close().await;
        }
        None
    }

    /// Drop a session from the pool without touching it
    pub(crate) fn forget(&self, key: &PoolKey, session_id: &str) -> bool {
        match self.take_slot(key, session_id) {
            Some(slot) => {
                slot.idle_timer.abort();
                true
            }
            None => false,
        }
    }

    /// Close and remove one pooled session
    async fn evict(&self, key: &PoolKey, session_id: &str) {
        if self.take_slot(key, session_id).is_none() {
            // acquired or forgotten in the meantime
            return;
        }
        if let Some(entry) = self.registry.remove(session_id) {
            entry.close().await;
        }
    }

    /// Evict every pooled session idle for longer than `threshold`
    pub async fn evict_idle(&self, threshold: Duration) -> usize {
        let stale: Vec<(PoolKey, String)> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .flat_map(|(key, queue)| queue.iter().map(move |s| (key, s)))
                .filter(|(_, slot)| {
                    // idle since the later of pooling and last traffic
                    let idle = match self.registry.get(&slot.session_id) {
                        Some(entry) => slot.pooled_at.elapsed().min(entry.idle_for()),
                        None => Duration::MAX,
                    };
                    idle > threshold
                })
                .map(|(key, slot)| (key.clone(), slot.session_id.clone()))
                .collect()
        };

        let mut evicted = 0;
        for (key, session_id) in &stale {
            // acquired or forgotten since the scan
            let Some(slot) = self.take_slot(key, session_id) else {
                continue;
            };
            slot.idle_timer.abort();
            evicted += 1;
            if let Some(entry) = self.registry.remove(session_id) {
                info!("Evicting stale pooled session {}", session_id);
                entry.close().await;
            }
        }
        evicted
    }

    /// Close every pooled session
    pub async fn drain(&self) -> usize {
        let drained: Vec<PooledSlot> = {
            let mut slots = self.slots.lock();
            slots.drain().flat_map(|(_, q)| q).collect()
        };

        for slot in &drained {
            slot.idle_timer.abort();
            if let Some(entry) = self.registry.remove(&slot.session_id) {
                entry.close().await;
            }
        }
        drained.len()
    }
}
