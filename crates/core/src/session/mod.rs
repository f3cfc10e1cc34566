//! Session data model (§3) and registry.
//!
//! `Table<K, V>` and the pre-sized `HashMap` choice are carried over
//! verbatim from the teacher's `session/mod.rs`: an ahash-backed map wrapper
//! that pre-allocates for the expected cardinality (here, the configured
//! work-conn pool size rather than a port range, since that's what a
//! session's tables are keyed by).

pub mod ports;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::HashMap;
use parking_lot::RwLock;
use rand::RngCore;

use crate::proxy::Proxy;
use crate::workconn::Pool;

/// Opaque 32-byte session identifier minted at first login (§3). Stable
/// across reconnects within the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub [u8; 32]);

impl RunId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Pre-sized ahash map, mirroring the teacher's `Table<K, V>` wrapper.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::default())
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = HashMap<K, V>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Monotonic counter for heartbeat/epoch bookkeeping, mirroring the
/// teacher's `Timer`.
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Privilege bits granted at login (§3); currently always empty, since the
/// admin-API surface that would consume them is an explicit Non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Privileges(u8);

impl Privileges {
    pub const NONE: Privileges = Privileges(0);
}

/// One authenticated client bound to one physical control channel and N
/// logical data streams (§3).
pub struct Session {
    pub run_id: RunId,
    pub principal: String,
    pub pool_count: usize,
    pub last_ping_millis: Timer,
    pub proxies: RwLock<Table<String, Arc<Proxy>>>,
    pub work_conns: RwLock<Table<String, Arc<Pool>>>,
    pub privileges: Privileges,
    /// Set when the physical carrier is lost; cleared on a fresh `Login`
    /// reattaching to this RunID within the grace window (§4.7 `Draining`).
    pub draining_since_millis: AtomicU64,
    /// Fired when the control channel is lost, so every task derived from
    /// this session (matchmaker waits, proxy sub-loops, work-conn
    /// provisioning) can cancel within the §5 1s bound instead of each
    /// polling `draining_since_millis` independently.
    pub cancel: tokio::sync::Notify,
}

impl Session {
    pub fn new(run_id: RunId, principal: String, pool_count: usize) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            principal,
            pool_count,
            last_ping_millis: Timer(AtomicU64::new(now_millis())),
            proxies: RwLock::new(Table::default()),
            work_conns: RwLock::new(Table::default()),
            privileges: Privileges::NONE,
            draining_since_millis: AtomicU64::new(0),
            cancel: tokio::sync::Notify::new(),
        })
    }

    /// Signals every task waiting on this session (§5 cancellation
    /// contract) that its control channel is gone.
    pub fn cancel_all(&self) {
        self.cancel.notify_waiters();
    }

    pub fn touch_ping(&self) {
        self.last_ping_millis.set(now_millis());
    }

    /// §4.7: server closes a Session whose last `Ping` is older than 90s.
    pub fn heartbeat_expired(&self, timeout_millis: u64) -> bool {
        now_millis().saturating_sub(self.last_ping_millis.get()) > timeout_millis
    }

    pub fn mark_draining(&self) {
        self.draining_since_millis.store(now_millis(), Ordering::SeqCst);
    }

    pub fn clear_draining(&self) {
        self.draining_since_millis.store(0, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining_since_millis.load(Ordering::SeqCst) != 0
    }

    /// §4.7 `Draining`: grace timer expiry.
    pub fn drain_grace_expired(&self, grace_millis: u64) -> bool {
        let since = self.draining_since_millis.load(Ordering::SeqCst);
        since != 0 && now_millis().saturating_sub(since) > grace_millis
    }

    /// Fetches this session's work-conn pool for `proxy_name`, creating a
    /// fresh `poolCount`-capacity pool on first use (§5 "Work-conn pool:
    /// bounded queue per (session, proxy) with poolCount capacity").
    pub fn pool_for(&self, proxy_name: &str) -> Arc<Pool> {
        if let Some(pool) = self.work_conns.read().get(proxy_name) {
            return pool.clone();
        }

        let mut pools = self.work_conns.write();
        pools
            .entry(proxy_name.to_string())
            .or_insert_with(|| Arc::new(Pool::new(self.pool_count)))
            .clone()
    }

    pub fn remove_pool(&self, proxy_name: &str) {
        self.work_conns.write().remove(proxy_name);
    }
}

/// Server-side registry of live sessions keyed by RunID (§5: "single writer
/// at a time, per-key" — enforced here by locking the whole table for
/// mutation, which is sufficient at the scale this engine targets).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<RunId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.run_id, session);
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<Session>> {
        self.sessions.read().get(run_id).cloned()
    }

    pub fn remove(&self, run_id: &RunId) -> Option<Arc<Session>> {
        self.sessions.write().remove(run_id)
    }

    /// Sweeps sessions that have exceeded their heartbeat timeout or drain
    /// grace window, returning the ones removed so the caller can tear down
    /// their proxies and notify the plugin bus.
    pub fn sweep_expired(&self, heartbeat_timeout_millis: u64, drain_grace_millis: u64) -> Vec<Arc<Session>> {
        let mut expired = Vec::new();
        let mut sessions = self.sessions.write();
        sessions.retain(|_, session| {
            let dead = session.heartbeat_expired(heartbeat_timeout_millis)
                || session.drain_grace_expired(drain_grace_millis);
            if dead {
                expired.push(session.clone());
            }
            !dead
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips_and_sweeps_expired() {
        let registry = SessionRegistry::new();
        let session = Session::new(RunId::generate(), "alice".into(), 5);
        let run_id = session.run_id;
        registry.insert(session);

        assert!(registry.get(&run_id).is_some());

        let stored = registry.get(&run_id).unwrap();
        stored.last_ping_millis.set(0);

        let expired = registry.sweep_expired(90_000, 10_000);
        assert_eq!(expired.len(), 1);
        assert!(registry.get(&run_id).is_none());
    }
}
