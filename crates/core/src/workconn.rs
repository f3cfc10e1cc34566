//! Work-conn pool and user-connection matchmaker (§3 `WorkConn`/`UserConn`,
//! §4.8).
//!
//! `Pool` is the bounded per-`(session, proxy)` queue of idle, pre-
//! authenticated logical streams a client has dialed ahead of need (§5
//! "Work-conn pool: bounded queue ... with `poolCount` capacity"). Sending
//! the `ReqWorkConn`/`StartWorkConn` control messages themselves is the
//! control-plane FSM's job; this module owns only the pooling and FIFO
//! pairing mechanics both the client and server FSMs drive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::time::Instant;

use crate::carrier::BoxedCarrier;
use crate::error::{Error, Result};

/// Bounded FIFO queue of idle work-conns for one `(session, proxy)` pair.
pub struct Pool {
    tx: mpsc::Sender<BoxedCarrier>,
    rx: AsyncMutex<mpsc::Receiver<BoxedCarrier>>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Offers a freshly dialed work-conn to the pool (§4.6 provisioner).
    /// Silently dropped if the pool is already at `poolCount` — the client
    /// over-provisioned and the extra stream is of no use.
    pub fn offer(&self, carrier: BoxedCarrier) {
        let _ = self.tx.try_send(carrier);
    }

    /// Takes the next free work-conn, waiting up to `wait` (§4.8
    /// `workConnWait`, default 30s). `cancel` is notified on session loss so
    /// a blocked matchmaker doesn't outlive its session.
    pub async fn acquire(&self, wait: Duration, cancel: &Notify) -> Result<BoxedCarrier> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.notified() => Err(Error::Canceled),
            result = tokio::time::timeout(wait, rx.recv()) => match result {
                Ok(Some(carrier)) => Ok(carrier),
                Ok(None) => Err(Error::PeerClosed),
                Err(_) => Err(Error::Timeout),
            },
        }
    }
}

/// State of a live public ingress connection awaiting or bound to a
/// work-conn (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserConnState {
    Pending,
    Paired,
    Closed,
}

/// Metadata for one `UserConn` (§4.8 step 1).
pub struct UserConn {
    pub remote_addr: String,
    pub proxy_name: String,
    pub started_at: Instant,
    state: RwLock<UserConnState>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl UserConn {
    pub fn new(remote_addr: String, proxy_name: String) -> Self {
        Self {
            remote_addr,
            proxy_name,
            started_at: Instant::now(),
            state: RwLock::new(UserConnState::Pending),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> UserConnState {
        *self.state.read()
    }

    /// Pairs this UserConn to a work-conn; invariant (§8.1): a paired
    /// UserConn is spliced to exactly one work-conn for its entire
    /// lifetime, so pairing twice is a logic error in the caller.
    pub fn mark_paired(&self) {
        let mut guard = self.state.write();
        debug_assert_eq!(*guard, UserConnState::Pending, "UserConn paired twice");
        *guard = UserConnState::Paired;
    }

    pub fn mark_closed(&self) {
        *self.state.write() = UserConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pool_pairs_fifo_and_times_out_when_empty() {
        let pool = Pool::new(2);
        let cancel = Notify::new();

        let timed_out = pool.acquire(Duration::from_millis(20), &cancel).await;
        assert!(matches!(timed_out, Err(Error::Timeout)));

        let (a, _keep_a) = duplex(16);
        let (b, _keep_b) = duplex(16);
        pool.offer(Box::new(a));
        pool.offer(Box::new(b));

        let first = pool.acquire(Duration::from_millis(50), &cancel).await;
        assert!(first.is_ok());
        let second = pool.acquire(Duration::from_millis(50), &cancel).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn pool_acquire_is_canceled_by_session_loss() {
        let pool = Pool::new(1);
        let cancel = Notify::new();
        cancel.notify_waiters();

        let result = pool.acquire(Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[test]
    fn user_conn_tracks_lifecycle() {
        let conn = UserConn::new("1.2.3.4:1111".into(), "t".into());
        assert_eq!(conn.state(), UserConnState::Pending);
        conn.mark_paired();
        assert_eq!(conn.state(), UserConnState::Paired);
        conn.mark_closed();
        assert_eq!(conn.state(), UserConnState::Closed);
    }
}
