//! Client-side control-plane state machine (§4.6 "Running", §4.7 mirrored
//! from the client's perspective).
//!
//! One physical carrier to the server carries `Login → LoginResp →` a
//! serving loop that multiplexes heartbeats, proxy registration, work-conn
//! provisioning, and XTCP rendezvous relay — the same frames
//! `crates/server/src/control.rs` drives from the other end, read here in
//! reverse.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use retun_core::carrier::BoxedCarrier;
use retun_core::error::{Error, Result};
use retun_core::proxy::ProxyState;
use retun_core::splice::{self, DEFAULT_HOOK_INTERVAL};
use retun_core::stream::{self, StreamOptions};
use retun_core::xtcp;
use retun_proto::frame::{self, DEFAULT_MAX_MESSAGE_SIZE};
use retun_proto::msg::{
    Login, LoginResp, Message, NewProxy, NewWorkConn, Ping, Pong, ReqWorkConn, StartWorkConn,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::state::ClientState;
use crate::visitor;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "1.0";

/// Exponential backoff between reconnect attempts (§8 S4 "backoff
/// monotonicity"). `current` tracks the pre-jitter delay so tests (and
/// callers wanting a predictable schedule) can assert it never decreases;
/// [`Backoff::next_delay`] only applies jitter to the value it returns.
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Returns a jittered delay (±25%) and advances `current` for next time.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_frac = rand::rng().random_range(0.75..1.25);
        let jittered = self.current.mul_f64(jitter_frac);
        self.current = (self.current * 2).min(self.max);
        jittered
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Whether this client needs an authenticated control channel at all:
/// STCP/SUDP visitors dial the server directly per-connection with no login
/// (§4.10 step 1's sibling path), but a client with registered proxies or
/// any XTCP visitor (which relays `NatHoleVisitor` over its own control
/// channel) needs one.
pub fn needs_control_channel(state: &ClientState) -> bool {
    !state.config.proxies.is_empty()
        || state
            .config
            .visitors
            .iter()
            .any(|v| v.visitor_type == retun_proto::msg::ProxyType::Xtcp)
}

/// Reconnect loop: dials, logs in, serves until the connection drops, then
/// backs off and retries forever. Returns only on an unrecoverable config
/// error (e.g. an unknown transport protocol), never on a transient network
/// failure.
pub async fn run(state: Arc<ClientState>) -> anyhow::Result<()> {
    let mut backoff = Backoff::default();

    loop {
        match connect_and_run(&state).await {
            Ok(()) => {
                log::info!("control channel closed cleanly, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                log::warn!("control channel error: {e}, retrying in {:?}", backoff.current());
            }
        }

        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn connect_and_run(state: &Arc<ClientState>) -> anyhow::Result<()> {
    let server_addr = state.config.server_addr.to_string();
    let carrier = state.transport.dial(&server_addr).await?;

    let run_id = state.run_id.lock().clone();
    let timestamp = now_millis();
    let login = Login {
        version: PROTOCOL_VERSION.to_string(),
        hostname: hostname(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        user: state.config.user.clone(),
        token_proof: xtcp::sign(&state.config.auth.token, "login", timestamp),
        run_id,
        pool_count: state.config.transport.pool_count,
        metas: Default::default(),
        timestamp,
    };

    let (mut read_half, mut write_half) = tokio::io::split(carrier);

    frame::write_message(&mut write_half, &Message::Login(login)).await?;

    let resp = timeout(
        LOGIN_TIMEOUT,
        frame::read_message(&mut read_half, DEFAULT_MAX_MESSAGE_SIZE),
    )
    .await
    .map_err(|_| anyhow::anyhow!("login timed out"))??;

    let LoginResp { run_id, error, .. } = match resp {
        Message::LoginResp(r) => r,
        other => anyhow::bail!("expected LoginResp, got {:?}", other.msg_type()),
    };
    if !error.is_empty() {
        anyhow::bail!("login rejected: {error}");
    }

    log::info!("logged in, run_id={run_id}");
    *state.run_id.lock() = Some(run_id.clone());

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if frame::write_message(&mut write_half, &msg).await.is_err() {
                break;
            }
        }
    });

    register_all_proxies(state, &writer_tx);

    let xtcp_visitors: Vec<_> = state
        .config
        .visitors
        .iter()
        .filter(|v| v.visitor_type == retun_proto::msg::ProxyType::Xtcp)
        .cloned()
        .collect();
    let xtcp_tasks: Vec<_> = xtcp_visitors
        .into_iter()
        .map(|v| {
            let state = state.clone();
            let writer_tx = writer_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = visitor::serve_xtcp_visitor(state, v, writer_tx).await {
                    log::warn!("xtcp visitor listener ended: {e}");
                }
            })
        })
        .collect();

    let heartbeat = {
        let writer_tx = writer_tx.clone();
        let interval = Duration::from_secs(state.config.transport.heartbeat_interval_secs);
        tokio::spawn(async move { heartbeat_loop(writer_tx, interval).await })
    };

    let serving = serving_loop(state, &mut read_half, &writer_tx).await;

    heartbeat.abort();
    for task in xtcp_tasks {
        task.abort();
    }
    drop(writer_tx);
    let _ = writer_task.await;

    serving
}

async fn heartbeat_loop(writer_tx: mpsc::UnboundedSender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let timestamp = now_millis();
        if writer_tx.send(Message::Ping(Ping { timestamp })).is_err() {
            return;
        }
    }
}

fn register_all_proxies(state: &Arc<ClientState>, writer_tx: &mpsc::UnboundedSender<Message>) {
    for proxy in state.proxies.read().values() {
        proxy.set_state(ProxyState::Registering);
        let _ = writer_tx.send(Message::NewProxy(NewProxy {
            proxy: proxy.entry.wire.clone(),
        }));
    }
}

async fn serving_loop(
    state: &Arc<ClientState>,
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    writer_tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    loop {
        let msg = frame::read_message(read_half, DEFAULT_MAX_MESSAGE_SIZE).await?;

        match msg {
            Message::Ping(Ping { timestamp }) => {
                let _ = writer_tx.send(Message::Pong(Pong { timestamp }));
            }
            Message::Pong(_) => {}
            Message::NewProxyResp(m) => {
                let proxies = state.proxies.read();
                if let Some(proxy) = proxies.get(&m.proxy_name) {
                    if m.error.is_empty() {
                        proxy.set_state(ProxyState::Active);
                        log::info!(
                            "proxy {:?} registered (remote_port={:?})",
                            m.proxy_name,
                            m.remote_port
                        );
                    } else {
                        proxy.set_state(ProxyState::Closed);
                        log::warn!("proxy {:?} rejected: {}", m.proxy_name, m.error);
                    }
                }
            }
            Message::ReqWorkConn(ReqWorkConn { proxy_name }) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = dial_work_conn(&state, &proxy_name).await {
                        log::debug!("work-conn for proxy {proxy_name:?} failed: {e}");
                    }
                });
            }
            Message::NatHoleClient(m) => {
                // §9: the server never replies with a resolved peer address
                // for the proxy-owner side of a rendezvous (no `NatHoleResp`
                // is constructed in `crates/server/src/control.rs`), so this
                // client has nothing actionable to do yet beyond logging the
                // request; honoring it fully requires that server-side wire
                // gap to close first.
                log::debug!("NatHoleClient for proxy {:?} sid={} (relay-only)", m.proxy_name, m.sid);
            }
            Message::NatHoleResp(resp) => {
                if let Some(tx) = state.pending_nat_hole.lock().remove(&resp.sid) {
                    let _ = tx.send(resp);
                }
            }
            other => {
                log::debug!("server sent unhandled op {:?}", other.msg_type());
            }
        }
    }
}

/// §4.6 "work-conn provisioner": dials a fresh carrier, announces it with
/// `NewWorkConn`, waits for the server to pair it via `StartWorkConn`, then
/// splices it to the proxy's local backend.
async fn dial_work_conn(state: &Arc<ClientState>, proxy_name: &str) -> Result<()> {
    let proxy = state
        .proxies
        .read()
        .get(proxy_name)
        .cloned()
        .ok_or_else(|| Error::Internal(format!("unknown proxy {proxy_name:?}")))?;

    let run_id = state.run_id.lock().clone().ok_or(Error::Internal("no run_id yet".into()))?;

    let server_addr = state.config.server_addr.to_string();
    let mut work_conn: BoxedCarrier = state.transport.dial(&server_addr).await?;

    frame::write_message(
        &mut work_conn,
        &Message::NewWorkConn(NewWorkConn {
            run_id,
            proxy_name: proxy_name.to_string(),
        }),
    )
    .await?;

    let msg = frame::read_message(&mut work_conn, DEFAULT_MAX_MESSAGE_SIZE).await?;
    let StartWorkConn { src_addr, .. } = match msg {
        Message::StartWorkConn(m) => m,
        other => return Err(Error::ProtocolViolation(format!("expected StartWorkConn, got {:?}", other.msg_type()))),
    };

    let opts = StreamOptions {
        use_encryption: proxy.entry.wire.use_encryption,
        use_compression: proxy.entry.wire.use_compression,
    };
    let work_conn = stream::wrap(work_conn, &state.config.auth.token, opts);

    let local_conn = proxy.local_handler.dial(&proxy.entry.local_addr).await?;

    let proxy_for_hook = proxy.clone();
    let result = splice::join(work_conn, local_conn, DEFAULT_HOOK_INTERVAL, move |in_d, out_d| {
        proxy_for_hook.record_bytes(in_d, out_d);
    })
    .await;

    log::debug!(
        "work-conn for proxy {proxy_name:?} from {src_addr} closed: in={} out={}",
        result.in_bytes,
        result.out_bytes
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_non_decreasing_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            backoff.next_delay();
            let current = backoff.current();
            assert!(current >= last, "backoff must never decrease");
            last = current;
        }
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_resets_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }
}
