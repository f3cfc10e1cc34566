//! Visitor drivers (§3 `Visitor`, §4.10).
//!
//! STCP/SUDP visitors need no control channel of their own: each accepted
//! local connection dials the server fresh and proves knowledge of the
//! target proxy's secret via `NewVisitorConn`, mirroring
//! `crates/server/src/control.rs`'s `handle_visitor_conn` on the other end.
//! XTCP additionally relays a `NatHoleVisitor` over an authenticated control
//! channel first (§4.10 step 2), which is why [`serve_xtcp_visitor`] takes
//! the control channel's writer queue as a parameter instead of dialing
//! independently.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use retun_core::carrier::BoxedCarrier;
use retun_core::error::{Error, Result};
use retun_core::stream::{self, StreamOptions};
use retun_core::splice::{self, DEFAULT_HOOK_INTERVAL};
use retun_core::xtcp;
use retun_proto::frame::{self, DEFAULT_MAX_MESSAGE_SIZE};
use retun_proto::msg::{Message, NatHoleVisitor, NewVisitorConn, NewVisitorConnResp};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::config::VisitorConfig;
use crate::state::ClientState;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn bind_target(visitor: &VisitorConfig) -> Option<String> {
    let port = visitor.bind_port?;
    let addr = visitor.bind_addr.clone().unwrap_or_else(|| "127.0.0.1".to_string());
    Some(format!("{addr}:{port}"))
}

/// Spawns one accept loop per configured STCP/SUDP visitor. Returns
/// immediately; listeners run for the lifetime of the process, independent
/// of the control channel's own reconnect cycle.
pub fn spawn_stcp_sudp_visitors(state: &Arc<ClientState>) {
    for visitor in &state.config.visitors {
        if visitor.visitor_type == retun_proto::msg::ProxyType::Xtcp {
            continue;
        }
        let state = state.clone();
        let visitor = visitor.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_direct_visitor(state, visitor).await {
                log::warn!("visitor listener ended: {e}");
            }
        });
    }
}

async fn serve_direct_visitor(state: Arc<ClientState>, visitor: VisitorConfig) -> anyhow::Result<()> {
    let Some(bind_addr) = bind_target(&visitor) else {
        log::warn!("visitor {:?} has no bind_port configured, skipping", visitor.name);
        return Ok(());
    };

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("visitor {:?} listening on {bind_addr}", visitor.name);

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        let visitor = visitor.clone();
        tokio::spawn(async move {
            if let Err(e) = dial_and_splice(&state, &visitor, Box::new(stream)).await {
                log::debug!("visitor {:?} connection from {peer} failed: {e}", visitor.name);
            }
        });
    }
}

/// Dials the target proxy directly (STCP/SUDP path, and the XTCP fallback
/// path once a punch attempt has given up).
async fn dial_and_splice(state: &Arc<ClientState>, visitor: &VisitorConfig, local_conn: BoxedCarrier) -> Result<()> {
    dial_and_splice_named(state, &visitor.server_name, &visitor.secret_key, visitor.use_encryption, visitor.use_compression, local_conn).await
}

async fn dial_and_splice_named(
    state: &Arc<ClientState>,
    proxy_name: &str,
    secret_key: &str,
    use_encryption: bool,
    use_compression: bool,
    local_conn: BoxedCarrier,
) -> Result<()> {
    let server_addr = state.config.server_addr.to_string();
    let mut carrier = state.transport.dial(&server_addr).await?;

    let timestamp = now_millis();
    frame::write_message(
        &mut carrier,
        &Message::NewVisitorConn(NewVisitorConn {
            proxy_name: proxy_name.to_string(),
            sign: xtcp::sign(secret_key, proxy_name, timestamp),
            timestamp,
            use_encryption,
            use_compression,
        }),
    )
    .await?;

    let msg = frame::read_message(&mut carrier, DEFAULT_MAX_MESSAGE_SIZE).await?;
    let NewVisitorConnResp { error, .. } = match msg {
        Message::NewVisitorConnResp(m) => m,
        other => return Err(Error::ProtocolViolation(format!("expected NewVisitorConnResp, got {:?}", other.msg_type()))),
    };
    if !error.is_empty() {
        return Err(Error::AuthRejected(error));
    }

    let opts = StreamOptions {
        use_encryption,
        use_compression,
    };
    let carrier = stream::wrap(carrier, &state.config.auth.token, opts);

    let result = splice::join(carrier, local_conn, DEFAULT_HOOK_INTERVAL, |_, _| {}).await;
    log::debug!("visitor connection to {proxy_name:?} closed: in={} out={}", result.in_bytes, result.out_bytes);

    Ok(())
}

fn random_sid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Runs one XTCP visitor's accept loop for the lifetime of the control
/// channel that spawned it (callers abort this task on disconnect).
pub async fn serve_xtcp_visitor(
    state: Arc<ClientState>,
    visitor: VisitorConfig,
    writer_tx: mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    let Some(bind_addr) = bind_target(&visitor) else {
        log::warn!("xtcp visitor {:?} has no bind_port configured, skipping", visitor.name);
        return Ok(());
    };

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("xtcp visitor {:?} listening on {bind_addr}", visitor.name);

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        let visitor = visitor.clone();
        let writer_tx = writer_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_xtcp_connection(&state, &visitor, &writer_tx, Box::new(stream)).await {
                log::debug!("xtcp visitor {:?} connection from {peer} failed: {e}", visitor.name);
            }
        });
    }
}

/// §4.10 steps 2-6: relay `NatHoleVisitor`, wait (bounded by
/// `fallback_timeout_ms`) for a resolved peer address, and either punch
/// directly or fall back to a plain STCP-style dial of `fallback_to`.
async fn handle_xtcp_connection(
    state: &Arc<ClientState>,
    visitor: &VisitorConfig,
    writer_tx: &mpsc::UnboundedSender<Message>,
    local_conn: BoxedCarrier,
) -> Result<()> {
    let sid = random_sid();
    let timestamp = now_millis();

    let (tx, rx) = oneshot::channel();
    state.pending_nat_hole.lock().insert(sid.clone(), tx);

    writer_tx
        .send(Message::NatHoleVisitor(NatHoleVisitor {
            sid: sid.clone(),
            proxy_name: visitor.server_name.clone(),
            owner_user: visitor.server_user.clone().unwrap_or_default(),
            sign: xtcp::sign(&visitor.secret_key, &sid, timestamp),
            timestamp,
        }))
        .map_err(|_| Error::PeerClosed)?;

    let resolved = match visitor.fallback_timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), rx).await.ok(),
        None => Some(rx.await),
    };
    state.pending_nat_hole.lock().remove(&sid);

    match resolved {
        Some(Ok(resp)) if resp.error.is_empty() => {
            let candidate = resp
                .candidates
                .first()
                .or_else(|| resp.assisted_addrs.first())
                .ok_or_else(|| Error::Internal("no candidates in NatHoleResp".into()))?;
            let carrier = state.transport.dial(candidate).await?;
            let opts = StreamOptions {
                use_encryption: visitor.use_encryption,
                use_compression: visitor.use_compression,
            };
            let carrier = stream::wrap(carrier, &state.config.auth.token, opts);
            let result = splice::join(carrier, local_conn, DEFAULT_HOOK_INTERVAL, |_, _| {}).await;
            log::debug!(
                "xtcp punch to {:?} closed: in={} out={}",
                visitor.server_name,
                result.in_bytes,
                result.out_bytes
            );
            Ok(())
        }
        Some(Ok(resp)) => Err(Error::AuthRejected(resp.error)),
        Some(Err(_)) => Err(Error::PeerClosed),
        // Timed out waiting for a `NatHoleResp` (§9: the server never
        // constructs one today), fall back per the visitor's config.
        None => match &visitor.fallback_to {
            Some(fallback_proxy) => {
                dial_and_splice_named(
                    state,
                    fallback_proxy,
                    &visitor.secret_key,
                    visitor.use_encryption,
                    visitor.use_compression,
                    local_conn,
                )
                .await
            }
            None => Err(Error::Timeout),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_target_requires_port() {
        let visitor = VisitorConfig {
            name: "v".into(),
            visitor_type: retun_proto::msg::ProxyType::Stcp,
            server_user: None,
            server_name: "x".into(),
            secret_key: "s".into(),
            bind_addr: None,
            bind_port: None,
            use_encryption: false,
            use_compression: false,
            fallback_to: None,
            fallback_timeout_ms: None,
            keep_tunnel_open: false,
            max_retries_an_hour: 8,
            min_retry_interval_secs: 180,
        };
        assert!(bind_target(&visitor).is_none());
    }

    #[test]
    fn bind_target_defaults_loopback() {
        let mut visitor_base = VisitorConfig {
            name: "v".into(),
            visitor_type: retun_proto::msg::ProxyType::Stcp,
            server_user: None,
            server_name: "x".into(),
            secret_key: "s".into(),
            bind_addr: None,
            bind_port: Some(6000),
            use_encryption: false,
            use_compression: false,
            fallback_to: None,
            fallback_timeout_ms: None,
            keep_tunnel_open: false,
            max_retries_an_hour: 8,
            min_retry_interval_secs: 180,
        };
        assert_eq!(bind_target(&visitor_base).as_deref(), Some("127.0.0.1:6000"));

        visitor_base.bind_addr = Some("0.0.0.0".into());
        assert_eq!(bind_target(&visitor_base).as_deref(), Some("0.0.0.0:6000"));
    }

    #[test]
    fn random_sid_is_32_hex_chars() {
        let sid = random_sid();
        assert_eq!(sid.len(), 32);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
