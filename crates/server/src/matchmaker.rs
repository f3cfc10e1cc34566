//! User-connection matchmaker (§4.8).
//!
//! Pairs a public ingress connection with a pooled work-conn: builds the
//! `UserConn`, runs it past the plugin bus, requests a work-conn over the
//! control channel, blocks (with a session-liveness watch) for the matching
//! `NewWorkConn`, then hands both ends to the splice engine.

use std::sync::Arc;
use std::time::Duration;

use retun_core::carrier::BoxedCarrier;
use retun_core::error::{Error, Result};
use retun_core::plugin::{Op, PluginBus};
use retun_core::proxy::Proxy;
use retun_core::session::Session;
use retun_core::splice::{self, DEFAULT_HOOK_INTERVAL};
use retun_core::stream::{self, StreamOptions};
use retun_core::workconn::UserConn;
use retun_proto::msg::{Message, ReqWorkConn, StartWorkConn};
use tokio::sync::mpsc;

/// Default wait for a `ReqWorkConn`→`NewWorkConn` pairing (§4.8
/// `workConnWait`).
pub const WORK_CONN_WAIT: Duration = Duration::from_secs(30);

/// Drives one public ingress connection through the full matchmaking
/// sequence (§4.8 steps 1-4). `control_tx` is the session's control-channel
/// writer queue; `src_addr` is the ingress's observed remote address.
pub async fn handle_user_conn(
    session: Arc<Session>,
    proxy: Arc<Proxy>,
    plugin_bus: &PluginBus,
    control_tx: mpsc::UnboundedSender<Message>,
    ingress: BoxedCarrier,
    src_addr: String,
    version: &str,
    token: &str,
) {
    if !proxy.accepts_new_ingress() {
        log::info!(
            "refusing new ingress on closing proxy {:?} from {}",
            proxy.config.name,
            src_addr
        );
        return;
    }

    let user_conn = UserConn::new(src_addr.clone(), proxy.config.name.clone());

    let content = serde_json::json!({
        "proxy_name": proxy.config.name,
        "remote_addr": src_addr,
    });
    if let Err(e) = plugin_bus
        .dispatch_request(Op::NewUserConn, version, content)
        .await
    {
        log::info!("user-conn from {src_addr} rejected by plugin bus: {e}");
        notify_close(plugin_bus, version, &proxy.config.name, &src_addr).await;
        return;
    }

    proxy.begin_inflight();
    user_conn.mark_paired();

    let result = pair_and_splice(&session, &proxy, &control_tx, ingress, &src_addr, token).await;

    if proxy.end_inflight() {
        log::debug!("proxy {:?} fully drained after closing", proxy.config.name);
    }

    if let Err(e) = result {
        log::info!("user-conn {src_addr} for proxy {:?} failed: {e}", proxy.config.name);
        notify_close(plugin_bus, version, &proxy.config.name, &src_addr).await;
    }
}

async fn pair_and_splice(
    session: &Arc<Session>,
    proxy: &Arc<Proxy>,
    control_tx: &mpsc::UnboundedSender<Message>,
    ingress: BoxedCarrier,
    src_addr: &str,
    token: &str,
) -> Result<()> {
    let pool = session.pool_for(&proxy.config.name);

    control_tx
        .send(Message::ReqWorkConn(ReqWorkConn {
            proxy_name: proxy.config.name.clone(),
        }))
        .map_err(|_| Error::PeerClosed)?;

    let mut work_conn = pool.acquire(WORK_CONN_WAIT, &session.cancel).await?;

    // Plaintext first: the client (crates/client/src/control.rs's
    // `dial_work_conn`) reads `StartWorkConn` before it wraps its end with
    // the proxy's crypto/compression, so the server must write it before
    // wrapping too or the two legs disagree on where the plaintext ends.
    retun_proto::frame::write_message(
        &mut work_conn,
        &Message::StartWorkConn(StartWorkConn {
            proxy_name: proxy.config.name.clone(),
            src_addr: src_addr.to_string(),
            dst_port: None,
        }),
    )
    .await?;

    let opts = StreamOptions {
        use_encryption: proxy.config.use_encryption,
        use_compression: proxy.config.use_compression,
    };
    let work_conn = stream::wrap(work_conn, token, opts);

    let proxy_for_hook = proxy.clone();
    let result = splice::join(ingress, work_conn, DEFAULT_HOOK_INTERVAL, move |in_d, out_d| {
        proxy_for_hook.record_bytes(in_d, out_d);
    })
    .await;

    log::debug!(
        "user-conn {src_addr} for proxy {:?} closed: in={} out={}",
        proxy.config.name,
        result.in_bytes,
        result.out_bytes
    );

    Ok(())
}

async fn notify_close(plugin_bus: &PluginBus, version: &str, proxy_name: &str, src_addr: &str) {
    plugin_bus
        .dispatch_notification(
            Op::CloseUserConn,
            version,
            serde_json::json!({ "proxy_name": proxy_name, "remote_addr": src_addr }),
        )
        .await;
}
