//! Server-side control-plane state machine (§4.7).
//!
//! One physical carrier dialed by a client passes through
//! `Greeted → Authenticated → Serving → Draining → Closed`. The very first
//! frame on *any* freshly accepted carrier decides its role: `Login` starts
//! a control channel (this module owns its whole lifetime from then on),
//! `NewWorkConn` hands the carrier straight to a session's work-conn pool,
//! and `NewVisitorConn` routes it to the STCP/SUDP matchmaking path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use retun_core::carrier::BoxedCarrier;
use retun_core::error::Error;
use retun_core::plugin::Op;
use retun_core::proxy::Proxy;
use retun_core::session::{RunId, Session};
use retun_core::stream::{self, StreamOptions};
use retun_core::vhost::AUTH_FAILURE_DELAY;
use retun_core::xtcp;
use retun_proto::frame::{self, DEFAULT_MAX_MESSAGE_SIZE};
use retun_proto::msg::{
    CloseProxy, Login, LoginResp, Message, NatHoleClient, NewProxy, NewProxyResp, NewVisitorConn,
    NewVisitorConnResp, NewWorkConn, Ping, Pong, ProxyType,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::matchmaker;
use crate::state::ServerState;

const GREET_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_GRACE: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "1.0";

/// Accepts the control listener and dispatches each fresh carrier by its
/// first frame's role.
pub async fn serve_control(state: Arc<ServerState>, bind_addr: SocketAddr) -> anyhow::Result<()> {
    let mut listener = state.transport.listen(&bind_addr.to_string()).await?;
    log::info!("control channel listening on {bind_addr}");

    loop {
        let carrier = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("control listener accept failed: {e}");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = route_fresh_carrier(state, carrier).await {
                log::debug!("fresh carrier handling ended: {e}");
            }
        });
    }
}

async fn route_fresh_carrier(state: Arc<ServerState>, mut carrier: BoxedCarrier) -> anyhow::Result<()> {
    let first = timeout(
        GREET_TIMEOUT,
        frame::read_message(&mut carrier, DEFAULT_MAX_MESSAGE_SIZE),
    )
    .await
    .map_err(|_| anyhow::anyhow!("greeting timed out"))??;

    match first {
        Message::Login(login) => handle_control_channel(state, carrier, login).await,
        Message::NewWorkConn(m) => handle_work_conn(state, carrier, m).await,
        Message::NewVisitorConn(m) => handle_visitor_conn(state, carrier, m).await,
        other => {
            log::debug!("rejecting unexpected first frame {:?}", other.msg_type());
            Err(anyhow::anyhow!("unexpected first frame"))
        }
    }
}

/// §4.7 `Authenticated` → `Serving` → `Draining`.
async fn handle_control_channel(
    state: Arc<ServerState>,
    carrier: BoxedCarrier,
    login: Login,
) -> anyhow::Result<()> {
    let proof_ok = xtcp::verify(&state.config.auth.token, "login", login.timestamp, &login.token_proof);
    if !proof_ok {
        log::warn!("login rejected for user {:?}: bad token proof", login.user);
        return Err(anyhow::anyhow!("auth rejected"));
    }

    let login_content = serde_json::to_value(&login).unwrap_or(serde_json::Value::Null);
    if let Err(e) = state
        .plugin_bus
        .dispatch_request(Op::Login, PROTOCOL_VERSION, login_content)
        .await
    {
        log::info!("login rejected by plugin bus for user {:?}: {e}", login.user);
        return Err(e.into());
    }

    let session = resolve_session(&state, &login);
    session.clear_draining();
    state
        .sessions_by_principal
        .write()
        .insert(login.user.clone(), session.clone());

    let (mut read_half, mut write_half) = tokio::io::split(carrier);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
    state.control_senders.write().insert(session.run_id, writer_tx.clone());

    frame::write_message(
        &mut write_half,
        &Message::LoginResp(LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: session.run_id.to_string(),
            error: String::new(),
        }),
    )
    .await?;

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if frame::write_message(&mut write_half, &msg).await.is_err() {
                break;
            }
        }
    });

    log::info!(
        "session {} authenticated for user {:?} (pool_count={})",
        session.run_id,
        login.user,
        login.pool_count
    );

    let result = serving_loop(&state, &session, &mut read_half, &writer_tx).await;

    state.control_senders.write().remove(&session.run_id);
    drop(writer_tx);
    let _ = writer_task.await;

    if let Err(e) = result {
        log::info!("session {} control read loop ended: {e}", session.run_id);
    }

    enter_draining(&state, &session).await;
    Ok(())
}

fn resolve_session(state: &Arc<ServerState>, login: &Login) -> Arc<Session> {
    if let Some(existing_id) = login.run_id.as_deref().and_then(parse_run_id) {
        if let Some(existing) = state.sessions.get(&existing_id) {
            if existing.principal == login.user {
                log::info!("session {existing_id} resumed by user {:?}", login.user);
                return existing;
            }
        }
    }

    let session = Session::new(RunId::generate(), login.user.clone(), login.pool_count.max(1) as usize);
    state.sessions.insert(session.clone());
    session
}

fn parse_run_id(hex: &str) -> Option<RunId> {
    if hex.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(RunId(bytes))
}

/// How often the heartbeat deadline is checked independent of other traffic
/// (§4.7/§5: the 90s timeout must fire even on a silent/half-open carrier
/// that never hands the read loop a frame to return from).
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves only once the session's last `Ping` is older than
/// `timeout_millis` (§4.7), polling every [`HEARTBEAT_CHECK_INTERVAL`].
/// Ticks that don't find the deadline expired loop internally rather than
/// resolving, so racing this against `frame::read_message` in a
/// `tokio::select!` never cancels a read that's mid-frame: the read side
/// only loses if the deadline has genuinely passed, at which point the
/// carrier is being torn down anyway.
async fn watch_heartbeat(session: &Session, timeout_millis: u64) {
    let mut tick = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    tick.tick().await;
    loop {
        tick.tick().await;
        if session.heartbeat_expired(timeout_millis) {
            return;
        }
    }
}

async fn serving_loop(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    writer_tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    let heartbeat_timeout_millis = state.heartbeat_timeout().as_millis() as u64;

    loop {
        let msg = tokio::select! {
            biased;
            _ = watch_heartbeat(session, heartbeat_timeout_millis) => {
                return Err(Error::Timeout.into());
            }
            result = frame::read_message(read_half, DEFAULT_MAX_MESSAGE_SIZE) => result?,
        };

        match msg {
            Message::Ping(Ping { timestamp }) => {
                session.touch_ping();
                let _ = writer_tx.send(Message::Pong(Pong { timestamp }));
            }
            Message::NewProxy(m) => handle_new_proxy(state, session, writer_tx, m).await,
            Message::CloseProxy(CloseProxy { proxy_name }) => {
                handle_close_proxy(state, session, &proxy_name).await
            }
            Message::NatHoleVisitor(m) => handle_nat_hole_visitor(state, m).await,
            Message::NatHoleReport(m) => {
                log::debug!(
                    "NatHoleReport sid={} success={} (relay-only, no address deduction wired)",
                    m.sid,
                    m.success
                );
            }
            other => {
                log::debug!("session {} sent unhandled op {:?}", session.run_id, other.msg_type());
            }
        }
    }
}

/// §4.10 step 2-3: the visitor's secret proof is checked against the target
/// proxy's `secret_key`, then `NatHoleClient` is relayed to the proxy
/// owner's control channel so both sides can begin probing.
async fn handle_nat_hole_visitor(state: &Arc<ServerState>, m: retun_proto::msg::NatHoleVisitor) {
    let target = state.proxy_index.read().get(&m.proxy_name).map(|(s, p)| (s.clone(), p.clone()));
    let Some((owner_session, proxy)) = target else {
        log::info!("NatHoleVisitor for unknown proxy {:?}", m.proxy_name);
        return;
    };

    let secret = proxy.config.secret_key.clone().unwrap_or_default();
    if !xtcp::verify(&secret, &m.sid, m.timestamp, &m.sign) {
        log::warn!("NatHoleVisitor for proxy {:?} failed secret proof", m.proxy_name);
        return;
    }

    state.xtcp.open(m.sid.clone(), m.proxy_name.clone(), m.owner_user.clone());

    let _ = send_to_session(
        state,
        &owner_session,
        Message::NatHoleClient(NatHoleClient {
            sid: m.sid,
            proxy_name: m.proxy_name,
        }),
    );
}

fn send_to_session(state: &Arc<ServerState>, session: &Arc<Session>, msg: Message) -> Result<(), Error> {
    let senders = state.control_senders.read();
    senders
        .get(&session.run_id)
        .ok_or(Error::PeerClosed)?
        .send(msg)
        .map_err(|_| Error::PeerClosed)
}

async fn handle_new_proxy(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    writer_tx: &mpsc::UnboundedSender<Message>,
    m: NewProxy,
) {
    let plugin_content = serde_json::to_value(&m.proxy).unwrap_or(serde_json::Value::Null);
    if let Err(e) = state
        .plugin_bus
        .dispatch_request(Op::NewProxy, PROTOCOL_VERSION, plugin_content)
        .await
    {
        let _ = writer_tx.send(Message::NewProxyResp(NewProxyResp {
            proxy_name: m.proxy.name.clone(),
            remote_port: None,
            error: e.to_string(),
        }));
        return;
    }

    if session.proxies.read().contains_key(&m.proxy.name) || state.proxy_index.read().contains_key(&m.proxy.name) {
        let _ = writer_tx.send(Message::NewProxyResp(NewProxyResp {
            proxy_name: m.proxy.name.clone(),
            remote_port: None,
            error: "proxy name already registered".to_string(),
        }));
        return;
    }

    let allocated_port = match allocate_port(state, m.proxy.proxy_type, m.proxy.remote_port) {
        Ok(port) => port,
        Err(e) => {
            let _ = writer_tx.send(Message::NewProxyResp(NewProxyResp {
                proxy_name: m.proxy.name.clone(),
                remote_port: None,
                error: e,
            }));
            return;
        }
    };

    let proxy = Arc::new(Proxy::new(session.run_id, m.proxy.clone(), allocated_port));

    if m.proxy.proxy_type.binds_public_endpoint() && !m.proxy.custom_domains.is_empty() {
        if let Err(e) = state.vhost.register(proxy.clone()) {
            if let Some(port) = allocated_port {
                release_port(state, m.proxy.proxy_type, port);
            }
            let _ = writer_tx.send(Message::NewProxyResp(NewProxyResp {
                proxy_name: m.proxy.name.clone(),
                remote_port: None,
                error: e.to_string(),
            }));
            return;
        }
    }

    proxy.activate();
    session.proxies.write().insert(m.proxy.name.clone(), proxy.clone());
    state
        .proxy_index
        .write()
        .insert(m.proxy.name.clone(), (session.clone(), proxy.clone()));

    crate::listeners::spawn_proxy_listener(state.clone(), session.clone(), proxy, writer_tx.clone());

    let _ = writer_tx.send(Message::NewProxyResp(NewProxyResp {
        proxy_name: m.proxy.name.clone(),
        remote_port: allocated_port,
        error: String::new(),
    }));
}

/// TCP/UDP reserve a public port (a specific one if requested, else any
/// free one in range); every other proxy type is discoverable purely via
/// the control channel and needs none.
fn allocate_port(state: &Arc<ServerState>, proxy_type: ProxyType, requested: Option<u16>) -> Result<Option<u16>, String> {
    let allocator = match proxy_type {
        ProxyType::Tcp => &state.tcp_ports,
        ProxyType::Udp => &state.udp_ports,
        _ => return Ok(None),
    };

    let mut allocator = allocator.lock();
    let port = match requested.filter(|p| *p != 0) {
        Some(p) => allocator.alloc_specific(p),
        None => allocator.alloc(None),
    };

    port.map(Some).ok_or_else(|| "no ports available in the configured range".to_string())
}

fn release_port(state: &Arc<ServerState>, proxy_type: ProxyType, port: u16) {
    match proxy_type {
        ProxyType::Tcp => state.tcp_ports.lock().restore(port),
        ProxyType::Udp => state.udp_ports.lock().restore(port),
        _ => {}
    }
}

/// §9 resolved policy: mark `Closing` immediately (refusing new ingress),
/// but let in-flight UserConns drain naturally before releasing the port
/// and route.
async fn handle_close_proxy(state: &Arc<ServerState>, session: &Arc<Session>, proxy_name: &str) {
    let proxy = { session.proxies.read().get(proxy_name).cloned() };
    let Some(proxy) = proxy else { return };

    proxy.begin_closing();

    state
        .plugin_bus
        .dispatch_notification(
            Op::CloseProxy,
            PROTOCOL_VERSION,
            serde_json::json!({ "proxy_name": proxy_name }),
        )
        .await;

    if proxy.inflight_count() == 0 {
        finalize_proxy_close(state, session, &proxy);
    }
}

fn finalize_proxy_close(state: &Arc<ServerState>, session: &Arc<Session>, proxy: &Arc<Proxy>) {
    proxy.close();
    if proxy.config.proxy_type.binds_public_endpoint() && !proxy.config.custom_domains.is_empty() {
        state.vhost.unregister(proxy);
    }
    if let Some(port) = proxy.allocated_port {
        release_port(state, proxy.config.proxy_type, port);
    }
    session.proxies.write().remove(&proxy.config.name);
    session.remove_pool(&proxy.config.name);
    state.proxy_index.write().remove(&proxy.config.name);
}

async fn enter_draining(state: &Arc<ServerState>, session: &Arc<Session>) {
    session.mark_draining();
    session.cancel_all();
    log::info!("session {} draining for {:?}", session.run_id, DRAIN_GRACE);

    tokio::time::sleep(DRAIN_GRACE).await;

    if session.drain_grace_expired(DRAIN_GRACE.as_millis() as u64) {
        log::info!("session {} grace window expired, tearing down", session.run_id);
        let proxies: Vec<_> = session.proxies.read().values().cloned().collect();
        for proxy in proxies {
            proxy.begin_closing();
            if proxy.inflight_count() == 0 {
                finalize_proxy_close(state, session, &proxy);
            }
        }
        state.sessions.remove(&session.run_id);
    }
}

async fn handle_work_conn(state: Arc<ServerState>, carrier: BoxedCarrier, m: NewWorkConn) -> anyhow::Result<()> {
    let run_id = parse_run_id(&m.run_id).ok_or_else(|| anyhow::anyhow!("malformed run_id"))?;
    let session = state
        .sessions
        .get(&run_id)
        .ok_or_else(|| anyhow::anyhow!("unknown session for work-conn"))?;

    let pool = session.pool_for(&m.proxy_name);
    pool.offer(carrier);
    Ok(())
}

/// STCP/SUDP ingress: a visitor dials a fresh carrier directly (not over
/// its own control channel) and proves knowledge of the target proxy's
/// secret before being paired into the matchmaker like any other UserConn
/// (§4.8, §4.10 step 1's STCP/SUDP sibling path).
async fn handle_visitor_conn(
    state: Arc<ServerState>,
    mut carrier: BoxedCarrier,
    m: NewVisitorConn,
) -> anyhow::Result<()> {
    let owning = state.proxy_index.read().get(&m.proxy_name).map(|(s, p)| (s.clone(), p.clone()));

    let Some((session, proxy)) = owning else {
        frame::write_message(
            &mut carrier,
            &Message::NewVisitorConnResp(NewVisitorConnResp {
                proxy_name: m.proxy_name,
                error: "no such proxy".to_string(),
            }),
        )
        .await?;
        return Ok(());
    };

    let secret = proxy.config.secret_key.clone().unwrap_or_default();
    if !xtcp::verify(&secret, &m.proxy_name, m.timestamp, &m.sign) {
        tokio::time::sleep(AUTH_FAILURE_DELAY).await;
        frame::write_message(
            &mut carrier,
            &Message::NewVisitorConnResp(NewVisitorConnResp {
                proxy_name: m.proxy_name,
                error: "bad secret".to_string(),
            }),
        )
        .await?;
        return Ok(());
    }

    frame::write_message(
        &mut carrier,
        &Message::NewVisitorConnResp(NewVisitorConnResp {
            proxy_name: m.proxy_name.clone(),
            error: String::new(),
        }),
    )
    .await?;

    let opts = StreamOptions {
        use_encryption: m.use_encryption,
        use_compression: m.use_compression,
    };
    let carrier = stream::wrap(carrier, &state.config.auth.token, opts);

    let control_tx = state.control_senders.read().get(&session.run_id).cloned();
    let Some(control_tx) = control_tx else {
        return Ok(());
    };

    matchmaker::handle_user_conn(
        session,
        proxy,
        &state.plugin_bus,
        control_tx,
        carrier,
        "visitor".to_string(),
        PROTOCOL_VERSION,
        &state.config.auth.token,
    )
    .await;

    Ok(())
}
