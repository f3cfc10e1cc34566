//! Public-facing ingress (§4.8, §4.9): one accept loop per registered
//! TCP/UDP proxy port, plus the shared HTTP/HTTPS vhost listeners that
//! dispatch by Host header / TLS SNI across every registered domain.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ahash::HashMap;
use retun_core::carrier::BoxedCarrier;
use retun_core::proxy::Proxy;
use retun_core::session::Session;
use retun_core::vhost::{self, AUTH_FAILURE_DELAY};
use retun_proto::msg::{Message, ProxyType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::matchmaker;
use crate::state::ServerState;

const API_VERSION: &str = "1.0";

/// Starts the public accept loop for a freshly activated TCP or UDP proxy,
/// bound to its allocated port. A no-op for proxy types that don't bind a
/// public listener (HTTP/HTTPS share the vhost listeners; STCP/SUDP/XTCP
/// have no public port at all).
pub fn spawn_proxy_listener(
    state: Arc<ServerState>,
    session: Arc<Session>,
    proxy: Arc<Proxy>,
    control_tx: mpsc::UnboundedSender<Message>,
) {
    let Some(port) = proxy.allocated_port else { return };
    let bind_addr = SocketAddr::new(state.config.bind_addr.ip(), port);

    match proxy.config.proxy_type {
        ProxyType::Tcp => {
            tokio::spawn(serve_tcp_proxy(state, session, proxy, control_tx, bind_addr));
        }
        ProxyType::Udp => {
            tokio::spawn(serve_udp_proxy(state, session, proxy, control_tx, bind_addr));
        }
        _ => {}
    }
}

async fn serve_tcp_proxy(
    state: Arc<ServerState>,
    session: Arc<Session>,
    proxy: Arc<Proxy>,
    control_tx: mpsc::UnboundedSender<Message>,
    bind_addr: SocketAddr,
) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::warn!("failed to bind public TCP port {bind_addr} for {:?}: {e}", proxy.config.name);
            return;
        }
    };
    log::info!("proxy {:?} listening on {bind_addr}/tcp", proxy.config.name);

    while proxy.accepts_new_ingress() {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed on {bind_addr}: {e}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let session = session.clone();
        let proxy = proxy.clone();
        let control_tx = control_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            matchmaker::handle_user_conn(
                session,
                proxy,
                &state.plugin_bus,
                control_tx,
                Box::new(stream),
                peer.to_string(),
                API_VERSION,
                &state.config.auth.token,
            )
            .await;
        });
    }
}

/// UDP has no connection to accept; each distinct peer address is treated
/// as one logical UserConn, backed by an in-memory channel pair pumped
/// to/from the shared socket for as long as that peer stays active.
async fn serve_udp_proxy(
    state: Arc<ServerState>,
    session: Arc<Session>,
    proxy: Arc<Proxy>,
    control_tx: mpsc::UnboundedSender<Message>,
    bind_addr: SocketAddr,
) {
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::warn!("failed to bind public UDP port {bind_addr} for {:?}: {e}", proxy.config.name);
            return;
        }
    };
    log::info!("proxy {:?} listening on {bind_addr}/udp", proxy.config.name);

    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::default();
    let mut buf = vec![0u8; 64 * 1024];

    while proxy.accepts_new_ingress() {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("udp recv failed on {bind_addr}: {e}");
                continue;
            }
        };
        let datagram = buf[..len].to_vec();

        if let Some(tx) = peers.get(&peer) {
            if tx.try_send(datagram).is_ok() {
                continue;
            }
            peers.remove(&peer);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let _ = inbound_tx.try_send(buf[..len].to_vec());
        peers.insert(peer, inbound_tx);

        let carrier: BoxedCarrier = Box::new(UdpPeerCarrier::new(socket.clone(), peer, inbound_rx));

        let session = session.clone();
        let proxy = proxy.clone();
        let control_tx = control_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            matchmaker::handle_user_conn(
                session,
                proxy,
                &state.plugin_bus,
                control_tx,
                carrier,
                peer.to_string(),
                API_VERSION,
                &state.config.auth.token,
            )
            .await;
        });
    }
}

/// One UDP peer's view of the shared socket, wrapped as a [`Carrier`] so
/// the matchmaker and splice engine don't need to know the transport is
/// connectionless underneath.
struct UdpPeerCarrier {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl UdpPeerCarrier {
    fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            inbound,
            pending: Vec::new(),
        }
    }
}

impl AsyncRead for UdpPeerCarrier {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                if n < datagram.len() {
                    self.pending = datagram[n..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpPeerCarrier {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let socket = self.socket.clone();
        let peer = self.peer;
        let payload = buf.to_vec();
        let len = payload.len();
        tokio::spawn(async move {
            let _ = socket.send_to(&payload, peer).await;
        });
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Replays the bytes already consumed while sniffing a request's routing
/// key (HTTP request line / TLS ClientHello) ahead of whatever the
/// backend still has to send, so the work-conn sees the byte stream
/// exactly as the client sent it.
struct ReplayCarrier {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: TcpStream,
}

impl ReplayCarrier {
    fn new(prefix: Vec<u8>, inner: TcpStream) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl AsyncRead for ReplayCarrier {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = self.prefix.len() - self.prefix_pos;
            let n = remaining.min(buf.remaining());
            let start = self.prefix_pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayCarrier {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Looks up the session/control-tx pair needed to matchmake against a
/// vhost-resolved proxy.
fn control_tx_for(state: &Arc<ServerState>, proxy_name: &str) -> Option<(Arc<Session>, mpsc::UnboundedSender<Message>)> {
    let session = state.proxy_index.read().get(proxy_name).map(|(s, _)| s.clone())?;
    let control_tx = state.control_senders.read().get(&session.run_id).cloned()?;
    Some((session, control_tx))
}

/// §4.9: shared HTTP listener on `vhost.http-port`, dispatching by Host
/// header and optional path prefix across every registered domain.
pub async fn serve_http_vhost(state: Arc<ServerState>) {
    let bind_addr = SocketAddr::new(state.config.bind_addr.ip(), state.config.vhost.http_port);
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind HTTP vhost port {bind_addr}: {e}");
            return;
        }
    };
    log::info!("HTTP vhost listening on {bind_addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("HTTP vhost accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_http_ingress(state, stream, peer).await {
                log::debug!("HTTP vhost connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_http_ingress(state: Arc<ServerState>, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 8192];
    let mut filled = 0usize;

    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(());
        }
        filled += n;

        let parsed = match vhost::parse_request_head(&buf[..filled]) {
            Ok(parsed) => parsed,
            Err(retun_core::error::Error::ProtocolViolation(m)) if m.contains("incomplete") => {
                if filled == buf.len() {
                    buf.resize(buf.len() * 2, 0);
                }
                continue;
            }
            Err(_) => {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n").await;
                return Ok(());
            }
        };

        let Some(proxy) = state.vhost.resolve(&parsed.host, &parsed.path, None) else {
            stream.write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n").await?;
            return Ok(());
        };

        if let (Some(expected_user), Some(expected_pass)) =
            (proxy.config.http_user.as_deref(), proxy.config.http_password.as_deref())
        {
            let authorized = parsed
                .authorization
                .as_deref()
                .and_then(vhost::decode_basic_auth)
                .map(|(u, p)| u == expected_user && p == expected_pass)
                .unwrap_or(false);

            if !authorized {
                tokio::time::sleep(AUTH_FAILURE_DELAY).await;
                stream
                    .write_all(b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        }

        if !state.limiter.allow(&proxy.config.name, &state.plugin_bus, API_VERSION).await {
            stream
                .write_all(b"HTTP/1.1 429 Too Many Requests\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }

        let Some((session, control_tx)) = control_tx_for(&state, &proxy.config.name) else {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n").await?;
            return Ok(());
        };

        let carrier: BoxedCarrier = Box::new(ReplayCarrier::new(buf[..filled].to_vec(), stream));
        matchmaker::handle_user_conn(
            session,
            proxy,
            &state.plugin_bus,
            control_tx,
            carrier,
            peer.to_string(),
            API_VERSION,
            &state.config.auth.token,
        )
        .await;
        return Ok(());
    }
}

/// §4.9: shared HTTPS listener on `vhost.https-port`. Routes by SNI
/// without terminating TLS, matching the default pass-through mode; a
/// provisioned-certificate termination mode is an Open Question left for
/// a follow-up (see DESIGN.md).
pub async fn serve_https_vhost(state: Arc<ServerState>) {
    let bind_addr = SocketAddr::new(state.config.bind_addr.ip(), state.config.vhost.https_port);
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind HTTPS vhost port {bind_addr}: {e}");
            return;
        }
    };
    log::info!("HTTPS vhost listening on {bind_addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("HTTPS vhost accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_https_ingress(state, stream, peer).await {
                log::debug!("HTTPS vhost connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_https_ingress(state: Arc<ServerState>, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut filled = 0usize;

    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(());
        }
        filled += n;

        if let Some(domain) = vhost::extract_sni(&buf[..filled]) {
            let Some(proxy) = state.vhost.resolve(&domain, "", None) else {
                return Ok(());
            };

            if !state.limiter.allow(&proxy.config.name, &state.plugin_bus, API_VERSION).await {
                return Ok(());
            }

            let Some((session, control_tx)) = control_tx_for(&state, &proxy.config.name) else {
                return Ok(());
            };

            let carrier: BoxedCarrier = Box::new(ReplayCarrier::new(buf[..filled].to_vec(), stream));
            matchmaker::handle_user_conn(
                session,
                proxy,
                &state.plugin_bus,
                control_tx,
                carrier,
                peer.to_string(),
                API_VERSION,
                &state.config.auth.token,
            )
            .await;
            return Ok(());
        }

        if filled == buf.len() {
            log::debug!("giving up on SNI sniffing from {peer}: ClientHello too large or malformed");
            return Ok(());
        }
    }
}
