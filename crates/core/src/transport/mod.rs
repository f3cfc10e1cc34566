//! Transport adapters (§4.3).
//!
//! A `Transport` is anything that can dial out to, or listen for, a physical
//! carrier the rest of the engine treats uniformly as a [`BoxedCarrier`].
//! TCP and WebSocket are fully implemented; QUIC and KCP are specified as
//! `Transport` implementations too, but deliberately minimal — neither is
//! part of the multiplexing "hard core" this crate scopes in, and both are
//! resolved as Open Questions in DESIGN.md rather than built out fully.

mod kcp;
mod quic;
mod tcp;
mod ws;

pub use kcp::KcpTransport;
pub use quic::QuicTransport;
pub use tcp::TcpTransport;
pub use ws::WebSocketTransport;

use async_trait::async_trait;

use crate::carrier::BoxedCarrier;
use crate::error::Result;

/// A listening endpoint that yields one physical carrier per accepted peer.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<BoxedCarrier>;
}

/// A dialer/listener pair for one wire protocol (§6's `transport.protocol`
/// config key selects among implementors of this trait: `tcp`, `ws`/`wss`,
/// `quic`, `kcp`).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<BoxedCarrier>;
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// Selects a concrete transport by the `transport.protocol` configuration
/// key (§6).
pub fn by_name(name: &str) -> Result<Box<dyn Transport>> {
    match name {
        "tcp" => Ok(Box::new(TcpTransport)),
        "ws" | "wss" => Ok(Box::new(WebSocketTransport)),
        "quic" => Ok(Box::new(QuicTransport::new())),
        "kcp" => Ok(Box::new(KcpTransport)),
        other => Err(crate::error::Error::ConfigInvalid(format!(
            "unknown transport protocol: {other}"
        ))),
    }
}
