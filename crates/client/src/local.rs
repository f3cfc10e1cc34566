//! Local backend dialer (§3 "local service"), the client's half of a spliced
//! connection.
//!
//! SPEC_FULL.md §9 scopes out the static-file/HTTP-reverse-proxy/SOCKS5
//! local handlers the original ships (`plugin/{static_file,http_proxy,
//! socks5}.go`) as a fixed, pluggable interface instead: every proxy dials
//! its configured `local_addr` over TCP, and a future local handler only
//! needs to implement [`LocalHandler`] to slot in.

use async_trait::async_trait;
use retun_core::carrier::BoxedCarrier;
use retun_core::error::{Error, Result};
use tokio::net::TcpStream;

/// Produces a fresh connection to a proxy's local backend. One call per
/// work-conn that needs splicing.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn dial(&self, local_addr: &str) -> Result<BoxedCarrier>;
}

/// Default handler: plain TCP dial, matching every built-in proxy type's
/// local side (§4.6 Running).
pub struct TcpLocalHandler;

#[async_trait]
impl LocalHandler for TcpLocalHandler {
    async fn dial(&self, local_addr: &str) -> Result<BoxedCarrier> {
        let stream = TcpStream::connect(local_addr)
            .await
            .map_err(|e| Error::TransportDial(format!("{local_addr}: {e}")))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_handler_dials_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let handler = TcpLocalHandler;
        let dialed = handler.dial(&addr).await;
        assert!(dialed.is_ok());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_handler_fails_against_nothing_listening() {
        let handler = TcpLocalHandler;
        let result = handler.dial("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
