//! Plain TCP transport, the default `transport.protocol` (§6).

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{Listener, Transport};
use crate::carrier::BoxedCarrier;
use crate::error::{Error, Result};

pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedCarrier> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        Ok(Box::new(TcpListenerAdapter(listener)))
    }
}

struct TcpListenerAdapter(TcpListener);

#[async_trait]
impl Listener for TcpListenerAdapter {
    async fn accept(&mut self) -> Result<BoxedCarrier> {
        let (stream, _addr) = self
            .0
            .accept()
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
