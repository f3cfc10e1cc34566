//! WebSocket transport, grounded on `tokio-tungstenite` (the same crate and
//! version the TURN signaling binary in the retrieval pack depends on).
//!
//! `WebSocketStream` speaks in `Message` frames, not raw bytes, so each
//! connection is bridged to a byte-oriented [`BoxedCarrier`] by two
//! background tasks plumbing binary frames through a `tokio::io::duplex`
//! pipe — the same bridging idiom used for logical streams in [`crate::mux`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Listener, Transport};
use crate::carrier::BoxedCarrier;
use crate::error::{Error, Result};

pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedCarrier> {
        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{addr}")
        };

        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        Ok(bridge(ws))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        Ok(Box::new(WsListenerAdapter(listener)))
    }
}

struct WsListenerAdapter(TcpListener);

#[async_trait]
impl Listener for WsListenerAdapter {
    async fn accept(&mut self) -> Result<BoxedCarrier> {
        let (stream, _addr) = self
            .0
            .accept()
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        Ok(bridge(ws))
    }
}

/// Spawns the read/write bridging tasks and returns the application-facing
/// half of the duplex pipe as a [`BoxedCarrier`].
fn bridge(ws: WebSocketStream<TcpStream>) -> BoxedCarrier {
    let (mut sink, mut stream) = ws.split();

    let (app_side, internal_side) = tokio::io::duplex(64 * 1024);
    let (mut internal_read, mut internal_write) = tokio::io::split(internal_side);

    // Outbound: bytes written by the application arrive on `internal_read`;
    // forward each chunk as one binary frame.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match internal_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound: binary frames from the peer are written into
    // `internal_write`, which the application reads from `app_side`.
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if internal_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = internal_write.shutdown().await;
    });

    Box::new(app_side)
}
