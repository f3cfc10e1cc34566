//! Stream multiplexer (§4.2).
//!
//! Many ordered, reliable, flow-controlled logical streams over one
//! physical carrier. Used whenever `tcpMux`-style sharing is enabled so a
//! client's work-conn pool doesn't need one physical dial per pooled
//! connection (the `transport.tcpMux` key in SPEC_FULL.md §6's
//! configuration table).
//!
//! Each logical stream is backed by a pair of `tokio::io::duplex` pipes: one
//! local buffer for bytes queued to go out, one for bytes delivered from the
//! peer. A single background task per mux instance owns the physical
//! carrier and fans frames in and out to per-stream handles; per-stream
//! sender tasks apply credit-based flow control before putting `Data`
//! frames on the wire. Because the shared reader task writes inbound
//! payload into a stream's bounded duplex buffer, a slow consumer on one
//! stream does apply backpressure to the whole carrier — a deliberate
//! simplification over a fully independent per-stream read path, noted here
//! rather than silently.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Semaphore, mpsc};

use crate::carrier::BoxedCarrier;
use crate::error::{Error, Result};

/// Per-stream and overall send/receive buffering target (§4.2).
pub const DEFAULT_WINDOW: usize = 256 * 1024;
const FRAME_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Open = 0,
    Data = 1,
    WindowUpdate = 2,
    Close = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameType {
    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Open,
            1 => Self::Data,
            2 => Self::WindowUpdate,
            3 => Self::Close,
            4 => Self::Ping,
            5 => Self::Pong,
            _ => return None,
        })
    }
}

struct Frame {
    kind: FrameType,
    stream_id: u32,
    payload: Vec<u8>,
}

impl Frame {
    async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.kind as u8).await?;
        w.write_u32(self.stream_id).await?;
        w.write_u32(self.payload.len() as u32).await?;
        if !self.payload.is_empty() {
            w.write_all(&self.payload).await?;
        }
        Ok(())
    }

    async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Self>> {
        let tag = match r.read_u8().await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };

        let kind = FrameType::from_tag(tag)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad mux frame"))?;
        let stream_id = r.read_u32().await?;
        let len = r.read_u32().await? as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            r.read_exact(&mut payload).await?;
        }

        Ok(Some(Self {
            kind,
            stream_id,
            payload,
        }))
    }
}

struct StreamHandle {
    /// Reader task writes inbound payload bytes here; the application reads
    /// from the other end via `MuxStream`.
    inbound_tx: tokio::io::DuplexStream,
    send_credit: Arc<Semaphore>,
}

struct Shared {
    streams: Mutex<HashMap<u32, StreamHandle>>,
    writer_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU32,
}

/// Handle to a running multiplexer instance. Dropping it does not close the
/// underlying carrier; call [`Mux::close`] for a synchronous shutdown of
/// every stream (§5 cancellation contract).
pub struct Mux {
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<BoxedCarrier>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Mux {
    /// Spawns the reader and writer tasks driving `carrier` and returns a
    /// handle for opening/accepting logical streams.
    pub fn new(carrier: BoxedCarrier) -> Arc<Self> {
        let (mut reader, mut writer) = tokio::io::split(carrier);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel::<BoxedCarrier>();

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            writer_tx: writer_tx.clone(),
            next_id: AtomicU32::new(1),
        });

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if frame.write_to(&mut writer).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        {
            let shared = shared.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match Frame::read_from(&mut reader).await {
                        Ok(Some(frame)) => {
                            Self::dispatch_inbound(&shared, &accept_tx, frame).await;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                closed.store(true, Ordering::SeqCst);
                Self::shutdown_all(&shared);
            });
        }

        Arc::new(Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
            closed,
        })
    }

    async fn dispatch_inbound(
        shared: &Arc<Shared>,
        accept_tx: &mpsc::UnboundedSender<BoxedCarrier>,
        frame: Frame,
    ) {
        match frame.kind {
            FrameType::Open => {
                let stream = Self::register_stream(shared, frame.stream_id, false);
                let _ = accept_tx.send(stream);
            }
            FrameType::Data => {
                // Write under a short-lived clone so we don't hold the map
                // lock across the (potentially blocking-on-backpressure)
                // write.
                let inbound = {
                    let mut streams = shared.streams.lock();
                    streams.get_mut(&frame.stream_id).map(|h| h.inbound_tx.clone())
                };
                if let Some(mut inbound) = inbound {
                    let _ = inbound.write_all(&frame.payload).await;
                }
            }
            FrameType::WindowUpdate => {
                let credit = {
                    let streams = shared.streams.lock();
                    streams.get(&frame.stream_id).map(|h| h.send_credit.clone())
                };
                if let Some(credit) = credit {
                    if frame.payload.len() == 4 {
                        let delta = u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
                        credit.add_permits(delta as usize);
                    }
                }
            }
            FrameType::Close => {
                shared.streams.lock().remove(&frame.stream_id);
            }
            FrameType::Ping | FrameType::Pong => {}
        }
    }

    fn shutdown_all(shared: &Arc<Shared>) {
        shared.streams.lock().clear();
    }

    fn register_stream(shared: &Arc<Shared>, id: u32, initiator: bool) -> BoxedCarrier {
        // Outbound half: app writes here, a sender task drains it with
        // credit-gated Data frames.
        let (app_write, mut internal_read) = tokio::io::duplex(DEFAULT_WINDOW);
        // Inbound half: reader task writes Data payload here, app reads it.
        let (internal_write, app_read) = tokio::io::duplex(DEFAULT_WINDOW);

        let send_credit = Arc::new(Semaphore::new(DEFAULT_WINDOW));

        shared.streams.lock().insert(
            id,
            StreamHandle {
                inbound_tx: internal_write,
                send_credit: send_credit.clone(),
            },
        );

        let writer_tx = shared.writer_tx.clone();
        if initiator {
            let _ = writer_tx.send(Frame {
                kind: FrameType::Open,
                stream_id: id,
                payload: Vec::new(),
            });
        }

        tokio::spawn(async move {
            let mut buf = vec![0u8; FRAME_CHUNK];
            loop {
                let n = match internal_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };

                let Ok(permit) = send_credit.clone().acquire_many_owned(n as u32).await else {
                    break;
                };
                permit.forget();

                if writer_tx
                    .send(Frame {
                        kind: FrameType::Data,
                        stream_id: id,
                        payload: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }

            let _ = writer_tx.send(Frame {
                kind: FrameType::Close,
                stream_id: id,
                payload: Vec::new(),
            });
        });

        Box::new(MuxStream {
            read_half: CreditingReader {
                inner: app_read,
                stream_id: id,
                unacked: 0,
                writer_tx: shared.writer_tx.clone(),
            },
            write_half: app_write,
        })
    }

    /// Opens a new logical stream and notifies the peer with an `Open`
    /// frame; the peer surfaces it from its own `accept_stream`.
    pub async fn open_stream(self: &Arc<Self>) -> Result<BoxedCarrier> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerClosed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Self::register_stream(&self.shared, id, true))
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<BoxedCarrier> {
        self.accept_rx
            .lock()
            .recv()
            .await
            .ok_or(Error::PeerClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Synchronously closes every open stream (§5: within 1s of carrier
    /// loss in practice, immediate here since it's driven by the same
    /// event that observed the loss).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        Self::shutdown_all(&self.shared);
    }
}

/// Wraps a duplex read half, emitting `WindowUpdate` frames back to the
/// peer as the application consumes bytes, replenishing the peer's send
/// credit for this stream.
struct CreditingReader {
    inner: tokio::io::DuplexStream,
    stream_id: u32,
    unacked: u32,
    writer_tx: mpsc::UnboundedSender<Frame>,
}

impl AsyncRead for CreditingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = (buf.filled().len() - before) as u32;
            if n > 0 {
                this.unacked += n;
                if this.unacked >= (DEFAULT_WINDOW as u32) / 2 {
                    let delta = this.unacked;
                    this.unacked = 0;
                    let _ = this.writer_tx.send(Frame {
                        kind: FrameType::WindowUpdate,
                        stream_id: this.stream_id,
                        payload: delta.to_be_bytes().to_vec(),
                    });
                }
            }
        }

        result
    }
}

struct MuxStream {
    read_half: CreditingReader,
    write_half: tokio::io::DuplexStream,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().read_half).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().write_half).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().write_half).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().write_half).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn opens_a_stream_and_exchanges_bytes() {
        let (carrier_a, carrier_b) = duplex(1 << 20);
        let mux_a = Mux::new(Box::new(carrier_a));
        let mux_b = Mux::new(Box::new(carrier_b));

        let mut stream_a = mux_a.open_stream().await.unwrap();
        let accept = tokio::spawn(async move { mux_b.accept_stream().await.unwrap() });

        stream_a.write_all(b"hello mux").await.unwrap();
        stream_a.flush().await.unwrap();

        let mut stream_b = accept.await.unwrap();
        let mut buf = vec![0u8; 9];
        stream_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello mux");

        stream_b.write_all(b"reply!").await.unwrap();
        let mut buf2 = vec![0u8; 6];
        stream_a.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"reply!");
    }
}
