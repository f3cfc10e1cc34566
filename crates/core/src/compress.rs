//! Snappy frame compression wrapper (§4.4), layered outside the crypto
//! wrapper at send and unwrapped before it at receive.
//!
//! Each `poll_write` call's buffer is compressed as one Snappy block (via
//! the `snap` crate's raw block codec, the direct counterpart of the
//! original's `github.com/golang/snappy` dependency) and framed with a
//! 4-byte big-endian length prefix; the reader drains frames back into
//! plaintext. Compression itself is a pure CPU-bound function, so the only
//! asynchronous bookkeeping needed is buffering the length-prefixed frame
//! across multiple `poll_write`/`poll_read` calls.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use snap::raw::{Decoder, Encoder};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

enum WriteState {
    Idle,
    Flushing { frame: Vec<u8>, pos: usize },
}

pub struct CompressWriter<W> {
    inner: W,
    state: WriteState,
    encoder: Encoder,
}

impl<W: AsyncWrite + Unpin> CompressWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            state: WriteState::Idle,
            encoder: Encoder::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                WriteState::Idle => return Poll::Ready(Ok(())),
                WriteState::Flushing { frame, pos } => {
                    if *pos == frame.len() {
                        self.state = WriteState::Idle;
                        return Poll::Ready(Ok(()));
                    }

                    match Pin::new(&mut self.inner).poll_write(cx, &frame[*pos..]) {
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "failed to write compressed frame",
                            )));
                        }
                        Poll::Ready(Ok(n)) => *pos += n,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CompressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other.map(|r| r.map(|()| 0)),
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let compressed = this
            .encoder
            .compress_vec(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let mut frame = Vec::with_capacity(4 + compressed.len());
        frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&compressed);
        this.state = WriteState::Flushing { frame, pos: 0 };

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

enum ReadState {
    Len { buf: [u8; 4], pos: usize },
    Body { buf: Vec<u8>, pos: usize },
    Ready { data: Vec<u8>, pos: usize },
}

pub struct CompressReader<R> {
    inner: R,
    state: ReadState,
    decoder: Decoder,
    // Holds any already-decompressed bytes that didn't fit in the caller's
    // buffer on a previous call.
    pending: VecDeque<u8>,
}

impl<R: AsyncRead + Unpin> CompressReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::Len {
                buf: [0u8; 4],
                pos: 0,
            },
            decoder: Decoder::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CompressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            for _ in 0..n {
                buf.put_slice(&[this.pending.pop_front().unwrap()]);
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.state {
                ReadState::Len { buf: lbuf, pos } => {
                    if *pos == 4 {
                        let len = u32::from_be_bytes(*lbuf) as usize;
                        this.state = ReadState::Body {
                            buf: vec![0u8; len],
                            pos: 0,
                        };
                        continue;
                    }

                    let mut rb = ReadBuf::new(&mut lbuf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let n = rb.filled().len();
                            if n == 0 {
                                if *pos == 0 {
                                    // clean EOF at a frame boundary.
                                    return Poll::Ready(Ok(()));
                                }
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "peer closed mid compressed-frame header",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Body { buf: cbuf, pos } => {
                    if *pos == cbuf.len() {
                        let data = this
                            .decoder
                            .decompress_vec(cbuf)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        this.state = ReadState::Ready { data, pos: 0 };
                        continue;
                    }

                    let mut rb = ReadBuf::new(&mut cbuf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let n = rb.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "peer closed mid compressed-frame body",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Ready { data, pos } => {
                    let remaining = &data[*pos..];
                    let n = remaining.len().min(buf.remaining());
                    buf.put_slice(&remaining[..n]);
                    *pos += n;

                    if *pos == data.len() {
                        this.state = ReadState::Len {
                            buf: [0u8; 4],
                            pos: 0,
                        };
                    } else if n == 0 {
                        // caller's buffer was full; stash the rest.
                        this.pending.extend(remaining.iter().copied());
                        this.state = ReadState::Len {
                            buf: [0u8; 4],
                            pos: 0,
                        };
                    }

                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn round_trips_several_writes() {
        let (client, server) = duplex(8192);
        let (_r, w) = tokio::io::split(client);
        let (r, _w) = tokio::io::split(server);

        let mut writer = CompressWriter::new(w);
        let mut reader = CompressReader::new(r);

        let chunk_a = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let chunk_b = b"totally different bytes, less compressible maybe".to_vec();

        let writer_task = tokio::spawn({
            let (a, b) = (chunk_a.clone(), chunk_b.clone());
            async move {
                writer.write_all(&a).await.unwrap();
                writer.flush().await.unwrap();
                writer.write_all(&b).await.unwrap();
                writer.flush().await.unwrap();
            }
        });

        let mut got_a = vec![0u8; chunk_a.len()];
        reader.read_exact(&mut got_a).await.unwrap();
        assert_eq!(got_a, chunk_a);

        let mut got_b = vec![0u8; chunk_b.len()];
        reader.read_exact(&mut got_b).await.unwrap();
        assert_eq!(got_b, chunk_b);

        writer_task.await.unwrap();
    }
}
