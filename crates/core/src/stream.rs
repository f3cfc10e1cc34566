//! Combinators for layering the crypto/compression wrappers (§4.4) over a
//! [`BoxedCarrier`] and recombining the resulting read/write halves back
//! into a single full-duplex stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::carrier::{BoxedCarrier, Carrier};
use crate::compress::{CompressReader, CompressWriter};
use crate::crypto::{DecryptReader, EncryptWriter};

/// Joins an independent reader and writer into one [`Carrier`].
pub struct JoinedCarrier<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> JoinedCarrier<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AsyncRead for JoinedCarrier<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AsyncWrite for JoinedCarrier<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Negotiated per-work-conn stream options (§4.4), carried alongside a
/// [`crate::proxy::ProxyState`] and applied identically by both legs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    pub use_encryption: bool,
    pub use_compression: bool,
}

/// Applies the configured crypto/compression layers to a raw carrier.
///
/// Order at send is plaintext → compress → encrypt → mux stream, so
/// encryption wraps the mux carrier first and compression wraps that.
pub fn wrap(carrier: BoxedCarrier, token: &str, opts: StreamOptions) -> BoxedCarrier {
    let carrier: BoxedCarrier = if opts.use_encryption {
        let (r, w) = tokio::io::split(carrier);
        Box::new(JoinedCarrier {
            reader: DecryptReader::new(r, token),
            writer: EncryptWriter::new(w, token),
        })
    } else {
        carrier
    };

    if opts.use_compression {
        let (r, w) = tokio::io::split(carrier);
        Box::new(JoinedCarrier {
            reader: CompressReader::new(r),
            writer: CompressWriter::new(w),
        })
    } else {
        carrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn wrap_round_trips_with_both_layers() {
        let (client, server) = duplex(65536);
        let token = "shared-secret";
        let opts = StreamOptions {
            use_encryption: true,
            use_compression: true,
        };

        let mut client_wrapped = wrap(Box::new(client), token, opts);
        let mut server_wrapped = wrap(Box::new(server), token, opts);

        let payload = b"round trip through compress+encrypt".repeat(50);

        let send_payload = payload.clone();
        let sender = tokio::spawn(async move {
            client_wrapped.write_all(&send_payload).await.unwrap();
            client_wrapped.flush().await.unwrap();
        });

        let mut received = vec![0u8; payload.len()];
        server_wrapped.read_exact(&mut received).await.unwrap();
        sender.await.unwrap();

        assert_eq!(received, payload);
    }
}
