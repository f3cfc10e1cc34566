//! Symmetric stream encryption wrapper (§4.4).
//!
//! A random 16-byte salt is written once by the writer side; both sides
//! derive `(aes_key, iv, mac_key)` from the pre-shared token and that salt
//! via PBKDF2-HMAC-SHA256, then AES-256-CTR covers confidentiality. Because
//! CTR keystreams are a pure function of byte offset, `StreamCipherSeek`
//! lets each side reseek the cipher to the exact offset a given poll is
//! operating on instead of hand-rolling partial-write bookkeeping.
//!
//! The accompanying HMAC-SHA256 runs continuously over the ciphertext and
//! is exposed via `tag()` for out-of-band integrity checks (e.g. a session
//! audit or the plugin bus comparing tags at teardown); it is not framed
//! into the stream as a per-chunk AEAD, since that would require a framing
//! format this wrapper's callers (the mux layer) don't otherwise need.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type CtrAes256 = ctr::Ctr128BE<Aes256>;

pub const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 4096;
const KEY_MATERIAL_LEN: usize = 32 + 16 + 32;

struct KeyMaterial {
    aes_key: [u8; 32],
    iv: [u8; 16],
    mac_key: [u8; 32],
}

fn derive_key(token: &str, salt: &[u8; SALT_LEN]) -> KeyMaterial {
    let mut okm = [0u8; KEY_MATERIAL_LEN];
    pbkdf2_hmac::<Sha256>(token.as_bytes(), salt, PBKDF2_ITERATIONS, &mut okm);

    let mut aes_key = [0u8; 32];
    let mut iv = [0u8; 16];
    let mut mac_key = [0u8; 32];
    aes_key.copy_from_slice(&okm[0..32]);
    iv.copy_from_slice(&okm[32..48]);
    mac_key.copy_from_slice(&okm[48..80]);

    KeyMaterial {
        aes_key,
        iv,
        mac_key,
    }
}

enum WriteState {
    Salt { pos: usize },
    Body,
}

pub struct EncryptWriter<W> {
    inner: W,
    salt: [u8; SALT_LEN],
    state: WriteState,
    cipher: CtrAes256,
    mac: Hmac<Sha256>,
    offset: u64,
}

impl<W: AsyncWrite + Unpin> EncryptWriter<W> {
    pub fn new(inner: W, token: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let km = derive_key(token, &salt);

        Self {
            inner,
            salt,
            state: WriteState::Salt { pos: 0 },
            cipher: CtrAes256::new(&km.aes_key.into(), &km.iv.into()),
            mac: Hmac::<Sha256>::new_from_slice(&km.mac_key).expect("hmac accepts any key length"),
            offset: 0,
        }
    }

    /// Running HMAC tag over all ciphertext written so far.
    pub fn tag(&self) -> [u8; 32] {
        self.mac.clone().finalize().into_bytes().into()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match this.state {
                WriteState::Salt { pos } => {
                    if pos == SALT_LEN {
                        this.state = WriteState::Body;
                        continue;
                    }

                    match Pin::new(&mut this.inner).poll_write(cx, &this.salt[pos..]) {
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "failed to write encryption salt",
                            )));
                        }
                        Poll::Ready(Ok(n)) => this.state = WriteState::Salt { pos: pos + n },
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                WriteState::Body => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    let mut scratch = buf.to_vec();
                    this.cipher
                        .try_seek(this.offset)
                        .expect("offset within CTR keystream period");
                    this.cipher.apply_keystream(&mut scratch);

                    return match Pin::new(&mut this.inner).poll_write(cx, &scratch) {
                        Poll::Ready(Ok(n)) => {
                            this.mac.update(&scratch[..n]);
                            this.offset += n as u64;
                            Poll::Ready(Ok(n))
                        }
                        other => other,
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum ReadState {
    Salt { buf: [u8; SALT_LEN], pos: usize },
    Body,
}

pub struct DecryptReader<R> {
    inner: R,
    token: String,
    state: ReadState,
    cipher: Option<CtrAes256>,
    mac: Option<Hmac<Sha256>>,
    offset: u64,
}

impl<R: AsyncRead + Unpin> DecryptReader<R> {
    pub fn new(inner: R, token: &str) -> Self {
        Self {
            inner,
            token: token.to_string(),
            state: ReadState::Salt {
                buf: [0u8; SALT_LEN],
                pos: 0,
            },
            cipher: None,
            mac: None,
            offset: 0,
        }
    }

    pub fn tag(&self) -> Option<[u8; 32]> {
        self.mac.as_ref().map(|m| m.clone().finalize().into_bytes().into())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                ReadState::Salt { buf: salt, pos } => {
                    if *pos == SALT_LEN {
                        let km = derive_key(&this.token, salt);
                        this.cipher = Some(CtrAes256::new(&km.aes_key.into(), &km.iv.into()));
                        this.mac = Some(
                            Hmac::<Sha256>::new_from_slice(&km.mac_key)
                                .expect("hmac accepts any key length"),
                        );
                        this.state = ReadState::Body;
                        continue;
                    }

                    let mut rb = ReadBuf::new(&mut salt[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let n = rb.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "peer closed before sending encryption salt",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Body => {
                    let before = buf.filled().len();
                    return match Pin::new(&mut this.inner).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            let after = buf.filled().len();
                            if after > before {
                                let mac = this.mac.as_mut().expect("derived on salt completion");
                                mac.update(&buf.filled()[before..after]);

                                let cipher =
                                    this.cipher.as_mut().expect("derived on salt completion");
                                cipher
                                    .try_seek(this.offset)
                                    .expect("offset within CTR keystream period");
                                cipher.apply_keystream(&mut buf.filled_mut()[before..after]);
                                this.offset += (after - before) as u64;
                            }
                            Poll::Ready(Ok(()))
                        }
                        other => other,
                    };
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
    async fn round_trips_arbitrary_bytes() {
        let (client, server) = duplex(8192);
        let token = "correct horse battery staple";

        let (_r, w) = tokio::io::split(client);
        let (r, _w) = tokio::io::split(server);

        let mut writer = EncryptWriter::new(w, token);
        let mut reader = DecryptReader::new(r, token);

        let payload = b"the quick brown fox jumps over the lazy dog".repeat(37);

        let writer_task = tokio::spawn({
            let payload = payload.clone();
            async move {
                writer.write_all(&payload).await.unwrap();
                writer.flush().await.unwrap();
                writer
            }
        });

        let mut received = vec![0u8; payload.len()];
        reader.read_exact(&mut received).await.unwrap();

        let writer = writer_task.await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(reader.tag(), Some(writer.tag()));
    }
}
