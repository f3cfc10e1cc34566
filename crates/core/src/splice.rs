//! Bidirectional copy engine (§4.5).
//!
//! Grounded directly on `patch/io.go`'s `Join`/`CopyBufferWithHook`: two
//! directions copied concurrently, each with a reusable buffer, an
//! accumulated byte delta flushed to a hook on a fixed interval or at
//! closure, and a close-once guarantee so neither direction can double-close
//! the shared endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::carrier::BoxedCarrier;

/// Default interval between telemetry hook invocations while a direction is
/// actively flowing (§4.5).
pub const DEFAULT_HOOK_INTERVAL: Duration = Duration::from_secs(5);

const BUFFER_SIZE: usize = 16 * 1024;

/// Final byte counts for both directions of a completed splice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceResult {
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Splices `a` and `b` together: bytes read from `a` go to `b` ("in") and
/// vice versa ("out"). `hook` is invoked with `(in_delta, out_delta)` at
/// most once per `interval` while data is flowing, and exactly once more at
/// close with any remaining delta. Closing either direction (I/O error or
/// clean EOF) cancels the other via `Notify`, guaranteeing no lost bytes on
/// clean EOF and no double-close.
pub async fn join<H>(a: BoxedCarrier, b: BoxedCarrier, interval: Duration, hook: H) -> SpliceResult
where
    H: Fn(u64, u64) + Send + Sync + 'static,
{
    let hook = Arc::new(hook);
    let cancel = Arc::new(Notify::new());

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let in_hook = hook.clone();
    let in_cancel = cancel.clone();
    let a_to_b = tokio::spawn(async move {
        let result = copy_with_hook(
            &mut a_read,
            &mut b_write,
            interval,
            &in_cancel,
            move |n| in_hook(n, 0),
        )
        .await;
        let _ = b_write.shutdown().await;
        result
    });

    let out_hook = hook.clone();
    let out_cancel = cancel.clone();
    let b_to_a = tokio::spawn(async move {
        let result = copy_with_hook(
            &mut b_read,
            &mut a_write,
            interval,
            &out_cancel,
            move |n| out_hook(0, n),
        )
        .await;
        let _ = a_write.shutdown().await;
        result
    });

    let in_bytes = a_to_b.await.unwrap_or(0);
    cancel.notify_waiters();
    let out_bytes = b_to_a.await.unwrap_or(0);

    SpliceResult {
        in_bytes,
        out_bytes,
    }
}

async fn copy_with_hook<R, W, F>(
    src: &mut R,
    dst: &mut W,
    interval: Duration,
    cancel: &Notify,
    hook: F,
) -> u64
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    let mut delta = 0u64;
    let mut last_flush = Instant::now();

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.notified() => break,
            result = src.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            },
        };

        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }

        total += n as u64;
        delta += n as u64;

        let now = Instant::now();
        if now.duration_since(last_flush) >= interval {
            hook(delta);
            delta = 0;
            last_flush = now;
        }
    }

    if delta > 0 {
        hook(delta);
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::duplex;

    #[tokio::test]
    async fn splices_both_directions_and_reports_totals() {
        let (client_a, mut test_a) = duplex(4096);
        let (client_b, mut test_b) = duplex(4096);

        let in_count = Arc::new(AtomicU64::new(0));
        let out_count = Arc::new(AtomicU64::new(0));
        let in_count2 = in_count.clone();
        let out_count2 = out_count.clone();

        let splice = tokio::spawn(async move {
            join(
                Box::new(client_a),
                Box::new(client_b),
                Duration::from_millis(10),
                move |i, o| {
                    in_count2.fetch_add(i, Ordering::SeqCst);
                    out_count2.fetch_add(o, Ordering::SeqCst);
                },
            )
            .await
        });

        test_a.write_all(b"hello from a").await.unwrap();
        let mut buf = vec![0u8; 32];
        let n = test_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from a");

        test_b.write_all(b"hi a").await.unwrap();
        let n = test_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi a");

        drop(test_a);
        drop(test_b);

        let result = splice.await.unwrap();
        assert_eq!(result.in_bytes, 12);
        assert_eq!(result.out_bytes, 4);
        assert_eq!(in_count.load(Ordering::SeqCst), 12);
        assert_eq!(out_count.load(Ordering::SeqCst), 4);
    }
}
