//! Rate limiting for storage backends.
//!
//! Two gates compose here: a counting semaphore bounding concurrent
//! upstream connections, and token buckets bounding read/write throughput.
//!
//! # Algorithm
//!
//! Each direction owns a token bucket refilled continuously at the
//! configured rate with burst capacity of one second's worth of tokens.
//! `pre_read` reserves up to the caller's want; when the bucket runs dry a
//! floor rate (`MIN_RATE`) still grants a minimal quantum so a reader can
//! never stall forever, driving the bucket negative. `after_read` refunds
//! unused reservations and converts any deficit into the wall delay the
//! next read must honour, which keeps the observed rate at or under the
//! ceiling.
//!
//! # Example
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new(24, 512 * 1024, 512 * 1024);
//! let _permit = limiter.conns().acquire().await?;
//! let reader = LimitedReader::new(file, limiter.controller());
//! ```

use crate::error::{EdgeError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Sleep;

/// Floor rate in bytes/sec applied when a bucket is drained.
pub const MIN_RATE: f64 = 1024.0;

/// Counting semaphore over upstream connection slots.
///
/// A limit of zero means unbounded.
#[derive(Clone)]
pub struct ConnLimiter {
    sem: Option<Arc<Semaphore>>,
}

impl ConnLimiter {
    pub fn new(max_conn: usize) -> Self {
        Self {
            sem: (max_conn > 0).then(|| Arc::new(Semaphore::new(max_conn))),
        }
    }

    /// Wait for a free slot. Dropping the future releases nothing; dropping
    /// the returned permit releases the slot.
    pub async fn acquire(&self) -> Result<ConnPermit> {
        match &self.sem {
            None => Ok(ConnPermit { _permit: None }),
            Some(sem) => {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EdgeError::Cancelled)?;
                Ok(ConnPermit {
                    _permit: Some(permit),
                })
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<ConnPermit> {
        match &self.sem {
            None => Some(ConnPermit { _permit: None }),
            Some(sem) => sem
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| ConnPermit {
                    _permit: Some(permit),
                }),
        }
    }

    /// Free slots right now; `usize::MAX` when unbounded.
    pub fn available(&self) -> usize {
        self.sem
            .as_ref()
            .map(|s| s.available_permits())
            .unwrap_or(usize::MAX)
    }
}

/// RAII connection slot.
pub struct ConnPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct Bucket {
    /// Ceiling in bytes/sec; also the burst capacity.
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }

    fn pre(&mut self, want: usize, now: Instant) -> usize {
        if want == 0 {
            return 0;
        }
        self.refill(now);
        let want_f = want as f64;
        let granted = if self.tokens >= want_f {
            want_f
        } else {
            // Bucket is short: still grant a floor quantum so the caller
            // cannot stall forever, pushing the balance negative.
            self.tokens.max(MIN_RATE.min(want_f))
        };
        self.tokens -= granted;
        granted as usize
    }

    fn after(&mut self, unused: usize, now: Instant) -> Option<Duration> {
        self.refill(now);
        self.tokens += unused as f64;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.rate))
        }
    }

    fn refund(&mut self, granted: usize) {
        self.tokens += granted as f64;
    }
}

/// Token-bucket throughput control for both transfer directions.
///
/// A zero rate disables the corresponding direction.
pub struct RateController {
    read: Option<Mutex<Bucket>>,
    write: Option<Mutex<Bucket>>,
}

impl RateController {
    /// Rates are in bytes/sec; zero disables that direction.
    pub fn new(read_rate: usize, write_rate: usize) -> Self {
        Self {
            read: (read_rate > 0).then(|| Mutex::new(Bucket::new(read_rate as f64))),
            write: (write_rate > 0).then(|| Mutex::new(Bucket::new(write_rate as f64))),
        }
    }

    /// Reserve up to `want` read bytes; returns the granted amount.
    pub fn pre_read(&self, want: usize) -> usize {
        match &self.read {
            None => want,
            Some(b) => b.lock().pre(want, Instant::now()),
        }
    }

    /// Report a finished read of `got` bytes out of a grant, refunding the
    /// `unused` remainder. Returns the delay the next read must honour.
    pub fn after_read(&self, _got: usize, unused: usize) -> Option<Duration> {
        self.read
            .as_ref()
            .and_then(|b| b.lock().after(unused, Instant::now()))
    }

    /// Return a full unused grant, e.g. when a read returned `Pending`.
    pub fn refund_read(&self, granted: usize) {
        if let Some(b) = &self.read {
            b.lock().refund(granted);
        }
    }

    pub fn pre_write(&self, want: usize) -> usize {
        match &self.write {
            None => want,
            Some(b) => b.lock().pre(want, Instant::now()),
        }
    }

    pub fn after_write(&self, _got: usize, unused: usize) -> Option<Duration> {
        self.write
            .as_ref()
            .and_then(|b| b.lock().after(unused, Instant::now()))
    }

    /// Charge `n` already-transferred read bytes, sleeping out any deficit.
    /// Used to throttle chunked body streams after each chunk arrives.
    pub async fn consume_read(&self, n: usize) {
        if self.read.is_none() {
            return;
        }
        let granted = self.pre_read(n);
        debug_assert!(granted <= n || n == 0);
        // Charge the rest of the chunk beyond the first grant.
        if n > granted {
            if let Some(b) = &self.read {
                b.lock().tokens -= (n - granted) as f64;
            }
        }
        if let Some(delay) = self.after_read(n, 0) {
            tokio::time::sleep(delay).await;
        }
    }

    /// Write-direction twin of [`consume_read`](Self::consume_read).
    pub async fn consume_write(&self, n: usize) {
        if self.write.is_none() {
            return;
        }
        let granted = self.pre_write(n);
        if n > granted {
            if let Some(b) = &self.write {
                b.lock().tokens -= (n - granted) as f64;
            }
        }
        if let Some(delay) = self.after_write(n, 0) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Combined connection and throughput limiter owned by a storage backend.
pub struct RateLimiter {
    conns: ConnLimiter,
    controller: Arc<RateController>,
}

impl RateLimiter {
    /// `max_conn` of zero means unbounded; rates are bytes/sec, zero
    /// disables the respective ceiling.
    pub fn new(max_conn: usize, read_rate: usize, write_rate: usize) -> Self {
        Self {
            conns: ConnLimiter::new(max_conn),
            controller: Arc::new(RateController::new(read_rate, write_rate)),
        }
    }

    pub fn conns(&self) -> &ConnLimiter {
        &self.conns
    }

    pub fn controller(&self) -> Arc<RateController> {
        Arc::clone(&self.controller)
    }
}

/// Throttle a byte stream against the controller's read bucket, charging
/// each chunk as it passes through.
pub fn throttle_read_stream<S, E>(
    controller: Arc<RateController>,
    stream: S,
) -> impl futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send
where
    S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    use futures::StreamExt;
    futures::stream::unfold((stream, controller), |(mut stream, controller)| async move {
        match stream.next().await {
            None => None,
            Some(Err(e)) => Some((Err(e), (stream, controller))),
            Some(Ok(chunk)) => {
                controller.consume_read(chunk.len()).await;
                Some((Ok(chunk), (stream, controller)))
            }
        }
    })
}

/// Write-direction twin of [`throttle_read_stream`].
pub fn throttle_write_stream<S, E>(
    controller: Arc<RateController>,
    stream: S,
) -> impl futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send
where
    S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    use futures::StreamExt;
    futures::stream::unfold((stream, controller), |(mut stream, controller)| async move {
        match stream.next().await {
            None => None,
            Some(Err(e)) => Some((Err(e), (stream, controller))),
            Some(Ok(chunk)) => {
                controller.consume_write(chunk.len()).await;
                Some((Ok(chunk), (stream, controller)))
            }
        }
    })
}

/// An [`AsyncRead`] wrapper that sleeps between reads per the controller.
pub struct LimitedReader<R> {
    inner: R,
    controller: Arc<RateController>,
    scratch: Vec<u8>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> LimitedReader<R> {
    pub fn new(inner: R, controller: Arc<RateController>) -> Self {
        Self {
            inner,
            controller,
            scratch: Vec::new(),
            delay: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.delay = None,
            }
        }

        let want = buf.remaining();
        let granted = this.controller.pre_read(want);
        if granted == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.scratch.len() < granted {
            this.scratch.resize(granted, 0);
        }

        let mut taken = ReadBuf::new(&mut this.scratch[..granted]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut taken) {
            Poll::Pending => {
                this.controller.refund_read(granted);
                Poll::Pending
            }
            Poll::Ready(Err(e)) => {
                this.controller.refund_read(granted);
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok(())) => {
                let got = taken.filled().len();
                buf.put_slice(taken.filled());
                if let Some(delay) = this.controller.after_read(got, granted - got) {
                    this.delay = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_conn_limiter_bounds_slots() {
        let limiter = ConnLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert!(limiter.try_acquire().is_none());
        drop(a);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_conn_limiter_unbounded() {
        let limiter = ConnLimiter::new(0);
        for _ in 0..1000 {
            // Permits from an unbounded limiter never block.
            let _ = limiter.acquire().await.unwrap();
        }
        assert_eq!(limiter.available(), usize::MAX);
    }

    #[test]
    fn test_bucket_grants_within_burst() {
        let controller = RateController::new(10_000, 0);
        let granted = controller.pre_read(4_000);
        assert_eq!(granted, 4_000);
        assert!(controller.after_read(granted, 0).is_none());
    }

    #[test]
    fn test_bucket_floor_when_drained() {
        let controller = RateController::new(2048, 0);
        // Drain the burst.
        assert_eq!(controller.pre_read(2048), 2048);
        // A drained bucket still grants the floor quantum.
        let granted = controller.pre_read(64 * 1024);
        assert_eq!(granted, MIN_RATE as usize);
        // The deficit shows up as a mandatory delay.
        let delay = controller.after_read(granted, 0);
        assert!(delay.is_some());
        assert!(delay.unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_unused_tokens_refunded() {
        let controller = RateController::new(10_000, 0);
        let granted = controller.pre_read(8_000);
        assert_eq!(granted, 8_000);
        // Only 1000 bytes actually arrived; refund clears any deficit.
        assert!(controller.after_read(1_000, 7_000).is_none());
        assert_eq!(controller.pre_read(9_000), 9_000);
    }

    #[test]
    fn test_disabled_direction_passthrough() {
        let controller = RateController::new(0, 0);
        assert_eq!(controller.pre_read(usize::MAX), usize::MAX);
        assert!(controller.after_read(123, 0).is_none());
    }

    #[tokio::test]
    async fn test_limited_reader_passes_data() {
        let data: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        let controller = Arc::new(RateController::new(1_000_000, 0));
        let mut reader = LimitedReader::new(&data[..], controller);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_reader_paces_reads() {
        // 1 KiB/s ceiling with a 4 KiB payload: the burst covers the first
        // KiB, the floor grants keep the reader moving afterwards, and
        // virtual time must advance to cover the deficit.
        let data = vec![7u8; 4096];
        let controller = Arc::new(RateController::new(1024, 0));
        let mut reader = LimitedReader::new(&data[..], controller);
        let start = tokio::time::Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 4096);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
