//! Progress-tracking stream wrapper for upload bodies.

use bytes::Bytes;
use futures_util::{ready, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Receives the absolute number of bytes sent so far
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Counts the bytes of an upload body and reports the running total after
/// every chunk and once more when the body ends. Rate limiting is the
/// callback's business (see `ProgressTracker::record`).
pub struct ProgressStream<S> {
    inner: S,
    sent: u64,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self::starting_at(inner, 0, callback)
    }

    /// Count from `offset`, for a transfer resumed part-way through the file.
    pub fn starting_at(inner: S, offset: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            sent: offset,
            callback,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.sent
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(Pin::new(&mut self.inner).poll_next(cx));
        match &item {
            Some(Ok(chunk)) => {
                self.sent += chunk.len() as u64;
                (self.callback)(self.sent);
            }
            None => (self.callback)(self.sent),
            Some(Err(_)) => {}
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_reports_final_count() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);

        let mut stream = ProgressStream::new(
            chunks,
            Arc::new(move |n| seen_cb.store(n, Ordering::Relaxed)),
        );
        while stream.next().await.is_some() {}

        assert_eq!(stream.bytes_transferred(), 11);
        assert_eq!(seen.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_reports_every_chunk() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = Arc::clone(&calls);
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
            Ok(Bytes::from_static(b"c")),
        ]);

        let mut stream = ProgressStream::new(
            chunks,
            Arc::new(move |_| {
                calls_cb.fetch_add(1, Ordering::Relaxed);
            }),
        );
        while stream.next().await.is_some() {}

        // three chunks plus end of body
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_resumed_stream_counts_from_offset() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let chunks = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"tail"))]);

        let mut stream = ProgressStream::starting_at(
            chunks,
            100,
            Arc::new(move |n| seen_cb.store(n, Ordering::Relaxed)),
        );
        while stream.next().await.is_some() {}

        assert_eq!(seen.load(Ordering::Relaxed), 104);
    }
}
