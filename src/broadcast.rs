use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use crate::event::event;

/// Buffer handed to each subscriber pipe. Writes block once a subscriber
/// falls this far behind, so consumers are expected to keep draining.
const PIPE_CAPACITY: usize = 64 * 1024;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// One-to-many byte fan-out.
///
/// Every chunk written is delivered to every registered sink. A sink that
/// errors or accepts a short write is evicted after the current batch
/// rather than retried; the producer itself never sees per-subscriber
/// failures. Surviving subscribers all observe the same byte prefix.
pub struct Broadcaster {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Sink)>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink and return its id for later `remove`.
    pub async fn add(&self, w: impl AsyncWrite + Send + Unpin + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().await.push((id, Box::new(w)));
        id
    }

    /// Deregister and close a sink. Unknown ids are ignored.
    pub async fn remove(&self, id: u64) {
        let mut sinks = self.sinks.lock().await;
        let pos = sinks.iter().position(|(sid, _)| *sid == id);
        if let Some(pos) = pos {
            let (_, mut sink) = sinks.swap_remove(pos);
            let _ = sink.shutdown().await;
        }
    }

    /// Register a pipe subscriber and return its read end. The reader sees
    /// EOF once the broadcaster closes its sinks (or the pipe is evicted).
    pub async fn pipe(&self) -> DuplexStream {
        let (r, w) = tokio::io::duplex(PIPE_CAPACITY);
        self.add(w).await;
        r
    }

    /// Deliver `p` to every sink. Failing sinks are marked during the pass
    /// and evicted afterwards so the subscriber set is never mutated
    /// mid-iteration. Always reports the full length to the producer.
    pub async fn write(&self, p: &[u8]) -> usize {
        if p.is_empty() {
            return 0;
        }
        let mut sinks = self.sinks.lock().await;
        let mut evict: Vec<u64> = Vec::new();
        for (id, sink) in sinks.iter_mut() {
            match sink.write(p).await {
                Ok(n) if n == p.len() => {}
                _ => evict.push(*id),
            }
        }
        for id in evict {
            let pos = sinks.iter().position(|(sid, _)| *sid == id);
            if let Some(pos) = pos {
                let (_, mut sink) = sinks.swap_remove(pos);
                let _ = sink.shutdown().await;
            }
        }
        p.len()
    }

    /// Pump a reader into the broadcaster until EOF or a read error, then
    /// close all remaining sinks. Used to wire child stdout/stderr in.
    pub async fn run(&self, mut r: impl AsyncRead + Unpin) -> std::io::Result<()> {
        let mut buf = [0u8; 8192];
        let res = loop {
            match r.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    self.write(&buf[..n]).await;
                }
                Err(e) => break Err(e),
            }
        };
        self.remove_all().await;
        res
    }

    /// Close and drop every sink; their pipe readers see EOF.
    pub async fn remove_all(&self) {
        let mut sinks = self.sinks.lock().await;
        for (_, sink) in sinks.iter_mut() {
            let _ = sink.shutdown().await;
        }
        sinks.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.sinks.lock().await.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// `Broadcaster::run` wrapper that logs the pump outcome; child pipe
/// errors end the stream but must not take the producer down.
pub async fn pump(b: &Broadcaster, r: impl AsyncRead + Unpin, what: &str, service: &str) {
    if let Err(e) = b.run(r).await {
        event("runner", Some(service), format!("{what} stream error: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[tokio::test]
    async fn every_subscriber_sees_every_byte() {
        let b = Arc::new(Broadcaster::new());
        let mut readers = Vec::new();
        for _ in 0..3 {
            readers.push(b.pipe().await);
        }

        let writer = Arc::clone(&b);
        let feed = tokio::spawn(async move {
            writer.run(&b"0123456789"[..]).await.unwrap();
        });

        for mut r in readers {
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"0123456789");
        }
        feed.await.unwrap();
        assert_eq!(b.subscriber_count().await, 0);
    }

    /// Accepts `limit` bytes in total, then short-writes.
    struct ShortWriter {
        limit: usize,
        written: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.limit -= n;
            self.written.lock().unwrap().extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn short_writing_subscriber_is_evicted() {
        let b = Broadcaster::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        b.add(ShortWriter {
            limit: 4,
            written: Arc::clone(&seen),
        })
        .await;
        let mut healthy = b.pipe().await;

        b.write(b"0123").await;
        assert_eq!(b.subscriber_count().await, 2);
        b.write(b"4567").await;
        assert_eq!(b.subscriber_count().await, 1);
        b.write(b"89").await;
        b.remove_all().await;

        let mut out = Vec::new();
        healthy.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
        // The evicted writer kept the prefix it managed to accept.
        assert_eq!(seen.lock().unwrap().as_slice(), b"0123");
    }

    #[tokio::test]
    async fn remove_closes_the_pipe_and_is_idempotent() {
        let b = Broadcaster::new();
        let (r, w) = tokio::io::duplex(64);
        let id = b.add(w).await;
        b.remove(id).await;
        b.remove(id).await;

        let mut r = r;
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn dropped_reader_evicts_its_writer() {
        let b = Broadcaster::new();
        let r = b.pipe().await;
        drop(r);
        for _ in 0..3 {
            b.write(b"xxxxxxxx").await;
        }
        assert_eq!(b.subscriber_count().await, 0);
    }
}
