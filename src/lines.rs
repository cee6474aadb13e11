//! Line-oriented stream plumbing for service logs.
//!
//! Log consumers read whole lines; these helpers re-chunk any byte stream
//! into newline-terminated lines so that interleaving several sources
//! (service lifecycle lines, child stdout, child stderr) never splices two
//! half-lines together.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::sync::mpsc;

/// A readable stream of whole lines fed by background forwarder tasks.
///
/// EOF is reached once every feeding task has finished. Dropping the
/// stream detaches the feeders, which then drop their source readers; a
/// source backed by a broadcaster pipe gets evicted on the producer side
/// as a result, so abandoned log followers clean themselves up.
pub struct LogStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl AsyncRead for LogStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.buf.len() {
                let n = out.remaining().min(this.buf.len() - this.pos);
                out.put_slice(&this.buf[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.buf = chunk;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn spawn_forwarder(
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: impl AsyncRead + Send + Unpin + 'static,
    prefix: Option<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let chunk = match &prefix {
                Some(p) => format!("{p} {line}\n").into_bytes(),
                None => format!("{line}\n").into_bytes(),
            };
            if tx.send(chunk).is_err() {
                break;
            }
        }
    });
}

/// Prefix every line of `reader` with `prefix` and a space.
pub fn prefixed(prefix: String, reader: impl AsyncRead + Send + Unpin + 'static) -> LogStream {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_forwarder(tx, reader, Some(prefix));
    LogStream {
        rx,
        buf: Vec::new(),
        pos: 0,
    }
}

/// Interleave several line streams into one. Lines stay intact; the
/// interleaving across sources is arrival order.
pub fn merged(readers: Vec<Box<dyn AsyncRead + Send + Unpin>>) -> LogStream {
    let (tx, rx) = mpsc::unbounded_channel();
    for reader in readers {
        spawn_forwarder(tx.clone(), reader, None);
    }
    LogStream {
        rx,
        buf: Vec::new(),
        pos: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefixed_tags_every_line() {
        let input: &[u8] = b"one\ntwo\n";
        let mut stream = prefixed("svc[stdout]:".to_string(), input);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "svc[stdout]: one\nsvc[stdout]: two\n");
    }

    #[tokio::test]
    async fn merged_keeps_lines_whole() {
        let a: &[u8] = b"alpha\n";
        let b: &[u8] = b"beta\ngamma\n";
        let mut stream = merged(vec![Box::new(a), Box::new(b)]);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();

        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn merged_of_nothing_is_empty() {
        let mut stream = merged(Vec::new());
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
