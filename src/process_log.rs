use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::DuplexStream;

use crate::bus::Bus;
use crate::event::event;
use crate::runner::ProcessRunner;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
#[error("no process has been pushed")]
pub struct EmptyLog;

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// The sequence of runners one service executes over its lifetime.
///
/// Readers obtained from `stdout_pipe`/`stderr_pipe` drain the current
/// runner's output and then seamlessly continue with every subsequently
/// pushed runner, so a log follower survives service restarts. `shutdown`
/// stops the hand-off; readers finish once the runner they are on EOFs.
pub struct ProcessLog {
    last: Mutex<Option<Arc<ProcessRunner>>>,
    bus: Bus<Arc<ProcessRunner>>,
    running: AtomicBool,
}

impl ProcessLog {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
            bus: Bus::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Record `runner` as current and hand it to live followers.
    pub fn push(&self, runner: Arc<ProcessRunner>) {
        if self.running.load(Ordering::SeqCst) {
            self.bus.publish(Arc::clone(&runner));
        }
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(runner);
    }

    pub fn last(&self) -> Result<Arc<ProcessRunner>, EmptyLog> {
        let last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        last.clone().ok_or(EmptyLog)
    }

    /// Stop handing new runners to followers. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.bus.shutdown();
    }

    pub async fn stdout_pipe(&self) -> DuplexStream {
        self.pipe(StreamKind::Stdout).await
    }

    pub async fn stderr_pipe(&self) -> DuplexStream {
        self.pipe(StreamKind::Stderr).await
    }

    async fn pipe(&self, kind: StreamKind) -> DuplexStream {
        let (r, mut w) = tokio::io::duplex(PIPE_CAPACITY);

        // Subscribe before snapshotting the current runner so a restart
        // racing this call is not lost; the snapshot is deduplicated below.
        let mut sub = self.bus.subscribe();
        let snapshot = {
            let last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            last.clone()
        };

        tokio::spawn(async move {
            let mut drained = snapshot.clone();
            if let Some(runner) = snapshot {
                let mut pipe = match kind {
                    StreamKind::Stdout => runner.stdout_pipe().await,
                    StreamKind::Stderr => runner.stderr_pipe().await,
                };
                if let Err(e) = tokio::io::copy(&mut pipe, &mut w).await {
                    event("procs", None, format!("log pipe: {e}"));
                    return;
                }
            }

            while let Some(runner) = sub.recv().await {
                // The snapshot runner may also arrive through the bus.
                if drained
                    .take()
                    .map_or(false, |d| Arc::ptr_eq(&d, &runner))
                {
                    continue;
                }
                let mut pipe = match kind {
                    StreamKind::Stdout => runner.stdout_pipe().await,
                    StreamKind::Stderr => runner.stderr_pipe().await,
                };
                if let Err(e) = tokio::io::copy(&mut pipe, &mut w).await {
                    event("procs", None, format!("log pipe: {e}"));
                    return;
                }
            }
            // Dropping the writer here signals EOF to the follower.
        });

        r
    }
}

impl Default for ProcessLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessSpec;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    fn echo(word: &str) -> Arc<ProcessRunner> {
        Arc::new(ProcessRunner::new(ProcessSpec::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("sleep 0.1; echo {word}"),
        ])))
    }

    #[tokio::test]
    async fn last_errors_while_empty() {
        let log = ProcessLog::new();
        assert!(log.last().is_err());
        log.push(echo("x"));
        assert!(log.last().is_ok());
    }

    #[tokio::test]
    async fn follower_spans_successive_runners() {
        let log = Arc::new(ProcessLog::new());

        let a = echo("one");
        log.push(Arc::clone(&a));

        let mut pipe = log.stdout_pipe().await;
        let reader = tokio::spawn(async move {
            let mut out = String::new();
            pipe.read_to_string(&mut out).await.unwrap();
            out
        });

        a.run(CancellationToken::new()).await.unwrap();

        let b = echo("two");
        log.push(Arc::clone(&b));
        b.run(CancellationToken::new()).await.unwrap();

        log.shutdown();
        let out = reader.await.unwrap();
        assert!(out.contains("one"), "missing first runner output: {out:?}");
        assert!(out.contains("two"), "missing second runner output: {out:?}");
    }

    #[tokio::test]
    async fn shutdown_releases_followers() {
        let log = ProcessLog::new();
        let mut pipe = log.stdout_pipe().await;
        log.shutdown();
        let mut out = Vec::new();
        pipe.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
