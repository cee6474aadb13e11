use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::event;
use crate::lines::merged;
use crate::service::{Service, ServiceError};

/// Line protocol over a unix socket: `<verb> [service...]\n` with
/// shell-quoted tokens, plain-text responses. One connection may carry
/// several commands; `logs` streams until the client goes away.
pub struct ControlServer {
    services: Arc<Vec<Arc<Service>>>,
    socket_path: PathBuf,
}

impl ControlServer {
    pub fn new(services: Vec<Arc<Service>>, socket_path: PathBuf) -> Self {
        Self {
            services: Arc::new(services),
            socket_path,
        }
    }

    /// Accept connections until cancelled or the listener fails.
    pub async fn listen(&self, token: CancellationToken) -> std::io::Result<()> {
        // A stale socket from a crashed daemon would make bind fail;
        // absence is not an error.
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        event(
            "control",
            None,
            format!("listening on {}", self.socket_path.display()),
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let services = Arc::clone(&self.services);
                            let conn_token = token.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(&services, stream, conn_token).await {
                                    event("control", None, format!("connection: {e}"));
                                }
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    services: &[Arc<Service>],
    stream: UnixStream,
    token: CancellationToken,
) -> std::io::Result<()> {
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        handle_command(services, &mut w, &line, &token).await?;
    }
}

async fn handle_command(
    services: &[Arc<Service>],
    w: &mut OwnedWriteHalf,
    line: &str,
    token: &CancellationToken,
) -> std::io::Result<()> {
    let Some(parts) = shlex::split(line) else {
        return w
            .write_all(b"error: parsing command line failed\n")
            .await;
    };
    let Some((verb, args)) = parts.split_first() else {
        // Blank line; nothing to do.
        return Ok(());
    };

    match verb.as_str() {
        "list" => {
            if let Some(extra) = args.first() {
                return write_error(w, format!("extra argument: {extra}")).await;
            }
            let mut listing = String::new();
            for svc in services {
                listing.push_str(svc.name());
                listing.push('\n');
            }
            w.write_all(listing.as_bytes()).await
        }
        "logs" => {
            let targets = match lookup_all(services, args) {
                Ok(t) => t,
                Err(missing) => return write_error(w, missing).await,
            };
            let mut readers: Vec<Box<dyn AsyncRead + Send + Unpin>> = Vec::new();
            for svc in &targets {
                readers.push(Box::new(svc.logs().await));
            }
            let mut stream = merged(readers);
            // The copy ends when the client disconnects (write error) or
            // every source dries up.
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                res = tokio::io::copy(&mut stream, w) => res.map(|_| ()),
            }
        }
        "start" | "stop" | "restart" | "reload" => {
            let targets = match lookup_all(services, args) {
                Ok(t) => t,
                Err(missing) => return write_error(w, missing).await,
            };
            let mut report = String::new();
            for (name, res) in run_action(targets, verb).await {
                if let Err(e) = res {
                    report.push_str(&format!("{name}: {e}\n"));
                }
            }
            w.write_all(report.as_bytes()).await
        }
        other => write_error(w, format!("invalid command: {other}")).await,
    }
}

async fn write_error(w: &mut OwnedWriteHalf, msg: impl AsRef<str>) -> std::io::Result<()> {
    w.write_all(format!("error: {}\n", msg.as_ref()).as_bytes())
        .await
}

fn lookup_all(
    services: &[Arc<Service>],
    names: &[String],
) -> Result<Vec<Arc<Service>>, String> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match services.iter().find(|s| s.name() == name.as_str()) {
            Some(svc) => out.push(Arc::clone(svc)),
            None => return Err(format!("service not found: {name}")),
        }
    }
    Ok(out)
}

/// Run one verb against every target in parallel; results come back
/// sorted by name so responses are deterministic.
async fn run_action(
    targets: Vec<Arc<Service>>,
    verb: &str,
) -> Vec<(String, Result<(), ServiceError>)> {
    let mut js: JoinSet<(String, Result<(), ServiceError>)> = JoinSet::new();
    for svc in targets {
        let verb = verb.to_string();
        js.spawn(async move {
            let res = match verb.as_str() {
                "start" => svc.start().await,
                "stop" => svc.stop().await,
                "restart" => svc.restart().await,
                _ => svc.reload().await,
            };
            (svc.name().to_string(), res)
        });
    }
    let mut out = Vec::new();
    while let Some(joined) = js.join_next().await {
        if let Ok(item) = joined {
            out.push(item);
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Client half of the protocol: one command per call, response streamed
/// to `out` until the server closes the connection.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn run_command(
        &self,
        out: &mut (impl AsyncWrite + Unpin),
        token: &CancellationToken,
        verb: &str,
        services: &[String],
    ) -> anyhow::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            anyhow::anyhow!(
                "failed to connect to ella daemon socket {}: {e}",
                self.socket_path.display()
            )
        })?;

        let mut line = String::from(verb);
        for name in services {
            let quoted = shlex::try_quote(name)
                .map_err(|e| anyhow::anyhow!("unquotable service name {name:?}: {e}"))?;
            line.push(' ');
            line.push_str(&quoted);
        }
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;

        // Half-close so the server knows no further commands are coming,
        // then drain the response until EOF.
        let (mut r, mut w) = stream.split();
        w.shutdown().await?;
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            res = tokio::io::copy(&mut r, out) => {
                res?;
                Ok(())
            }
        }
    }
}
