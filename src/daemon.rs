use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::build_info;
use crate::config::LoadedConfig;
use crate::control::ControlServer;
use crate::event::event;
use crate::paths;
use crate::service::Service;

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_GENERAL_ERR: i32 = 1;
pub const CODE_INVALID_CONFIG: i32 = 2;
pub const CODE_INVALID_INVOCATION: i32 = 3;
pub const CODE_INITIALIZATION_FAILED: i32 = 4;

/// One-shot assembly of the whole supervisor.
///
/// Builds services from the loaded configuration, provisions the pid file
/// and runtime directory, runs the control server next to the per-service
/// run loops, and unwinds all of it when the token fires or the control
/// server dies.
pub struct Daemon {
    running: AtomicBool,
    log: bool,
}

impl Daemon {
    /// `log` mirrors every service's log stream to the daemon's stdout.
    pub fn new(log: bool) -> Self {
        Self {
            running: AtomicBool::new(false),
            log,
        }
    }

    pub async fn run(
        &self,
        token: CancellationToken,
        cfg: &LoadedConfig,
        start_names: &[String],
    ) -> i32 {
        if self.running.swap(true, Ordering::SeqCst) {
            event("daemon", None, "daemon already running");
            return CODE_GENERAL_ERR;
        }
        event("boot", None, build_info::banner());

        let services: Vec<Arc<Service>> = cfg
            .services
            .iter()
            .map(|def| Arc::new(Service::from_def(def)))
            .collect();

        for name in start_names {
            if !services.iter().any(|s| s.name() == name.as_str()) {
                event(
                    "daemon",
                    None,
                    format!("unknown service on command line: {name}"),
                );
                return CODE_INVALID_INVOCATION;
            }
        }

        let pid = std::process::id();
        let pid_path = paths::pid_file(cfg.pid_file.as_deref());
        if let Err(e) = write_pid_file(&pid_path, pid) {
            event("daemon", None, format!("failed creating pid file: {e}"));
            return CODE_INITIALIZATION_FAILED;
        }
        let runtime_dir = paths::runtime_dir(pid);
        if let Err(e) = std::fs::create_dir_all(&runtime_dir) {
            event(
                "daemon",
                None,
                format!("failed creating runtime dir {}: {e}", runtime_dir.display()),
            );
            let _ = std::fs::remove_file(&pid_path);
            return CODE_INITIALIZATION_FAILED;
        }

        // Everything below shares one child token so a single cancel
        // unwinds the control server, its connections and every service.
        let child = token.child_token();

        let server = ControlServer::new(services.clone(), paths::socket_path(pid));
        let server_token = child.clone();
        let mut server_task = tokio::spawn(async move { server.listen(server_token).await });

        let mut loops: JoinSet<()> = JoinSet::new();
        for svc in &services {
            let svc = Arc::clone(svc);
            let run_token = child.clone();
            let mirror_logs = self.log;
            let kick = start_names.iter().any(|n| n == svc.name());
            loops.spawn(async move {
                if mirror_logs {
                    let mut logs = svc.logs().await;
                    tokio::spawn(async move {
                        let mut stdout = tokio::io::stdout();
                        let _ = tokio::io::copy(&mut logs, &mut stdout).await;
                    });
                }
                if kick {
                    if let Err(e) = svc.start().await {
                        event("daemon", Some(svc.name()), format!("start: {e}"));
                    }
                }
                svc.run(run_token).await;
            });
        }

        // Either an outside cancellation (signal) or the control server
        // going away ends the daemon; both drain through the same path.
        let early_server_exit = tokio::select! {
            _ = token.cancelled() => None,
            res = &mut server_task => Some(res),
        };
        child.cancel();
        while loops.join_next().await.is_some() {}
        let server_result = match early_server_exit {
            Some(res) => res,
            None => server_task.await,
        };

        let mut code = CODE_SUCCESS;
        match server_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                event("control", None, format!("server: {e}"));
                code = CODE_GENERAL_ERR;
            }
            Err(e) => {
                event("control", None, format!("server task: {e}"));
                code = CODE_GENERAL_ERR;
            }
        }

        let _ = std::fs::remove_file(paths::socket_path(pid));
        if let Err(e) = std::fs::remove_dir(&runtime_dir) {
            event(
                "daemon",
                None,
                format!("failed removing runtime dir {}: {e}", runtime_dir.display()),
            );
            code = CODE_GENERAL_ERR;
        }
        if let Err(e) = std::fs::remove_file(&pid_path) {
            event("daemon", None, format!("failed removing pid file: {e}"));
            code = CODE_GENERAL_ERR;
        }
        code
    }
}

fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{pid}\n"))
}

/// The pid recorded by a running daemon, used by clients to locate its
/// socket.
pub fn read_pid_file(path: &Path) -> anyhow::Result<u32> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed reading pid file {}: {e}", path.display()))?;
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid pid file {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("main.pid");
        write_pid_file(&path, 4321).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4321\n");
        assert_eq!(read_pid_file(&path).unwrap(), 4321);
    }

    #[tokio::test]
    async fn unknown_start_names_abort_before_side_effects() {
        let daemon = Daemon::new(false);
        let cfg = LoadedConfig {
            pid_file: None,
            services: Vec::new(),
        };
        let code = daemon
            .run(
                CancellationToken::new(),
                &cfg,
                &["ghost".to_string()],
            )
            .await;
        assert_eq!(code, CODE_INVALID_INVOCATION);

        // The refusal flag is latched; a second run on the same instance
        // is rejected outright.
        let code = daemon.run(CancellationToken::new(), &cfg, &[]).await;
        assert_eq!(code, CODE_GENERAL_ERR);
    }
}
