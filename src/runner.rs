use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{pump, Broadcaster};
use crate::bus::{Bus, Subscription};
use crate::event::event;

/// Lifecycle of one OS child. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    Stopped = 3,
    WaitDone = 4,
    BusShutDown = 5,
}

impl ProcState {
    fn from_i32(v: i32) -> ProcState {
        match v {
            0 => ProcState::NotStarted,
            1 => ProcState::Starting,
            2 => ProcState::Started,
            3 => ProcState::Stopped,
            4 => ProcState::WaitDone,
            _ => ProcState::BusShutDown,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("not started yet")]
    NotStarted,
    #[error("not stopped yet")]
    NotStopped,
    #[error("process state can only go forward: current: {current:?}, desired: {desired:?}")]
    StateOrder {
        current: ProcState,
        desired: ProcState,
    },
    #[error("signal delivery failed: {0}")]
    Signal(nix::errno::Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to launch one child, resolved ahead of time.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    /// File fed to the child's stdin; null device when unset.
    pub stdin: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    /// Explicit environment; `None` inherits the supervisor's.
    pub env: Option<Vec<(String, String)>>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            stdin: None,
            cwd: None,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            env: None,
        }
    }
}

/// Owns a single child execution and exposes it as observable state.
///
/// `run` drives the whole lifecycle once; everything else is observation
/// (pipes, state subscriptions, exit code) or signalling. The runner is
/// shared behind an `Arc` between the watchdog, the process log and any
/// stop/reload action targeting it.
pub struct ProcessRunner {
    spec: ProcessSpec,
    state: AtomicI32,
    pid: AtomicI32,
    exit_code: AtomicI32,
    stdout: Broadcaster,
    stderr: Broadcaster,
    bus: Bus<ProcState>,
}

impl ProcessRunner {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            state: AtomicI32::new(ProcState::NotStarted as i32),
            pid: AtomicI32::new(0),
            exit_code: AtomicI32::new(0),
            stdout: Broadcaster::new(),
            stderr: Broadcaster::new(),
            bus: Bus::new(),
        }
    }

    /// Launch the child and see it through to `WaitDone`.
    ///
    /// Cancelling the token kills the child, which then flows through the
    /// normal exit path. Launch failures are returned without advancing
    /// past `Starting`. The state bus is shut down on every return path.
    pub async fn run(&self, token: CancellationToken) -> Result<(), ProcError> {
        let res = self.launch_and_wait(token).await;
        self.shutdown();
        res
    }

    async fn launch_and_wait(&self, token: CancellationToken) -> Result<(), ProcError> {
        self.set_state(ProcState::Starting)?;

        let program = self.spec.argv.first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(&self.spec.argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match &self.spec.stdin {
            Some(path) => {
                cmd.stdin(std::fs::File::open(path)?);
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &self.spec.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        // Skip the setuid/setgid syscalls when the child runs as ourselves.
        let own_uid = nix::unistd::getuid().as_raw();
        let own_gid = nix::unistd::getgid().as_raw();
        if self.spec.uid != own_uid || self.spec.gid != own_gid {
            cmd.uid(self.spec.uid);
            cmd.gid(self.spec.gid);
        }

        let mut child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            self.pid.store(pid as i32, Ordering::SeqCst);
        }
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child stdout not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child stderr not captured")
        })?;
        self.set_state(ProcState::Started)?;

        let name = program.clone();
        let wait = async {
            let waited = tokio::select! {
                st = child.wait() => Some(st),
                _ = token.cancelled() => None,
            };
            let status = match waited {
                Some(st) => st,
                // Cancelled: take the child down, then reap it.
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            match status {
                // Killed-by-signal has no exit code; report -1 like wait(2) consumers do.
                Ok(st) => self
                    .exit_code
                    .store(st.code().unwrap_or(-1), Ordering::SeqCst),
                Err(e) => event("runner", Some(name.as_str()), format!("wait failed: {e}")),
            }
            // Publish Stopped as soon as the child is gone, not when the
            // output pumps drain; stop actions wait on this transition.
            let _ = self.set_state(ProcState::Stopped);
        };
        tokio::join!(
            pump(&self.stdout, stdout, "stdout", &name),
            pump(&self.stderr, stderr, "stderr", &name),
            wait,
        );

        self.set_state(ProcState::WaitDone)?;
        Ok(())
    }

    pub async fn stdout_pipe(&self) -> DuplexStream {
        self.stdout.pipe().await
    }

    pub async fn stderr_pipe(&self) -> DuplexStream {
        self.stderr.pipe().await
    }

    pub fn state(&self) -> ProcState {
        ProcState::from_i32(self.state.load(Ordering::SeqCst))
    }

    pub fn process(&self) -> Result<Pid, ProcError> {
        if self.state() < ProcState::Started {
            return Err(ProcError::NotStarted);
        }
        Ok(Pid::from_raw(self.pid.load(Ordering::SeqCst)))
    }

    pub fn signal(&self, sig: Signal) -> Result<(), ProcError> {
        let pid = self.process()?;
        kill(pid, sig).map_err(ProcError::Signal)
    }

    pub fn exit_code(&self) -> Result<i32, ProcError> {
        if self.state() < ProcState::Stopped {
            return Err(ProcError::NotStopped);
        }
        Ok(self.exit_code.load(Ordering::SeqCst))
    }

    /// Subscribe to state changes. Subscribers that attach after a
    /// transition do not see past events; after shutdown the subscription
    /// comes back closed.
    pub fn subscribe(&self) -> Subscription<ProcState> {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Close the state bus and park the state machine. The shutdown
    /// transition itself is never delivered to subscribers.
    pub fn shutdown(&self) {
        if self.state() >= ProcState::BusShutDown {
            return;
        }
        self.bus.shutdown();
        let _ = self.set_state(ProcState::BusShutDown);
    }

    fn set_state(&self, desired: ProcState) -> Result<(), ProcError> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= desired as i32 {
                return Err(ProcError::StateOrder {
                    current: ProcState::from_i32(current),
                    desired,
                });
            }
            match self.state.compare_exchange(
                current,
                desired as i32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.bus.publish(desired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::new(ProcessSpec::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]))
    }

    #[tokio::test]
    async fn pipes_carry_stdout_and_stderr() {
        let runner = Arc::new(sh("printf out; printf err >&2"));
        let mut stdout = runner.stdout_pipe().await;
        let mut stderr = runner.stderr_pipe().await;

        let r = Arc::clone(&runner);
        let run = tokio::spawn(async move { r.run(CancellationToken::new()).await });

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        let mut err = Vec::new();
        stderr.read_to_end(&mut err).await.unwrap();

        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn states_advance_in_order_and_shutdown_is_silent() {
        let runner = Arc::new(sh("true"));
        let mut states = runner.subscribe();

        let r = Arc::clone(&runner);
        let run = tokio::spawn(async move { r.run(CancellationToken::new()).await });

        assert_eq!(states.recv().await, Some(ProcState::Starting));
        assert_eq!(states.recv().await, Some(ProcState::Started));
        assert_eq!(states.recv().await, Some(ProcState::Stopped));
        assert_eq!(states.recv().await, Some(ProcState::WaitDone));
        // The bus closes without delivering BusShutDown.
        assert_eq!(states.recv().await, None);

        run.await.unwrap().unwrap();
        assert_eq!(runner.state(), ProcState::BusShutDown);
    }

    #[tokio::test]
    async fn exit_code_is_captured() {
        let runner = sh("exit 3");
        runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(runner.exit_code().unwrap(), 3);
    }

    #[tokio::test]
    async fn queries_fail_before_their_state() {
        let runner = sh("true");
        assert!(matches!(
            runner.signal(Signal::SIGTERM),
            Err(ProcError::NotStarted)
        ));
        assert!(matches!(runner.process(), Err(ProcError::NotStarted)));
        assert!(matches!(runner.exit_code(), Err(ProcError::NotStopped)));
    }

    #[tokio::test]
    async fn launch_failure_does_not_reach_started() {
        let runner = sh("true");
        // Swap in a bogus program through a fresh runner.
        let runner = ProcessRunner::new(ProcessSpec {
            argv: vec!["/nonexistent/ella-test-binary".to_string()],
            ..runner.spec.clone()
        });
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcError::Io(_)));
        assert_eq!(runner.state(), ProcState::BusShutDown);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let runner = Arc::new(sh("sleep 60"));
        let mut states = runner.subscribe();
        let token = CancellationToken::new();

        let r = Arc::clone(&runner);
        let t = token.clone();
        let run = tokio::spawn(async move { r.run(t).await });

        assert_eq!(states.recv().await, Some(ProcState::Starting));
        assert_eq!(states.recv().await, Some(ProcState::Started));
        token.cancel();
        assert_eq!(states.recv().await, Some(ProcState::Stopped));

        run.await.unwrap().unwrap();
        assert_eq!(runner.exit_code().unwrap(), -1);
    }

    #[tokio::test]
    async fn run_cannot_be_replayed() {
        let runner = sh("true");
        runner.run(CancellationToken::new()).await.unwrap();
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcError::StateOrder { .. }));
    }
}
