use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::bus::{Bus, Subscription};
use crate::config::{ServiceDef, WatchdogKind};
use crate::event::event;
use crate::lines::{merged, prefixed, LogStream};
use crate::runner::{ProcessRunner, ProcessSpec};
use crate::watchdog::{SimpleWatchdog, WatchdogError, WatchdogSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    Reloading = 3,
    Deactivating = 4,
    Failed = 5,
}

impl ServiceState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceState::Inactive | ServiceState::Failed)
    }

    fn from_i32(v: i32) -> ServiceState {
        match v {
            0 => ServiceState::Inactive,
            1 => ServiceState::Activating,
            2 => ServiceState::Active,
            3 => ServiceState::Reloading,
            4 => ServiceState::Deactivating,
            _ => ServiceState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service already running")]
    AlreadyRunning,
    #[error("service already stopped")]
    AlreadyStopped,
    #[error("service is not active")]
    NotActive,
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
}

/// The observable half of a service, shared with the watchdog signal
/// handler task: current state, the state bus, the action mutex and the
/// lifecycle log sender.
struct Core {
    name: String,
    state: AtomicI32,
    bus: Bus<ServiceState>,
    action: tokio::sync::Mutex<()>,
    log_tx: mpsc::UnboundedSender<String>,
}

impl Core {
    fn state(&self) -> ServiceState {
        ServiceState::from_i32(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as i32, Ordering::SeqCst);
        self.bus.publish(state);
    }

    fn log_line(&self, msg: &str) {
        let _ = self.log_tx.send(msg.to_string());
    }

    fn start_done(&self) {
        self.log_line("started");
        self.set_state(ServiceState::Active);
    }

    fn stop_done(&self) {
        self.log_line("stopped");
        self.set_state(ServiceState::Inactive);
    }

    fn reload_done(&self) {
        self.log_line("reloaded");
        self.set_state(ServiceState::Active);
    }

    fn fail(&self) {
        self.log_line("failed");
        self.set_state(ServiceState::Failed);
    }

    async fn handle_watchdog_signal(&self, sig: WatchdogSignal) {
        let _guard = self.action.lock().await;
        match sig {
            // A command issued between the process starting and this
            // signal being handled wins; a stale confirmation must not
            // resurrect the service.
            WatchdogSignal::Started => {
                if self.state() == ServiceState::Activating {
                    self.start_done();
                }
            }
            // The terminal stop path is driven by stop() itself.
            WatchdogSignal::Stopped => {}
            WatchdogSignal::Failed => {
                if !self.state().is_stopped() {
                    self.fail();
                }
            }
        }
    }
}

/// A supervised unit: controllable, observable, streamable.
///
/// All state transitions happen under the action mutex, including the ones
/// driven by watchdog signals, so no command can observe a half-finished
/// transition. `Failed` is a stopped state and `start` recovers from it.
pub struct Service {
    core: Arc<Core>,
    watchdog: Option<Arc<SimpleWatchdog>>,
    log_b: Broadcaster,
    log_stdout: bool,
    log_stderr: bool,
    log_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Service {
    pub fn new(
        name: String,
        watchdog: Option<Arc<SimpleWatchdog>>,
        log_stdout: bool,
        log_stderr: bool,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(Core {
                name,
                state: AtomicI32::new(ServiceState::Inactive as i32),
                bus: Bus::new(),
                action: tokio::sync::Mutex::new(()),
                log_tx,
            }),
            watchdog,
            log_b: Broadcaster::new(),
            log_stdout,
            log_stderr,
            log_rx: StdMutex::new(Some(log_rx)),
        }
    }

    /// Assemble a service from its validated definition.
    pub fn from_def(def: &ServiceDef) -> Self {
        let spec = ProcessSpec {
            argv: def.argv.clone(),
            stdin: def.stdin.clone(),
            cwd: def.cwd.clone(),
            uid: def.uid,
            gid: def.gid,
            env: def.env.clone(),
        };
        let factory = Box::new(move || Arc::new(ProcessRunner::new(spec.clone())));
        let watchdog = match def.watchdog {
            WatchdogKind::Simple => Some(Arc::new(SimpleWatchdog::new(
                factory,
                def.stop.clone(),
                def.reload.clone(),
            ))),
        };
        Self::new(def.name.clone(), watchdog, def.log_stdout, def.log_stderr)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ServiceState {
        self.core.state()
    }

    pub fn subscribe(&self) -> Subscription<ServiceState> {
        self.core.bus.subscribe()
    }

    pub fn watchdog(&self) -> Option<&Arc<SimpleWatchdog>> {
        self.watchdog.as_ref()
    }

    /// Begin activation. Completion is asynchronous: the service reports
    /// `Active` through its state bus once the watchdog confirms the
    /// process started.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let _guard = self.core.action.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<(), ServiceError> {
        let _guard = self.core.action.lock().await;
        self.stop_locked().await
    }

    pub async fn reload(&self) -> Result<(), ServiceError> {
        let _guard = self.core.action.lock().await;
        self.reload_locked().await
    }

    /// Stop (when running) then start, atomically with respect to other
    /// commands on this service.
    pub async fn restart(&self) -> Result<(), ServiceError> {
        let _guard = self.core.action.lock().await;
        if !self.core.state().is_stopped() {
            self.stop_locked().await?;
        }
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), ServiceError> {
        if !self.core.state().is_stopped() {
            return Err(ServiceError::AlreadyRunning);
        }
        self.core.log_line("starting");
        self.core.set_state(ServiceState::Activating);

        let Some(wd) = &self.watchdog else {
            self.core.start_done();
            return Ok(());
        };
        match wd.start().await {
            Err(e) => {
                self.core.fail();
                Err(e.into())
            }
            Ok(mut signals) => {
                let core = Arc::clone(&self.core);
                tokio::spawn(async move {
                    while let Some(sig) = signals.recv().await {
                        core.handle_watchdog_signal(sig).await;
                    }
                });
                Ok(())
            }
        }
    }

    async fn stop_locked(&self) -> Result<(), ServiceError> {
        if self.core.state().is_stopped() {
            return Err(ServiceError::AlreadyStopped);
        }
        self.core.log_line("stopping");
        self.core.set_state(ServiceState::Deactivating);

        let Some(wd) = &self.watchdog else {
            self.core.stop_done();
            return Ok(());
        };
        match wd.stop().await {
            Err(e) => {
                self.core.fail();
                Err(e.into())
            }
            Ok(()) => {
                self.core.stop_done();
                Ok(())
            }
        }
    }

    async fn reload_locked(&self) -> Result<(), ServiceError> {
        if self.core.state() != ServiceState::Active {
            return Err(ServiceError::NotActive);
        }
        self.core.log_line("reloading");
        self.core.set_state(ServiceState::Reloading);

        let Some(wd) = &self.watchdog else {
            self.core.reload_done();
            return Ok(());
        };
        match wd.reload().await {
            Err(e) => {
                self.core.fail();
                Err(e.into())
            }
            Ok(()) => {
                self.core.reload_done();
                Ok(())
            }
        }
    }

    async fn write_log(&self, line: &str) {
        let formatted = format!("{}: {line}\n", self.core.name);
        self.log_b.write(formatted.as_bytes()).await;
    }

    /// Merged line stream: lifecycle lines plus, when enabled, child
    /// stdout/stderr tagged with `<name>[stdout]:` / `<name>[stderr]:`.
    pub async fn logs(&self) -> LogStream {
        let mut readers: Vec<Box<dyn AsyncRead + Send + Unpin>> =
            vec![Box::new(self.log_b.pipe().await)];
        if let Some(wd) = &self.watchdog {
            if self.log_stdout {
                readers.push(Box::new(prefixed(
                    format!("{}[stdout]:", self.core.name),
                    wd.logs().stdout_pipe().await,
                )));
            }
            if self.log_stderr {
                readers.push(Box::new(prefixed(
                    format!("{}[stderr]:", self.core.name),
                    wd.logs().stderr_pipe().await,
                )));
            }
        }
        merged(readers)
    }

    /// Pump lifecycle log lines into the log broadcaster until the token
    /// fires, then shut the service down in order: stop the process if it
    /// is still up, flush pending lines, tear down the log fan-out, close
    /// the state bus and the process log. Does not start the service.
    pub async fn run(&self, token: CancellationToken) {
        let taken = {
            let mut rx = self.log_rx.lock().unwrap_or_else(|p| p.into_inner());
            rx.take()
        };
        let Some(mut rx) = taken else {
            // A second run loop for the same service is a wiring bug.
            event("service", Some(self.core.name.as_str()), "run called twice");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => self.write_log(&line).await,
                    None => break,
                }
            }
        }

        if !self.core.state().is_stopped() {
            if let Err(e) = self.stop().await {
                event(
                    "service",
                    Some(self.core.name.as_str()),
                    format!("shutdown stop: {e}"),
                );
            }
        }
        while let Ok(line) = rx.try_recv() {
            self.write_log(&line).await;
        }
        self.log_b.remove_all().await;
        self.core.bus.shutdown();
        if let Some(wd) = &self.watchdog {
            wd.logs().shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ReloadAction, StopAction};
    use nix::sys::signal::Signal;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_service(name: &str, script: &str) -> Arc<Service> {
        let script = script.to_string();
        let factory = Box::new(move || {
            Arc::new(ProcessRunner::new(ProcessSpec::new(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.clone(),
            ])))
        });
        let wd = Arc::new(SimpleWatchdog::new(
            factory,
            StopAction::Signal {
                signal: Signal::SIGTERM,
                timeout: Duration::from_secs(5),
            },
            ReloadAction::Signal {
                signal: Signal::SIGHUP,
            },
        ));
        Arc::new(Service::new(name.to_string(), Some(wd), true, true))
    }

    async fn wait_for(states: &mut Subscription<ServiceState>, wanted: ServiceState) {
        timeout(Duration::from_secs(5), async {
            while let Some(s) = states.recv().await {
                if s == wanted {
                    return;
                }
            }
            panic!("state bus closed before reaching {wanted:?}");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
    }

    #[tokio::test]
    async fn start_stop_walks_the_state_machine() {
        let svc = sh_service("svc", "exec sleep 60");
        let mut states = svc.subscribe();

        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;

        assert!(matches!(
            svc.start().await,
            Err(ServiceError::AlreadyRunning)
        ));

        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Inactive);
        assert!(matches!(
            svc.stop().await,
            Err(ServiceError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn crash_drives_the_service_to_failed() {
        let svc = sh_service("crash", "exit 1");
        let mut states = svc.subscribe();

        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Failed).await;
        assert_eq!(
            svc.watchdog()
                .unwrap()
                .logs()
                .last()
                .unwrap()
                .exit_code()
                .unwrap(),
            1
        );

        // Failed is a stopped state: start recovers from it.
        let mut states = svc.subscribe();
        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Failed).await;
    }

    #[tokio::test]
    async fn restart_yields_a_fresh_process() {
        let svc = sh_service("svc", "exec sleep 60");
        let mut states = svc.subscribe();

        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;
        let first = svc
            .watchdog()
            .unwrap()
            .logs()
            .last()
            .unwrap()
            .process()
            .unwrap();

        let mut trajectory = svc.subscribe();
        svc.restart().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;

        let mut seen = Vec::new();
        while let Some(s) = trajectory.try_recv() {
            seen.push(s);
        }
        assert!(seen.starts_with(&[
            ServiceState::Deactivating,
            ServiceState::Inactive,
            ServiceState::Activating,
        ]));

        let second = svc
            .watchdog()
            .unwrap()
            .logs()
            .last()
            .unwrap()
            .process()
            .unwrap();
        assert_ne!(first, second);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reload_requires_active() {
        let svc = sh_service("svc", "trap '' HUP; while :; do sleep 1; done");
        assert!(matches!(svc.reload().await, Err(ServiceError::NotActive)));

        let mut states = svc.subscribe();
        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;

        svc.reload().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Active);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_stops_resolve_to_one_winner() {
        let svc = sh_service("svc", "exec sleep 60");
        let mut states = svc.subscribe();
        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;

        let a = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.stop().await })
        };
        let b = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.stop().await })
        };
        let ra = a.await.unwrap();
        let rb = b.await.unwrap();

        let oks = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1, "exactly one stop may win: {ra:?} / {rb:?}");
        assert!(matches!(
            [ra, rb].into_iter().find(|r| r.is_err()).unwrap(),
            Err(ServiceError::AlreadyStopped)
        ));
        assert_eq!(svc.state(), ServiceState::Inactive);
    }

    #[tokio::test]
    async fn watchdogless_service_activates_synchronously() {
        let svc = Arc::new(Service::new("plain".to_string(), None, false, false));
        svc.start().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Active);
        svc.reload().await.unwrap();
        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Inactive);
    }

    #[tokio::test]
    async fn reloads_between_actives_are_observable() {
        let svc = sh_service("svc", "trap '' HUP; while :; do sleep 1; done");
        let mut states = svc.subscribe();
        svc.start().await.unwrap();
        wait_for(&mut states, ServiceState::Active).await;

        let mut trajectory = svc.subscribe();
        svc.reload().await.unwrap();
        let mut seen = Vec::new();
        while let Some(s) = trajectory.try_recv() {
            seen.push(s);
        }
        assert_eq!(seen, vec![ServiceState::Reloading, ServiceState::Active]);
        svc.stop().await.unwrap();
    }
}
