use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionError, ReloadAction, StopAction};
use crate::event::event;
use crate::process_log::{EmptyLog, ProcessLog};
use crate::runner::{ProcState, ProcessRunner};

/// Service-level view of what happened to the underlying process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    Started,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("an active process is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Empty(#[from] EmptyLog),
    #[error(transparent)]
    Action(#[from] ActionError),
}

/// Builds the next runner for a service. The process spec is resolved up
/// front so construction itself cannot fail; launch problems surface
/// through the runner's own lifecycle.
pub type ProcFactory = Box<dyn Fn() -> Arc<ProcessRunner> + Send + Sync>;

/// One process per service, no restarts.
///
/// Translates runner states into `Started`/`Stopped`/`Failed` signals and
/// owns the stop/reload actions. The `running` flag is set from `start`
/// until either `stop` is requested or the process is gone; while a stop
/// is in flight it marks operator intent, so an exit during that window is
/// reported as `Stopped` rather than `Failed`.
pub struct SimpleWatchdog {
    log: ProcessLog,
    factory: ProcFactory,
    stop: StopAction,
    reload: ReloadAction,
    running: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SimpleWatchdog {
    pub fn new(factory: ProcFactory, stop: StopAction, reload: ReloadAction) -> Self {
        Self {
            log: ProcessLog::new(),
            factory,
            stop,
            reload,
            running: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
            cancel: Mutex::new(None),
        }
    }

    /// Launch a new process and observe it.
    ///
    /// Returns the signal stream for this execution; the stream closes
    /// once the process is fully torn down. Fails with `AlreadyRunning`
    /// while a previous execution is still live.
    pub async fn start(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<WatchdogSignal>, WatchdogError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WatchdogError::AlreadyRunning);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let runner = (self.factory)();
        self.log.push(Arc::clone(&runner));

        // Subscribe before the runner starts so no transition is missed.
        let mut states = runner.subscribe();
        let token = CancellationToken::new();
        {
            let mut cancel = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
            *cancel = Some(token.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::clone(&self.running);
        let epochs = Arc::clone(&self.epoch);
        tokio::spawn(async move {
            let run_target = Arc::clone(&runner);
            let run = tokio::spawn(async move {
                if let Err(e) = run_target.run(token).await {
                    event("watchdog", None, format!("process: {e}"));
                }
            });

            let mut saw_exit = false;
            while let Some(state) = states.recv().await {
                match state {
                    ProcState::Started => {
                        let _ = tx.send(WatchdogSignal::Started);
                    }
                    ProcState::Stopped => {
                        saw_exit = true;
                        let code = runner.exit_code().unwrap_or(0);
                        let failed = code != 0 && running.load(Ordering::SeqCst);
                        // The process is gone; release the slot before
                        // reporting so a start issued right after the
                        // signal is never spuriously rejected. Guarded by
                        // the epoch so a newer execution keeps its claim.
                        if epochs.load(Ordering::SeqCst) == epoch {
                            running.store(false, Ordering::SeqCst);
                        }
                        let _ = tx.send(if failed {
                            WatchdogSignal::Failed
                        } else {
                            WatchdogSignal::Stopped
                        });
                    }
                    _ => {}
                }
            }
            if !saw_exit {
                // The runner went away without ever producing an exit
                // (spawn failure). Report it so the service leaves
                // Activating.
                if running.load(Ordering::SeqCst) {
                    let _ = tx.send(WatchdogSignal::Failed);
                } else {
                    let _ = tx.send(WatchdogSignal::Stopped);
                }
            }
            // Only clear the flag for our own execution; a newer start may
            // have claimed it already.
            if epochs.load(Ordering::SeqCst) == epoch {
                running.store(false, Ordering::SeqCst);
            }
            let _ = run.await;
        });

        Ok(rx)
    }

    /// Apply the stop action to the current process. Clearing `running`
    /// first is what keeps an operator-initiated exit from being reported
    /// as a failure.
    pub async fn stop(&self) -> Result<(), WatchdogError> {
        let runner = self.log.last()?;
        self.running.store(false, Ordering::SeqCst);
        let res = self.stop.exec(&runner).await;
        // Backstop: release the runner task even if the action misfired.
        let token = {
            let mut cancel = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
            cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
        res.map_err(Into::into)
    }

    pub async fn reload(&self) -> Result<(), WatchdogError> {
        let runner = self.log.last()?;
        self.reload.exec(&runner).await.map_err(Into::into)
    }

    pub fn logs(&self) -> &ProcessLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessSpec;
    use nix::sys::signal::Signal;
    use std::time::Duration;

    fn watchdog(script: &str) -> Arc<SimpleWatchdog> {
        let script = script.to_string();
        Arc::new(SimpleWatchdog::new(
            Box::new(move || {
                Arc::new(ProcessRunner::new(ProcessSpec::new(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.clone(),
                ])))
            }),
            StopAction::Signal {
                signal: Signal::SIGTERM,
                timeout: Duration::from_secs(5),
            },
            ReloadAction::Signal {
                signal: Signal::SIGHUP,
            },
        ))
    }

    #[tokio::test]
    async fn operator_stop_reports_stopped() {
        let wd = watchdog("exec sleep 60");
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));

        wd.stop().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Stopped));
        assert_eq!(signals.recv().await, None);
    }

    #[tokio::test]
    async fn clean_exit_reports_stopped() {
        let wd = watchdog("true");
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Stopped));
    }

    #[tokio::test]
    async fn crash_reports_failed() {
        let wd = watchdog("exit 1");
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Failed));
        assert_eq!(wd.logs().last().unwrap().exit_code().unwrap(), 1);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let wd = watchdog("exec sleep 60");
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));

        assert!(matches!(
            wd.start().await,
            Err(WatchdogError::AlreadyRunning)
        ));
        wd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_a_process_is_an_error() {
        let wd = watchdog("true");
        assert!(matches!(wd.stop().await, Err(WatchdogError::Empty(_))));
    }

    #[tokio::test]
    async fn spawn_failure_reports_failed() {
        let wd = Arc::new(SimpleWatchdog::new(
            Box::new(|| {
                Arc::new(ProcessRunner::new(ProcessSpec::new(vec![
                    "/nonexistent/ella-test-binary".to_string(),
                ])))
            }),
            StopAction::Signal {
                signal: Signal::SIGTERM,
                timeout: Duration::from_secs(1),
            },
            ReloadAction::Signal {
                signal: Signal::SIGHUP,
            },
        ));
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Failed));
        assert_eq!(signals.recv().await, None);
    }

    #[tokio::test]
    async fn restart_sequence_gets_a_fresh_pid() {
        let wd = watchdog("exec sleep 60");
        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));
        let first = wd.logs().last().unwrap().process().unwrap();

        wd.stop().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Stopped));
        assert_eq!(signals.recv().await, None);

        let mut signals = wd.start().await.unwrap();
        assert_eq!(signals.recv().await, Some(WatchdogSignal::Started));
        let second = wd.logs().last().unwrap().process().unwrap();
        assert_ne!(first, second);
        wd.stop().await.unwrap();
    }
}
