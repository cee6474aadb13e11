use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::time::timeout;

use crate::bus::Subscription;
use crate::event::event;
use crate::runner::{ProcError, ProcState, ProcessRunner};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("process never stopped")]
    NeverStopped,
    #[error(transparent)]
    Proc(#[from] ProcError),
}

/// How to take a running process down.
///
/// Signal-based stop is the only implemented kind; exec-based stop exists
/// in the configuration schema and is rejected there as not implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopAction {
    Signal { signal: Signal, timeout: Duration },
}

impl StopAction {
    /// Drive the runner to `Stopped`.
    ///
    /// Delivers the configured signal and waits up to the timeout; on
    /// expiry escalates to SIGKILL and keeps waiting (the kill makes the
    /// remaining wait finite). Succeeds immediately when the process is
    /// already down.
    pub async fn exec(&self, runner: &ProcessRunner) -> Result<(), ActionError> {
        match self {
            StopAction::Signal { signal, timeout } => {
                stop_by_signal(runner, *signal, *timeout).await
            }
        }
    }
}

async fn stop_by_signal(
    runner: &ProcessRunner,
    signal: Signal,
    grace: Duration,
) -> Result<(), ActionError> {
    // Subscribe before checking state so the Stopped transition cannot
    // slip between the check and the wait.
    let mut states = runner.subscribe();
    if runner.state() >= ProcState::Stopped {
        return Ok(());
    }
    runner.signal(signal)?;

    match timeout(grace, wait_for_stopped(runner, &mut states)).await {
        Ok(res) => res,
        Err(_) => {
            event(
                "action",
                None,
                format!("stop timed out after {grace:?}; escalating to SIGKILL"),
            );
            if let Err(e) = runner.signal(Signal::SIGKILL) {
                // ESRCH here means the child beat us to the exit.
                if runner.state() >= ProcState::Stopped {
                    return Ok(());
                }
                return Err(e.into());
            }
            wait_for_stopped(runner, &mut states).await
        }
    }
}

async fn wait_for_stopped(
    runner: &ProcessRunner,
    states: &mut Subscription<ProcState>,
) -> Result<(), ActionError> {
    loop {
        if runner.state() >= ProcState::Stopped {
            return Ok(());
        }
        match states.recv().await {
            Some(s) if s >= ProcState::Stopped => return Ok(()),
            Some(_) => continue,
            None => {
                if runner.state() >= ProcState::Stopped {
                    return Ok(());
                }
                return Err(ActionError::NeverStopped);
            }
        }
    }
}

/// How to ask a running process to reload. Fire and forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadAction {
    Signal { signal: Signal },
}

impl ReloadAction {
    pub async fn exec(&self, runner: &ProcessRunner) -> Result<(), ActionError> {
        match self {
            ReloadAction::Signal { signal } => {
                runner.signal(*signal)?;
                Ok(())
            }
        }
    }
}
