use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::{self, LoadedConfig};
use crate::control::ControlClient;
use crate::daemon::{
    self, Daemon, CODE_GENERAL_ERR, CODE_INVALID_CONFIG, CODE_INVALID_INVOCATION, CODE_SUCCESS,
};
use crate::paths;

#[derive(Debug, Parser)]
#[command(name = "ella", version, about = "lightweight per-user process supervisor")]
pub struct Args {
    /// Path to the config file
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        default_value = "ella.json"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the daemon
    Run {
        /// Suppress mirroring service logs to stdout
        #[arg(short = 'l', long = "no-logs")]
        no_logs: bool,
        /// Start all configured services
        #[arg(short = 'a', long = "all")]
        all: bool,
        /// Services to start on boot
        services: Vec<String>,
    },
    /// List services registered with the daemon
    List,
    /// Start services
    Start {
        #[arg(short = 'a', long = "all")]
        all: bool,
        services: Vec<String>,
    },
    /// Stop services
    Stop {
        #[arg(short = 'a', long = "all")]
        all: bool,
        services: Vec<String>,
    },
    /// Restart services
    Restart {
        #[arg(short = 'a', long = "all")]
        all: bool,
        services: Vec<String>,
    },
    /// Reload services
    Reload {
        #[arg(short = 'a', long = "all")]
        all: bool,
        services: Vec<String>,
    },
    /// Stream merged service logs
    Logs {
        #[arg(short = 'a', long = "all")]
        all: bool,
        services: Vec<String>,
    },
    /// Print the URL of the config file's JSON schema
    Schema,
}

pub async fn run() -> i32 {
    exec(Args::parse()).await
}

pub async fn exec(args: Args) -> i32 {
    match args.cmd {
        Cmd::Schema => {
            println!("{}", paths::schema_url(env!("CARGO_PKG_VERSION")));
            CODE_SUCCESS
        }
        Cmd::Run {
            no_logs,
            all,
            services,
        } => {
            let Some(cfg) = load_or_complain(&args.config) else {
                return CODE_INVALID_CONFIG;
            };
            let names = if all { all_names(&cfg) } else { services };
            Daemon::new(!no_logs)
                .run(signal_token(), &cfg, &names)
                .await
        }
        Cmd::List => {
            let Some(cfg) = load_or_complain(&args.config) else {
                return CODE_INVALID_CONFIG;
            };
            client_command(&cfg, "list", Vec::new()).await
        }
        Cmd::Start { all, services } => socket_action(&args.config, "start", all, services).await,
        Cmd::Stop { all, services } => socket_action(&args.config, "stop", all, services).await,
        Cmd::Restart { all, services } => {
            socket_action(&args.config, "restart", all, services).await
        }
        Cmd::Reload { all, services } => socket_action(&args.config, "reload", all, services).await,
        Cmd::Logs { all, services } => socket_action(&args.config, "logs", all, services).await,
    }
}

fn load_or_complain(path: &Path) -> Option<LoadedConfig> {
    match config::load(path) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("error: invalid config: {e}");
            None
        }
    }
}

fn all_names(cfg: &LoadedConfig) -> Vec<String> {
    cfg.services.iter().map(|s| s.name.clone()).collect()
}

async fn socket_action(config: &Path, verb: &str, all: bool, services: Vec<String>) -> i32 {
    let Some(cfg) = load_or_complain(config) else {
        return CODE_INVALID_CONFIG;
    };
    let names = if all { all_names(&cfg) } else { services };
    if names.is_empty() {
        eprintln!("error: no service name specified");
        return CODE_INVALID_INVOCATION;
    }
    client_command(&cfg, verb, names).await
}

async fn client_command(cfg: &LoadedConfig, verb: &str, names: Vec<String>) -> i32 {
    let pid_path = paths::pid_file(cfg.pid_file.as_deref());
    let pid = match daemon::read_pid_file(&pid_path) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("error: {e}");
            return CODE_GENERAL_ERR;
        }
    };

    let client = ControlClient::new(paths::socket_path(pid));
    let mut stdout = tokio::io::stdout();
    match client
        .run_command(&mut stdout, &signal_token(), verb, &names)
        .await
    {
        Ok(()) => CODE_SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            CODE_GENERAL_ERR
        }
    }
}

/// Root cancellation for the whole invocation, fired by SIGINT/SIGTERM.
fn signal_token() -> CancellationToken {
    let token = CancellationToken::new();
    let fire = token.clone();
    tokio::spawn(async move {
        let Ok(mut term) = unix_signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut int) = unix_signal(SignalKind::interrupt()) else {
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        fire.cancel();
    });
    token
}
