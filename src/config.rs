use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;
use thiserror::Error;

use crate::action::{ReloadAction, StopAction, DEFAULT_STOP_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid include pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("include glob failed: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("circular inclusion: {0}")]
    CircularInclude(String),
    #[error("duplicate service name: {0}")]
    DuplicateService(String),
    #[error("service {name}: invalid command line")]
    BadCommand { name: String },
    #[error("service {name}: empty command line")]
    EmptyCommand { name: String },
    #[error("service {name}: unknown signal: {signal}")]
    UnknownSignal { name: String, signal: String },
    #[error("service {name}: invalid timeout {value:?}: {reason}")]
    BadTimeout {
        name: String,
        value: String,
        reason: String,
    },
    #[error("service {name}: unresolvable user: {user}")]
    UnknownUser { name: String, user: String },
    #[error("service {name}: unresolvable group: {group}")]
    UnknownGroup { name: String, group: String },
    #[error("service {name}: invalid env value: {value}")]
    BadEnv { name: String, value: String },
    #[error("service {name}: environment variable {key} is not set")]
    MissingEnv { name: String, key: String },
    #[error("service {name}: unknown watchdog strategy: {strategy}")]
    UnknownWatchdogStrategy { name: String, strategy: String },
    #[error("service {name}: invalid action type: {kind}")]
    BadActionType { name: String, kind: &'static str },
    #[error("service {name}: {what} action not implemented")]
    NotImplemented { name: String, what: &'static str },
}

// -------- on-disk schema --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Glob patterns of sub-config files. Relative patterns are resolved
    /// against the daemon's working directory.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Shell-quoted command line.
    pub exec: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// User name, numeric id, or "inherit" (the default).
    #[serde(default)]
    pub user: Option<Account>,
    #[serde(default)]
    pub group: Option<Account>,
    /// "inherit", or a map. Map values may be plain strings, "inherit"
    /// for per-key passthrough, or `{"value": ...}` to escape a literal.
    #[serde(default)]
    pub env: Option<EnvConfig>,
    /// File fed to the child's stdin.
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default = "default_true")]
    pub stderr: bool,
    /// Signal name, or `{type: "signal", code, timeout}`. `{type: "exec"}`
    /// is reserved and rejected.
    #[serde(default)]
    pub stop: Option<ActionConfig>,
    #[serde(default)]
    pub reload: Option<ActionConfig>,
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Account {
    Id(u32),
    Name(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvConfig {
    Inherit(String),
    Map(BTreeMap<String, EnvValue>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal { value: String },
    Plain(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionConfig {
    Signal(String),
    Detailed(DetailedAction),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DetailedAction {
    Signal {
        code: String,
        #[serde(default)]
        timeout: Option<DurationValue>,
    },
    Exec {
        #[serde(default)]
        command: Option<String>,
    },
}

/// Integer milliseconds or a suffixed string like "10s".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Millis(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    pub strategy: String,
}

// -------- resolved form --------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    Simple,
}

/// A fully validated service definition; everything the runtime needs,
/// with names, signals, users and environment already resolved.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub name: String,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    pub env: Option<Vec<(String, String)>>,
    pub stdin: Option<PathBuf>,
    pub log_stdout: bool,
    pub log_stderr: bool,
    pub stop: StopAction,
    pub reload: ReloadAction,
    pub watchdog: WatchdogKind,
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub pid_file: Option<PathBuf>,
    pub services: Vec<ServiceDef>,
}

pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read `path`, fold in its includes depth-first, reject duplicates and
/// resolve every service definition.
pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let root = read_config(path)?;
    let mut chain = vec![path.canonicalize().unwrap_or_else(|_| path.to_path_buf())];
    let mut merged: Vec<ServiceConfig> = Vec::new();
    collect_services(&root, &mut chain, &mut merged)?;
    check_duplicates(&merged)?;

    let services = merged
        .iter()
        .map(resolve_service)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LoadedConfig {
        pid_file: root.pid_file,
        services,
    })
}

/// Included services land before the including file's own, depth-first.
/// Patterns are globbed as given, so relative ones are relative to the
/// daemon's working directory. `chain` holds the canonical paths of the
/// current include chain; seeing one again is a cycle. A file reachable
/// along two separate chains is fine by itself (its duplicate services
/// are caught later).
fn collect_services(
    cfg: &Config,
    chain: &mut Vec<PathBuf>,
    out: &mut Vec<ServiceConfig>,
) -> Result<(), ConfigError> {
    for pattern in &cfg.include {
        let matches = glob::glob(pattern).map_err(|e| ConfigError::Pattern {
            pattern: pattern.clone(),
            source: e,
        })?;
        for entry in matches {
            let file = entry?;
            let canon = file.canonicalize().unwrap_or_else(|_| file.clone());
            if chain.contains(&canon) {
                let trail: Vec<String> = chain
                    .iter()
                    .chain(std::iter::once(&canon))
                    .map(|p| p.display().to_string())
                    .collect();
                return Err(ConfigError::CircularInclude(trail.join(" -> ")));
            }
            let sub = read_config(&file)?;
            chain.push(canon);
            collect_services(&sub, chain, out)?;
            chain.pop();
        }
    }
    out.extend(cfg.services.iter().cloned());
    Ok(())
}

fn check_duplicates(services: &[ServiceConfig]) -> Result<(), ConfigError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for s in services {
        if !seen.insert(s.name.as_str()) {
            return Err(ConfigError::DuplicateService(s.name.clone()));
        }
    }
    Ok(())
}

fn resolve_service(cfg: &ServiceConfig) -> Result<ServiceDef, ConfigError> {
    let name = cfg.name.clone();
    let argv = shlex::split(&cfg.exec).ok_or_else(|| ConfigError::BadCommand {
        name: name.clone(),
    })?;
    if argv.is_empty() {
        return Err(ConfigError::EmptyCommand { name });
    }

    Ok(ServiceDef {
        argv,
        cwd: cfg.cwd.clone(),
        uid: resolve_uid(&name, &cfg.user)?,
        gid: resolve_gid(&name, &cfg.group)?,
        env: resolve_env(&name, &cfg.env)?,
        stdin: cfg.stdin.clone(),
        log_stdout: cfg.stdout,
        log_stderr: cfg.stderr,
        stop: resolve_stop(&name, &cfg.stop)?,
        reload: resolve_reload(&name, &cfg.reload)?,
        watchdog: resolve_watchdog(&name, &cfg.watchdog)?,
        name,
    })
}

fn resolve_uid(name: &str, account: &Option<Account>) -> Result<u32, ConfigError> {
    match account {
        None => Ok(nix::unistd::getuid().as_raw()),
        Some(Account::Id(id)) => Ok(*id),
        Some(Account::Name(s)) if s == "inherit" => Ok(nix::unistd::getuid().as_raw()),
        Some(Account::Name(s)) => users::get_user_by_name(s)
            .map(|u| u.uid())
            .ok_or_else(|| ConfigError::UnknownUser {
                name: name.to_string(),
                user: s.clone(),
            }),
    }
}

fn resolve_gid(name: &str, account: &Option<Account>) -> Result<u32, ConfigError> {
    match account {
        None => Ok(nix::unistd::getgid().as_raw()),
        Some(Account::Id(id)) => Ok(*id),
        Some(Account::Name(s)) if s == "inherit" => Ok(nix::unistd::getgid().as_raw()),
        Some(Account::Name(s)) => users::get_group_by_name(s)
            .map(|g| g.gid())
            .ok_or_else(|| ConfigError::UnknownGroup {
                name: name.to_string(),
                group: s.clone(),
            }),
    }
}

fn resolve_env(
    name: &str,
    env: &Option<EnvConfig>,
) -> Result<Option<Vec<(String, String)>>, ConfigError> {
    match env {
        // Whole-environment inherit is the default and maps to "no
        // explicit environment" at spawn time.
        None => Ok(None),
        Some(EnvConfig::Inherit(s)) if s == "inherit" => Ok(None),
        Some(EnvConfig::Inherit(s)) => Err(ConfigError::BadEnv {
            name: name.to_string(),
            value: s.clone(),
        }),
        Some(EnvConfig::Map(map)) => {
            let mut out = Vec::with_capacity(map.len());
            for (key, value) in map {
                let resolved = match value {
                    EnvValue::Plain(s) if s == "inherit" => {
                        std::env::var(key).map_err(|_| ConfigError::MissingEnv {
                            name: name.to_string(),
                            key: key.clone(),
                        })?
                    }
                    EnvValue::Plain(s) => s.clone(),
                    // The object form escapes values that would otherwise
                    // be treated as the "inherit" marker.
                    EnvValue::Literal { value } => value.clone(),
                };
                out.push((key.clone(), resolved));
            }
            Ok(Some(out))
        }
    }
}

fn resolve_stop(name: &str, cfg: &Option<ActionConfig>) -> Result<StopAction, ConfigError> {
    match cfg {
        None => Ok(StopAction::Signal {
            signal: Signal::SIGTERM,
            timeout: DEFAULT_STOP_TIMEOUT,
        }),
        Some(ActionConfig::Signal(raw)) => Ok(StopAction::Signal {
            signal: resolve_signal(name, raw)?,
            timeout: DEFAULT_STOP_TIMEOUT,
        }),
        Some(ActionConfig::Detailed(DetailedAction::Signal { code, timeout })) => {
            let timeout = match timeout {
                None => DEFAULT_STOP_TIMEOUT,
                Some(v) => resolve_timeout(name, v)?,
            };
            Ok(StopAction::Signal {
                signal: resolve_signal(name, code)?,
                timeout,
            })
        }
        Some(ActionConfig::Detailed(DetailedAction::Exec { .. })) => {
            Err(ConfigError::NotImplemented {
                name: name.to_string(),
                what: "exec stop",
            })
        }
    }
}

fn resolve_reload(name: &str, cfg: &Option<ActionConfig>) -> Result<ReloadAction, ConfigError> {
    match cfg {
        None => Ok(ReloadAction::Signal {
            signal: Signal::SIGHUP,
        }),
        Some(ActionConfig::Signal(raw)) => Ok(ReloadAction::Signal {
            signal: resolve_signal(name, raw)?,
        }),
        // The object form of reload only knows the (reserved) exec kind;
        // a signal reload is always spelled as a bare signal name.
        Some(ActionConfig::Detailed(DetailedAction::Signal { .. })) => {
            Err(ConfigError::BadActionType {
                name: name.to_string(),
                kind: "signal",
            })
        }
        Some(ActionConfig::Detailed(DetailedAction::Exec { .. })) => {
            Err(ConfigError::NotImplemented {
                name: name.to_string(),
                what: "exec reload",
            })
        }
    }
}

fn resolve_watchdog(
    name: &str,
    cfg: &Option<WatchdogConfig>,
) -> Result<WatchdogKind, ConfigError> {
    match cfg {
        None => Ok(WatchdogKind::Simple),
        Some(w) if w.strategy == "simple" => Ok(WatchdogKind::Simple),
        Some(w) => Err(ConfigError::UnknownWatchdogStrategy {
            name: name.to_string(),
            strategy: w.strategy.clone(),
        }),
    }
}

fn resolve_signal(name: &str, raw: &str) -> Result<Signal, ConfigError> {
    signal_from_name(raw).ok_or_else(|| ConfigError::UnknownSignal {
        name: name.to_string(),
        signal: raw.to_string(),
    })
}

/// Accepts the usual POSIX names, with or without the SIG prefix.
pub fn signal_from_name(raw: &str) -> Option<Signal> {
    let t = raw.trim();
    let t = t.strip_prefix("SIG").unwrap_or(t);
    match t {
        "ABRT" => Some(Signal::SIGABRT),
        "ALRM" => Some(Signal::SIGALRM),
        "CHLD" => Some(Signal::SIGCHLD),
        "CONT" => Some(Signal::SIGCONT),
        "FPE" => Some(Signal::SIGFPE),
        "HUP" => Some(Signal::SIGHUP),
        "ILL" => Some(Signal::SIGILL),
        "INT" => Some(Signal::SIGINT),
        "KILL" => Some(Signal::SIGKILL),
        "PIPE" => Some(Signal::SIGPIPE),
        "QUIT" => Some(Signal::SIGQUIT),
        "SEGV" => Some(Signal::SIGSEGV),
        "STOP" => Some(Signal::SIGSTOP),
        "TERM" => Some(Signal::SIGTERM),
        "TSTP" => Some(Signal::SIGTSTP),
        "TTIN" => Some(Signal::SIGTTIN),
        "TTOU" => Some(Signal::SIGTTOU),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}

fn resolve_timeout(name: &str, value: &DurationValue) -> Result<Duration, ConfigError> {
    match value {
        DurationValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
        DurationValue::Text(s) => parse_duration_str(s)
            .map(Duration::from_millis)
            .map_err(|reason| ConfigError::BadTimeout {
                name: name.to_string(),
                value: s.clone(),
                reason,
            }),
    }
}

/// e.g. 1000ms, 10s, 1m, 2h
fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut idx = 0usize;
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number: {e}"))?;
    if num < 0.0 {
        return Err("duration must be >= 0".to_string());
    }
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}
