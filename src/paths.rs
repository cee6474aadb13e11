use std::path::{Path, PathBuf};

pub const SOCKET_NAME: &str = "ella.sock";

fn var_run_base() -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    if uid == 0 {
        PathBuf::from("/var/run/ella")
    } else {
        PathBuf::from(format!("/var/run/user/{uid}/ella"))
    }
}

pub fn default_pid_file() -> PathBuf {
    var_run_base().join("main.pid")
}

pub fn pid_file(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(default_pid_file)
}

/// Per-daemon directory holding the control socket; removed on graceful
/// shutdown.
pub fn runtime_dir(pid: u32) -> PathBuf {
    var_run_base().join(pid.to_string())
}

pub fn socket_path(pid: u32) -> PathBuf {
    runtime_dir(pid).join(SOCKET_NAME)
}

pub fn schema_url(version: &str) -> String {
    format!("https://ella-supervisor.github.io/schema/{version}/ella.schema.json")
}
