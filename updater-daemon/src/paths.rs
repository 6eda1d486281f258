use std::path::{Path, PathBuf};
use std::time::Duration;

use updater_core::config::{config_dir_at, CONFIG_FILE};

/// Quiet period after the last config file event before reloading.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn updater_root(home: &Path) -> PathBuf {
    config_dir_at(home)
}

pub fn config_file_name() -> &'static str {
    CONFIG_FILE
}

pub fn socket_path(home: &Path) -> PathBuf {
    updater_root(home).join(DAEMON_SOCKET)
}
