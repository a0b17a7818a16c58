// ABOUTME: Filesystem locations under the ~/.kafclaw dot-directory.
// ABOUTME: Sessions directory, timeline database, and config file resolution.

use directories::BaseDirs;
use std::path::PathBuf;

const DOT_DIR: &str = ".kafclaw";

/// The user's home directory. Honors $HOME so tests can redirect it;
/// falls back to the current directory when neither source resolves.
pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Root state directory, e.g. ~/.kafclaw
pub fn state_dir() -> PathBuf {
    home_dir().join(DOT_DIR)
}

/// Where session documents live, e.g. ~/.kafclaw/sessions
pub fn sessions_dir() -> PathBuf {
    state_dir().join("sessions")
}

/// Default timeline database path, e.g. ~/.kafclaw/timeline.db
pub fn timeline_db() -> PathBuf {
    state_dir().join("timeline.db")
}

/// Default config file path, e.g. ~/.kafclaw/config.toml
pub fn config_file() -> PathBuf {
    state_dir().join("config.toml")
}
