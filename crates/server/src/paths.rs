//! Central path resolution for all laskd data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `LASKD_DATA_DIR` env >
//! `~/.laskd`. All callsites use these helpers instead of constructing paths
//! from `HOME` directly.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `LASKD_DATA_DIR` env > `~/.laskd` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("LASKD_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".laskd")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("laskd.pid")
}

pub fn socket_path() -> PathBuf {
    data_dir().join("laskd.sock")
}

pub fn mail_pending_dir() -> PathBuf {
    data_dir().join("mail").join("pending")
}

/// Home for `.ccb/`/`.ccb_config/` artifacts is resolved per-project, not
/// under the daemon's own data dir; see `laskd_protocol::project_id`.
pub fn ccb_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".ccb")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    std::fs::create_dir_all(mail_pending_dir())?;
    Ok(())
}

/// Reset data dir — for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}
