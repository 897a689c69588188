//! Central path resolution for all hookbridge data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `HOOKBRIDGE_DATA_DIR` env > `~/.hookbridge`.
//! All callsites use these helpers instead of constructing paths by hand.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DATA_DIR_ENV: &str = "HOOKBRIDGE_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Priority: `explicit` arg > `HOOKBRIDGE_DATA_DIR` env > `~/.hookbridge` default.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Some(env_val) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()
                .context("HOME directory not found")?
                .join(".hookbridge")
        };
        Ok(DataPaths { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        DataPaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn endpoint_file_path(&self) -> PathBuf {
        self.root.join("daemon.endpoint")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
