//! Configuration loading and defaults for lscreensaver.
//!
//! The file is plain `key = value` text, one setting per line. Problems in
//! the file are never fatal: bad lines are skipped with a warning and the
//! remaining settings still apply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::domain::{ExemptionSet, MAX_EXEMPT_PROCESSES};

/// Default idle timeout before blanking (10 minutes).
pub const DEFAULT_INACTIVITY_SECONDS: u64 = 600;

/// Main configuration for the daemon mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Idle time before the screen is blanked (default: 600s).
    pub inactivity_time: Duration,

    /// Process basenames that suppress auto-blanking while running.
    pub exempt_processes: ExemptionSet,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inactivity_time: Duration::from_secs(DEFAULT_INACTIVITY_SECONDS),
            exempt_processes: ExemptionSet::new(),
        }
    }
}

impl Config {
    /// Default config location: `$XDG_CONFIG_HOME/lscreensaver/config`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lscreensaver").join("config"))
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        debug!("Parsing config file {}", path.display());
        Ok(Self::parse(&content))
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_if_exists(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load an explicit path, or the default path when none is given.
    ///
    /// A missing default file is not an error; an explicit path must be readable.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        match Self::default_path() {
            Some(default_path) => Self::load_if_exists(&default_path),
            None => Ok(Self::default()),
        }
    }

    /// Parse `key = value` text on top of the defaults.
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        let mut dropped = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let lineno = index + 1;
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("Skipping malformed config line {}: no '='", lineno);
                continue;
            };

            match (key.trim(), value.trim()) {
                ("inactivity_time", value) => match value.parse::<u64>() {
                    Ok(secs) => config.inactivity_time = Duration::from_secs(secs),
                    Err(e) => warn!(
                        "Invalid inactivity_time '{}' on line {}: {}. Keeping {}s",
                        value,
                        lineno,
                        e,
                        config.inactivity_time.as_secs()
                    ),
                },
                ("exempt_processes", value) => {
                    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                        if let Err(full) = config.exempt_processes.insert(name) {
                            dropped.push(full.0);
                        }
                    }
                }
                (key, _) => warn!("Ignoring unknown config key '{}' on line {}", key, lineno),
            }
        }

        if !dropped.is_empty() {
            warn!(
                "Only {} exempt processes are supported; ignoring: {}",
                MAX_EXEMPT_PROCESSES,
                dropped.join(", ")
            );
        }

        config
    }

    /// Log the effective settings.
    pub fn log_summary(&self) {
        info!("Inactivity timeout: {}s", self.inactivity_time.as_secs());
        for (i, name) in self.exempt_processes.iter().enumerate() {
            info!("Exempt[{}] = '{}'", i, name);
        }
    }
}
