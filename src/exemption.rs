//! Exempt process detection.
//!
//! Scanning the process table is expensive compared to input polling, so the
//! result is cached and refreshed at most once per [`SAMPLE_INTERVAL`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, trace, warn};

use crate::domain::ExemptionSet;

/// Minimum time between two process-table scans.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Answers "is any exempt process running right now?".
pub trait ExemptProcessOracle {
    fn is_exempt_process_running(&mut self, exemptions: &ExemptionSet) -> Result<bool>;
}

/// Oracle backed by `/proc/<pid>/cmdline`.
#[derive(Debug, Clone)]
pub struct ProcScanner {
    root: PathBuf,
}

impl ProcScanner {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Scan a different proc-like tree.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ExemptProcessOracle for ProcScanner {
    fn is_exempt_process_running(&mut self, exemptions: &ExemptionSet) -> Result<bool> {
        if exemptions.is_empty() {
            return Ok(false);
        }

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(pid) = file_name.to_str().filter(|s| is_pid(s)) else {
                continue;
            };

            // Processes may exit between listing and reading.
            let Some(name) = process_name(&entry.path()) else {
                continue;
            };

            if exemptions.contains(&name) {
                trace!("Exempt process '{}' running as pid {}", name, pid);
                return Ok(true);
            }
        }

        Ok(false)
    }
}

fn is_pid(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) && name != "0"
}

/// Basename of argv[0] from `<proc_dir>/cmdline`.
fn process_name(proc_dir: &Path) -> Option<String> {
    let cmdline = fs::read(proc_dir.join("cmdline")).ok()?;
    let argv0 = cmdline.split(|&b| b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }

    let argv0 = String::from_utf8_lossy(argv0);
    let base = argv0.rsplit('/').next().unwrap_or_default();
    Some(base.to_string())
}

/// Result of one [`ExemptionSampler::sample`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Current (possibly cached) exemption state.
    pub running: bool,
    /// True only when a fresh scan flipped the state.
    pub changed: bool,
}

/// Rate-limited, cached view of an [`ExemptProcessOracle`].
pub struct ExemptionSampler<O> {
    oracle: O,
    exemptions: ExemptionSet,
    running: bool,
    last_sample: Instant,
}

impl<O: ExemptProcessOracle> ExemptionSampler<O> {
    /// Create a sampler and take the initial sample at `now`.
    pub fn new(oracle: O, exemptions: ExemptionSet, now: Instant) -> Self {
        let mut sampler = Self {
            oracle,
            exemptions,
            running: false,
            last_sample: now,
        };
        sampler.running = sampler.query();
        if sampler.running {
            info!("Exempt process already running at startup");
        }
        sampler
    }

    /// Cached exemption state.
    pub fn running(&self) -> bool {
        self.running
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Refresh the cache if [`SAMPLE_INTERVAL`] has passed since the last scan.
    pub fn sample(&mut self, now: Instant) -> Sample {
        if now.saturating_duration_since(self.last_sample) < SAMPLE_INTERVAL {
            return Sample {
                running: self.running,
                changed: false,
            };
        }

        self.last_sample = now;
        let running = self.query();
        let prev = std::mem::replace(&mut self.running, running);

        if running == prev {
            trace!("Exempt process running: {}", running);
        } else {
            info!("Exempt process running changed: {} -> {}", prev, running);
        }

        Sample {
            running,
            changed: running != prev,
        }
    }

    fn query(&mut self) -> bool {
        match self.oracle.is_exempt_process_running(&self.exemptions) {
            Ok(running) => running,
            Err(e) => {
                // Retried on the next interval.
                warn!("Exempt process scan failed: {:#}. Assuming none running", e);
                false
            }
        }
    }
}

impl<O> std::fmt::Debug for ExemptionSampler<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExemptionSampler")
            .field("exemptions", &self.exemptions)
            .field("running", &self.running)
            .field("last_sample", &self.last_sample)
            .finish_non_exhaustive()
    }
}
