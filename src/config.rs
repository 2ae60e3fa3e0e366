use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::error::{LockError, Result};

/// Default acquisition budget for the named lock operations.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Which lock node implementation a manager builds for every path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Readers and writers exclude each other.
    #[default]
    Strict,
    /// Readers never block; only writers are serialized.
    DirtyRead,
}

#[derive(Parser, Debug)]
#[command(name = "nslock", about = "Hierarchical namespace lock manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hammer a lock manager from several threads and report the outcome
    Stress {
        /// Lock node policy
        #[arg(long, value_enum, default_value_t = Policy::Strict)]
        policy: Policy,

        /// Per-acquisition timeout in milliseconds
        #[arg(long, default_value_t = 200)]
        timeout_ms: u64,

        /// Number of worker threads
        #[arg(long, default_value_t = 8)]
        threads: usize,

        /// Number of distinct paths to pick from
        #[arg(long, default_value_t = 32)]
        paths: usize,

        /// Maximum path depth
        #[arg(long, default_value_t = 4)]
        depth: usize,

        /// Seconds to run before stopping
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,

        /// Microseconds each lock is held
        #[arg(long, default_value_t = 200)]
        hold_micros: u64,

        /// Fraction of operations that take a write-family lock
        #[arg(long, default_value_t = 0.2)]
        write_ratio: f64,

        /// Seed for path generation and operation choice
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Log file path
        #[arg(long, default_value = "/tmp/nslock.log")]
        log_file: PathBuf,

        /// Also print a tree status snapshot taken halfway through the run
        #[arg(long)]
        show_status: bool,
    },
}

/// Settings of a single lock manager.
#[derive(Debug, Clone, Serialize)]
pub struct LockConfig {
    pub policy: Policy,
    /// Budget used by the named `*_lock` operations.
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Strict,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl LockConfig {
    pub fn new(policy: Policy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    pub lock: LockConfig,
    pub threads: usize,
    pub paths: usize,
    pub depth: usize,
    pub duration: Duration,
    pub hold: Duration,
    pub write_ratio: f64,
    pub seed: u64,
}

impl StressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(LockError::Config("threads must be at least 1".into()));
        }
        if self.paths == 0 {
            return Err(LockError::Config("paths must be at least 1".into()));
        }
        if self.depth == 0 {
            return Err(LockError::Config("depth must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.write_ratio) {
            return Err(LockError::Config(format!(
                "write ratio {} is outside 0.0..=1.0",
                self.write_ratio
            )));
        }
        Ok(())
    }
}
