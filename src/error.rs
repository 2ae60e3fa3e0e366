use std::time::Duration;

use thiserror::Error;

use crate::lock::LockMode;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for {mode} lock")]
    Timeout { mode: LockMode, timeout: Duration },

    #[error("Interrupted while waiting for {mode} lock")]
    Interrupted { mode: LockMode },

    #[error("Illegal lock state: {0}")]
    IllegalState(String),

    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// True for failures that leave lock state untouched and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. } | LockError::Interrupted { .. })
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
