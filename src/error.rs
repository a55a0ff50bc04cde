//! Error types surfaced by the dispatcher.
//!
//! [`ConfigError`] is returned synchronously, before anything is scheduled.
//! [`ScanError`] terminates a run that already started.
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid exclude: {0}")]
    InvalidExclude(String),

    #[error("resolve {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("host {0} resolved but all addresses are disallowed")]
    HostFiltered(String),

    #[error("target {0} is not allowed (loopback/private/reserved)")]
    TargetNotAllowed(String),

    #[error("no targets specified")]
    NoTargets,

    #[error("no targets remain after applying excludes")]
    NoTargetsAfterExclude,

    #[error("invalid port specification: {0}")]
    InvalidPorts(String),

    #[error("invalid preflight ports: {0}")]
    InvalidPreflightPorts(String),

    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,

    #[error("worker pool could not be created: {0}")]
    Pool(String),

    #[error("dispatcher task failed: {0}")]
    Join(String),
}

impl ScanError {
    /// Cancellation is a normal way for a run to end.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio::task::JoinError> for ScanError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Join(err.to_string())
        }
    }
}
