use std::io;
use std::time::Duration;

use thiserror::Error;

/// Classifies errors that may be masked by a previously known value.
///
/// Errors for which [`use_cached_result`](Self::use_cached_result) returns `true` do not reach
/// the callers of a multiplexer as long as a fallback value is available.
pub trait CacheAcceptable {
    /// Whether a cached value should be served instead of this error.
    fn use_cached_result(&self) -> bool;
}

/// An error that happens when fetching a value from a remote location.
///
/// Multiplexers broadcast one error to all waiting callers, so this is cheaply [`Clone`]-able.
/// Any other [`Clone`] error type can be used with a multiplexer instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The value does not exist at the remote source.
    #[error("not found")]
    NotFound,
    /// The value could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The value could not be fetched due to a timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The remote source could not be reached, like connection loss or DNS resolution.
    #[error("connection failed: {0}")]
    Connectivity(String),
    /// The value was fetched, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Any other failure reported by the remote source.
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether this error is caused by the remote source being unreachable.
    pub fn is_connectivity_error(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connectivity(_))
    }
}

impl CacheAcceptable for FetchError {
    fn use_cached_result(&self) -> bool {
        self.is_connectivity_error()
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Self::Connectivity(err.to_string()),
            _ => Self::Other(err.to_string()),
        }
    }
}

/// An error that happens when persisting values through a [`CacheBackend`](crate::CacheBackend).
///
/// These errors are soft: multiplexers log them, but never report them to their callers.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Reading or writing the cache storage failed.
    #[error("cache i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The value could not be serialized.
    #[error("failed to serialize cache value: {0}")]
    Json(#[from] serde_json::Error),
}
