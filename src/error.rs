//! Error kinds surfaced by remote calls, catalog parsing and local persistence.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlingError>;

/// Failure of a remote call, a parse step, discovery, or a local store.
///
/// The type is `Clone` so failed results can travel on the broadcast bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlingError {
    #[error("remote call '{call}' failed: {message}")]
    RemoteCallFailed { call: String, message: String },

    #[error("remote call '{call}' timed out after {timeout_ms}ms")]
    RemoteCallTimedOut { call: String, timeout_ms: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("discovery failure: {0}")]
    DiscoveryFailure(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl FlingError {
    pub fn remote(call: impl Into<String>, message: impl Into<String>) -> Self {
        FlingError::RemoteCallFailed {
            call: call.into(),
            message: message.into(),
        }
    }

    /// Human-readable cause without the call prefix, appended to extended failure messages.
    pub fn cause(&self) -> String {
        match self {
            FlingError::RemoteCallFailed { message, .. } => message.clone(),
            FlingError::RemoteCallTimedOut { timeout_ms, .. } => {
                format!("timed out after {}ms", timeout_ms)
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for FlingError {
    fn from(err: std::io::Error) -> Self {
        FlingError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FlingError {
    fn from(err: serde_json::Error) -> Self {
        FlingError::Parse(err.to_string())
    }
}
