//! Structured error types for hangwatch
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these are fatal to the watched program: the watchdog logs them and
//! carries on.

use super::types::DispatchId;
use hangwatch_common::ThreadId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntrospectionError {
    #[error("No stack available for thread {0}")]
    StackUnavailable(ThreadId),

    #[error("Thread {0} not found")]
    ThreadNotFound(ThreadId),

    #[error("Calling thread is not known to the introspector")]
    UnregisteredThread,

    #[error("Type '{0}' cannot be resolved")]
    UnresolvableType(String),

    #[error("{0} is not supported by this introspector")]
    Unsupported(&'static str),

    #[error("Failed to read {path}: {error}")]
    ProcReadFailed { path: String, error: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("Dispatch end reported with an empty dispatch queue")]
    EmptyDispatchQueue,

    #[error("Dispatch {dispatch}: no call-tree node at depth {depth} to credit")]
    MissingCruxNode { dispatch: DispatchId, depth: usize },

    #[error("Dispatch {dispatch}: consecutive samples share no outer frame")]
    DisjointSamples { dispatch: DispatchId },

    #[error("Failed to spawn scan thread '{name}': {error}")]
    SpawnFailed { name: String, error: String },

    #[error("Analysis panicked: {0}")]
    AnalysisPanicked(String),

    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_introspection_error_display() {
        let err = IntrospectionError::StackUnavailable(ThreadId(12));
        assert_eq!(err.to_string(), "No stack available for thread TID:12");
    }

    #[test]
    fn test_missing_crux_error() {
        let err = WatchdogError::MissingCruxNode { dispatch: DispatchId(4), depth: 3 };
        assert!(err.to_string().contains("#4"));
        assert!(err.to_string().contains("depth 3"));
    }

    #[test]
    fn test_introspection_error_converts() {
        let err: WatchdogError = IntrospectionError::Unsupported("contention monitoring").into();
        assert!(err.to_string().contains("contention monitoring"));
    }
}
