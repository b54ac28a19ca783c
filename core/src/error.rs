//! Error types for testfan-core.

use std::path::PathBuf;
use std::time::Duration;
use testfan_common::CommonError;
use thiserror::Error;

use crate::config::DistMode;
use crate::types::WorkerId;

/// Errors returned by the scheduler contract.
///
/// Contract violations (out-of-order completion, scheduling before the
/// collection is complete) are not represented here; they panic.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Item not in the collection: {0}")]
    UnknownItem(String),

    #[error("{operation} is not supported by {mode} scheduling")]
    Unsupported {
        mode: DistMode,
        operation: &'static str,
    },

    #[error(transparent)]
    Configuration(#[from] CommonError),
}

/// Errors raised by the distributed counting barrier.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(
        "Timed out after {timeout:?} waiting for {path:?}: another registrant is holding the \
         lock too long or the timeout is too short"
    )]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Invalid barrier state in {path:?}: {message}")]
    InvalidState { path: PathBuf, message: String },

    #[error("Coordinated callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoordinationError {
    /// True when the lock could not be acquired in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout { .. })
    }

    pub(crate) fn from_lock(path: PathBuf, err: CommonError) -> Self {
        match err {
            CommonError::TimeoutError { timeout, .. } => CoordinationError::Timeout { path, timeout },
            other => CoordinationError::Common(other),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_maps_to_timeout() {
        let err = CoordinationError::from_lock(
            PathBuf::from("/tmp/x/lock"),
            CommonError::timeout_error("busy", Duration::from_secs(1)),
        );
        assert!(err.is_timeout());

        let err = CoordinationError::from_lock(
            PathBuf::from("/tmp/x/lock"),
            CommonError::io_error("permission denied"),
        );
        assert!(!err.is_timeout());
        assert!(matches!(err, CoordinationError::Common(_)));
    }

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::UnknownWorker("gw3".to_string());
        assert_eq!(err.to_string(), "Unknown worker: gw3");

        let err = SchedulerError::Unsupported {
            mode: DistMode::IsoScope,
            operation: "mark_item_pending",
        };
        assert_eq!(
            err.to_string(),
            "mark_item_pending is not supported by isoscope scheduling"
        );
    }
}
