//! Error types for layerkit.

use thiserror::Error;

use crate::pipeline::PipelineState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("stale dependency layer: expected {expected}, found {found}")]
    StaleLayer { expected: String, found: String },

    #[error("invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("workspace is locked by another build: {0}")]
    WorkspaceLocked(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an error, used to pick a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Manifest,
    Compile,
    Assembly,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Manifest(_) | Error::StaleLayer { .. } => ErrorKind::Manifest,
            Error::Compile(_) => ErrorKind::Compile,
            Error::Assembly(_) => ErrorKind::Assembly,
            _ => ErrorKind::Other,
        }
    }
}

impl ErrorKind {
    /// Process exit status for a pipeline that failed with this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Manifest => 2,
            ErrorKind::Compile => 3,
            ErrorKind::Assembly => 4,
            ErrorKind::Other => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_to_exit_codes() {
        assert_eq!(Error::Manifest("x".into()).kind().exit_code(), 2);
        assert_eq!(Error::Compile("x".into()).kind().exit_code(), 3);
        assert_eq!(Error::Assembly("x".into()).kind().exit_code(), 4);
        assert_eq!(Error::Cancelled.kind().exit_code(), 1);
    }

    #[test]
    fn test_stale_layer_is_a_manifest_failure() {
        let err = Error::StaleLayer {
            expected: "aaa".into(),
            found: "bbb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Manifest);
        assert_eq!(
            err.to_string(),
            "stale dependency layer: expected aaa, found bbb"
        );
    }
}
