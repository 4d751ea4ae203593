//! The [`UpdateError`] type carried through every engine operation.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::kind::{ErrorKind, ExitCode};

/// A failure with a classified kind and a human-readable message.
///
/// Plugin failures are re-raised by the orchestrator with a phase prefix
/// (`"failed to detach: ..."`); [`UpdateError::prefixed`] preserves the kind
/// while extending the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct UpdateError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
}

impl UpdateError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Re-raise with a context phrase, keeping the original kind.
    pub fn prefixed(self, phase: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("failed to {}: {}", phase, self.message),
        }
    }

    /// The failure classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Map onto the stable CLI exit code.
    pub fn exit_code(&self) -> ExitCode {
        self.kind.exit_code()
    }

    /// Caller supplied a malformed selector, flag combination or path.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    /// Structural parse failure in a cabinet or metadata document.
    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFile, message)
    }

    /// A detached signature did not verify.
    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureInvalid, message)
    }

    /// Capability or requirement not satisfiable.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    /// The named device, release or remote does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// State already matches; nothing needed doing.
    pub fn nothing_to_do(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NothingToDo, message)
    }

    /// Plugin returned an inconsistent state.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// A replug or operation deadline elapsed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}
