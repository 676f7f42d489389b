//! Error taxonomy.
//!
//! Most code propagates [`anyhow::Error`] with context attached; the
//! variants here are the ones callers need to tell apart, and are
//! recovered from an error chain via [`ErrorCode::classify`].

use serde::{Deserialize, Serialize};

/// Errors with a meaning beyond "an operation failed".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The system root or bootloader setup is malformed.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// An OS name, deployment, commit or update does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// A lifecycle operation was requested from an incompatible state.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    /// The operation was cancelled before the boot version was flipped.
    #[error("Operation was cancelled")]
    Cancelled,
    /// A completion was delivered for a submission that is not in flight.
    #[error("Completion for unknown submission {0}")]
    ConsistencyFault(u64),
}

/// Why a daemon request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    /// An update is known but its content has not been fetched.
    #[error("Update has not been fetched")]
    NotFetched,
    /// There is no update to operate on.
    #[error("No update available")]
    NoUpdateAvailable,
    /// An update was already applied; the system must reboot first.
    #[error("Busy, awaiting reboot")]
    AwaitingReboot,
}

/// Numeric error code exposed to clients alongside a message.
///
/// Code 0 with an empty message means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// No error.
    #[default]
    Success,
    /// Generic failure, including I/O errors.
    Failed,
    /// Malformed system root or bootloader configuration.
    Configuration,
    /// Missing OS name, deployment, commit or update.
    NotFound,
    /// Update not yet fetched.
    NotInitialized,
    /// Operation not valid in the current state.
    WrongState,
    /// Waiting for a reboot into an applied update.
    Busy,
    /// Cancelled by request.
    Cancelled,
}

impl ErrorCode {
    /// The numeric value of this code.
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::Failed => 1,
            ErrorCode::Configuration => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::NotInitialized => 4,
            ErrorCode::WrongState => 5,
            ErrorCode::Busy => 6,
            ErrorCode::Cancelled => 7,
        }
    }

    /// Find the most specific code for an error by walking its chain.
    pub fn classify(e: &anyhow::Error) -> Self {
        e.chain()
            .find_map(|cause| cause.downcast_ref::<Error>())
            .map(ErrorCode::from)
            .unwrap_or(ErrorCode::Failed)
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::Configuration(_) => ErrorCode::Configuration,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Precondition(p) => ErrorCode::from(*p),
            Error::Cancelled => ErrorCode::Cancelled,
            Error::ConsistencyFault(_) => ErrorCode::Failed,
        }
    }
}

impl From<PreconditionError> for ErrorCode {
    fn from(e: PreconditionError) -> Self {
        match e {
            PreconditionError::NotFetched => ErrorCode::NotInitialized,
            PreconditionError::NoUpdateAvailable => ErrorCode::WrongState,
            PreconditionError::AwaitingReboot => ErrorCode::Busy,
        }
    }
}
