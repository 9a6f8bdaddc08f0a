use std::{fmt, io, result::Result as StdResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagnostics::DiagnosticCategory;

/// A diagnostic callback that panicked while handling a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackFault {
    /// Category of the record being delivered.
    pub category: DiagnosticCategory,
    /// Position of the record in its category log.
    pub index: usize,
    /// Panic message captured from the callback.
    pub message: String,
}

impl fmt::Display for CallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} callback failed on record {}: {}",
            self.category, self.index, self.message
        )
    }
}

#[derive(Error, Debug, Clone)]
/// Error type for pool and execution operations.
pub enum Error {
    /// Invalid pool bounds, duplicate variable names, unknown modules.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The pool is not in the `Ready` state.
    #[error("Context pool is not initialized")]
    NotInitialized,

    /// `initialize` was called on a pool that is opening or ready.
    #[error("Context pool is already initialized")]
    AlreadyInitialized,

    /// `initialize` was called on a disposed pool.
    #[error("Context pool has been disposed")]
    Disposed,

    /// The script raised an unrecoverable fault.
    #[error("Script execution failed: {message}")]
    ScriptExecution {
        /// Message reported by the script.
        message: String,
        /// Location in the script, when available.
        location: Option<String>,
        /// Whether the context was discarded because of the fault.
        context_corrupted: bool,
        /// Callback faults captured during the same call.
        callback_faults: Vec<CallbackFault>,
    },

    /// Execution was cancelled by the caller.
    #[error("Script execution cancelled")]
    Cancelled {
        /// Callback faults captured before the call returned.
        callback_faults: Vec<CallbackFault>,
    },

    /// The script succeeded but one or more diagnostic callbacks failed.
    #[error("{} diagnostic callback(s) failed", .faults.len())]
    CallbackFailed {
        /// The captured faults, in delivery order.
        faults: Vec<CallbackFault>,
    },

    /// A context could not be allocated at all.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// I/O error with a message.
    #[error("IO error: {message}")]
    Io {
        /// Error message details.
        message: String,
    },

    /// JSON serialization or parsing error.
    #[error("JSON serialization error: {message}")]
    Json {
        /// Error message details.
        message: String,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Callback faults carried by this error, if any.
    pub fn callback_faults(&self) -> &[CallbackFault] {
        match self {
            Self::ScriptExecution {
                callback_faults, ..
            }
            | Self::Cancelled { callback_faults } => callback_faults,
            Self::CallbackFailed { faults } => faults,
            _ => &[],
        }
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Result alias using the crate error type.
pub type Result<T> = StdResult<T, Error>;
