//! The interpreter capability the pool manages.
//!
//! The pool knows nothing about any particular scripting language. It creates
//! contexts through a [`ContextFactory`] and runs scripts through
//! [`InterpreterContext::invoke`]. The Rhai engine in
//! [`rhai_engine`](crate::rhai_engine) is the bundled implementation.

use std::{collections::HashMap, fmt};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    config::SessionConfiguration,
    diagnostics::DiagnosticSink,
    error::{CallbackFault, Error, Result},
};

/// Named parameters passed to a single invocation.
pub type Parameters = HashMap<String, Value>;

/// Everything a context needs for one invocation.
pub struct Invocation<'a> {
    /// Script source text.
    pub script: &'a str,
    /// Named parameters bound for this invocation only.
    pub parameters: &'a Parameters,
    /// Where diagnostic records go.
    pub diagnostics: &'a DiagnosticSink,
    /// Cooperative cancellation signal.
    pub cancel: &'a CancellationToken,
}

/// One isolated script-execution environment.
///
/// A context runs one invocation at a time and is owned by at most one
/// borrower. It must stop at its next checkpoint once `cancel` fires and
/// report [`FaultKind::Cancelled`].
pub trait InterpreterContext: Send + 'static {
    /// Run a script and return its pipeline output in emission order.
    fn invoke(
        &mut self,
        invocation: Invocation<'_>,
    ) -> std::result::Result<Vec<Value>, ScriptFault>;
}

/// Builds contexts from a session configuration.
pub trait ContextFactory: Send + Sync + 'static {
    /// Create a fresh context with `config` applied.
    fn create(&self, config: &SessionConfiguration) -> Result<Box<dyn InterpreterContext>>;
}

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The script failed; the context is still usable.
    Script,
    /// The invocation stopped because of cancellation; the context is usable.
    Cancelled,
    /// The context can no longer be trusted and must be discarded.
    ContextCorrupted,
}

/// A failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    /// What kind of failure this is.
    pub kind: FaultKind,
    /// Message reported by the script or the engine.
    pub message: String,
    /// Location in the script, when available.
    pub location: Option<String>,
}

impl ScriptFault {
    /// A script-level fault.
    pub fn script(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Script,
            message: message.into(),
            location: None,
        }
    }

    /// The invocation observed cancellation.
    pub fn cancelled() -> Self {
        Self {
            kind: FaultKind::Cancelled,
            message: "invocation cancelled".to_string(),
            location: None,
        }
    }

    /// The context is corrupted.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::ContextCorrupted,
            message: message.into(),
            location: None,
        }
    }

    /// Attach a script location.
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// Whether the context must be discarded.
    pub fn is_corrupting(&self) -> bool {
        self.kind == FaultKind::ContextCorrupted
    }

    /// Convert into the caller-facing error, attaching callback faults.
    pub(crate) fn into_error(self, callback_faults: Vec<CallbackFault>) -> Error {
        match self.kind {
            FaultKind::Cancelled => Error::Cancelled { callback_faults },
            FaultKind::Script | FaultKind::ContextCorrupted => Error::ScriptExecution {
                context_corrupted: self.is_corrupting(),
                message: self.message,
                location: self.location,
                callback_faults,
            },
        }
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({location})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptFault {}
