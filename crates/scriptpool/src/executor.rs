//! Running one script request against a pooled context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{
    context::Parameters,
    diagnostics::{DiagnosticCallbacks, DiagnosticSink},
    dispatch::DiagnosticDispatcher,
    error::{CallbackFault, Error, Result},
    pool::{ExecutionContextPool, PooledContext},
    worker::{Job, Outcome, Worker},
};

/// Script text plus the parameters bound for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequest {
    /// Script source text.
    pub script: String,
    /// Named parameters. These shadow session variables of the same name.
    #[serde(default)]
    pub parameters: Parameters,
}

impl ScriptRequest {
    /// A request with no parameters.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            parameters: Parameters::new(),
        }
    }

    /// Bind a named parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Values a script emitted, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineResult {
    items: Vec<Value>,
}

impl PipelineResult {
    /// The emitted values.
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Number of emitted values.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the script emitted nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take the emitted values.
    pub fn into_vec(self) -> Vec<Value> {
        self.items
    }
}

impl From<Vec<Value>> for PipelineResult {
    fn from(items: Vec<Value>) -> Self {
        Self { items }
    }
}

impl IntoIterator for PipelineResult {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Executes scripts against contexts borrowed from a pool.
///
/// Cheap to clone; every clone shares the pool.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    pool: ExecutionContextPool,
}

impl ScriptExecutor {
    /// Create an executor over `pool`.
    pub fn new(pool: ExecutionContextPool) -> Self {
        Self { pool }
    }

    /// The pool this executor draws from.
    pub fn pool(&self) -> &ExecutionContextPool {
        &self.pool
    }

    /// Run a script with no callbacks and no cancellation.
    pub async fn run(&self, script: impl Into<String>) -> Result<PipelineResult> {
        self.execute(
            ScriptRequest::new(script),
            &DiagnosticCallbacks::default(),
            &CancellationToken::new(),
        )
        .await
    }

    /// Run `request` on a pooled context.
    ///
    /// Diagnostics are delivered to `callbacks` while the script runs, and all
    /// of them have been delivered by the time this returns. When `cancel`
    /// fires, the wait ends at once with [`Error::Cancelled`] after already
    /// queued diagnostics are delivered. The invocation itself stops at its
    /// next checkpoint and its context is reclaimed in the background.
    pub async fn execute(
        &self,
        request: ScriptRequest,
        callbacks: &DiagnosticCallbacks,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        self.pool.ensure_ready()?;
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let mut lease = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            lease = self.pool.checkout() => lease?,
        };
        let worker = lease.take_worker().ok_or(Error::NotInitialized)?;

        tracing::debug!(
            "executing script ({} bytes, {} parameters)",
            request.script.len(),
            request.parameters.len()
        );
        let (sink, feed) = DiagnosticSink::channel();
        let stop = CancellationToken::new();
        let dispatch = tokio::spawn(DiagnosticDispatcher::new(callbacks).run(feed, stop.clone()));

        let job = Job::new(request, sink, cancel.clone());
        let mut running = tokio::spawn(async move {
            let (worker, outcome) = worker.run(job).await;
            settle(&mut lease, worker, &outcome);
            outcome
        });

        let joined = tokio::select! {
            biased;
            joined = &mut running => Some(joined),
            () = cancel.cancelled() => None,
        };

        let Some(joined) = joined else {
            tracing::debug!("execution cancelled, reclaiming context in the background");
            stop.cancel();
            let callback_faults = delivered(dispatch.await);
            return Err(Error::Cancelled { callback_faults });
        };

        // The sink is gone once the invocation returns, so the feed drains
        // and closes on its own.
        let faults = delivered(dispatch.await);
        let outcome = joined.map_err(|e| Error::ScriptExecution {
            message: format!("execution task failed: {e}"),
            location: None,
            context_corrupted: true,
            callback_faults: Vec::new(),
        });
        match outcome {
            Ok(Ok(items)) if faults.is_empty() => Ok(PipelineResult::from(items)),
            Ok(Ok(_)) => Err(Error::CallbackFailed { faults }),
            Ok(Err(fault)) => Err(fault.into_error(faults)),
            Err(Error::ScriptExecution {
                message,
                location,
                context_corrupted,
                ..
            }) => Err(Error::ScriptExecution {
                message,
                location,
                context_corrupted,
                callback_faults: faults,
            }),
            Err(other) => Err(other),
        }
    }
}

fn cancelled() -> Error {
    Error::Cancelled {
        callback_faults: Vec::new(),
    }
}

/// Callback faults of a finished dispatch task.
fn delivered(
    joined: std::result::Result<Vec<CallbackFault>, JoinError>,
) -> Vec<CallbackFault> {
    joined.unwrap_or_else(|e| {
        tracing::warn!("diagnostic dispatch task failed, deliveries lost: {}", e);
        Vec::new()
    })
}

/// Hand a worker back to its lease, or let the lease discard it.
fn settle(lease: &mut PooledContext, worker: Option<Worker>, outcome: &Outcome) {
    match (worker, outcome) {
        (Some(worker), Err(fault)) if fault.is_corrupting() => {
            tracing::warn!("discarding corrupted context: {}", fault);
            drop(worker);
        }
        (Some(worker), _) => lease.restore(worker),
        (None, Err(fault)) => tracing::warn!("context lost: {}", fault),
        (None, Ok(_)) => tracing::warn!("context lost after a successful invocation"),
    }
}
