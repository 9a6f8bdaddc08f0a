use std::sync::{Arc, Mutex, MutexGuard};

use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    context::{Invocation, InterpreterContext, ScriptFault},
    diagnostics::{DiagnosticSink, ProgressRecord},
};

/// State of the invocation currently running on a context.
pub(crate) struct ActiveCall {
    pub(crate) sink: DiagnosticSink,
    pub(crate) cancel: CancellationToken,
    pub(crate) pipeline: Vec<Dynamic>,
}

/// Where functions registered on the engine find the running invocation.
#[derive(Clone, Default)]
pub(crate) struct CallSlot(Arc<Mutex<Option<ActiveCall>>>);

impl CallSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveCall>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, sink: DiagnosticSink, cancel: CancellationToken) -> CallGuard<'_> {
        *self.lock() = Some(ActiveCall {
            sink,
            cancel,
            pipeline: Vec::new(),
        });
        CallGuard { slot: self }
    }

    /// Run `f` against the active call, if any.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }

    pub(crate) fn progress(&self, record: ProgressRecord) {
        self.with(|call| call.sink.progress(record));
    }

    pub(crate) fn cancel_token(&self) -> Option<CancellationToken> {
        self.with(|call| call.cancel.clone())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.with(|call| call.cancel.is_cancelled()).unwrap_or(false)
    }
}

/// Clears the slot when the invocation ends, releasing its sink.
struct CallGuard<'a> {
    slot: &'a CallSlot,
}

impl CallGuard<'_> {
    fn take_pipeline(&self) -> Vec<Dynamic> {
        self.slot
            .with(|call| std::mem::take(&mut call.pipeline))
            .unwrap_or_default()
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

/// A Rhai engine with the session applied.
pub struct RhaiContext {
    engine: Engine,
    session: Scope<'static>,
    call: CallSlot,
}

impl RhaiContext {
    pub(crate) fn new(engine: Engine, session: Scope<'static>, call: CallSlot) -> Self {
        Self {
            engine,
            session,
            call,
        }
    }
}

impl InterpreterContext for RhaiContext {
    fn invoke(
        &mut self,
        invocation: Invocation<'_>,
    ) -> std::result::Result<Vec<Value>, ScriptFault> {
        let call = self
            .call
            .begin(invocation.diagnostics.clone(), invocation.cancel.clone());

        // Parameters are pushed last so they shadow session variables.
        let mut scope = self.session.clone();
        for (name, value) in invocation.parameters {
            let value = rhai::serde::to_dynamic(value)
                .map_err(|e| ScriptFault::script(format!("parameter '{name}': {e}")))?;
            scope.push_dynamic(name.as_str(), value);
        }

        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, invocation.script);
        let mut pipeline = call.take_pipeline();
        match result {
            Ok(value) => {
                if !value.is_unit() {
                    pipeline.push(value);
                }
                Ok(pipeline.iter().map(to_json).collect())
            }
            Err(err) => Err(to_fault(&err)),
        }
    }
}

fn to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn to_fault(err: &EvalAltResult) -> ScriptFault {
    match err {
        EvalAltResult::ErrorTerminated(..) => ScriptFault::cancelled(),
        EvalAltResult::ErrorRuntime(value, pos) => {
            ScriptFault::script(value.to_string()).with_location(format_location(*pos))
        }
        other => {
            ScriptFault::script(other.to_string()).with_location(format_location(other.position()))
        }
    }
}

pub(crate) fn format_location(pos: Position) -> Option<String> {
    if pos.is_none() {
        None
    } else {
        Some(format!("line {}", pos.line().unwrap_or(0)))
    }
}
