//! Hosting of contexts on threads according to the pool's thread policy.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{SessionConfiguration, ThreadPolicy},
    context::{ContextFactory, Invocation, InterpreterContext, ScriptFault},
    diagnostics::DiagnosticSink,
    dispatch::panic_message,
    error::{Error, Result},
    executor::ScriptRequest,
};

/// Outcome of one invocation.
pub(crate) type Outcome = std::result::Result<Vec<Value>, ScriptFault>;

/// The worker, if it survived, and the invocation outcome.
pub(crate) type Completion = (Option<Worker>, Outcome);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// One invocation's inputs, owned so they can cross threads.
pub(crate) struct Job {
    request: ScriptRequest,
    sink: DiagnosticSink,
    cancel: CancellationToken,
}

impl Job {
    pub(crate) fn new(
        request: ScriptRequest,
        sink: DiagnosticSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            sink,
            cancel,
        }
    }

    /// Run on `context`. Consumes the job so the sink is dropped on return.
    fn run_on(self, context: &mut dyn InterpreterContext) -> Outcome {
        if self.cancel.is_cancelled() {
            return Err(ScriptFault::cancelled());
        }
        context.invoke(Invocation {
            script: &self.request.script,
            parameters: &self.request.parameters,
            diagnostics: &self.sink,
            cancel: &self.cancel,
        })
    }
}

/// A live context together with the thread arrangement it runs on.
pub(crate) enum Worker {
    /// Invocations run on the blocking thread pool.
    Blocking(Box<dyn InterpreterContext>),
    /// The context lives on its own thread.
    Dedicated(DedicatedThread),
}

impl Worker {
    /// Create a context under the given thread policy.
    pub(crate) async fn spawn(
        factory: Arc<dyn ContextFactory>,
        config: Arc<SessionConfiguration>,
        policy: ThreadPolicy,
    ) -> Result<Self> {
        match policy {
            ThreadPolicy::NewThreadPerUse => {
                let context = tokio::task::spawn_blocking(move || factory.create(&config))
                    .await
                    .map_err(|e| match e.try_into_panic() {
                        Ok(payload) => factory_panicked(payload.as_ref()),
                        Err(e) => {
                            Error::ResourceExhausted(format!("context creation task failed: {e}"))
                        }
                    })??;
                Ok(Self::Blocking(context))
            }
            ThreadPolicy::ReuseThread => DedicatedThread::spawn(factory, config)
                .await
                .map(Self::Dedicated),
        }
    }

    /// Start an invocation. The returned future owns the worker until it
    /// resolves; a worker that panicked is not handed back.
    pub(crate) fn run(self, job: Job) -> BoxFuture<'static, Completion> {
        match self {
            Self::Blocking(mut context) => Box::pin(async move {
                let handle = tokio::task::spawn_blocking(move || {
                    let outcome = job.run_on(context.as_mut());
                    (context, outcome)
                });
                match handle.await {
                    Ok((context, outcome)) => (Some(Self::Blocking(context)), outcome),
                    Err(e) => (
                        None,
                        Err(ScriptFault::corrupted(format!("context panicked: {e}"))),
                    ),
                }
            }),
            Self::Dedicated(thread) => Box::pin(async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                if thread.jobs.send((job, reply_tx)).is_err() {
                    return (
                        None,
                        Err(ScriptFault::corrupted(format!(
                            "context thread {} has exited",
                            thread.name
                        ))),
                    );
                }
                match reply_rx.await {
                    Ok(outcome) => (Some(Self::Dedicated(thread)), outcome),
                    Err(_) => (
                        None,
                        Err(ScriptFault::corrupted(format!(
                            "context thread {} terminated during invocation",
                            thread.name
                        ))),
                    ),
                }
            }),
        }
    }
}

type DedicatedJob = (Job, oneshot::Sender<Outcome>);

fn factory_panicked(payload: &(dyn std::any::Any + Send)) -> Error {
    Error::configuration(format!(
        "context factory panicked: {}",
        panic_message(payload)
    ))
}

/// A context pinned to one OS thread.
///
/// The context is created, invoked and dropped on that thread. Dropping the
/// handle closes the job queue, which ends the thread.
pub(crate) struct DedicatedThread {
    name: String,
    jobs: mpsc::UnboundedSender<DedicatedJob>,
}

impl DedicatedThread {
    async fn spawn(
        factory: Arc<dyn ContextFactory>,
        config: Arc<SessionConfiguration>,
    ) -> Result<Self> {
        let name = format!(
            "scriptpool-context-{}",
            NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
        );
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<DedicatedJob>();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(&config)))
                    .unwrap_or_else(|payload| Err(factory_panicked(payload.as_ref())));
                let mut context = match created {
                    Ok(context) => context,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                drop(config);
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                while let Some((job, reply)) = jobs_rx.blocking_recv() {
                    let outcome = job.run_on(context.as_mut());
                    let _ = reply.send(outcome);
                }
            })
            .map_err(|e| Error::ResourceExhausted(format!("failed to spawn {name}: {e}")))?;

        ready_rx.await.map_err(|_| {
            Error::ResourceExhausted(format!("{name} exited before its context was ready"))
        })??;
        tracing::debug!("started {}", name);
        Ok(Self {
            name,
            jobs: jobs_tx,
        })
    }
}
