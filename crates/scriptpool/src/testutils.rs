//! Test utilities for `scriptpool`.
//!
//! Helpers shared by the unit tests and the integration tests under `tests/`,
//! exposed so downstream crates can drive a pool the same way:
//! `use scriptpool::testutils::*`.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use rhai::Engine;
use serde_json::Value;

use crate::{
    config::{PoolOptions, SessionConfiguration},
    context::{ContextFactory, Invocation, InterpreterContext, ScriptFault},
    diagnostics::{DiagnosticCallbacks, DiagnosticCategory, DiagnosticRecord},
    error::{Error, Result},
    pool::ExecutionContextPool,
    rhai_engine::RhaiFactory,
};

/// Records every diagnostic delivered to its callbacks, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct RecordingCallbacks {
    records: Arc<Mutex<Vec<DiagnosticRecord>>>,
}

impl RecordingCallbacks {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks for every category that record into this recorder.
    pub fn callbacks(&self) -> DiagnosticCallbacks {
        self.callbacks_for(&DiagnosticCategory::ALL)
    }

    /// Callbacks for the given categories only.
    pub fn callbacks_for(&self, categories: &[DiagnosticCategory]) -> DiagnosticCallbacks {
        let mut callbacks = DiagnosticCallbacks::new();
        for category in categories {
            let records = self.records.clone();
            callbacks = match category {
                DiagnosticCategory::Verbose => callbacks.with_verbose(move |r| {
                    push(&records, DiagnosticRecord::Verbose(r.clone()))
                }),
                DiagnosticCategory::Debug => callbacks
                    .with_debug(move |r| push(&records, DiagnosticRecord::Debug(r.clone()))),
                DiagnosticCategory::Information => callbacks.with_information(move |r| {
                    push(&records, DiagnosticRecord::Information(r.clone()))
                }),
                DiagnosticCategory::Warning => callbacks.with_warning(move |r| {
                    push(&records, DiagnosticRecord::Warning(r.clone()))
                }),
                DiagnosticCategory::Error => callbacks
                    .with_error(move |r| push(&records, DiagnosticRecord::Error(r.clone()))),
                DiagnosticCategory::Progress => callbacks.with_progress(move |r| {
                    push(&records, DiagnosticRecord::Progress(r.clone()))
                }),
            };
        }
        callbacks
    }

    /// Everything recorded so far.
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        lock(&self.records).clone()
    }

    /// Rendered messages of one category.
    pub fn messages(&self, category: DiagnosticCategory) -> Vec<String> {
        lock(&self.records)
            .iter()
            .filter(|r| r.category() == category)
            .map(ToString::to_string)
            .collect()
    }

    /// Percentages of the recorded progress records.
    pub fn progress_percents(&self) -> Vec<u8> {
        lock(&self.records)
            .iter()
            .filter_map(|r| match r {
                DiagnosticRecord::Progress(p) => Some(p.percent_complete),
                _ => None,
            })
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn push(records: &Mutex<Vec<DiagnosticRecord>>, record: DiagnosticRecord) {
    lock(records).push(record);
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    peak: AtomicUsize,
    attempts: AtomicUsize,
    created: AtomicUsize,
    fail_at: AtomicUsize,
    delay: Mutex<Duration>,
}

/// Wraps a factory and counts the contexts it has alive.
///
/// Clones share their counters, so a clone can be handed to a pool while the
/// test keeps another to inspect it.
#[derive(Clone)]
pub struct CountingFactory {
    inner: Arc<dyn ContextFactory>,
    counters: Arc<Counters>,
}

impl CountingFactory {
    /// Count contexts created by `factory`.
    pub fn new(factory: impl ContextFactory) -> Self {
        Self {
            inner: Arc::new(factory),
            counters: Arc::default(),
        }
    }

    /// Count contexts created by [`instrumented_factory`].
    pub fn rhai() -> Self {
        Self::new(instrumented_factory())
    }

    /// Make the `n`th creation attempt (counting from 1) fail.
    pub fn fail_at(self, n: usize) -> Self {
        self.counters.fail_at.store(n, Ordering::SeqCst);
        self
    }

    /// Block every later creation for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.counters.delay) = delay;
    }

    /// Contexts currently alive.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Most contexts ever alive at the same time.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Contexts successfully created so far.
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }
}

impl ContextFactory for CountingFactory {
    fn create(&self, config: &SessionConfiguration) -> Result<Box<dyn InterpreterContext>> {
        let attempt = self.counters.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *lock(&self.counters.delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.counters.fail_at.load(Ordering::SeqCst) == attempt {
            return Err(Error::ResourceExhausted(format!(
                "creation attempt {attempt} refused"
            )));
        }
        let inner = self.inner.create(config)?;
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(Counted {
            inner,
            counters: self.counters.clone(),
        }))
    }
}

struct Counted {
    inner: Box<dyn InterpreterContext>,
    counters: Arc<Counters>,
}

impl InterpreterContext for Counted {
    fn invoke(
        &mut self,
        invocation: Invocation<'_>,
    ) -> std::result::Result<Vec<Value>, ScriptFault> {
        self.inner.invoke(invocation)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A Rhai factory with two probes registered.
///
/// `thread_tag()` returns the name and id of the thread running the script.
/// `crash()` panics inside the interpreter.
pub fn instrumented_factory() -> RhaiFactory {
    RhaiFactory::new().with_extension(|engine: &mut Engine| {
        engine.register_fn("thread_tag", || {
            let current = thread::current();
            format!("{}/{:?}", current.name().unwrap_or("unnamed"), current.id())
        });
        engine.register_fn("crash", || -> bool { panic!("interpreter crashed") });
    })
}

/// Open a pool over `factory` with a default session.
pub async fn ready_pool(
    factory: impl ContextFactory,
    options: PoolOptions,
) -> Result<ExecutionContextPool> {
    ready_pool_with(factory, options, SessionConfiguration::default()).await
}

/// Open a pool over `factory` with the given session.
pub async fn ready_pool_with(
    factory: impl ContextFactory,
    options: PoolOptions,
    config: SessionConfiguration,
) -> Result<ExecutionContextPool> {
    let pool = ExecutionContextPool::new(factory);
    pool.initialize(options, config).await?;
    Ok(pool)
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
