//! A bounded pool of interpreter contexts sharing one session configuration.
//!
//! The pool moves through `Uninitialized -> Opening -> Ready -> Disposed`.
//! A failed open returns it to `Uninitialized`; nothing leaves `Disposed`.
//!
//! Concurrency is bounded by a semaphore with `max_size` permits. A caller
//! holding a permit is guaranteed either an idle context or room to create
//! one, so the live count never exceeds `max_size`. All bookkeeping lives
//! behind a single mutex, so [`ExecutionContextPool::status`] never observes a
//! torn state.
//!
//! Disposal is graceful: idle contexts are torn down at once, borrowed
//! contexts finish their in-flight invocation and are torn down when they are
//! released, and callers waiting in [`ExecutionContextPool::checkout`] fail
//! with [`Error::NotInitialized`].

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::{PoolOptions, SessionConfiguration, ThreadPolicy},
    context::ContextFactory,
    error::{Error, Result},
    worker::Worker,
};

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Created, not yet opened.
    Uninitialized,
    /// `initialize` is creating the minimum set of contexts.
    Opening,
    /// Accepting checkouts.
    Ready,
    /// Torn down for good.
    Disposed,
}

/// A consistent snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Lifecycle state.
    pub state: PoolState,
    /// Contexts currently alive, idle or borrowed.
    pub live: usize,
    /// Contexts waiting in the pool.
    pub idle: usize,
    /// Contexts checked out or being created for a borrower.
    pub borrowed: usize,
    /// Configured lower bound, zero before the pool is opened.
    pub min_size: usize,
    /// Configured upper bound, zero before the pool is opened.
    pub max_size: usize,
}

struct Settings {
    options: PoolOptions,
    config: Arc<SessionConfiguration>,
    permits: Arc<Semaphore>,
}

struct Inner {
    state: PoolState,
    idle: Vec<Worker>,
    live: usize,
    settings: Option<Settings>,
}

struct Shared {
    factory: Arc<dyn ContextFactory>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take back a context from a borrower, or account for its loss.
    fn release(&self, worker: Option<Worker>) {
        let mut inner = self.lock();
        match worker {
            Some(worker) if inner.state == PoolState::Ready => {
                inner.idle.push(worker);
            }
            Some(worker) => {
                inner.live -= 1;
                drop(inner);
                drop(worker);
                tracing::debug!("tore down context released after dispose");
            }
            None => {
                inner.live -= 1;
                tracing::debug!("context discarded, {} live", inner.live);
            }
        }
    }
}

/// A bounded pool of interpreter contexts.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ExecutionContextPool {
    shared: Arc<Shared>,
}

impl fmt::Debug for ExecutionContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContextPool")
            .field("status", &self.status())
            .finish()
    }
}

impl ExecutionContextPool {
    /// Create an empty, uninitialized pool that builds contexts with `factory`.
    pub fn new(factory: impl ContextFactory) -> Self {
        Self::from_factory(Arc::new(factory))
    }

    /// Create a pool from a shared factory.
    pub fn from_factory(factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                inner: Mutex::new(Inner {
                    state: PoolState::Uninitialized,
                    idle: Vec::new(),
                    live: 0,
                    settings: None,
                }),
            }),
        }
    }

    /// Open the pool, creating `options.min_size` contexts.
    ///
    /// Resolves once every context is live. If any creation fails, the ones
    /// already created are torn down, the pool returns to `Uninitialized`
    /// and the first error is returned. Dropping the future before it
    /// resolves has the same effect.
    pub async fn initialize(
        &self,
        options: PoolOptions,
        config: SessionConfiguration,
    ) -> Result<()> {
        options.validate()?;
        {
            let mut inner = self.shared.lock();
            match inner.state {
                PoolState::Uninitialized => inner.state = PoolState::Opening,
                PoolState::Opening | PoolState::Ready => return Err(Error::AlreadyInitialized),
                PoolState::Disposed => return Err(Error::Disposed),
            }
        }
        let mut opening = OpeningGuard {
            shared: &self.shared,
            armed: true,
        };

        tracing::info!(
            "opening context pool (min {}, max {}, {:?})",
            options.min_size,
            options.max_size,
            options.thread_policy
        );
        let config = Arc::new(config);
        let results = join_all((0..options.min_size).map(|_| {
            Worker::spawn(
                self.shared.factory.clone(),
                config.clone(),
                options.thread_policy,
            )
        }))
        .await;

        let mut workers = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        let mut inner = self.shared.lock();
        if let Some(err) = failure {
            drop(inner);
            drop(workers);
            tracing::warn!("context pool failed to open: {}", err);
            return Err(err);
        }
        if inner.state != PoolState::Opening {
            drop(inner);
            drop(workers);
            opening.armed = false;
            return Err(Error::Disposed);
        }

        inner.state = PoolState::Ready;
        inner.live = workers.len();
        inner.idle = workers;
        inner.settings = Some(Settings {
            options,
            config,
            permits: Arc::new(Semaphore::new(options.max_size)),
        });
        opening.armed = false;
        tracing::info!("context pool ready with {} contexts", inner.live);
        Ok(())
    }

    /// Borrow a context.
    ///
    /// Returns an idle context if there is one, creates a new one while the
    /// live count is below `max_size`, and otherwise waits until a context is
    /// released. The context goes back to the pool when the returned guard is
    /// dropped.
    pub async fn checkout(&self) -> Result<PooledContext> {
        let permits = self.ready_settings(|s| s.permits.clone())?;
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| Error::NotInitialized)?;

        let mut reservation = {
            let mut inner = self.shared.lock();
            if inner.state != PoolState::Ready {
                return Err(Error::NotInitialized);
            }
            if let Some(worker) = inner.idle.pop() {
                return Ok(PooledContext {
                    shared: self.shared.clone(),
                    worker: Some(worker),
                    _permit: permit,
                });
            }
            let Some(settings) = inner.settings.as_ref() else {
                return Err(Error::NotInitialized);
            };
            let config = settings.config.clone();
            let policy = settings.options.thread_policy;
            inner.live += 1;
            Reservation {
                shared: self.shared.clone(),
                armed: true,
                config,
                policy,
            }
        };

        // The creation owns the slot and the permit, so a checkout that is
        // abandoned midway still counts against `max_size` until the context
        // it was building has landed in the pool.
        tracing::debug!("no idle context, creating one on demand");
        let shared = self.shared.clone();
        let creation = tokio::spawn(async move {
            let worker = Worker::spawn(
                shared.factory.clone(),
                reservation.config.clone(),
                reservation.policy,
            )
            .await?;
            reservation.armed = false;
            Ok::<_, Error>(PooledContext {
                shared,
                worker: Some(worker),
                _permit: permit,
            })
        });
        let context = creation.await.map_err(|e| {
            Error::ResourceExhausted(format!("context creation task failed: {e}"))
        })??;
        if self.state() != PoolState::Ready {
            // Disposed while creating; the guard tears the context down.
            return Err(Error::NotInitialized);
        }
        Ok(context)
    }

    /// Tear the pool down. A second call does nothing.
    pub fn dispose(&self) {
        let (idle, permits) = {
            let mut inner = self.shared.lock();
            if inner.state == PoolState::Disposed {
                return;
            }
            inner.state = PoolState::Disposed;
            let idle = std::mem::take(&mut inner.idle);
            inner.live -= idle.len();
            let permits = inner.settings.take().map(|s| s.permits);
            (idle, permits)
        };
        if let Some(permits) = permits {
            permits.close();
        }
        tracing::info!("context pool disposed, tearing down {} idle contexts", idle.len());
        drop(idle);
    }

    /// A snapshot of the pool's bookkeeping.
    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.lock();
        let (min_size, max_size) = inner
            .settings
            .as_ref()
            .map_or((0, 0), |s| (s.options.min_size, s.options.max_size));
        PoolStatus {
            state: inner.state,
            live: inner.live,
            idle: inner.idle.len(),
            borrowed: inner.live - inner.idle.len(),
            min_size,
            max_size,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    /// Fail with `NotInitialized` unless the pool is ready.
    pub fn ensure_ready(&self) -> Result<()> {
        self.ready_settings(|_| ())
    }

    /// The session configuration shared by every context, once ready.
    pub fn configuration(&self) -> Option<Arc<SessionConfiguration>> {
        self.ready_settings(|s| s.config.clone()).ok()
    }

    fn ready_settings<T>(&self, f: impl FnOnce(&Settings) -> T) -> Result<T> {
        let inner = self.shared.lock();
        match (&inner.state, &inner.settings) {
            (PoolState::Ready, Some(settings)) => Ok(f(settings)),
            _ => Err(Error::NotInitialized),
        }
    }
}

/// Resets an `Opening` pool if `initialize` does not finish.
struct OpeningGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.lock();
            if inner.state == PoolState::Opening {
                inner.state = PoolState::Uninitialized;
            }
        }
    }
}

/// Gives back a live-count slot if on-demand creation fails.
struct Reservation {
    shared: Arc<Shared>,
    armed: bool,
    config: Arc<SessionConfiguration>,
    policy: ThreadPolicy,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().live -= 1;
        }
    }
}

/// A context checked out of the pool.
///
/// Dropping the guard returns the context to the pool, or tears it down if
/// the pool has been disposed in the meantime.
pub struct PooledContext {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    _permit: OwnedSemaphorePermit,
}

impl PooledContext {
    /// Thread arrangement of the borrowed context.
    pub fn thread_policy(&self) -> Option<ThreadPolicy> {
        self.worker.as_ref().map(|w| match w {
            Worker::Blocking(_) => ThreadPolicy::NewThreadPerUse,
            Worker::Dedicated(_) => ThreadPolicy::ReuseThread,
        })
    }

    /// Take the worker out for an invocation.
    pub(crate) fn take_worker(&mut self) -> Option<Worker> {
        self.worker.take()
    }

    /// Put a healthy worker back after an invocation.
    pub(crate) fn restore(&mut self, worker: Worker) {
        self.worker = Some(worker);
    }
}

impl fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledContext")
            .field("thread_policy", &self.thread_policy())
            .finish()
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        self.shared.release(self.worker.take());
    }
}
