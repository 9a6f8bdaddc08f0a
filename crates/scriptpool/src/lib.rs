#![warn(missing_docs)]

//! # scriptpool
//!
//! Pooled script execution with typed diagnostic streams.
//!
//! ## Overview
//!
//! A [`SessionConfiguration`] describes the variables, modules and policies
//! every interpreter context starts with. An [`ExecutionContextPool`] keeps a
//! bounded set of contexts built from it, and a [`ScriptExecutor`] runs
//! scripts on borrowed contexts. While a script runs, its verbose, debug,
//! information, warning, error and progress output is routed to the matching
//! handler of a [`DiagnosticCallbacks`] set; the values the script emits come
//! back as a [`PipelineResult`].
//!
//! ```no_run
//! use scriptpool::{
//!     DiagnosticCallbacks, ExecutionContextPool, PoolOptions, RhaiFactory, ScriptExecutor,
//!     ScriptRequest, SessionConfiguration,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> scriptpool::Result<()> {
//! let config = SessionConfiguration::builder()
//!     .with_variable("x", "42")
//!     .build()?;
//! let pool = ExecutionContextPool::new(RhaiFactory::new());
//! pool.initialize(PoolOptions::new(1, 4), config).await?;
//!
//! let executor = ScriptExecutor::new(pool.clone());
//! let callbacks = DiagnosticCallbacks::new().with_progress(|p| println!("{p}"));
//! let result = executor
//!     .execute(
//!         ScriptRequest::new("write_progress(\"work\", 50); return x"),
//!         &callbacks,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(result.items(), ["42"]);
//! pool.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread policy
//!
//! With [`ThreadPolicy::NewThreadPerUse`] every invocation runs on Tokio's
//! blocking pool. With [`ThreadPolicy::ReuseThread`] every context lives on a
//! dedicated thread for its whole life.

/// Session configuration and pool options.
mod config;
/// The interpreter capability.
mod context;
/// Diagnostic records, sinks and callbacks.
mod diagnostics;
/// Routing of diagnostic notices.
mod dispatch;
/// Error types and Result alias.
mod error;
/// Script requests and the executor.
mod executor;
/// The context pool.
mod pool;
/// Thread hosting of contexts.
mod worker;

pub mod rhai_engine;
pub mod testutils;

pub use config::{
    CreationMode, ExecutionPolicy, PoolOptions, SessionConfiguration,
    SessionConfigurationBuilder, ThreadPolicy, VariableEntry,
};
pub use context::{
    ContextFactory, FaultKind, InterpreterContext, Invocation, Parameters, ScriptFault,
};
pub use diagnostics::{
    Callback, DiagnosticCallbacks, DiagnosticCategory, DiagnosticFeed, DiagnosticNotice,
    DiagnosticRecord, DiagnosticSink, DiagnosticStreams, ErrorRecord, InformationRecord,
    InformationalRecord, ProgressRecord, ProgressRecordType, SharedStreams,
};
pub use dispatch::DiagnosticDispatcher;
pub use error::{CallbackFault, Error, Result};
pub use executor::{PipelineResult, ScriptExecutor, ScriptRequest};
pub use pool::{ExecutionContextPool, PoolState, PoolStatus, PooledContext};
pub use rhai_engine::{EngineExtension, EngineLimits, RhaiContext, RhaiFactory};
