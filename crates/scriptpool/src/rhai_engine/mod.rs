//! The bundled interpreter, built on [Rhai](https://rhai.rs).
//!
//! Each context owns its own [`rhai::Engine`] and a base scope holding the
//! session variables. Scripts see the following host functions on top of the
//! language itself:
//!
//! | function | effect |
//! |---|---|
//! | `print(x)` | information record, source `print` |
//! | `debug(x)` | debug record |
//! | `write_verbose(msg)`, `write_debug(msg)`, `write_warning(msg)` | record in that category |
//! | `write_information(msg)` | information record, source `write_information` |
//! | `write_error(msg)` | non-terminating error record with the call's line |
//! | `write_progress(activity, percent[, status[, operation]])` | progress record, `percent` in `0..=100` |
//! | `complete_progress(activity)` | completed progress record |
//! | `emit(value)` | append `value` to the pipeline |
//! | `sleep(ms)` | block, returning early if the call is cancelled |
//!
//! The pipeline of an invocation is every emitted value followed by the
//! script's final value, unless that value is `()`.

use std::{collections::HashMap, fmt, sync::Arc};

use rhai::{Engine, Module, Scope, Shared, module_resolvers::StaticModuleResolver};

use crate::{
    config::{ExecutionPolicy, SessionConfiguration},
    context::{ContextFactory, InterpreterContext},
    error::{Error, Result},
};

mod context;
mod engine;
mod limits;

pub use context::RhaiContext;
pub use limits::EngineLimits;

use context::CallSlot;
use engine::{build_engine, register_host_api};

/// Host functionality registered on every engine a factory builds.
pub trait EngineExtension: Send + Sync + 'static {
    /// Register functions, types, and modules on the engine.
    fn register(&self, engine: &mut Engine);
}

impl<F> EngineExtension for F
where
    F: Fn(&mut Engine) + Send + Sync + 'static,
{
    fn register(&self, engine: &mut Engine) {
        self(engine)
    }
}

/// Builds [`RhaiContext`]s.
///
/// Modules are registered here by name; a session configuration picks which
/// of them every context preloads.
#[derive(Clone, Default)]
pub struct RhaiFactory {
    limits: EngineLimits,
    modules: HashMap<String, Shared<Module>>,
    extensions: Vec<Arc<dyn EngineExtension>>,
}

impl fmt::Debug for RhaiFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<_> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("RhaiFactory")
            .field("limits", &self.limits)
            .field("modules", &modules)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

impl RhaiFactory {
    /// A factory with default limits, no modules and no extensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set engine limits.
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Make a module available under `name`.
    pub fn with_module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.modules.insert(name.into(), module.into());
        self
    }

    /// Compile Rhai source into a module available under `name`.
    ///
    /// Every non-private function and top-level variable of the source
    /// becomes a member of the module.
    pub fn with_module_source(self, name: impl Into<String>, source: &str) -> Result<Self> {
        let name = name.into();
        let engine = Engine::new();
        let module = engine
            .compile(source)
            .map_err(|e| e.into())
            .and_then(|ast| Module::eval_ast_as_new(Scope::new(), &ast, &engine))
            .map_err(|e| Error::configuration(format!("module '{name}': {e}")))?;
        Ok(self.with_module(name, module))
    }

    /// Add a host extension.
    pub fn with_extension(mut self, extension: impl EngineExtension) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Names of the registered modules.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    fn build(&self, config: &SessionConfiguration) -> Result<RhaiContext> {
        let policy = config.execution_policy();
        let mut engine = build_engine(&self.limits, config.creation_mode(), policy);
        let call = CallSlot::default();
        register_host_api(&mut engine, &call);
        for extension in &self.extensions {
            extension.register(&mut engine);
        }

        let mut resolver = StaticModuleResolver::new();
        for name in config.modules() {
            let module = self
                .modules
                .get(name)
                .ok_or_else(|| Error::configuration(format!("unknown module '{name}'")))?;
            engine.register_static_module(name.as_str(), module.clone());
            resolver.insert(name.as_str(), (**module).clone());
        }
        if policy == ExecutionPolicy::Default {
            engine.set_module_resolver(resolver);
        }

        let mut session = Scope::new();
        for variable in config.variables() {
            let value = rhai::serde::to_dynamic(&variable.value).map_err(|e| {
                Error::configuration(format!("variable '{}': {e}", variable.name))
            })?;
            session.push_dynamic(variable.name.as_str(), value);
        }

        Ok(RhaiContext::new(engine, session, call))
    }
}

impl ContextFactory for RhaiFactory {
    fn create(&self, config: &SessionConfiguration) -> Result<Box<dyn InterpreterContext>> {
        let context = self.build(config)?;
        tracing::debug!(
            "created rhai context with {} variables, {} modules",
            config.variables().len(),
            config.modules().len()
        );
        Ok(Box::new(context))
    }
}
