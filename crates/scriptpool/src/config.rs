//! Session configuration and pool options.

use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Which script sources a context accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// Scripts may import modules and evaluate dynamic code.
    #[default]
    Default,
    /// Module imports and dynamic evaluation are disabled.
    Restricted,
}

/// How much of the language surface a fresh session exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationMode {
    /// The full standard library.
    #[default]
    Default,
    /// A minimal core subset.
    Restricted,
}

/// Threads on which a pool's contexts run their invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPolicy {
    /// Each context owns one dedicated thread for its whole life.
    ReuseThread,
    /// Each invocation runs on a thread from the blocking pool.
    #[default]
    NewThreadPerUse,
}

/// A named session variable visible to every script in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    /// Variable name.
    pub name: String,
    /// Initial value.
    pub value: Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl VariableEntry {
    /// Create a variable entry.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<Value>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: description.into(),
        }
    }
}

/// Shared, read-only setup applied to every context of a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionConfiguration {
    variables: Vec<VariableEntry>,
    modules: Vec<String>,
    execution_policy: ExecutionPolicy,
    creation_mode: CreationMode,
}

/// On-disk shape of a session configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionFile {
    #[serde(default)]
    variables: Vec<VariableEntry>,
    #[serde(default)]
    modules: Vec<String>,
    #[serde(default)]
    execution_policy: ExecutionPolicy,
    #[serde(default)]
    creation_mode: CreationMode,
}

impl SessionConfiguration {
    /// Validate and build a configuration.
    ///
    /// Fails if a variable name is empty or appears more than once. Module
    /// names form a set: repeats are collapsed, first occurrence wins.
    pub fn build(
        variables: impl IntoIterator<Item = VariableEntry>,
        modules: impl IntoIterator<Item = impl Into<String>>,
        execution_policy: ExecutionPolicy,
        creation_mode: CreationMode,
    ) -> Result<Self> {
        let variables: Vec<VariableEntry> = variables.into_iter().collect();
        {
            let mut names = HashSet::new();
            for variable in &variables {
                if variable.name.is_empty() {
                    return Err(Error::configuration("variable name must not be empty"));
                }
                if !names.insert(variable.name.as_str()) {
                    return Err(Error::configuration(format!(
                        "duplicate variable name '{}'",
                        variable.name
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        let modules = modules
            .into_iter()
            .map(Into::into)
            .filter(|m: &String| seen.insert(m.clone()))
            .collect();

        Ok(Self {
            variables,
            modules,
            execution_policy,
            creation_mode,
        })
    }

    /// Start a builder.
    pub fn builder() -> SessionConfigurationBuilder {
        SessionConfigurationBuilder::default()
    }

    /// A builder seeded with this configuration, for layering more settings
    /// on top of a loaded file.
    pub fn into_builder(self) -> SessionConfigurationBuilder {
        SessionConfigurationBuilder {
            variables: self.variables,
            modules: self.modules,
            execution_policy: self.execution_policy,
            creation_mode: self.creation_mode,
        }
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: SessionFile = serde_json::from_str(text)?;
        Self::build(
            file.variables,
            file.modules,
            file.execution_policy,
            file.creation_mode,
        )
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Session variables, in declaration order.
    pub fn variables(&self) -> &[VariableEntry] {
        &self.variables
    }

    /// Look up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&VariableEntry> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Module names to preload.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// The execution policy.
    pub fn execution_policy(&self) -> ExecutionPolicy {
        self.execution_policy
    }

    /// The creation mode.
    pub fn creation_mode(&self) -> CreationMode {
        self.creation_mode
    }
}

/// Incremental construction of a [`SessionConfiguration`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigurationBuilder {
    variables: Vec<VariableEntry>,
    modules: Vec<String>,
    execution_policy: ExecutionPolicy,
    creation_mode: CreationMode,
}

impl SessionConfigurationBuilder {
    /// Add a variable with an empty description.
    pub fn with_variable(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_entry(VariableEntry::new(name, value, ""))
    }

    /// Add a variable entry.
    pub fn with_entry(mut self, entry: VariableEntry) -> Self {
        self.variables.push(entry);
        self
    }

    /// Add a module to preload.
    pub fn with_module(mut self, name: impl Into<String>) -> Self {
        self.modules.push(name.into());
        self
    }

    /// Set the execution policy.
    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    /// Set the creation mode.
    pub fn with_creation_mode(mut self, mode: CreationMode) -> Self {
        self.creation_mode = mode;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<SessionConfiguration> {
        SessionConfiguration::build(
            self.variables,
            self.modules,
            self.execution_policy,
            self.creation_mode,
        )
    }
}

/// Size bounds and thread policy of a context pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Contexts opened eagerly by `initialize`.
    pub min_size: usize,
    /// Upper bound on live contexts.
    pub max_size: usize,
    /// Thread policy shared by every context.
    pub thread_policy: ThreadPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            thread_policy: ThreadPolicy::default(),
        }
    }
}

impl PoolOptions {
    /// Options with the given bounds and the default thread policy.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            thread_policy: ThreadPolicy::default(),
        }
    }

    /// Set the thread policy.
    pub fn with_thread_policy(mut self, thread_policy: ThreadPolicy) -> Self {
        self.thread_policy = thread_policy;
        self
    }

    /// Check `1 <= min_size <= max_size`.
    pub fn validate(&self) -> Result<()> {
        if self.min_size < 1 {
            return Err(Error::configuration("min_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn duplicate_variable_names_are_rejected() {
        let err = SessionConfiguration::builder()
            .with_variable("x", 1)
            .with_variable("y", 2)
            .with_variable("x", 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("'x'")));
    }

    #[test]
    fn empty_variable_name_is_rejected() {
        let err = SessionConfiguration::builder()
            .with_variable("", 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn modules_are_deduplicated_in_order() {
        let config = SessionConfiguration::build(
            Vec::new(),
            ["b", "a", "b"],
            ExecutionPolicy::Default,
            CreationMode::Default,
        )
        .unwrap();
        assert_eq!(config.modules(), ["b", "a"]);
    }

    #[test]
    fn parses_json_configuration() {
        let config = SessionConfiguration::from_json(
            r#"{
                "variables": [
                    {"name": "x", "value": "42", "description": "answer"},
                    {"name": "limits", "value": {"max": 3}}
                ],
                "modules": ["util"],
                "execution_policy": "restricted"
            }"#,
        )
        .unwrap();
        assert_eq!(config.variable("x").unwrap().value, json!("42"));
        assert_eq!(config.variable("limits").unwrap().description, "");
        assert_eq!(config.modules(), ["util"]);
        assert_eq!(config.execution_policy(), ExecutionPolicy::Restricted);
        assert_eq!(config.creation_mode(), CreationMode::Default);
    }

    #[test]
    fn json_duplicates_fail_validation() {
        let err = SessionConfiguration::from_json(
            r#"{"variables": [{"name": "a", "value": 1}, {"name": "a", "value": 2}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn unknown_json_fields_are_errors() {
        let err = SessionConfiguration::from_json(r#"{"vars": []}"#).unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{"creation_mode": "restricted"}"#).unwrap();
        let config = SessionConfiguration::load(&path).unwrap();
        assert_eq!(config.creation_mode(), CreationMode::Restricted);

        let missing = SessionConfiguration::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, Error::Io { .. }));
    }

    #[test]
    fn layered_settings_are_revalidated() {
        let base = SessionConfiguration::from_json(
            r#"{"variables": [{"name": "x", "value": 1}], "modules": ["m"]}"#,
        )
        .unwrap();
        let config = base
            .clone()
            .into_builder()
            .with_variable("y", 2)
            .with_module("m")
            .build()
            .unwrap();
        assert_eq!(config.variables().len(), 2);
        assert_eq!(config.modules(), ["m"]);

        let err = base.into_builder().with_variable("x", 3).build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn pool_bounds_are_validated() {
        assert!(PoolOptions::default().validate().is_ok());
        assert!(PoolOptions::new(2, 2).validate().is_ok());
        assert!(matches!(
            PoolOptions::new(0, 2).validate(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            PoolOptions::new(3, 2).validate(),
            Err(Error::Configuration(_))
        ));
    }
}
