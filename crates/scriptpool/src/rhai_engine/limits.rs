use serde::{Deserialize, Serialize};

/// Resource limits applied to every Rhai engine a factory builds.
///
/// Wall-clock limits are not enforced here; wrap `execute` in a deadline that
/// fires its cancellation token instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Operations one invocation may perform.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum expression nesting depth inside functions.
    pub max_function_expr_depth: usize,
    /// Maximum size of any string value.
    pub max_string_size: usize,
    /// Maximum size of any array.
    pub max_array_size: usize,
    /// Maximum size of any object map.
    pub max_map_size: usize,
    /// Maximum number of variables in scope.
    pub max_variables: usize,
    /// Maximum number of script functions.
    pub max_functions: usize,
    /// Maximum number of modules a script may import.
    pub max_modules: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 1_000_000,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_variables: 10_000,
            max_functions: 1_000,
            max_modules: 10,
        }
    }
}

impl EngineLimits {
    /// Set the operation budget.
    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }
}
