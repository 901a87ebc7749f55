//! Execution configuration.
//!
//! A config is consulted at plan- and execute-time. It is threaded
//! explicitly into compilation and execution; a process-wide scoped
//! override stack is provided for callers that prefer ambient flags, with a
//! guard that pops on drop.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Flags consulted when compiling plans and executing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Enable intermediate-value eviction during execution.
    pub evict: bool,

    /// Globally override the per-operation `parallel` flag.
    pub parallel_tasks: Option<bool>,

    /// Globally force argument/result marshalling across the worker pool.
    pub marshal_tasks: Option<bool>,

    /// Disable eviction insertion at plan time.
    ///
    /// This flag participates in planning but not in the plan-cache key;
    /// flipping it mid-process requires clearing the cache.
    pub skip_evictions: bool,

    /// Master switch for partial-output rescheduling.
    pub reschedule_enabled: bool,

    /// Globally override the per-operation `endured` flag.
    pub endure_operations: Option<bool>,

    /// Attach richer context to errors. No semantic change.
    pub debug: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            evict: false,
            parallel_tasks: None,
            marshal_tasks: None,
            skip_evictions: false,
            reschedule_enabled: true,
            endure_operations: None,
            debug: false,
        }
    }
}

impl ExecutionConfig {
    /// Creates a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables intermediate-value eviction.
    #[must_use]
    pub fn with_evict(mut self, evict: bool) -> Self {
        self.evict = evict;
        self
    }

    /// Overrides the per-operation `parallel` flag globally.
    #[must_use]
    pub fn with_parallel_tasks(mut self, parallel: bool) -> Self {
        self.parallel_tasks = Some(parallel);
        self
    }

    /// Forces marshalling of task arguments and results.
    #[must_use]
    pub fn with_marshal_tasks(mut self, marshal: bool) -> Self {
        self.marshal_tasks = Some(marshal);
        self
    }

    /// Disables eviction insertion at plan time.
    #[must_use]
    pub fn with_skip_evictions(mut self, skip: bool) -> Self {
        self.skip_evictions = skip;
        self
    }

    /// Toggles partial-output rescheduling.
    #[must_use]
    pub fn with_reschedule(mut self, enabled: bool) -> Self {
        self.reschedule_enabled = enabled;
        self
    }

    /// Overrides the per-operation `endured` flag globally.
    #[must_use]
    pub fn with_endure_operations(mut self, endure: bool) -> Self {
        self.endure_operations = Some(endure);
        self
    }

    /// Enables richer error context.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns the innermost scoped override, or the default configuration
    /// when no override is active.
    #[must_use]
    pub fn current() -> Self {
        CONFIG_STACK.read().last().cloned().unwrap_or_default()
    }
}

static CONFIG_STACK: RwLock<Vec<ExecutionConfig>> = RwLock::new(Vec::new());

/// Pushes a scoped configuration override; the returned guard pops it on
/// drop.
///
/// Overrides nest: [`ExecutionConfig::current`] always sees the innermost
/// live scope.
#[must_use]
pub fn scoped(config: ExecutionConfig) -> ScopedConfig {
    CONFIG_STACK.write().push(config);
    ScopedConfig { _private: () }
}

/// Guard for a scoped configuration override.
///
/// Popping is tied to drop so an early return or panic inside the scope
/// still restores the previous configuration.
#[derive(Debug)]
pub struct ScopedConfig {
    _private: (),
}

impl Drop for ScopedConfig {
    fn drop(&mut self) {
        CONFIG_STACK.write().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExecutionConfig::default();
        assert!(!config.evict);
        assert!(config.reschedule_enabled);
        assert!(config.parallel_tasks.is_none());
    }

    #[test]
    fn test_builder_style() {
        let config = ExecutionConfig::new()
            .with_evict(true)
            .with_parallel_tasks(true)
            .with_debug(true);
        assert!(config.evict);
        assert_eq!(config.parallel_tasks, Some(true));
        assert!(config.debug);
    }

    // Uses only the semantically-inert flags so concurrently running tests
    // that consult the ambient configuration are unaffected.
    #[test]
    fn test_scoped_override_pops_on_drop() {
        let outer = scoped(ExecutionConfig::new().with_debug(true));
        assert!(ExecutionConfig::current().debug);
        {
            let _inner = scoped(ExecutionConfig::new().with_marshal_tasks(true));
            let current = ExecutionConfig::current();
            assert_eq!(current.marshal_tasks, Some(true));
            assert!(!current.debug);
        }
        assert!(ExecutionConfig::current().debug);
        drop(outer);
        assert!(!ExecutionConfig::current().debug);
    }
}
