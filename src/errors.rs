//! Error types for the flowgraph engine.
//!
//! Compile-time errors abort compilation. Execute-time errors in endured
//! operations are recorded on the solution and swallowed; in non-endured
//! operations they cancel downstream work and surface wrapped in
//! [`PipelineExecutionError`], which still carries the partial solution.

use crate::solution::Solution;
use thiserror::Error;

/// The umbrella error type for flowgraph operations.
#[derive(Debug, Error)]
pub enum FlowgraphError {
    /// An operation was declared with an invalid shape.
    #[error("{0}")]
    Build(#[from] OpBuildError),

    /// Two operations with the same name were appended to a network.
    #[error("{0}")]
    Duplicate(#[from] DuplicateOperationError),

    /// A data-flow cycle was detected while compiling a plan.
    #[error("{0}")]
    Cycle(#[from] CyclicDependencyError),

    /// An asked output cannot be produced from the given inputs.
    #[error("{0}")]
    Unsolvable(#[from] UnsolvableGraphError),

    /// Execution aborted on a fatal operation failure.
    #[error("{0}")]
    Execution(#[from] PipelineExecutionError),

    /// A solution was mutated after being finalized.
    #[error("{0}")]
    Finalized(#[from] SolutionFinalizedError),
}

impl From<CompileError> for FlowgraphError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Cycle(e) => Self::Cycle(e),
            CompileError::Unsolvable(e) => Self::Unsolvable(e),
        }
    }
}

/// Errors raised while compiling a network into a plan.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// A data-flow cycle was detected.
    #[error("{0}")]
    Cycle(#[from] CyclicDependencyError),

    /// An asked output is unreachable.
    #[error("{0}")]
    Unsolvable(#[from] UnsolvableGraphError),
}

/// Error raised when an operation declaration is invalid.
#[derive(Debug, Clone, Error)]
pub enum OpBuildError {
    /// The operation name is empty or whitespace-only.
    #[error("operation name cannot be empty")]
    EmptyName,

    /// The same base name appears twice in `needs`.
    #[error("operation '{op}' declares duplicate need '{name}'")]
    DuplicateNeed {
        /// The operation being built.
        op: String,
        /// The repeated base name.
        name: String,
    },

    /// The same base name appears twice in `provides`.
    #[error("operation '{op}' declares duplicate provide '{name}'")]
    DuplicateProvide {
        /// The operation being built.
        op: String,
        /// The repeated base name.
        name: String,
    },

    /// An alias references a source the operation does not provide.
    #[error("operation '{op}' aliases '{src}' which is not among its provides")]
    AliasSource {
        /// The operation being built.
        op: String,
        /// The missing alias source.
        src: String,
    },
}

/// Error raised when appending an operation whose name is already taken.
#[derive(Debug, Clone, Error)]
#[error("operation '{op}' already exists in network '{network}'")]
pub struct DuplicateOperationError {
    /// The clashing operation name.
    pub op: String,
    /// The network being composed.
    pub network: String,
}

/// Error raised when the data-flow subgraph contains a cycle.
///
/// Ordering-only (sideffect) edges never contribute to this error; the
/// acyclicity invariant holds on real data dependencies.
#[derive(Debug, Clone, Error)]
#[error("cyclic data dependency: {}", cycle.join(" -> "))]
pub struct CyclicDependencyError {
    /// Operation names along the cycle, first repeated last.
    pub cycle: Vec<String>,
}

/// Error raised when asked outputs cannot be reached from the known inputs.
#[derive(Debug, Clone, Error)]
#[error("unsolvable graph: no way to produce output(s) {outputs:?}{}", render_pruned(pruned))]
pub struct UnsolvableGraphError {
    /// The asked outputs that cannot be produced.
    pub outputs: Vec<String>,
    /// Pruned operations that would have provided them, with prune reasons.
    pub pruned: Vec<String>,
}

fn render_pruned(pruned: &[String]) -> String {
    if pruned.is_empty() {
        String::new()
    } else {
        format!("; pruned providers: {}", pruned.join(", "))
    }
}

/// Error wrapping a failure raised by a user-supplied operation body.
#[derive(Debug, Clone, Error)]
#[error("operation '{op}' body failed: {message} (inputs: {})", inputs.join(", "))]
pub struct UserFnError {
    /// The operation whose body failed.
    pub op: String,
    /// The rendered body error.
    pub message: String,
    /// Names of the inputs the body was invoked with.
    pub inputs: Vec<String>,
    /// Rendered input values, populated when `debug` is set.
    pub input_values: Option<String>,
}

/// Error raised when a non-rescheduled operation under-delivers its provides.
#[derive(Debug, Clone, Error)]
#[error("operation '{op}' did not return required output(s) {missing:?}")]
pub struct MissingOutputsError {
    /// The under-delivering operation.
    pub op: String,
    /// The required provides absent from the returned mapping.
    pub missing: Vec<String>,
}

/// Error raised when rescheduling cannot recover from a partial delivery.
#[derive(Debug, Clone, Error)]
#[error("operation '{op}' delivered partial outputs {missing:?} and rescheduling could not recover")]
pub struct PartialOutputFailure {
    /// The partially-delivering operation.
    pub op: String,
    /// The provides still missing.
    pub missing: Vec<String>,
}

/// Error raised when execution is aborted via an abort token.
#[derive(Debug, Clone, Default, Error)]
#[error("execution aborted")]
pub struct AbortError;

/// Error raised when mutating a finalized solution.
#[derive(Debug, Clone, Error)]
#[error("solution is finalized; cannot write '{name}'")]
pub struct SolutionFinalizedError {
    /// The data name whose mutation was rejected.
    pub name: String,
}

/// An execute-time failure attributable to a single operation.
///
/// Stored per-op in [`Solution::failures`](crate::solution::Solution) for
/// endured operations, or carried as the cause of a
/// [`PipelineExecutionError`] for fatal ones.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    /// The operation body raised.
    #[error("{0}")]
    UserFn(#[from] UserFnError),

    /// A non-rescheduled operation under-delivered.
    #[error("{0}")]
    MissingOutputs(#[from] MissingOutputsError),

    /// A rescheduled operation under-delivered twice.
    #[error("{0}")]
    PartialOutput(#[from] PartialOutputFailure),

    /// Execution was aborted.
    #[error("{0}")]
    Aborted(#[from] AbortError),

    /// An internal executor error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Terminal execute-time error carrying the partial solution snapshot.
#[derive(Debug, Error)]
#[error("pipeline execution failed at operation '{op}': {source}")]
pub struct PipelineExecutionError {
    /// The operation that triggered the failure.
    pub op: String,
    /// The first fatal cause.
    #[source]
    pub source: ExecuteError,
    /// The finalized partial solution at the moment of failure.
    pub solution: Box<Solution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_rendering() {
        let err = CyclicDependencyError {
            cycle: vec!["x".into(), "y".into(), "x".into()],
        };
        assert!(err.to_string().contains("x -> y -> x"));
    }

    #[test]
    fn test_unsolvable_error_rendering() {
        let err = UnsolvableGraphError {
            outputs: vec!["z".into()],
            pruned: vec!["mk_z (unsatisfied need 'q')".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("\"z\""));
        assert!(msg.contains("mk_z"));
    }

    #[test]
    fn test_user_fn_error_rendering() {
        let err = UserFnError {
            op: "add".into(),
            message: "boom".into(),
            inputs: vec!["a".into(), "b".into()],
            input_values: None,
        };
        assert!(err.to_string().contains("'add'"));
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_execute_error_from_conversions() {
        let err: ExecuteError = MissingOutputsError {
            op: "op".into(),
            missing: vec!["out".into()],
        }
        .into();
        assert!(matches!(err, ExecuteError::MissingOutputs(_)));
    }
}
