//! # Flowgraph
//!
//! A computational-graph pipeline engine: compose named, side-effect-free
//! operations into a dependency network, compile the network into a pruned
//! execution plan for a caller's inputs, outputs and predicate, then run
//! the plan sequentially or layer-parallel to produce a solution.
//!
//! - **Operations** declare what they *need* and what they *provide*; names
//!   carry modifiers (optional, sideffect, implicit, alias, keyword-rename)
//!   that shape planning and invocation.
//! - **Planning** prunes the network to a minimal DAG per request, schedules
//!   it topologically and inserts eviction instructions; plans are cached.
//! - **Execution** tolerates endured failures, frees intermediates, and
//!   replans dynamically when a rescheduled operation delivers only part of
//!   its advertised outputs.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgraph::prelude::*;
//! use serde_json::json;
//!
//! let double = Operation::builder("double")
//!     .needs(["x"])
//!     .provides(["y"])
//!     .build(FnBody::new(|inputs: ValueMap| {
//!         let x = inputs["x"].as_i64().unwrap();
//!         Ok(ValueMap::from([("y".to_string(), json!(x * 2))]))
//!     }))?;
//!
//! let network = compose("demo", [double], MergePolicy::Append)?;
//! let pipeline = Pipeline::new(network);
//! let solution = pipeline
//!     .run(ValueMap::from([("x".to_string(), json!(21))]))
//!     .await?;
//! assert_eq!(solution["y"], json!(42));
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod execute;
pub mod modifier;
pub mod network;
pub mod operation;
pub mod pipeline;
pub mod plan;
pub mod solution;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{scoped, ExecutionConfig, ScopedConfig};
    pub use crate::errors::{
        AbortError, CompileError, CyclicDependencyError, DuplicateOperationError, ExecuteError,
        FlowgraphError, MissingOutputsError, OpBuildError, PartialOutputFailure,
        PipelineExecutionError, SolutionFinalizedError, UnsolvableGraphError, UserFnError,
    };
    pub use crate::execute::{
        AbortToken, Executor, InlinePool, OpState, PoolOutcome, PoolTask, TokioPool, WorkerPool,
    };
    pub use crate::modifier::{
        alias, implicit, keyword, optional, optional_keyword, sideffect, Dep,
    };
    pub use crate::network::{compose, compose_shared, MergePolicy, Network};
    pub use crate::operation::{
        AsyncFnBody, BoxError, FnBody, OpBody, OpFlags, Operation, ValueMap,
    };
    pub use crate::pipeline::{Pipeline, RunOpts};
    pub use crate::plan::{compile, CompileRequest, OpPredicate, Plan, PlanCache, PlanKey, Step};
    pub use crate::solution::Solution;
}
