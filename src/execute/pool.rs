//! The worker-pool boundary for parallel layers.
//!
//! The executor never spawns threads itself: it hands a layer's eligible
//! tasks to a [`WorkerPool`] and blocks on the whole set. Marshalling
//! round-trips task arguments and results through serialized bytes, the
//! way a cross-process pool would receive them.

use crate::errors::ExecuteError;
use crate::operation::{Operation, ValueMap};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One operation invocation submitted to a pool.
#[derive(Debug)]
pub struct PoolTask {
    /// The operation to run.
    pub op: Arc<Operation>,
    /// The selected, body-visible inputs.
    pub inputs: ValueMap,
    /// Serialize arguments and results across the pool boundary.
    pub marshal: bool,
    /// Attach richer context to body errors.
    pub debug: bool,
}

/// The result of one submitted task.
#[derive(Debug)]
pub struct PoolOutcome {
    /// The operation name.
    pub op: String,
    /// The computed outputs, or the failure.
    pub result: Result<ValueMap, ExecuteError>,
}

/// An external executor of task batches.
///
/// `run` submits every task and resolves only when all of them reached a
/// terminal state; this is the layer barrier of the execution model.
#[async_trait]
pub trait WorkerPool: Send + Sync + Debug {
    /// Runs a batch of tasks to completion.
    async fn run(&self, tasks: Vec<PoolTask>) -> Vec<PoolOutcome>;
}

/// Runs one task, honoring its marshalling flag.
pub(crate) async fn run_task(task: PoolTask) -> PoolOutcome {
    let name = task.op.name().to_string();
    let result = run_task_inner(task).await;
    PoolOutcome { op: name, result }
}

async fn run_task_inner(task: PoolTask) -> Result<ValueMap, ExecuteError> {
    let inputs = if task.marshal {
        marshal_roundtrip(task.op.name(), task.inputs)?
    } else {
        task.inputs
    };
    let result = task.op.compute(&inputs, task.debug).await?;
    if task.marshal {
        marshal_roundtrip(task.op.name(), result)
    } else {
        Ok(result)
    }
}

fn marshal_roundtrip(op: &str, map: ValueMap) -> Result<ValueMap, ExecuteError> {
    let bytes = serde_json::to_vec(&map)
        .map_err(|e| ExecuteError::Internal(format!("marshalling for '{op}' failed: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ExecuteError::Internal(format!("unmarshalling for '{op}' failed: {e}")))
}

/// A pool that spawns each task onto the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPool;

impl TokioPool {
    /// Creates a tokio-backed pool.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerPool for TokioPool {
    async fn run(&self, tasks: Vec<PoolTask>) -> Vec<PoolOutcome> {
        let handles: Vec<(String, JoinHandle<PoolOutcome>)> = tasks
            .into_iter()
            .map(|task| {
                let name = task.op.name().to_string();
                (name, tokio::spawn(run_task(task)))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(PoolOutcome {
                    op: name.clone(),
                    result: Err(ExecuteError::Internal(format!(
                        "worker for '{name}' died: {join_err}"
                    ))),
                }),
            }
        }
        outcomes
    }
}

/// A pool that runs tasks one after another on the caller's task.
///
/// Useful in tests and wherever spawning is undesirable; semantically a
/// pool of one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlinePool;

impl InlinePool {
    /// Creates an inline pool.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerPool for InlinePool {
    async fn run(&self, tasks: Vec<PoolTask>) -> Vec<PoolOutcome> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(run_task(task).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::FnBody;
    use serde_json::json;
    use std::collections::HashMap;

    fn double_op() -> Arc<Operation> {
        Arc::new(
            Operation::builder("double")
                .needs(["x"])
                .provides(["y"])
                .build(FnBody::new(|inputs: ValueMap| {
                    let x = inputs["x"].as_i64().unwrap();
                    Ok(HashMap::from([("y".to_string(), json!(x * 2))]))
                }))
                .unwrap(),
        )
    }

    fn task_for(op: Arc<Operation>, x: i64, marshal: bool) -> PoolTask {
        PoolTask {
            op,
            inputs: HashMap::from([("x".to_string(), json!(x))]),
            marshal,
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_tokio_pool_runs_batch() {
        let pool = TokioPool::new();
        let op = double_op();
        let outcomes = pool
            .run(vec![task_for(op.clone(), 1, false), task_for(op, 2, false)])
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result.as_ref().unwrap()["y"], json!(2));
        assert_eq!(outcomes[1].result.as_ref().unwrap()["y"], json!(4));
    }

    #[tokio::test]
    async fn test_inline_pool_marshal_roundtrip() {
        let pool = InlinePool::new();
        let outcomes = pool.run(vec![task_for(double_op(), 3, true)]).await;
        assert_eq!(outcomes[0].result.as_ref().unwrap()["y"], json!(6));
    }

    #[tokio::test]
    async fn test_pool_reports_body_failures() {
        let op = Arc::new(
            Operation::builder("bad")
                .needs(["x"])
                .provides(["y"])
                .build(FnBody::new(|_| Err("nope".into())))
                .unwrap(),
        );
        let outcomes = TokioPool::new().run(vec![task_for(op, 1, false)]).await;
        assert!(matches!(
            outcomes[0].result,
            Err(ExecuteError::UserFn(_))
        ));
    }
}
