//! Plan execution: sequential and layered-parallel, with endured failures,
//! evictions, dynamic rescheduling and cooperative abort.

mod pool;

pub use pool::{InlinePool, PoolOutcome, PoolTask, TokioPool, WorkerPool};

use crate::config::ExecutionConfig;
use crate::errors::{
    AbortError, CompileError, ExecuteError, PartialOutputFailure, PipelineExecutionError,
};
use crate::network::Network;
use crate::operation::{Operation, ValueMap};
use crate::plan::{compile, CompileRequest, OpPredicate, Plan, Step};
use crate::solution::Solution;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A shared flag aborting an execution between steps or layers.
///
/// Aborting is cooperative: running bodies are allowed to finish, pending
/// operations are canceled and the execution fails with an abort error.
/// The flag is sticky; call [`AbortToken::reset`] before reusing it.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
}

impl AbortToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an abort.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag for reuse.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The per-operation state machine within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Not reached yet.
    Pending,
    /// The body is being invoked.
    Running,
    /// All non-optional provides delivered.
    Completed,
    /// A rescheduled operation delivered a subset of its provides.
    Partial,
    /// The body raised and the operation is endured.
    FailedEndured,
    /// The body raised and the failure is fatal.
    FailedFatal,
    /// Skipped due to upstream failure, reschedule pruning or abort.
    Canceled,
}

/// Runs plans against input values, producing solutions.
#[derive(Debug)]
pub struct Executor {
    pool: Arc<dyn WorkerPool>,
    config: ExecutionConfig,
    abort: AbortToken,
}

/// Mutable state of one execution.
struct Run {
    plan: Arc<Plan>,
    solution: Solution,
    states: HashMap<String, OpState>,
    rescheduled_from: HashSet<String>,
    sfx_done: HashSet<String>,
}

impl Run {
    fn new(plan: Arc<Plan>, inputs: ValueMap) -> Self {
        let states = plan
            .ops()
            .iter()
            .map(|op| (op.name().to_string(), OpState::Pending))
            .collect();
        let solution = Solution::new(plan.key(), plan.asked_outs().clone(), inputs);
        Self {
            plan,
            solution,
            states,
            rescheduled_from: HashSet::new(),
            sfx_done: HashSet::new(),
        }
    }

    fn is_pending(&self, op: &str) -> bool {
        matches!(self.states.get(op), Some(OpState::Pending))
    }

    /// Whether the operation can run given what the solution holds now.
    ///
    /// Upstream failures and partial deliveries surface here: a consumer
    /// whose required need never materialized is canceled, not invoked.
    fn needs_satisfied(&self, op: &Operation) -> bool {
        for dep in op.needs() {
            if dep.is_sideffect() {
                let has_producers = self
                    .plan
                    .sfx_producers
                    .get(dep.base())
                    .is_some_and(|p| !p.is_empty());
                if has_producers && !self.sfx_done.contains(dep.base()) {
                    return false;
                }
            } else if !dep.is_optional() && !self.solution.contains(dep.base()) {
                return false;
            }
        }
        true
    }

    fn cancel(&mut self, op: &str) {
        self.states.insert(op.to_string(), OpState::Canceled);
        self.solution.record_canceled(op);
    }
}

/// A fatal outcome: the triggering operation and its error.
type Fatal = (String, ExecuteError);

enum RescheduleOutcome {
    /// A new plan was spliced in; restart from its first pending step.
    Spliced,
    /// No replanning happened; keep going.
    Continue,
}

impl Executor {
    /// Creates an executor over the given pool and configuration.
    #[must_use]
    pub fn new(pool: Arc<dyn WorkerPool>, config: ExecutionConfig) -> Self {
        Self {
            pool,
            config,
            abort: AbortToken::new(),
        }
    }

    /// Attaches an externally-held abort token.
    #[must_use]
    pub fn with_abort(mut self, token: AbortToken) -> Self {
        self.abort = token;
        self
    }

    /// The abort token consulted between steps and layers.
    #[must_use]
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Executes a plan against input values.
    ///
    /// The network is the one the plan was compiled from; rescheduling
    /// recompiles against it when a rescheduled operation under-delivers.
    ///
    /// # Errors
    ///
    /// [`PipelineExecutionError`] on the first fatal failure, wrapping the
    /// cause and the finalized partial solution.
    pub async fn execute(
        &self,
        plan: &Arc<Plan>,
        network: &Network,
        inputs: ValueMap,
    ) -> Result<Solution, PipelineExecutionError> {
        let mut run = Run::new(plan.clone(), inputs);
        let parallel = self
            .config
            .parallel_tasks
            .unwrap_or_else(|| plan.ops().iter().any(|op| op.flags().parallel));

        let result = if parallel {
            self.run_layers(&mut run, network).await
        } else {
            self.run_steps(&mut run, network).await
        };

        run.solution.finalize();
        match result {
            Ok(()) => Ok(run.solution),
            Err((op, source)) => Err(PipelineExecutionError {
                op,
                source,
                solution: Box::new(run.solution),
            }),
        }
    }

    // ---- sequential ----

    async fn run_steps(&self, run: &mut Run, network: &Network) -> Result<(), Fatal> {
        let mut steps: Vec<Step> = run.plan.steps().to_vec();
        let mut idx = 0;
        while idx < steps.len() {
            match steps[idx].clone() {
                Step::Evict(data) => {
                    self.apply_evict(run, &data);
                    idx += 1;
                }
                Step::Compute(name) => {
                    if self.abort.is_aborted() {
                        return Err(self.handle_abort(run, &name));
                    }
                    let Some(op) = run.plan.op(&name).cloned() else {
                        idx += 1;
                        continue;
                    };
                    if !run.is_pending(&name) {
                        idx += 1;
                        continue;
                    }
                    if !run.needs_satisfied(&op) {
                        debug!(op = %name, "canceled: required needs absent");
                        run.cancel(&name);
                        idx += 1;
                        continue;
                    }

                    run.states.insert(name.clone(), OpState::Running);
                    let task = PoolTask {
                        op: op.clone(),
                        inputs: select_inputs(&op, run.solution.values()),
                        marshal: false,
                        debug: self.config.debug,
                    };
                    let outcome = pool::run_task(task).await;

                    match outcome.result {
                        Ok(result) => {
                            let missing = self.merge_success(run, &op, result);
                            if !missing.is_empty() {
                                match self.try_reschedule(run, network, &op, missing)? {
                                    RescheduleOutcome::Spliced => {
                                        steps = run.plan.steps().to_vec();
                                        idx = 0;
                                        continue;
                                    }
                                    RescheduleOutcome::Continue => idx += 1,
                                }
                            } else {
                                idx += 1;
                            }
                        }
                        Err(err) => {
                            if let Some(fatal) = self.record_failure(run, &op, err) {
                                return Err((name, fatal));
                            }
                            idx += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- parallel ----

    async fn run_layers(&self, run: &mut Run, network: &Network) -> Result<(), Fatal> {
        let mut layers = run.plan.layers().to_vec();
        let mut layer_evictions = run.plan.layer_evictions.clone();
        let mut layer_idx = 0;

        while layer_idx < layers.len() {
            if self.abort.is_aborted() {
                let name = layers[layer_idx].first().cloned().unwrap_or_default();
                return Err(self.handle_abort(run, &name));
            }

            let mut batch: Vec<Arc<Operation>> = Vec::new();
            let mut serial: Vec<Arc<Operation>> = Vec::new();
            for name in &layers[layer_idx] {
                if !run.is_pending(name) {
                    continue;
                }
                let Some(op) = run.plan.op(name).cloned() else {
                    continue;
                };
                if !run.needs_satisfied(&op) {
                    debug!(op = %name, "canceled: required needs absent");
                    run.cancel(name);
                    continue;
                }
                if self.parallel_op(&op) {
                    batch.push(op);
                } else {
                    serial.push(op);
                }
            }

            let mut first_fatal: Option<Fatal> = None;
            let mut partials: Vec<(Arc<Operation>, Vec<String>)> = Vec::new();

            // The parallel subset goes to the pool as one barrier-synced
            // batch; results are merged in submission (composition) order.
            let mut tasks = Vec::with_capacity(batch.len());
            for op in &batch {
                run.states.insert(op.name().to_string(), OpState::Running);
                tasks.push(PoolTask {
                    op: op.clone(),
                    inputs: select_inputs(op, run.solution.values()),
                    marshal: self.marshal_op(op),
                    debug: self.config.debug,
                });
            }
            let outcomes = self.pool.run(tasks).await;
            let by_name: HashMap<&str, &Arc<Operation>> =
                batch.iter().map(|op| (op.name(), op)).collect();
            for outcome in outcomes {
                let Some(op) = by_name.get(outcome.op.as_str()).copied().cloned() else {
                    continue;
                };
                match outcome.result {
                    Ok(result) => {
                        let missing = self.merge_success(run, &op, result);
                        if !missing.is_empty() {
                            partials.push((op, missing));
                        }
                    }
                    Err(err) => {
                        if let Some(fatal) = self.record_failure(run, &op, err) {
                            first_fatal.get_or_insert((op.name().to_string(), fatal));
                        }
                    }
                }
            }

            // Non-parallel stragglers run serially after the subset drains.
            if first_fatal.is_none() {
                for op in serial {
                    run.states.insert(op.name().to_string(), OpState::Running);
                    let task = PoolTask {
                        op: op.clone(),
                        inputs: select_inputs(&op, run.solution.values()),
                        marshal: false,
                        debug: self.config.debug,
                    };
                    let outcome = pool::run_task(task).await;
                    match outcome.result {
                        Ok(result) => {
                            let missing = self.merge_success(run, &op, result);
                            if !missing.is_empty() {
                                partials.push((op, missing));
                            }
                        }
                        Err(err) => {
                            if let Some(fatal) = self.record_failure(run, &op, err) {
                                first_fatal = Some((op.name().to_string(), fatal));
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(fatal) = first_fatal {
                return Err(fatal);
            }

            if self.config.evict {
                for data in layer_evictions[layer_idx].clone() {
                    self.apply_evict(run, &data);
                }
            }

            // Reschedule strictly between layers.
            if !partials.is_empty() && self.config.reschedule_enabled {
                for (op, missing) in &partials {
                    match self.try_reschedule(run, network, op, missing.clone()) {
                        Ok(RescheduleOutcome::Spliced) => {}
                        Ok(RescheduleOutcome::Continue) => {}
                        Err(fatal) => return Err(fatal),
                    }
                }
                layers = run.plan.layers().to_vec();
                layer_evictions = run.plan.layer_evictions.clone();
                layer_idx = 0;
                continue;
            }

            layer_idx += 1;
        }
        Ok(())
    }

    // ---- shared machinery ----

    fn endured(&self, op: &Operation) -> bool {
        self.config.endure_operations.unwrap_or(op.flags().endured)
    }

    fn parallel_op(&self, op: &Operation) -> bool {
        self.config.parallel_tasks.unwrap_or(op.flags().parallel)
    }

    fn marshal_op(&self, op: &Operation) -> bool {
        self.config.marshal_tasks.unwrap_or(op.flags().marshalled)
    }

    fn apply_evict(&self, run: &mut Run, data: &str) {
        if self.config.evict && !run.plan.asked_outs().contains(data) {
            run.solution.evict(data);
            debug!(%data, "evicted intermediate value");
        }
    }

    /// Merges a successful result into the solution; returns the missing
    /// required provides (non-empty only for rescheduled operations).
    fn merge_success(&self, run: &mut Run, op: &Operation, result: ValueMap) -> Vec<String> {
        let missing: Vec<String> = op
            .required_provide_bases()
            .filter(|b| !result.contains_key(*b))
            .map(str::to_string)
            .collect();

        // Deterministic merge order for the overwrite log.
        let mut entries: Vec<(String, serde_json::Value)> = result.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in entries {
            run.solution.write(name, value);
        }

        for dep in op.provides() {
            if dep.is_sideffect() {
                run.sfx_done.insert(dep.base().to_string());
            }
        }

        run.solution.record_executed(op.name());
        if missing.is_empty() {
            run.states.insert(op.name().to_string(), OpState::Completed);
        } else {
            debug!(op = %op.name(), ?missing, "partial delivery");
            run.states.insert(op.name().to_string(), OpState::Partial);
        }
        missing
    }

    /// Records a body failure; returns the error when it is fatal.
    ///
    /// A fatal failure cancels every pending operation downstream of the
    /// failed one before surfacing.
    fn record_failure(
        &self,
        run: &mut Run,
        op: &Operation,
        err: ExecuteError,
    ) -> Option<ExecuteError> {
        run.solution.record_executed(op.name());
        if self.endured(op) {
            warn!(op = %op.name(), error = %err, "endured failure");
            run.states
                .insert(op.name().to_string(), OpState::FailedEndured);
            run.solution.record_failure(op.name(), err);
            None
        } else {
            run.states
                .insert(op.name().to_string(), OpState::FailedFatal);
            run.solution.record_failure(op.name(), err.clone());
            self.cancel_downstream(run, op.name());
            Some(err)
        }
    }

    fn cancel_downstream(&self, run: &mut Run, from: &str) {
        let mut frontier = vec![from.to_string()];
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(current) = frontier.pop() {
            for succ in run.plan.successors_of(&current).to_vec() {
                if seen.insert(succ.clone()) {
                    if run.is_pending(&succ) {
                        run.cancel(&succ);
                    }
                    frontier.push(succ);
                }
            }
        }
    }

    fn handle_abort(&self, run: &mut Run, at_op: &str) -> Fatal {
        warn!(op = %at_op, "execution aborted");
        let pending: Vec<String> = run
            .states
            .iter()
            .filter(|(_, s)| matches!(s, OpState::Pending))
            .map(|(name, _)| name.clone())
            .collect();
        for name in pending {
            run.cancel(&name);
        }
        (at_op.to_string(), ExecuteError::Aborted(AbortError))
    }

    /// Handles a partial delivery from a rescheduled operation.
    ///
    /// Replans at most once per operation per execution; on an
    /// unrecoverable replan the partial delivery becomes a
    /// [`PartialOutputFailure`], fatal unless the operation is endured.
    fn try_reschedule(
        &self,
        run: &mut Run,
        network: &Network,
        op: &Operation,
        missing: Vec<String>,
    ) -> Result<RescheduleOutcome, Fatal> {
        if !self.config.reschedule_enabled {
            debug!(op = %op.name(), "rescheduling disabled; downstream consumers cancel lazily");
            return Ok(RescheduleOutcome::Continue);
        }

        if !run.rescheduled_from.insert(op.name().to_string()) {
            return self.partial_failure(run, op, missing);
        }

        match self.recompile(run, network) {
            Some(new_plan) => {
                // Pending operations with no counterpart in the new plan
                // were pruned by the replan; cancellation only grows.
                let kept: HashSet<&str> = new_plan.ops().iter().map(|o| o.name()).collect();
                let dropped: Vec<String> = run
                    .states
                    .iter()
                    .filter(|(name, state)| {
                        matches!(state, OpState::Pending) && !kept.contains(name.as_str())
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in dropped {
                    debug!(op = %name, "canceled by reschedule");
                    run.cancel(&name);
                }
                debug!(op = %op.name(), new_plan = %new_plan.key(), "rescheduled");
                for kept_op in new_plan.ops() {
                    run.states
                        .entry(kept_op.name().to_string())
                        .or_insert(OpState::Pending);
                }
                run.solution.set_plan_key(new_plan.key());
                run.plan = new_plan;
                Ok(RescheduleOutcome::Spliced)
            }
            None => self.partial_failure(run, op, missing),
        }
    }

    fn partial_failure(
        &self,
        run: &mut Run,
        op: &Operation,
        missing: Vec<String>,
    ) -> Result<RescheduleOutcome, Fatal> {
        let err = ExecuteError::PartialOutput(PartialOutputFailure {
            op: op.name().to_string(),
            missing,
        });
        if self.endured(op) {
            run.solution.record_failure(op.name(), err);
            Ok(RescheduleOutcome::Continue)
        } else {
            run.solution.record_failure(op.name(), err.clone());
            self.cancel_downstream(run, op.name());
            Err((op.name().to_string(), err))
        }
    }

    /// Recompiles against the network with everything currently solved as
    /// inputs, excluding operations that already reached a terminal state.
    ///
    /// Asked outputs that became unreachable are dropped from the request;
    /// their pruned providers surface as cancellations at the splice.
    fn recompile(&self, run: &Run, network: &Network) -> Option<Arc<Plan>> {
        let mut inputs: BTreeSet<String> = run.plan.known_inputs().clone();
        inputs.extend(run.solution.values().keys().cloned());

        let done: HashSet<String> = run
            .states
            .iter()
            .filter(|(_, s)| !matches!(s, OpState::Pending))
            .map(|(name, _)| name.clone())
            .collect();
        let original = run.plan.predicate.clone();
        let predicate = OpPredicate::new(move |op: &Operation| {
            !done.contains(op.name()) && original.as_ref().map_or(true, |p| p.test(op))
        });

        let mut request = CompileRequest {
            inputs,
            outputs: run.plan.asked_outs().clone(),
            predicate: Some(predicate),
        };

        match compile(network, &request, &self.config) {
            Ok(plan) => Some(Arc::new(plan)),
            Err(CompileError::Unsolvable(e)) => {
                for lost in &e.outputs {
                    request.outputs.remove(lost);
                }
                if request.outputs.is_empty() {
                    // An emptied request would mean "produce everything";
                    // nothing recoverable remains.
                    return None;
                }
                compile(network, &request, &self.config).ok().map(Arc::new)
            }
            Err(CompileError::Cycle(_)) => None,
        }
    }
}

/// Selects the body-visible inputs for an operation from the solution's
/// values, keyed by base name.
fn select_inputs(op: &Operation, values: &ValueMap) -> ValueMap {
    let mut selected = ValueMap::with_capacity(op.needs().len());
    for dep in op.needs() {
        if !dep.is_body_visible() {
            continue;
        }
        if let Some(value) = values.get(dep.base()) {
            selected.insert(dep.base().to_string(), value.clone());
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_token_is_sticky() {
        let token = AbortToken::new();
        assert!(!token.is_aborted());
        token.abort();
        assert!(token.is_aborted());
        let shared = token.clone();
        assert!(shared.is_aborted());
        token.reset();
        assert!(!shared.is_aborted());
    }

    #[test]
    fn test_select_inputs_skips_invisible_deps() {
        use crate::modifier::{implicit, sideffect, Dep};
        use crate::operation::FnBody;
        use serde_json::json;

        let op = Operation::builder("op")
            .needs([Dep::from("a"), sideffect("s"), implicit("h")])
            .provides(["out"])
            .build(FnBody::new(|_: ValueMap| Ok(ValueMap::new())))
            .unwrap();

        let values = ValueMap::from([
            ("a".to_string(), json!(1)),
            ("h".to_string(), json!(2)),
        ]);
        let selected = select_inputs(&op, &values);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("a"));
    }
}
