//! Solutions: the values and execution metadata produced by one run.

use crate::errors::{ExecuteError, SolutionFinalizedError};
use crate::operation::ValueMap;
use crate::plan::PlanKey;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::ops::Index;
use uuid::Uuid;

/// The mapping of data names to computed values, plus metadata about what
/// ran, what failed and what was skipped.
///
/// A solution is mutated only by the executor during one execution, then
/// finalized; further writes raise [`SolutionFinalizedError`].
#[derive(Debug)]
pub struct Solution {
    values: ValueMap,
    executed: Vec<String>,
    canceled: Vec<String>,
    failures: HashMap<String, ExecuteError>,
    overwrites: HashMap<String, Vec<Value>>,
    asked_outs: BTreeSet<String>,
    plan_key: PlanKey,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    finalized: bool,
}

impl Solution {
    pub(crate) fn new(plan_key: PlanKey, asked_outs: BTreeSet<String>, values: ValueMap) -> Self {
        Self {
            values,
            executed: Vec::new(),
            canceled: Vec::new(),
            failures: HashMap::new(),
            overwrites: HashMap::new(),
            asked_outs,
            plan_key,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            finalized: false,
        }
    }

    /// Looks up a value by data name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// True when a value exists for the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// All values currently held.
    #[must_use]
    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// The number of values held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no values are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The values narrowed to the asked outputs, or everything when the
    /// request was open.
    #[must_use]
    pub fn outputs(&self) -> ValueMap {
        if self.asked_outs.is_empty() {
            self.values.clone()
        } else {
            self.values
                .iter()
                .filter(|(k, _)| self.asked_outs.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
    }

    /// Names of operations that ran to a non-canceled terminal state, in
    /// execution order.
    #[must_use]
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Names of operations skipped due to upstream failure or reschedule
    /// pruning.
    #[must_use]
    pub fn canceled(&self) -> &[String] {
        &self.canceled
    }

    /// Failures recorded per operation.
    #[must_use]
    pub fn failures(&self) -> &HashMap<String, ExecuteError> {
        &self.failures
    }

    /// Every value written to a name that was produced more than once,
    /// in write order; the last entry is the one in `values`.
    #[must_use]
    pub fn overwrites(&self) -> &HashMap<String, Vec<Value>> {
        &self.overwrites
    }

    /// The key of the plan that produced this solution (post-reschedule).
    #[must_use]
    pub fn plan_key(&self) -> PlanKey {
        self.plan_key
    }

    /// Unique identity of this execution.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// When execution began.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the solution was finalized, if it has been.
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// True once the solution has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Writes a value, recording an overwrite when the name already holds
    /// one.
    ///
    /// # Errors
    ///
    /// [`SolutionFinalizedError`] after [`Solution::finalize`].
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), SolutionFinalizedError> {
        let name = name.into();
        if self.finalized {
            return Err(SolutionFinalizedError { name });
        }
        self.write(name, value);
        Ok(())
    }

    /// Removes a value, returning it.
    ///
    /// # Errors
    ///
    /// [`SolutionFinalizedError`] after [`Solution::finalize`].
    pub fn remove(&mut self, name: &str) -> Result<Option<Value>, SolutionFinalizedError> {
        if self.finalized {
            return Err(SolutionFinalizedError {
                name: name.to_string(),
            });
        }
        Ok(self.values.remove(name))
    }

    /// Executor-side write; solutions are never finalized mid-run.
    pub(crate) fn write(&mut self, name: String, value: Value) {
        debug_assert!(!self.finalized, "write after finalize");
        if let Some(old) = self.values.get(&name) {
            let history = self
                .overwrites
                .entry(name.clone())
                .or_insert_with(|| vec![old.clone()]);
            history.push(value.clone());
        }
        self.values.insert(name, value);
    }

    /// Executor-side eviction.
    pub(crate) fn evict(&mut self, name: &str) {
        debug_assert!(!self.finalized, "evict after finalize");
        self.values.remove(name);
    }

    pub(crate) fn record_executed(&mut self, op: &str) {
        self.executed.push(op.to_string());
    }

    pub(crate) fn record_canceled(&mut self, op: &str) {
        if !self.canceled.iter().any(|c| c == op) {
            self.canceled.push(op.to_string());
        }
    }

    pub(crate) fn record_failure(&mut self, op: &str, err: ExecuteError) {
        self.failures.insert(op.to_string(), err);
    }

    pub(crate) fn set_plan_key(&mut self, key: PlanKey) {
        self.plan_key = key;
    }

    /// Freezes the solution; all later writes fail.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.finished_at = Some(Utc::now());
        }
    }
}

impl Index<&str> for Solution {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        self.values
            .get(name)
            .unwrap_or_else(|| panic!("no value for '{name}' in solution"))
    }
}
