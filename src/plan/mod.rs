//! Plans: immutable, cacheable results of compiling a network against a
//! request.

mod cache;
mod compile;

pub use cache::PlanCache;
pub use compile::compile;

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One instruction of a plan's step sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Run the named operation.
    Compute(String),
    /// Free the named intermediate value from the solution.
    Evict(String),
}

/// An operation filter with a caller-stable identity.
///
/// Two predicates compare equal for caching purposes only when they share
/// an id; equivalent but distinct closures defeat the cache.
#[derive(Clone)]
pub struct OpPredicate {
    id: Uuid,
    test: Arc<dyn Fn(&Operation) -> bool + Send + Sync>,
}

impl OpPredicate {
    /// Wraps a filter closure under a fresh identity.
    pub fn new(test: impl Fn(&Operation) -> bool + Send + Sync + 'static) -> Self {
        Self::with_id(Uuid::new_v4(), test)
    }

    /// Wraps a filter closure under a caller-chosen identity, letting
    /// equivalent predicates share cached plans.
    pub fn with_id(id: Uuid, test: impl Fn(&Operation) -> bool + Send + Sync + 'static) -> Self {
        Self {
            id,
            test: Arc::new(test),
        }
    }

    /// The caching identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Applies the filter.
    #[must_use]
    pub fn test(&self, op: &Operation) -> bool {
        (self.test)(op)
    }
}

impl fmt::Debug for OpPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpPredicate").field("id", &self.id).finish()
    }
}

/// A compilation request: what the caller will supply, what it wants back,
/// and which operations are admissible.
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Names the caller will supply values for.
    pub inputs: BTreeSet<String>,
    /// Names the caller wants; empty means "everything reachable".
    pub outputs: BTreeSet<String>,
    /// Optional node filter.
    pub predicate: Option<OpPredicate>,
}

impl CompileRequest {
    /// Builds a request from iterables of input and output names.
    pub fn new(
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            predicate: None,
        }
    }

    /// Attaches an operation filter.
    #[must_use]
    pub fn with_predicate(mut self, predicate: OpPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// The cache key of a compiled plan.
///
/// A SHA-256 digest over a bytes-stable canonical rendering of the network
/// identity, the sorted input names, the sorted output names and the
/// predicate identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    digest: [u8; 32],
}

impl PlanKey {
    pub(crate) fn derive(network_uid: Uuid, request: &CompileRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"net:");
        hasher.update(network_uid.as_bytes());
        hasher.update(b"\nin:");
        for name in &request.inputs {
            hasher.update(name.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\nout:");
        for name in &request.outputs {
            hasher.update(name.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\npred:");
        match &request.predicate {
            Some(p) => hasher.update(p.id().as_bytes()),
            None => hasher.update(b"-"),
        }
        Self {
            digest: hasher.finalize().into(),
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.digest {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The pruned DAG and schedule produced for one compilation request.
///
/// Immutable after compilation; executors never mutate a plan, they replace
/// it wholesale during a reschedule.
#[derive(Debug)]
pub struct Plan {
    pub(crate) key: PlanKey,
    pub(crate) network_uid: Uuid,
    /// Surviving operations, in composition order.
    pub(crate) ops: Vec<Arc<Operation>>,
    /// Flat step sequence (topological, evictions interleaved).
    pub(crate) steps: Vec<Step>,
    /// Dependency layers of operation names, for parallel dispatch.
    pub(crate) layers: Vec<Vec<String>>,
    /// Evictions to apply once the same-indexed layer completes.
    pub(crate) layer_evictions: Vec<Vec<String>>,
    /// The requested outputs.
    pub(crate) asked_outs: BTreeSet<String>,
    /// The declared inputs the plan was compiled for.
    pub(crate) known_inputs: BTreeSet<String>,
    /// The predicate the plan was compiled with.
    pub(crate) predicate: Option<OpPredicate>,
    /// Why each excluded operation was pruned.
    pub(crate) comments: HashMap<String, String>,
    /// Direct downstream operations, for failure cancellation.
    pub(crate) successors: HashMap<String, Vec<String>>,
    /// In-plan producers of each sideffect token.
    pub(crate) sfx_producers: HashMap<String, Vec<String>>,
}

impl Plan {
    /// The plan's cache key.
    #[must_use]
    pub fn key(&self) -> PlanKey {
        self.key
    }

    /// Identity of the network this plan was compiled from.
    #[must_use]
    pub fn network_uid(&self) -> Uuid {
        self.network_uid
    }

    /// The surviving operations, in composition order.
    #[must_use]
    pub fn ops(&self) -> &[Arc<Operation>] {
        &self.ops
    }

    /// Looks up a surviving operation by name.
    #[must_use]
    pub fn op(&self, name: &str) -> Option<&Arc<Operation>> {
        self.ops.iter().find(|op| op.name() == name)
    }

    /// The ordered step sequence.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The dependency layers, for parallel dispatch.
    #[must_use]
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// The asked outputs the plan was compiled for.
    #[must_use]
    pub fn asked_outs(&self) -> &BTreeSet<String> {
        &self.asked_outs
    }

    /// The inputs the plan was compiled for.
    #[must_use]
    pub fn known_inputs(&self) -> &BTreeSet<String> {
        &self.known_inputs
    }

    /// Why each excluded operation was pruned.
    #[must_use]
    pub fn comments(&self) -> &HashMap<String, String> {
        &self.comments
    }

    /// Operation names that directly consume the given operation's
    /// provides.
    #[must_use]
    pub fn successors_of(&self, op: &str) -> &[String] {
        self.successors.get(op).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_key_is_stable() {
        let uid = Uuid::new_v4();
        let req = CompileRequest::new(["b", "a"], ["z"]);
        let key1 = PlanKey::derive(uid, &req);
        // BTreeSet sorts, so declaration order does not matter.
        let req2 = CompileRequest::new(["a", "b"], ["z"]);
        let key2 = PlanKey::derive(uid, &req2);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_plan_key_varies_with_request() {
        let uid = Uuid::new_v4();
        let base = PlanKey::derive(uid, &CompileRequest::new(["a"], ["z"]));
        assert_ne!(base, PlanKey::derive(uid, &CompileRequest::new(["b"], ["z"])));
        assert_ne!(base, PlanKey::derive(uid, &CompileRequest::new(["a"], ["w"])));
        assert_ne!(base, PlanKey::derive(Uuid::new_v4(), &CompileRequest::new(["a"], ["z"])));
    }

    #[test]
    fn test_plan_key_predicate_identity() {
        let uid = Uuid::new_v4();
        let pred_id = Uuid::new_v4();
        let req1 = CompileRequest::new(["a"], ["z"])
            .with_predicate(OpPredicate::with_id(pred_id, |_| true));
        let req2 = CompileRequest::new(["a"], ["z"])
            .with_predicate(OpPredicate::with_id(pred_id, |_| true));
        assert_eq!(PlanKey::derive(uid, &req1), PlanKey::derive(uid, &req2));

        // Fresh identities defeat caching even for equivalent closures.
        let req3 =
            CompileRequest::new(["a"], ["z"]).with_predicate(OpPredicate::new(|_| true));
        assert_ne!(PlanKey::derive(uid, &req1), PlanKey::derive(uid, &req3));
    }

    #[test]
    fn test_plan_key_renders_as_hex() {
        let key = PlanKey::derive(Uuid::new_v4(), &CompileRequest::default());
        let rendered = key.to_string();
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
