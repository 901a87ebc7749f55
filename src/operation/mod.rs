//! Operations: immutable, named graph nodes wrapping a user body.

mod body;

pub use body::{AsyncFnBody, BoxError, FnBody, OpBody, ValueMap};

use crate::errors::{ExecuteError, MissingOutputsError, OpBuildError, UserFnError};
use crate::modifier::Dep;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Behavior flags of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpFlags {
    /// Exceptions from the body do not abort the plan.
    pub endured: bool,
    /// The body may return a subset of its provides; missing ones trigger
    /// replanning.
    pub rescheduled: bool,
    /// Eligible to run on a worker pool.
    pub parallel: bool,
    /// Arguments and results are serialized across the pool boundary.
    pub marshalled: bool,
}

/// An immutable operation node: a name, declared needs and provides, a body
/// and behavior flags.
///
/// Operations are frozen once built; networks share them via `Arc`.
#[derive(Debug)]
pub struct Operation {
    name: String,
    needs: Vec<Dep>,
    provides: Vec<Dep>,
    body: Arc<dyn OpBody>,
    flags: OpFlags,
}

impl Operation {
    /// Starts building an operation with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            needs: Vec::new(),
            provides: Vec::new(),
            flags: OpFlags::default(),
        }
    }

    /// The operation name, unique within a network.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared input dependencies, in declaration order.
    #[must_use]
    pub fn needs(&self) -> &[Dep] {
        &self.needs
    }

    /// The declared output dependencies, in declaration order.
    #[must_use]
    pub fn provides(&self) -> &[Dep] {
        &self.provides
    }

    /// The behavior flags.
    #[must_use]
    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    /// Base names of needs that must be present for the body to run.
    pub(crate) fn required_need_bases(&self) -> impl Iterator<Item = &str> {
        self.needs
            .iter()
            .filter(|d| !d.is_optional() && !d.is_sideffect())
            .map(Dep::base)
    }

    /// Base names of provides the body itself must deliver.
    ///
    /// Aliases and sideffects are derived by the engine, not returned by
    /// bodies; optional provides may be absent.
    pub(crate) fn required_provide_bases(&self) -> impl Iterator<Item = &str> {
        self.provides
            .iter()
            .filter(|d| !d.is_optional() && !d.is_sideffect() && !d.is_alias())
            .map(Dep::base)
    }

    /// Invokes the body with the given named inputs.
    ///
    /// Applies keyword renames, omits sideffect and implicit entries from
    /// the body-visible mapping, validates the returned provides (missing
    /// required ones are an error unless the operation is `rescheduled`),
    /// drops undeclared keys and expands aliases.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::UserFn`] when the body raises,
    /// [`ExecuteError::MissingOutputs`] when a non-rescheduled body
    /// under-delivers.
    pub async fn compute(
        &self,
        named_inputs: &ValueMap,
        debug: bool,
    ) -> Result<ValueMap, ExecuteError> {
        let mut body_inputs = ValueMap::with_capacity(self.needs.len());
        for dep in &self.needs {
            if !dep.is_body_visible() {
                continue;
            }
            if let Some(value) = named_inputs.get(dep.base()) {
                body_inputs.insert(dep.keyword().to_string(), value.clone());
            }
            // Absent optionals are omitted, not passed as a sentinel.
        }

        let input_names: Vec<String> = body_inputs.keys().cloned().collect();
        let rendered_inputs =
            debug.then(|| serde_json::to_string(&body_inputs).unwrap_or_default());
        let mut result = self.body.invoke(body_inputs).await.map_err(|err| {
            ExecuteError::UserFn(UserFnError {
                op: self.name.clone(),
                message: err.to_string(),
                inputs: input_names,
                input_values: rendered_inputs,
            })
        })?;

        let declared: HashSet<&str> = self
            .provides
            .iter()
            .filter(|d| !d.is_sideffect() && !d.is_alias())
            .map(Dep::base)
            .collect();
        let undeclared: Vec<String> = result
            .keys()
            .filter(|k| !declared.contains(k.as_str()))
            .cloned()
            .collect();
        for key in undeclared {
            warn!(op = %self.name, data = %key, "dropping undeclared output");
            result.remove(&key);
        }

        let missing: Vec<String> = self
            .required_provide_bases()
            .filter(|name| !result.contains_key(*name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() && !self.flags.rescheduled {
            return Err(ExecuteError::MissingOutputs(MissingOutputsError {
                op: self.name.clone(),
                missing,
            }));
        }

        for dep in &self.provides {
            if let Dep::Alias { src, dst } = dep {
                if let Some(value) = result.get(src).cloned() {
                    result.insert(dst.clone(), value);
                }
            }
        }

        Ok(result)
    }
}

/// Builder for [`Operation`].
#[derive(Debug)]
pub struct OperationBuilder {
    name: String,
    needs: Vec<Dep>,
    provides: Vec<Dep>,
    flags: OpFlags,
}

impl OperationBuilder {
    /// Sets the input dependencies.
    #[must_use]
    pub fn needs(mut self, deps: impl IntoIterator<Item = impl Into<Dep>>) -> Self {
        self.needs = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output dependencies.
    #[must_use]
    pub fn provides(mut self, deps: impl IntoIterator<Item = impl Into<Dep>>) -> Self {
        self.provides = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Body failures no longer abort the plan.
    #[must_use]
    pub fn endured(mut self) -> Self {
        self.flags.endured = true;
        self
    }

    /// The body may deliver a subset of its provides.
    #[must_use]
    pub fn rescheduled(mut self) -> Self {
        self.flags.rescheduled = true;
        self
    }

    /// Eligible for concurrent execution within a layer.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.flags.parallel = true;
        self
    }

    /// Arguments and results cross the pool boundary serialized.
    #[must_use]
    pub fn marshalled(mut self) -> Self {
        self.flags.marshalled = true;
        self
    }

    /// Freezes the operation around the given body.
    ///
    /// # Errors
    ///
    /// Returns [`OpBuildError`] for an empty name, duplicate base names
    /// within needs or provides, or an alias whose source is not provided.
    pub fn build(self, body: impl OpBody + 'static) -> Result<Operation, OpBuildError> {
        self.build_arc(Arc::new(body))
    }

    /// Freezes the operation around an already-shared body.
    ///
    /// # Errors
    ///
    /// Same as [`OperationBuilder::build`].
    pub fn build_arc(self, body: Arc<dyn OpBody>) -> Result<Operation, OpBuildError> {
        if self.name.trim().is_empty() {
            return Err(OpBuildError::EmptyName);
        }

        let mut seen = HashSet::new();
        for dep in &self.needs {
            if !seen.insert(dep.base().to_string()) {
                return Err(OpBuildError::DuplicateNeed {
                    op: self.name,
                    name: dep.base().to_string(),
                });
            }
        }

        seen.clear();
        for dep in &self.provides {
            if !seen.insert(dep.base().to_string()) {
                return Err(OpBuildError::DuplicateProvide {
                    op: self.name,
                    name: dep.base().to_string(),
                });
            }
        }

        let sources: HashSet<&str> = self
            .provides
            .iter()
            .filter(|d| !d.is_alias())
            .map(Dep::base)
            .collect();
        for dep in &self.provides {
            if let Dep::Alias { src, .. } = dep {
                if !sources.contains(src.as_str()) {
                    return Err(OpBuildError::AliasSource {
                        op: self.name,
                        src: src.clone(),
                    });
                }
            }
        }

        Ok(Operation {
            name: self.name,
            needs: self.needs,
            provides: self.provides,
            body,
            flags: self.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::{alias, keyword, optional, sideffect};
    use serde_json::json;
    use std::collections::HashMap;

    fn add_body() -> FnBody<impl Fn(ValueMap) -> Result<ValueMap, BoxError> + Send + Sync> {
        FnBody::new(|inputs: ValueMap| {
            let a = inputs["a"].as_i64().unwrap();
            let b = inputs["b"].as_i64().unwrap();
            Ok(HashMap::from([("sum".to_string(), json!(a + b))]))
        })
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            Operation::builder("").build(add_body()),
            Err(OpBuildError::EmptyName)
        ));
        assert!(matches!(
            Operation::builder("op")
                .needs(["a", "a"])
                .build(add_body()),
            Err(OpBuildError::DuplicateNeed { .. })
        ));
        assert!(matches!(
            Operation::builder("op")
                .provides([alias("x", "y")])
                .build(add_body()),
            Err(OpBuildError::AliasSource { .. })
        ));
    }

    #[tokio::test]
    async fn test_compute_basic() {
        let op = Operation::builder("add")
            .needs(["a", "b"])
            .provides(["sum"])
            .build(add_body())
            .unwrap();

        let inputs = HashMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert_eq!(out["sum"], json!(3));
    }

    #[tokio::test]
    async fn test_compute_keyword_rename() {
        let op = Operation::builder("pow")
            .needs([Dep::from("base"), keyword("exponent", "exp")])
            .provides(["result"])
            .build(FnBody::new(|inputs: ValueMap| {
                let base = inputs["base"].as_i64().unwrap();
                let exp = inputs["exp"].as_u64().unwrap();
                Ok(HashMap::from([(
                    "result".to_string(),
                    json!(base.pow(exp as u32)),
                )]))
            }))
            .unwrap();

        let inputs = HashMap::from([
            ("base".to_string(), json!(2)),
            ("exponent".to_string(), json!(3)),
        ]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert_eq!(out["result"], json!(8));
    }

    #[tokio::test]
    async fn test_compute_optional_absent() {
        let op = Operation::builder("addplus")
            .needs([Dep::from("a"), optional("c")])
            .provides(["out"])
            .build(FnBody::new(|inputs: ValueMap| {
                assert!(!inputs.contains_key("c"));
                Ok(HashMap::from([(
                    "out".to_string(),
                    inputs["a"].clone(),
                )]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(5))]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert_eq!(out["out"], json!(5));
    }

    #[tokio::test]
    async fn test_compute_sideffect_not_passed() {
        let op = Operation::builder("bump")
            .needs([sideffect("counter"), Dep::from("a")])
            .provides(["b"])
            .build(FnBody::new(|inputs: ValueMap| {
                assert_eq!(inputs.len(), 1);
                Ok(HashMap::from([("b".to_string(), inputs["a"].clone())]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        op.compute(&inputs, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_compute_missing_outputs() {
        let op = Operation::builder("incomplete")
            .needs(["a"])
            .provides(["x", "y"])
            .build(FnBody::new(|_| {
                Ok(HashMap::from([("x".to_string(), json!(1))]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        let err = op.compute(&inputs, false).await.unwrap_err();
        match err {
            ExecuteError::MissingOutputs(e) => assert_eq!(e.missing, vec!["y".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compute_rescheduled_tolerates_subset() {
        let op = Operation::builder("partial")
            .needs(["a"])
            .provides(["x", "y"])
            .rescheduled()
            .build(FnBody::new(|_| {
                Ok(HashMap::from([("x".to_string(), json!(1))]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["x"], json!(1));
    }

    #[tokio::test]
    async fn test_compute_alias_expansion() {
        let op = Operation::builder("aliased")
            .needs(["a"])
            .provides([Dep::from("x"), alias("x", "x_too")])
            .build(FnBody::new(|_| {
                Ok(HashMap::from([("x".to_string(), json!(7))]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert_eq!(out["x_too"], json!(7));
    }

    #[tokio::test]
    async fn test_compute_drops_undeclared() {
        let op = Operation::builder("chatty")
            .needs(["a"])
            .provides(["x"])
            .build(FnBody::new(|_| {
                Ok(HashMap::from([
                    ("x".to_string(), json!(1)),
                    ("stray".to_string(), json!(2)),
                ]))
            }))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        let out = op.compute(&inputs, false).await.unwrap();
        assert!(!out.contains_key("stray"));
    }

    #[tokio::test]
    async fn test_compute_wraps_body_error() {
        let op = Operation::builder("bad")
            .needs(["a"])
            .provides(["x"])
            .build(FnBody::new(|_| Err("kaboom".into())))
            .unwrap();

        let inputs = HashMap::from([("a".to_string(), json!(1))]);
        let err = op.compute(&inputs, false).await.unwrap_err();
        match err {
            ExecuteError::UserFn(e) => {
                assert_eq!(e.op, "bad");
                assert!(e.message.contains("kaboom"));
                assert_eq!(e.inputs, vec!["a".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
