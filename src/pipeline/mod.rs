//! The user-facing pipeline: a network plus a plan cache and an executor.


use crate::config::ExecutionConfig;
use crate::errors::{CompileError, FlowgraphError};
use crate::execute::{AbortToken, Executor, TokioPool, WorkerPool};
use crate::network::Network;
use crate::operation::ValueMap;
use crate::plan::{CompileRequest, OpPredicate, Plan, PlanCache};
use crate::solution::Solution;
use std::sync::Arc;

/// Per-run options for [`Pipeline::run_with`].
#[derive(Debug, Default)]
pub struct RunOpts {
    /// Names the caller wants back; empty means everything reachable.
    pub outputs: Vec<String>,
    /// Optional operation filter.
    pub predicate: Option<OpPredicate>,
    /// Configuration for this run, overriding the pipeline's default.
    pub config: Option<ExecutionConfig>,
}

impl RunOpts {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the asked outputs.
    #[must_use]
    pub fn outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the operation filter.
    #[must_use]
    pub fn predicate(mut self, predicate: OpPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Sets the per-run configuration.
    #[must_use]
    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// A network bundled with a plan cache, a worker pool and a default
/// configuration, runnable against input values.
#[derive(Debug)]
pub struct Pipeline {
    network: Network,
    cache: PlanCache,
    pool: Arc<dyn WorkerPool>,
    config: Option<ExecutionConfig>,
    abort: AbortToken,
}

impl Pipeline {
    /// Wraps a network with default cache, pool and configuration.
    #[must_use]
    pub fn new(network: Network) -> Self {
        Self {
            network,
            cache: PlanCache::default(),
            pool: Arc::new(TokioPool::new()),
            config: None,
            abort: AbortToken::new(),
        }
    }

    /// Replaces the worker pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the default configuration for every run.
    ///
    /// Without one, each run consults [`ExecutionConfig::current`], i.e.
    /// the innermost scoped override or the defaults.
    #[must_use]
    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Bounds the plan cache.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = PlanCache::new(capacity);
        self
    }

    /// Attaches an externally-held abort token.
    #[must_use]
    pub fn with_abort(mut self, token: AbortToken) -> Self {
        self.abort = token;
        self
    }

    /// The underlying network.
    #[must_use]
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// The plan cache.
    #[must_use]
    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// A token that aborts in-flight runs between steps.
    #[must_use]
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    /// Compiles (or fetches from cache) the plan for a request.
    ///
    /// # Errors
    ///
    /// Propagates [`CompileError`] from the planner.
    pub fn compile(&self, request: &CompileRequest) -> Result<Arc<Plan>, CompileError> {
        self.cache
            .get_or_compile(&self.network, request, &self.effective_config(None))
    }

    /// Runs the pipeline open-ended: every reachable value is produced.
    ///
    /// # Errors
    ///
    /// Compile-time errors or a [`FlowgraphError::Execution`] carrying the
    /// partial solution.
    pub async fn run(&self, inputs: ValueMap) -> Result<Solution, FlowgraphError> {
        self.run_with(inputs, RunOpts::default()).await
    }

    /// Runs the pipeline with explicit outputs, predicate or configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::run`].
    pub async fn run_with(
        &self,
        inputs: ValueMap,
        opts: RunOpts,
    ) -> Result<Solution, FlowgraphError> {
        let config = self.effective_config(opts.config.as_ref());
        let mut request = CompileRequest::new(inputs.keys().cloned(), opts.outputs);
        if let Some(predicate) = opts.predicate {
            request = request.with_predicate(predicate);
        }

        let plan = self.cache.get_or_compile(&self.network, &request, &config)?;
        let executor =
            Executor::new(self.pool.clone(), config).with_abort(self.abort.clone());
        let solution = executor.execute(&plan, &self.network, inputs).await?;
        Ok(solution)
    }

    fn effective_config(&self, overridden: Option<&ExecutionConfig>) -> ExecutionConfig {
        overridden
            .cloned()
            .or_else(|| self.config.clone())
            .unwrap_or_else(ExecutionConfig::current)
    }
}
