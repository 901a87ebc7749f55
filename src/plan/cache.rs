//! Memoization of compiled plans.

use super::{compile, CompileRequest, Plan, PlanKey};
use crate::config::ExecutionConfig;
use crate::errors::CompileError;
use crate::network::Network;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// An LRU cache of compiled plans.
///
/// Compilation runs under the cache lock, so concurrent requests for the
/// same key never compile twice. Compile failures are not cached.
#[derive(Debug)]
pub struct PlanCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<PlanKey, Arc<Plan>>,
    // Front = least recently used.
    order: VecDeque<PlanKey>,
}

impl PlanCache {
    /// Creates a cache bounded to `capacity` plans.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the cached plan for the request, compiling it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates [`CompileError`] from compilation; nothing is cached on
    /// failure.
    pub fn get_or_compile(
        &self,
        network: &Network,
        request: &CompileRequest,
        config: &ExecutionConfig,
    ) -> Result<Arc<Plan>, CompileError> {
        let key = PlanKey::derive(network.uid(), request);
        let mut inner = self.inner.lock();

        if let Some(plan) = inner.map.get(&key).cloned() {
            inner.order.retain(|k| *k != key);
            inner.order.push_back(key);
            debug!(%key, "plan cache hit");
            return Ok(plan);
        }

        // Exclusive loader: the lock is held across compilation.
        let plan = Arc::new(compile(network, request, config)?);
        if inner.map.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
                debug!(key = %evicted, "plan cache eviction");
            }
        }
        inner.map.insert(key, plan.clone());
        inner.order.push_back(key);
        debug!(%key, "plan cache miss, compiled");
        Ok(plan)
    }

    /// The number of cached plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all cached plans.
    ///
    /// Required after flipping plan-affecting configuration such as
    /// `skip_evictions`, which does not participate in the key.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(128)
    }
}
