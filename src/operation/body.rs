//! Operation bodies: the user-supplied callables behind each node.
//!
//! A body takes one named mapping and returns one named mapping. Everything
//! else (keyword renames, sideffect stripping, output validation) is the
//! engine's job.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;

/// A mapping of data names to values.
pub type ValueMap = HashMap<String, Value>;

/// The error type bodies may raise; the executor wraps it with operation
/// context.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The contract for a user-supplied operation body.
#[async_trait]
pub trait OpBody: Send + Sync + Debug {
    /// Invokes the body with its named inputs, returning named outputs.
    async fn invoke(&self, inputs: ValueMap) -> Result<ValueMap, BoxError>;
}

/// A synchronous closure body.
pub struct FnBody<F>
where
    F: Fn(ValueMap) -> Result<ValueMap, BoxError> + Send + Sync,
{
    func: F,
}

impl<F> FnBody<F>
where
    F: Fn(ValueMap) -> Result<ValueMap, BoxError> + Send + Sync,
{
    /// Wraps a synchronous closure as an operation body.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnBody<F>
where
    F: Fn(ValueMap) -> Result<ValueMap, BoxError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBody").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> OpBody for FnBody<F>
where
    F: Fn(ValueMap) -> Result<ValueMap, BoxError> + Send + Sync,
{
    async fn invoke(&self, inputs: ValueMap) -> Result<ValueMap, BoxError> {
        (self.func)(inputs)
    }
}

/// An asynchronous closure body.
pub struct AsyncFnBody<F, Fut>
where
    F: Fn(ValueMap) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueMap, BoxError>> + Send,
{
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnBody<F, Fut>
where
    F: Fn(ValueMap) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueMap, BoxError>> + Send,
{
    /// Wraps an async closure as an operation body.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnBody<F, Fut>
where
    F: Fn(ValueMap) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueMap, BoxError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnBody").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> OpBody for AsyncFnBody<F, Fut>
where
    F: Fn(ValueMap) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueMap, BoxError>> + Send,
{
    async fn invoke(&self, inputs: ValueMap) -> Result<ValueMap, BoxError> {
        (self.func)(inputs).await
    }
}
