//! Callback traits.
//!
//! Any `Fn(Job) -> impl Future<Output = Result<(), HandlerError>>` closure
//! is a [`JobHandler`]; implement the trait directly when the handler carries
//! state.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::HandlerError;
use crate::types::Job;

/// Processes one job at a time.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<(), HandlerError>;
}

/// Processes all jobs of one read at once. `Ok` acknowledges the whole
/// batch, `Err` leaves it pending.
#[async_trait]
pub trait BatchJobHandler: Send + Sync + 'static {
    async fn handle_batch(&self, jobs: Vec<Job>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        (self)(job).await
    }
}

#[async_trait]
impl<F, Fut> BatchJobHandler for F
where
    F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_batch(&self, jobs: Vec<Job>) -> Result<(), HandlerError> {
        (self)(jobs).await
    }
}

/// How a callback invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failed(String),
    Panicked(String),
}

impl Outcome {
    pub(crate) fn as_metric_label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(_) => "failed",
            Outcome::Panicked(_) => "panicked",
        }
    }
}

/// Run a callback future, turning errors and panics into an [`Outcome`].
pub(crate) async fn run_guarded<Fut>(callback: Fut) -> Outcome
where
    Fut: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The callback a consumer dispatches to.
#[derive(Clone)]
pub(crate) enum Dispatch {
    PerJob(std::sync::Arc<dyn JobHandler>),
    Batch(std::sync::Arc<dyn BatchJobHandler>),
}
