//! Middleware chain wrapped around every handler invocation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::registration::Stage;
use crate::saga::{HandlerResult, MessageType};

/// Describes the step a middleware is wrapping.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub saga_type: &'static str,
    pub saga_id: String,
    pub message_type: MessageType,
    pub stage: Stage,
    pub correlation_id: Option<String>,
}

/// A cross-cutting wrapper around a single handler invocation.
///
/// Call [`Next::run`] to continue down the chain. Not calling it skips the
/// handler; whatever the middleware returns becomes the step result.
#[async_trait]
pub trait StepMiddleware: Send + Sync {
    async fn handle(&self, step: &StepInfo, next: Next<'_>) -> HandlerResult;
}

/// The rest of the chain, ending in the handler itself.
pub struct Next<'a> {
    step: &'a StepInfo,
    remaining: &'a [Arc<dyn StepMiddleware>],
    handler: BoxFuture<'a, HandlerResult>,
}

impl<'a> Next<'a> {
    /// Runs the remaining middlewares and the handler.
    pub fn run(self) -> BoxFuture<'a, HandlerResult> {
        let remaining = self.remaining;
        match remaining.split_first() {
            Some((middleware, rest)) => middleware.handle(
                self.step,
                Next {
                    step: self.step,
                    remaining: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler,
        }
    }
}

/// Ordered middleware chain. The first middleware added is the outermost.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn StepMiddleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware inside the ones already registered.
    pub fn push(&mut self, middleware: Arc<dyn StepMiddleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `handler` through the chain. Errors are returned untouched.
    pub fn run<'a>(
        &'a self,
        step: &'a StepInfo,
        handler: BoxFuture<'a, HandlerResult>,
    ) -> BoxFuture<'a, HandlerResult> {
        Next {
            step,
            remaining: &self.middlewares,
            handler,
        }
        .run()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// Logs every step with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl StepMiddleware for TracingMiddleware {
    async fn handle(&self, step: &StepInfo, next: Next<'_>) -> HandlerResult {
        tracing::debug!(
            saga_type = step.saga_type,
            saga_id = %step.saga_id,
            message_type = %step.message_type,
            stage = %step.stage,
            "saga step started"
        );
        let started = Instant::now();
        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(transition) => tracing::info!(
                saga_type = step.saga_type,
                saga_id = %step.saga_id,
                stage = %step.stage,
                transition = transition.as_ref().map(|t| t.kind().as_str()).unwrap_or("continue"),
                elapsed_ms,
                "saga step finished"
            ),
            Err(err) => tracing::warn!(
                saga_type = step.saga_type,
                saga_id = %step.saga_id,
                stage = %step.stage,
                error = %err,
                elapsed_ms,
                "saga step failed"
            ),
        }
        result
    }
}

/// Records step counts, errors and durations with `metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsMiddleware;

#[async_trait]
impl StepMiddleware for MetricsMiddleware {
    async fn handle(&self, step: &StepInfo, next: Next<'_>) -> HandlerResult {
        let labels = [
            ("saga_type", step.saga_type),
            ("stage", step.stage.as_str()),
        ];
        metrics::counter!("saga_steps_total", &labels).increment(1);
        let started = Instant::now();
        let result = next.run().await;
        metrics::histogram!("saga_step_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!("saga_step_errors_total", &labels).increment(1);
        }
        result
    }
}
