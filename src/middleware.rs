//! Middleware harness: wrapping step callables at registration time.
//!
//! A middleware receives the step callable and a `StepContext` and returns a
//! wrapped callable. Middlewares are applied in registration order,
//! inner-first, so the first registered middleware sits closest to the user
//! function. STEP_START/STEP_END bookkeeping happens outside the middleware
//! boundary, in the invoker; middleware may observe and re-throw errors but
//! must not swallow lifecycle events.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;

use crate::runtime::meta;
use crate::types::{StepArgs, StepContext, StepOutcome, StreamYield};

/// A boxed single-result step callable.
pub type UnaryFn<S, C> = Arc<
    dyn Fn(StepArgs<S, C>) -> BoxFuture<'static, anyhow::Result<StepOutcome<S, C>>> + Send + Sync,
>;

/// A boxed streaming step callable.
pub type StreamFn<S, C> = Arc<
    dyn Fn(StepArgs<S, C>) -> BoxStream<'static, anyhow::Result<StreamYield<S, C>>> + Send + Sync,
>;

/// A registered step callable, single-result or streaming.
pub enum StepCallable<S, C> {
    Unary(UnaryFn<S, C>),
    Streaming(StreamFn<S, C>),
}

impl<S, C> Clone for StepCallable<S, C> {
    fn clone(&self) -> Self {
        match self {
            StepCallable::Unary(f) => StepCallable::Unary(f.clone()),
            StepCallable::Streaming(f) => StepCallable::Streaming(f.clone()),
        }
    }
}

/// Wraps step callables at registration time.
pub trait Middleware<S, C>: Send + Sync {
    fn wrap(&self, func: StepCallable<S, C>, ctx: &StepContext) -> StepCallable<S, C>;
}

/// The stock retry middleware.
///
/// Retries a failing step according to its configured `RetryPolicy`, with
/// exponential backoff between attempts. Streaming steps are never retried:
/// tokens already emitted cannot be un-emitted, so a retry request on a
/// streaming step logs a warning and falls through unwrapped.
#[derive(Debug, Default)]
pub struct RetryMiddleware;

impl<S, C> Middleware<S, C> for RetryMiddleware
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    fn wrap(&self, func: StepCallable<S, C>, ctx: &StepContext) -> StepCallable<S, C> {
        let Some(policy) = ctx.retries else {
            return func;
        };
        let cfg = policy.config();
        if cfg.stop <= 1 {
            return func;
        }

        match func {
            StepCallable::Streaming(f) => {
                log::warn!(
                    "Step '{}' is a streaming step and cannot retry automatically; \
                     retries are disabled for it",
                    ctx.name
                );
                StepCallable::Streaming(f)
            }
            StepCallable::Unary(f) => {
                let step_name = ctx.name.clone();
                StepCallable::Unary(Arc::new(move |args| {
                    let f = f.clone();
                    let step_name = step_name.clone();
                    async move {
                        let mut wait = cfg.wait_secs;
                        let mut attempt = 1u32;
                        loop {
                            match f(args.clone()).await {
                                Ok(outcome) => return Ok(outcome),
                                Err(err) => {
                                    if attempt >= cfg.stop {
                                        return Err(err);
                                    }
                                    attempt += 1;
                                    meta::bump_attempt();
                                    log::debug!(
                                        "Step '{step_name}' failed ({err:#}); retrying, attempt {attempt}/{}",
                                        cfg.stop
                                    );
                                    tokio::time::sleep(std::time::Duration::from_secs_f64(wait))
                                        .await;
                                    wait *= cfg.multiplier;
                                    if let Some(max) = cfg.max_wait_secs {
                                        wait = wait.min(max);
                                    }
                                }
                            }
                        }
                    }
                    .boxed()
                }))
            }
        }
    }
}
