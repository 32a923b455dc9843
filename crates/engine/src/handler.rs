//! The handler and middleware surface shared by the three engines.
//!
//! A [`Handler`] turns a request into a [`DeferredResponse`]; a
//! [`Middleware`] wraps a handler, running before it and optionally
//! transforming or short-circuiting the outcome. Chains are folded once at
//! router build time into a single composed handler, so no per-request
//! allocation of the chain happens.

use std::sync::Arc;

use thiserror::Error;

use crate::deferred::{Completer, Deferred};
use troika_http::protocol::{Request, Response};

/// The outcome type every handler produces.
pub type DeferredResponse = Deferred<Result<Response, HandlerError>>;

/// Producer half for handlers answering asynchronously.
pub type ResponseCompleter = Completer<Result<Response, HandlerError>>;

/// Failure of a handler or middleware.
///
/// Engines map `Overloaded` to 503 and everything else to 500.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A required pool rejected the work.
    #[error("service overloaded")]
    Overloaded,

    /// The handler panicked; the payload's message if it had one.
    #[error("handler panicked: {reason}")]
    Panicked { reason: String },

    /// Any other handler-reported failure.
    #[error("{source}")]
    Other {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl HandlerError {
    /// Wraps an arbitrary error value.
    pub fn other<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::Other { source: e.into() }
    }

    /// Builds the error for a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let reason = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::Panicked { reason }
    }
}

/// A request handler.
///
/// Handlers receive the request by value (attributes and path parameters
/// included) and produce a deferred response. Synchronous handlers resolve
/// it immediately; asynchronous ones keep the [`ResponseCompleter`] and
/// resolve it from another thread.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> DeferredResponse;
}

/// A middleware wrapping the rest of the chain.
///
/// `next` is the composed remainder: later middlewares and finally the
/// route handler. A middleware may short-circuit by not calling `next`,
/// pass through, or transform the response via [`Deferred::on_ready`] and
/// its own completer.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, request: Request, next: &dyn Handler) -> DeferredResponse;
}

/// Values a plain function handler may return.
///
/// Implemented for `Response`, `Result<Response, HandlerError>` and
/// `DeferredResponse`, so the common synchronous case needs no ceremony.
pub trait IntoDeferredResponse {
    fn into_deferred(self) -> DeferredResponse;
}

impl IntoDeferredResponse for Response {
    fn into_deferred(self) -> DeferredResponse {
        Deferred::ready(Ok(self))
    }
}

impl IntoDeferredResponse for Result<Response, HandlerError> {
    fn into_deferred(self) -> DeferredResponse {
        Deferred::ready(self)
    }
}

impl IntoDeferredResponse for DeferredResponse {
    fn into_deferred(self) -> DeferredResponse {
        self
    }
}

/// Wraps a plain function or closure as a [`Handler`].
///
/// ```
/// use troika_engine::{handler_fn, Response};
///
/// let handler = handler_fn(|_req| Response::ok().with_body("hello"));
/// ```
pub fn handler_fn<F, R>(f: F) -> impl Handler
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoDeferredResponse,
{
    FnHandler { f }
}

struct FnHandler<F> {
    f: F,
}

impl<F, R> Handler for FnHandler<F>
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoDeferredResponse,
{
    fn handle(&self, request: Request) -> DeferredResponse {
        (self.f)(request).into_deferred()
    }
}

/// Wraps a plain function or closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> impl Middleware
where
    F: Fn(Request, &dyn Handler) -> DeferredResponse + Send + Sync + 'static,
{
    FnMiddleware { f }
}

struct FnMiddleware<F> {
    f: F,
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(Request, &dyn Handler) -> DeferredResponse + Send + Sync + 'static,
{
    fn handle(&self, request: Request, next: &dyn Handler) -> DeferredResponse {
        (self.f)(request, next)
    }
}

/// One folded link of a middleware chain.
struct ChainLink {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn Handler>,
}

impl Handler for ChainLink {
    fn handle(&self, request: Request) -> DeferredResponse {
        self.middleware.handle(request, self.next.as_ref())
    }
}

/// Folds middlewares around a handler at registration time.
///
/// `middlewares` are given outermost first; the first entry sees the
/// request first and the response last.
pub(crate) fn compose(middlewares: &[Arc<dyn Middleware>], handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
    let mut composed = handler;
    for middleware in middlewares.iter().rev() {
        composed = Arc::new(ChainLink { middleware: Arc::clone(middleware), next: composed });
    }
    composed
}

/// Invokes a handler, converting panics into `HandlerError::Panicked`.
pub(crate) fn invoke_caught(handler: &dyn Handler, request: Request) -> DeferredResponse {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(request))) {
        Ok(deferred) => deferred,
        Err(payload) => Deferred::ready(Err(HandlerError::from_panic(payload))),
    }
}
