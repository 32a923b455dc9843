//! Troika engines: three request-processing architectures behind one
//! router and handler surface.
//!
//! The crate provides:
//!
//! - [`TpcEngine`]: thread-per-connection with a blocking request loop per
//!   accepted socket, run on the adaptive worker pool
//! - [`HrpEngine`]: a mio reactor owning all socket I/O, offloading parsed
//!   requests to the adaptive worker pool
//! - [`StelEngine`]: a single-threaded event loop running handlers inline,
//!   with a small auxiliary pool for CPU-bound work
//!
//! plus the collaborators the engines share: the [`router`], the adaptive
//! [`pool`], the async [`context`] manager and the [`DeferredResponse`]
//! primitive handlers use to answer asynchronously.

pub mod config;
pub mod context;
pub mod deferred;
pub mod engine;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod router;

mod date;

pub use config::EngineConfig;
pub use context::{AsyncContextManager, ContextId, ContextResult, ContextState};
pub use deferred::{Completer, Deferred};
pub use engine::{Engine, EngineError, HrpEngine, StelEngine, TpcEngine};
pub use engine::stel::run_on_worker;
pub use handler::{
    handler_fn, middleware_fn, DeferredResponse, Handler, HandlerError, IntoDeferredResponse, Middleware,
    ResponseCompleter,
};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use router::{Endpoint, ResourceHandlers, RouteOutcome, Router, RouterBuilder, RouterError};

pub use troika_http::protocol::{Request, Response};
