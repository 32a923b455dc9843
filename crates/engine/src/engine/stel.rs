//! Single-threaded event loop engine.
//!
//! The reactor thread owns accept, read, parse, route and write; handlers
//! that resolve synchronously run entirely inline on the reactor. Nothing
//! that blocks may run there: CPU-bound or blocking work goes through
//! [`run_on_worker`], which ships the job to a small auxiliary pool (sized
//! to the hardware parallelism) and resumes on the reactor via its task
//! queue when the result is in.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EngineConfig;
use crate::context::AsyncContextManager;
use crate::deferred::Deferred;
use crate::engine::reactor::{
    detach_context, spawn_reactor, ConnKey, DispatchOutcome, Dispatcher, ReactorHandle, ReactorRuntime,
};
use crate::engine::{bind_listener, route_request, Engine, EngineError};
use crate::handler::{DeferredResponse, HandlerError};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::pool::{PoolConfig, WorkerPool};
use crate::router::Router;
use troika_http::protocol::{Request, Response};

/// Request attribute under which the engine exposes its auxiliary pool.
const WORKER_GATE_ATTR: &str = "troika.worker-gate";

/// Handle to the auxiliary pool, carried in the request attribute bag.
#[derive(Clone)]
pub struct AuxSpawner {
    pool: Arc<WorkerPool>,
}

impl std::fmt::Debug for AuxSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxSpawner").finish_non_exhaustive()
    }
}

/// Runs a blocking or CPU-bound job off the reactor thread.
///
/// Under STEL the job goes to the auxiliary pool and the returned deferred
/// resolves when it finishes; a saturated pool resolves immediately with
/// [`HandlerError::Overloaded`] (surfaced as 503). Under the other engines
/// the request carries no spawner and the job simply runs inline, since
/// their workers are allowed to block.
///
/// ```no_run
/// use troika_engine::{handler_fn, run_on_worker, Response};
///
/// let handler = handler_fn(|req| {
///     run_on_worker(&req, || {
///         // expensive work happens off the reactor
///         Ok(Response::ok().with_body("done"))
///     })
/// });
/// # let _ = handler;
/// ```
pub fn run_on_worker<F>(request: &Request, job: F) -> DeferredResponse
where
    F: FnOnce() -> Result<Response, HandlerError> + Send + 'static,
{
    match request.attribute::<AuxSpawner>(WORKER_GATE_ATTR) {
        Some(spawner) => {
            let (deferred, completer) = Deferred::channel();
            let submitted = spawner.pool.submit(0, move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                    .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));
                completer.complete(result);
            });
            match submitted {
                Ok(_task_handle) => deferred,
                Err(_) => Deferred::ready(Err(HandlerError::Overloaded)),
            }
        }
        None => Deferred::ready(job()),
    }
}

/// The single-threaded event loop engine.
pub struct StelEngine {
    config: EngineConfig,
    router: Arc<Router>,
    metrics: Arc<ServerMetrics>,
    state: Option<Running>,
}

struct Running {
    runtime: ReactorRuntime,
    aux_pool: Arc<WorkerPool>,
    _contexts: Arc<AsyncContextManager>,
}

impl std::fmt::Debug for StelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StelEngine").field("running", &self.state.is_some()).finish_non_exhaustive()
    }
}

impl StelEngine {
    /// Creates the engine from a routing table and a configuration.
    pub fn new(router: Router, config: EngineConfig) -> Self {
        Self { config, router: Arc::new(router), metrics: Arc::new(ServerMetrics::default()), state: None }
    }
}

impl Engine for StelEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.state.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let listener = bind_listener(&self.config)?;

        // fixed-size helper pool, used only through run_on_worker
        let parallelism = num_cpus::get().max(1);
        let aux_pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "stel-aux".to_string(),
            core: parallelism,
            max: parallelism,
            queue_capacity: self.config.pool_queue_capacity,
            keep_alive: self.config.pool_keep_alive,
            scale_step: 1,
            adaptive: false,
            sample_interval: Duration::from_secs(5),
        }));

        let contexts = Arc::new(AsyncContextManager::new(
            self.config.async_context_timeout,
            self.config.context_sweep_interval,
            self.config.node_id.clone(),
            Arc::clone(&self.metrics),
        ));

        let dispatcher = StelDispatcher {
            router: Arc::clone(&self.router),
            aux_pool: Arc::clone(&aux_pool),
            contexts: Arc::clone(&contexts),
            metrics: Arc::clone(&self.metrics),
        };

        let runtime = spawn_reactor(
            "stel",
            listener,
            dispatcher,
            self.config.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&contexts),
        )?;

        info!(addr = %runtime.local_addr, "stel engine started");
        self.state = Some(Running { runtime, aux_pool, _contexts: contexts });
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<(), EngineError> {
        if let Some(mut running) = self.state.take() {
            running.runtime.stop(grace);
            running.aux_pool.shutdown(grace);
            info!("stel engine stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.as_ref().map(|running| running.runtime.running.load(Ordering::Acquire)).unwrap_or(false)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|running| running.runtime.local_addr)
    }

    fn metrics(&self) -> MetricsSnapshot {
        let utilization = self.state.as_ref().map(|running| running.aux_pool.utilization()).unwrap_or(0.0);
        self.metrics.snapshot(utilization)
    }
}

/// Runs the chain inline on the reactor; pending results detach.
struct StelDispatcher {
    router: Arc<Router>,
    aux_pool: Arc<WorkerPool>,
    contexts: Arc<AsyncContextManager>,
    metrics: Arc<ServerMetrics>,
}

impl Dispatcher for StelDispatcher {
    fn dispatch(&mut self, key: ConnKey, mut request: Request, handle: &ReactorHandle) -> DispatchOutcome {
        request.set_attribute(WORKER_GATE_ATTR, AuxSpawner { pool: Arc::clone(&self.aux_pool) });

        // handler panics are caught inside; inline execution is safe for
        // the reactor thread itself
        let deferred = route_request(self.router.as_ref(), request);

        match deferred.try_take() {
            Some(result) => DispatchOutcome::Immediate(result),
            None => DispatchOutcome::Detached(detach_context(deferred, key, handle, &self.contexts, &self.metrics)),
        }
    }
}
