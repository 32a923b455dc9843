//! Hybrid reactor+pool engine.
//!
//! One reactor thread owns all socket I/O and parsing (see
//! [`reactor`](super::reactor)); complete requests are submitted to the
//! adaptive worker pool, which runs the middleware chain. A synchronous
//! handler outcome is posted straight back to the reactor; a pending
//! deferred detaches through the async context manager (context switch
//! out) and the completion callback posts the response later (context
//! switch in). Pool saturation answers 503 within the same reactor
//! iteration.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EngineConfig;
use crate::context::AsyncContextManager;
use crate::engine::reactor::{
    detach_context, spawn_reactor, ConnKey, DispatchOutcome, Dispatcher, ReactorHandle, ReactorRuntime, ReactorTask,
};
use crate::engine::{bind_listener, route_request, Engine, EngineError};
use crate::handler::HandlerError;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::pool::{PoolConfig, WorkerPool};
use crate::router::Router;
use troika_http::protocol::Request;

/// The hybrid reactor+pool engine.
pub struct HrpEngine {
    config: EngineConfig,
    router: Arc<Router>,
    metrics: Arc<ServerMetrics>,
    state: Option<Running>,
}

struct Running {
    runtime: ReactorRuntime,
    pool: Arc<WorkerPool>,
    // keeps the sweeper alive for the lifetime of the engine run
    _contexts: Arc<AsyncContextManager>,
}

impl std::fmt::Debug for HrpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HrpEngine").field("running", &self.state.is_some()).finish_non_exhaustive()
    }
}

impl HrpEngine {
    /// Creates the engine from a routing table and a configuration.
    pub fn new(router: Router, config: EngineConfig) -> Self {
        Self { config, router: Arc::new(router), metrics: Arc::new(ServerMetrics::default()), state: None }
    }
}

impl Engine for HrpEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.state.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let listener = bind_listener(&self.config)?;

        let pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "hrp-worker".to_string(),
            core: self.config.pool_core,
            max: self.config.pool_max,
            queue_capacity: self.config.pool_queue_capacity,
            keep_alive: self.config.pool_keep_alive,
            scale_step: self.config.pool_scale_step,
            adaptive: self.config.pool_adaptive,
            sample_interval: Duration::from_secs(5),
        }));

        let contexts = Arc::new(AsyncContextManager::new(
            self.config.async_context_timeout,
            self.config.context_sweep_interval,
            self.config.node_id.clone(),
            Arc::clone(&self.metrics),
        ));

        let dispatcher = HrpDispatcher {
            router: Arc::clone(&self.router),
            pool: Arc::clone(&pool),
            contexts: Arc::clone(&contexts),
            metrics: Arc::clone(&self.metrics),
        };

        let runtime = spawn_reactor(
            "hrp",
            listener,
            dispatcher,
            self.config.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&contexts),
        )?;

        info!(addr = %runtime.local_addr, "hrp engine started");
        self.state = Some(Running { runtime, pool, _contexts: contexts });
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<(), EngineError> {
        if let Some(mut running) = self.state.take() {
            running.runtime.stop(grace);
            running.pool.shutdown(grace);
            info!("hrp engine stopped");
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
        let utilization = self.state.as_ref().map(|running| running.pool.utilization()).unwrap_or(0.0);
        self.metrics.snapshot(utilization)
    }
}

/// Submits parsed requests to the worker pool.
struct HrpDispatcher {
    router: Arc<Router>,
    pool: Arc<WorkerPool>,
    contexts: Arc<AsyncContextManager>,
    metrics: Arc<ServerMetrics>,
}

impl Dispatcher for HrpDispatcher {
    fn dispatch(&mut self, key: ConnKey, request: Request, handle: &ReactorHandle) -> DispatchOutcome {
        let router = Arc::clone(&self.router);
        let contexts = Arc::clone(&self.contexts);
        let metrics = Arc::clone(&self.metrics);
        let handle = handle.clone();

        let submitted = self.pool.submit(0, move || {
            let deferred = route_request(router.as_ref(), request);
            match deferred.try_take() {
                Some(result) => handle.post(ReactorTask::Respond { key, result }),
                None => {
                    // context switch out: the worker returns to the pool
                    let context = detach_context(deferred, key, &handle, &contexts, &metrics);
                    handle.post(ReactorTask::AttachContext { key, context });
                }
            }
        });

        match submitted {
            Ok(_task_handle) => DispatchOutcome::Pending,
            Err(_) => DispatchOutcome::Immediate(Err(HandlerError::Overloaded)),
        }
    }
}
