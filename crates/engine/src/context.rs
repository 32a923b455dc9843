//! Async context manager: tracks requests detached from their workers.
//!
//! When a handler returns a pending [`DeferredResponse`](crate::DeferredResponse),
//! the owning engine registers an async context. The context records the
//! request's deadline and the completion callback that delivers the eventual
//! response back to the engine (a reactor task post, or a no-op once the
//! connection died). A sweeper thread reaps contexts whose deadline passed,
//! firing the callback with a timeout result exactly once.
//!
//! State transitions form the DAG
//! `CREATED → PROCESSING → (WAITING → PROCESSING)* → (COMPLETED | ERROR | TIMEOUT)`
//! and are applied with compare-and-swap on an atomic, so every operation is
//! safe from any thread; callbacks always fire outside the internal locks.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::handler::HandlerError;
use crate::metrics::ServerMetrics;
use troika_http::protocol::Response;

/// Identifier of an async context, monotonic per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an async context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Processing = 1,
    Waiting = 2,
    Completed = 3,
    Error = 4,
    Timeout = 5,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Processing,
            2 => Self::Waiting,
            3 => Self::Completed,
            4 => Self::Error,
            _ => Self::Timeout,
        }
    }

    /// Terminal states cannot be left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Timeout)
    }

    fn can_transition_to(&self, next: ContextState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ContextState::Created => false,
            ContextState::Processing => matches!(self, Self::Created | Self::Waiting),
            ContextState::Waiting => matches!(self, Self::Processing),
            // terminal states are reachable from any live state
            ContextState::Completed | ContextState::Error | ContextState::Timeout => true,
        }
    }
}

/// The value delivered to a context's completion callback.
#[derive(Debug)]
pub enum ContextResult {
    /// The handler produced a response.
    Response(Response),
    /// The handler failed.
    Failed(HandlerError),
    /// The deadline passed before completion; engines answer 504.
    TimedOut,
}

/// Errors from context operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Unknown (or already reaped) context id.
    #[error("context {0} not found")]
    NotFound(ContextId),

    /// The requested state transition violates the lifecycle DAG.
    #[error("invalid transition {from:?} -> {to:?} for context {id}")]
    InvalidTransition { id: ContextId, from: ContextState, to: ContextState },
}

type CompletionCallback = Box<dyn FnOnce(ContextResult) + Send>;

struct ContextEntry {
    id: ContextId,
    state: AtomicU8,
    created_at: Instant,
    deadline: Instant,
    callback: Mutex<Option<CompletionCallback>>,
    attributes: Mutex<std::collections::HashMap<String, String>>,
}

impl ContextEntry {
    fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// CAS loop moving to `next` if the lifecycle allows it.
    fn try_transition(&self, next: ContextState) -> Result<ContextState, ContextState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let current_state = ContextState::from_u8(current);
            if !current_state.can_transition_to(next) {
                return Err(current_state);
            }
            match self.state.compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current_state),
                Err(actual) => current = actual,
            }
        }
    }

    fn take_callback(&self) -> Option<CompletionCallback> {
        self.callback.lock().take()
    }
}

/// Tracks all in-flight detached requests of one engine.
pub struct AsyncContextManager {
    table: Arc<DashMap<u64, Arc<ContextEntry>>>,
    seq: AtomicU64,
    node_id: Option<String>,
    timeout: Duration,
    sweeper_stop: Option<Sender<()>>,
}

impl fmt::Debug for AsyncContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContextManager")
            .field("in_flight", &self.table.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AsyncContextManager {
    /// Creates a manager and starts its sweeper thread.
    pub fn new(
        timeout: Duration,
        sweep_interval: Duration,
        node_id: Option<String>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let table: Arc<DashMap<u64, Arc<ContextEntry>>> = Arc::new(DashMap::new());
        let sweeper_stop = spawn_sweeper(Arc::clone(&table), sweep_interval, metrics);

        Self { table, seq: AtomicU64::new(0), node_id, timeout, sweeper_stop: Some(sweeper_stop) }
    }

    /// Registers a new context in state `Created` and returns its id.
    ///
    /// `on_complete` fires exactly once: with the response or error when the
    /// handler resolves, or with [`ContextResult::TimedOut`] if the deadline
    /// passes first.
    pub fn create<F>(&self, on_complete: F) -> ContextId
    where
        F: FnOnce(ContextResult) + Send + 'static,
    {
        let id = ContextId(self.seq.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let entry = Arc::new(ContextEntry {
            id,
            state: AtomicU8::new(ContextState::Created as u8),
            created_at: now,
            deadline: now + self.timeout,
            callback: Mutex::new(Some(Box::new(on_complete))),
            attributes: Mutex::new(std::collections::HashMap::new()),
        });
        self.table.insert(id.0, entry);
        trace!(context = %self.render(id), "created async context");
        id
    }

    /// Renders an id for logs, with the node prefix when configured.
    pub fn render(&self, id: ContextId) -> String {
        match &self.node_id {
            Some(node) => format!("{node}-{id}"),
            None => id.to_string(),
        }
    }

    /// Atomically moves a context to a new state.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids or transitions the lifecycle DAG forbids.
    pub fn transition(&self, id: ContextId, next: ContextState) -> Result<(), ContextError> {
        let entry = self.entry(id)?;
        entry
            .try_transition(next)
            .map(|_| ())
            .map_err(|from| ContextError::InvalidTransition { id, from, to: next })
    }

    /// Resolves a context with a response; fires the callback once.
    pub fn complete(&self, id: ContextId, response: Response) -> Result<(), ContextError> {
        self.finish(id, ContextState::Completed, ContextResult::Response(response))
    }

    /// Resolves a context with a failure; fires the callback once.
    pub fn fail(&self, id: ContextId, error: HandlerError) -> Result<(), ContextError> {
        self.finish(id, ContextState::Error, ContextResult::Failed(error))
    }

    /// Cancels a context after a client disconnect.
    ///
    /// The completion callback is short-circuited to a no-op: whoever later
    /// resolves the deferred finds nothing left to deliver to.
    pub fn cancel(&self, id: ContextId) {
        let Some((_, entry)) = self.table.remove(&id.0) else {
            return;
        };
        if entry.try_transition(ContextState::Error).is_ok() {
            // drop, do not fire
            let _ = entry.take_callback();
            debug!(context = %self.render(id), "cancelled async context");
        }
    }

    /// Stores a context attribute.
    pub fn set_attribute(&self, id: ContextId, name: impl Into<String>, value: impl Into<String>) -> Result<(), ContextError> {
        let entry = self.entry(id)?;
        entry.attributes.lock().insert(name.into(), value.into());
        Ok(())
    }

    /// Reads a context attribute.
    pub fn attribute(&self, id: ContextId, name: &str) -> Option<String> {
        let entry = self.table.get(&id.0)?;
        let value = entry.attributes.lock().get(name).cloned();
        value
    }

    /// Returns the current state, if the context is still tracked.
    pub fn state(&self, id: ContextId) -> Option<ContextState> {
        self.table.get(&id.0).map(|entry| entry.state())
    }

    /// Number of contexts currently tracked.
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Age of a context since creation, if still tracked.
    pub fn age(&self, id: ContextId) -> Option<Duration> {
        self.table.get(&id.0).map(|entry| entry.created_at.elapsed())
    }

    fn finish(&self, id: ContextId, terminal: ContextState, result: ContextResult) -> Result<(), ContextError> {
        let entry = self.entry(id)?;

        if entry.try_transition(terminal).is_err() {
            // already terminal; the first resolution won
            return Ok(());
        }

        let callback = entry.take_callback();
        self.table.remove(&id.0);

        if let Some(callback) = callback {
            callback(result);
        }
        Ok(())
    }

    fn entry(&self, id: ContextId) -> Result<Arc<ContextEntry>, ContextError> {
        self.table.get(&id.0).map(|entry| Arc::clone(&entry)).ok_or(ContextError::NotFound(id))
    }
}

impl Drop for AsyncContextManager {
    fn drop(&mut self) {
        if let Some(stop) = self.sweeper_stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Scans the table and times out contexts whose deadline has passed.
///
/// Exposed for tests; the sweeper thread calls this on its interval.
fn sweep(table: &DashMap<u64, Arc<ContextEntry>>, metrics: &ServerMetrics) -> usize {
    let now = Instant::now();
    let expired: Vec<Arc<ContextEntry>> = table
        .iter()
        .filter(|entry| now >= entry.deadline && !entry.state().is_terminal())
        .map(|entry| Arc::clone(&entry))
        .collect();

    let mut reaped = 0;
    for entry in expired {
        if entry.try_transition(ContextState::Timeout).is_err() {
            continue;
        }
        let callback = entry.take_callback();
        table.remove(&entry.id.0);
        warn!(context = %entry.id, "async context timed out");
        metrics.contexts_timed_out.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = callback {
            callback(ContextResult::TimedOut);
        }
        reaped += 1;
    }
    reaped
}

fn spawn_sweeper(
    table: Arc<DashMap<u64, Arc<ContextEntry>>>,
    interval: Duration,
    metrics: Arc<ServerMetrics>,
) -> Sender<()> {
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let builder = std::thread::Builder::new().name("context-sweeper".to_string());
    let spawn_result = builder.spawn(move || loop {
        match stop_rx.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                metrics.context_sweeps.fetch_add(1, Ordering::Relaxed);
                sweep(&table, &metrics);
            }
            // stop requested, or the manager is gone
            _ => break,
        }
    });
    if let Err(e) = spawn_result {
        warn!("failed to spawn context sweeper: {e}");
    }

    stop_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager(timeout: Duration) -> AsyncContextManager {
        AsyncContextManager::new(timeout, Duration::from_millis(20), None, Arc::new(ServerMetrics::default()))
    }

    #[test]
    fn lifecycle_happy_path() {
        let manager = manager(Duration::from_secs(5));
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let id = manager.create(move |result| {
            assert!(matches!(result, ContextResult::Response(_)));
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.transition(id, ContextState::Processing).unwrap();
        manager.transition(id, ContextState::Waiting).unwrap();
        manager.transition(id, ContextState::Processing).unwrap();
        manager.complete(id, Response::ok()).unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        // terminal contexts are reaped from the table
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let manager = manager(Duration::from_secs(5));
        let id = manager.create(|_| {});

        // Created -> Waiting skips Processing
        let result = manager.transition(id, ContextState::Waiting);
        assert!(matches!(result, Err(ContextError::InvalidTransition { .. })));

        manager.transition(id, ContextState::Processing).unwrap();
        manager.complete(id, Response::ok()).unwrap();
    }

    #[test]
    fn completion_fires_exactly_once() {
        let manager = manager(Duration::from_secs(5));
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let id = manager.create(move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.transition(id, ContextState::Processing).unwrap();
        manager.complete(id, Response::ok()).unwrap();
        // second resolution is a no-op, not an error
        assert!(manager.fail(id, HandlerError::Overloaded).is_err() || delivered.load(Ordering::SeqCst) == 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweeper_times_out_stale_contexts() {
        let manager = manager(Duration::from_millis(30));
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let id = manager.create(move |result| {
            assert!(matches!(result, ContextResult::TimedOut));
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.transition(id, ContextState::Processing).unwrap();
        manager.transition(id, ContextState::Waiting).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "sweeper never fired");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn cancel_short_circuits_the_callback() {
        let manager = manager(Duration::from_millis(30));
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let id = manager.create(move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.cancel(id);

        // neither completion nor the sweeper may fire the callback now
        assert!(manager.complete(id, Response::ok()).is_err());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn node_prefix_is_cosmetic() {
        let with_node = AsyncContextManager::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Some("node7".to_string()),
            Arc::new(ServerMetrics::default()),
        );
        let id = with_node.create(|_| {});
        assert_eq!(with_node.render(id), format!("node7-{}", id.0));

        let without = manager(Duration::from_secs(5));
        let id = without.create(|_| {});
        assert_eq!(without.render(id), id.0.to_string());
    }
}
