//! The deferred-value primitive used for asynchronous responses.
//!
//! A [`Deferred`] is a one-shot promise: some producer holds the matching
//! [`Completer`] and resolves it exactly once. Consumers either block on
//! [`Deferred::wait`] (the thread-per-connection engine does this
//! intentionally) or attach a callback with [`Deferred::on_ready`] (the
//! reactor engines do this, posting the result back to the reactor's task
//! queue).
//!
//! The implementation is a mutex/condvar cell with a stored callback. The
//! callback always fires outside the lock, from whichever thread completes
//! the value.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Consumer half of a one-shot deferred value.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

/// Producer half of a one-shot deferred value.
///
/// Dropping a completer without resolving it leaves the deferred pending
/// forever; detached requests rely on the async context manager's timeout
/// sweep to reap that case.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

struct State<T> {
    value: Option<T>,
    callback: Option<Box<dyn FnOnce(T) + Send>>,
    completed: bool,
}

impl<T: Send + 'static> Deferred<T> {
    /// Creates an already-resolved deferred.
    pub fn ready(value: T) -> Self {
        let (deferred, completer) = Self::channel();
        completer.complete(value);
        deferred
    }

    /// Creates a pending deferred together with its completer.
    pub fn channel() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State { value: None, callback: None, completed: false }),
            ready: Condvar::new(),
        });
        (Self { shared: Arc::clone(&shared) }, Completer { shared })
    }

    /// Returns true once a value has been produced (even if already taken).
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().completed
    }

    /// Takes the value if it has already been produced.
    pub fn try_take(&self) -> Option<T> {
        self.shared.state.lock().value.take()
    }

    /// Attaches the callback invoked when the value arrives.
    ///
    /// If the value is already present the callback fires immediately on
    /// the calling thread; otherwise it fires on the completing thread.
    /// Consumes the handle: a deferred has exactly one consumer.
    pub fn on_ready<F>(self, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let ready_value = {
            let mut state = self.shared.state.lock();
            match state.value.take() {
                Some(value) => Some(value),
                None => {
                    state.callback = Some(Box::new(callback));
                    return;
                }
            }
        };
        // fire outside the lock
        if let Some(value) = ready_value {
            callback(value);
        }
    }

    /// Blocks until the value arrives or the timeout elapses.
    ///
    /// Returns `None` on timeout; the deferred stays usable, so a later
    /// completion is still observed by the context sweeper path.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            if state.completed {
                // value produced but consumed elsewhere
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if self.shared.ready.wait_for(&mut state, deadline - now).timed_out() {
                return state.value.take();
            }
        }
    }
}

impl<T: Send + 'static> Completer<T> {
    /// Resolves the deferred.
    ///
    /// Consumes the completer, so a value is produced at most once and the
    /// consumer's callback can never fire twice.
    pub fn complete(self, value: T) {
        complete_shared(&self.shared, value);
    }
}

fn complete_shared<T: Send + 'static>(shared: &Shared<T>, value: T) {
    let callback = {
        let mut state = shared.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        match state.callback.take() {
            Some(callback) => Some((callback, value)),
            None => {
                state.value = Some(value);
                None
            }
        }
    };
    shared.ready.notify_all();

    if let Some((callback, value)) = callback {
        callback(value);
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").field("complete", &self.shared.state.lock().completed).finish()
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}
