//! The readiness-driven connection loop shared by the HRP and STEL engines.
//!
//! One reactor thread owns the listener, every client socket, the parser
//! state and the write queues. Nothing here blocks: reads and writes run
//! until `WouldBlock`, and everything another thread wants done to a socket
//! arrives as a [`ReactorTask`] over an MPSC channel paired with a
//! [`mio::Waker`]. The two engines differ only in their [`Dispatcher`]: HRP
//! submits complete requests to the worker pool, STEL runs them inline.
//!
//! Per-connection ordering: when a request completes parsing, the socket is
//! deregistered; it is re-registered for reads only after the response has
//! been fully written, and leftover pipelined bytes are re-fed to the
//! parser at that point. A connection therefore never has more than one
//! request in flight.
//!
//! Connection identity is (slab index, generation): a task that races with
//! a disconnect and slot reuse carries a stale generation and is dropped as
//! a no-op.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use http::StatusCode;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tokio_util::codec::Decoder;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::context::{AsyncContextManager, ContextId, ContextResult, ContextState};
use crate::engine::{
    decide_keep_alive, error_response, finalize_response, parse_error_response, wire_response, EngineError,
    CONTINUE_RESPONSE,
};
use crate::handler::{DeferredResponse, HandlerError};
use crate::metrics::ServerMetrics;
use troika_http::codec::{RequestDecoder, ResponseEncoder};
use troika_http::protocol::{Request, Response};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 2);

/// Upper bound on one poll wait; doubles as the idle-sweep cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Work posted to the reactor from other threads.
///
/// All socket mutations stay on the reactor thread; workers and completion
/// callbacks only ever post one of these.
pub(crate) enum ReactorTask {
    /// Deliver a handler outcome to a connection.
    Respond { key: ConnKey, result: Result<Response, HandlerError> },
    /// Record the async context a detached request is waiting on.
    AttachContext { key: ConnKey, context: ContextId },
    /// Begin graceful shutdown.
    Shutdown { grace: Duration },
}

/// Identity of a connection: slab index plus recycling generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnKey {
    pub index: usize,
    pub generation: u64,
}

/// Cloneable posting side of the reactor's task queue.
#[derive(Clone)]
pub(crate) struct ReactorHandle {
    tasks: Sender<ReactorTask>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Posts a task and wakes the reactor. A dead reactor drops the task.
    pub(crate) fn post(&self, task: ReactorTask) {
        if self.tasks.send(task).is_ok() {
            if let Err(e) = self.waker.wake() {
                debug!("reactor wake failed: {e}");
            }
        }
    }
}

/// What a dispatcher did with a freshly parsed request.
pub(crate) enum DispatchOutcome {
    /// A response (or failure) is already available.
    Immediate(Result<Response, HandlerError>),
    /// The request detached; the context will deliver the response.
    Detached(ContextId),
    /// The request is on its way to a worker; a task will follow.
    Pending,
}

/// Engine-specific request hand-off policy.
pub(crate) trait Dispatcher: Send + 'static {
    fn dispatch(&mut self, key: ConnKey, request: Request, handle: &ReactorHandle) -> DispatchOutcome;
}

/// Registers a detached request with the context manager.
///
/// The context's completion callback posts the response back to the
/// reactor; the deferred's resolution drives the context to its terminal
/// state (the "context switch in"). A timeout surfaces as 504.
pub(crate) fn detach_context(
    deferred: DeferredResponse,
    key: ConnKey,
    handle: &ReactorHandle,
    contexts: &Arc<AsyncContextManager>,
    metrics: &Arc<ServerMetrics>,
) -> ContextId {
    let callback_handle = handle.clone();
    let callback_metrics = Arc::clone(metrics);
    let id = contexts.create(move |ctx_result| {
        let result = match ctx_result {
            ContextResult::Response(response) => Ok(response),
            ContextResult::Failed(error) => Err(error),
            ContextResult::TimedOut => {
                callback_metrics.inc_timeout_errors();
                Ok(error_response(StatusCode::GATEWAY_TIMEOUT))
            }
        };
        callback_handle.post(ReactorTask::Respond { key, result });
    });

    let _ = contexts.transition(id, ContextState::Processing);
    let _ = contexts.transition(id, ContextState::Waiting);

    let resume_contexts = Arc::clone(contexts);
    deferred.on_ready(move |result| {
        let _ = resume_contexts.transition(id, ContextState::Processing);
        match result {
            Ok(response) => {
                let _ = resume_contexts.complete(id, response);
            }
            Err(error) => {
                let _ = resume_contexts.fail(id, error);
            }
        }
    });

    id
}

/// Handle to a running reactor thread.
pub(crate) struct ReactorRuntime {
    pub handle: ReactorHandle,
    pub running: Arc<AtomicBool>,
    pub local_addr: SocketAddr,
    join: Option<JoinHandle<()>>,
}

impl ReactorRuntime {
    /// Requests shutdown and joins the reactor thread.
    pub(crate) fn stop(&mut self, grace: Duration) {
        self.handle.post(ReactorTask::Shutdown { grace });
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Builds the poll/waker/channel plumbing and spawns the reactor thread.
pub(crate) fn spawn_reactor<D: Dispatcher>(
    name: &str,
    listener: std::net::TcpListener,
    dispatcher: D,
    config: EngineConfig,
    metrics: Arc<ServerMetrics>,
    contexts: Arc<AsyncContextManager>,
) -> Result<ReactorRuntime, EngineError> {
    let local_addr = listener.local_addr()?;
    let mut listener = mio::net::TcpListener::from_std(listener);

    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let (tasks_tx, tasks_rx) = unbounded();
    let handle = ReactorHandle { tasks: tasks_tx, waker };
    let running = Arc::new(AtomicBool::new(true));

    let reactor = Reactor {
        poll,
        listener,
        conns: Slab::new(),
        dispatcher,
        tasks: tasks_rx,
        handle: handle.clone(),
        config,
        metrics,
        contexts,
        generation: 0,
        shutdown_deadline: None,
        running: Arc::clone(&running),
    };

    let join = std::thread::Builder::new().name(format!("{name}-reactor")).spawn(move || reactor.run())?;

    Ok(ReactorRuntime { handle, running, local_addr, join: Some(join) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Reading and parsing the next request.
    Reading,
    /// A complete request is with the dispatcher/worker.
    Dispatched,
    /// The response is being written.
    Responding,
}

struct Conn {
    stream: TcpStream,
    generation: u64,
    decoder: RequestDecoder,
    encoder: ResponseEncoder,
    read_buf: BytesMut,
    write_queue: std::collections::VecDeque<Bytes>,
    write_offset: usize,
    phase: Phase,
    registered: Option<Interest>,
    req_keep_alive: bool,
    keep_alive_decided: bool,
    close_after_write: bool,
    requests_served: u32,
    last_activity: Instant,
    context: Option<ContextId>,
}

impl Conn {
    fn new(stream: TcpStream, generation: u64, config: &EngineConfig) -> Self {
        Self {
            stream,
            generation,
            decoder: RequestDecoder::with_limits(config.max_header_bytes, config.max_body_bytes),
            encoder: ResponseEncoder::new(),
            read_buf: BytesMut::new(),
            write_queue: std::collections::VecDeque::new(),
            write_offset: 0,
            phase: Phase::Reading,
            registered: None,
            req_keep_alive: false,
            keep_alive_decided: false,
            close_after_write: false,
            requests_served: 0,
            last_activity: Instant::now(),
            context: None,
        }
    }

    fn desired_interest(&self) -> Option<Interest> {
        let writable = !self.write_queue.is_empty();
        match self.phase {
            Phase::Reading => Some(if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE }),
            Phase::Dispatched | Phase::Responding => writable.then_some(Interest::WRITABLE),
        }
    }
}

enum Advanced {
    Idle,
    SentContinue,
    Request(Request),
    ParseFailure(Response),
}

enum FlushResult {
    Drained,
    Blocked,
    Failed(io::Error),
}

struct Reactor<D: Dispatcher> {
    poll: Poll,
    listener: mio::net::TcpListener,
    conns: Slab<Conn>,
    dispatcher: D,
    tasks: Receiver<ReactorTask>,
    handle: ReactorHandle,
    config: EngineConfig,
    metrics: Arc<ServerMetrics>,
    contexts: Arc<AsyncContextManager>,
    generation: u64,
    shutdown_deadline: Option<Instant>,
    running: Arc<AtomicBool>,
}

impl<D: Dispatcher> Reactor<D> {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = match self.shutdown_deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // a broken poll is fatal for the whole engine
                error!("reactor poll failed: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKER_TOKEN => {}
                    token => {
                        let index = token.0;
                        if event.is_readable() {
                            self.handle_read(index);
                        }
                        if event.is_writable() {
                            self.flush_writes(index);
                        }
                    }
                }
            }

            self.drain_tasks();
            self.sweep_idle();

            if let Some(deadline) = self.shutdown_deadline {
                if self.conns.is_empty() || Instant::now() >= deadline {
                    break;
                }
            }
        }

        self.close_all();
        self.running.store(false, Ordering::Release);
        debug!("reactor stopped");
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.shutdown_deadline.is_some() {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);

                    self.generation += 1;
                    let generation = self.generation;

                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        warn!("failed to register accepted socket: {e}");
                        continue;
                    }

                    let mut conn = Conn::new(stream, generation, &self.config);
                    conn.registered = Some(Interest::READABLE);
                    entry.insert(conn);

                    self.metrics.inc_connections_accepted();
                    trace!(%peer, "accepted connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_read(&mut self, index: usize) {
        enum ReadResult {
            Progress,
            Eof,
            Failed(io::Error),
        }

        let result = {
            let Some(conn) = self.conns.get_mut(index) else { return };
            let mut scratch = [0u8; 8 * 1024];
            let mut result = ReadResult::Progress;
            loop {
                match conn.stream.read(&mut scratch) {
                    Ok(0) => {
                        result = ReadResult::Eof;
                        break;
                    }
                    Ok(n) => {
                        conn.read_buf.extend_from_slice(&scratch[..n]);
                        conn.last_activity = Instant::now();
                        self.metrics.add_bytes_read(n as u64);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        result = ReadResult::Failed(e);
                        break;
                    }
                }
            }
            result
        };

        match result {
            ReadResult::Progress => self.advance(index),
            ReadResult::Eof => {
                trace!("peer closed connection");
                self.close(index);
            }
            ReadResult::Failed(e) => {
                debug!("read failed: {e}");
                self.metrics.inc_transport_errors();
                self.close(index);
            }
        }
    }

    /// Drives the parser over whatever is buffered, dispatching at most one
    /// request (per-connection processing is strictly serial).
    fn advance(&mut self, index: usize) {
        loop {
            let action = {
                let Some(conn) = self.conns.get_mut(index) else { return };
                if conn.phase != Phase::Reading {
                    return;
                }
                match conn.decoder.decode(&mut conn.read_buf) {
                    Ok(Some(request)) => {
                        conn.req_keep_alive = request.keeps_alive();
                        conn.phase = Phase::Dispatched;
                        conn.last_activity = Instant::now();
                        Advanced::Request(request)
                    }
                    Ok(None) => {
                        if conn.decoder.take_expect_continue() {
                            conn.write_queue.push_back(Bytes::from_static(CONTINUE_RESPONSE));
                            Advanced::SentContinue
                        } else {
                            Advanced::Idle
                        }
                    }
                    Err(e) => {
                        debug!("protocol error: {e}");
                        self.metrics.inc_protocol_errors();
                        conn.phase = Phase::Dispatched;
                        conn.close_after_write = true;
                        conn.req_keep_alive = false;
                        Advanced::ParseFailure(parse_error_response(&e))
                    }
                }
            };

            match action {
                Advanced::Idle => return,
                Advanced::SentContinue => {
                    self.flush_writes(index);
                    // body bytes may already be buffered behind the head
                    continue;
                }
                Advanced::Request(request) => {
                    self.update_registration(index);
                    let Some(generation) = self.conns.get(index).map(|conn| conn.generation) else { return };
                    let key = ConnKey { index, generation };

                    let handle = self.handle.clone();
                    match self.dispatcher.dispatch(key, request, &handle) {
                        DispatchOutcome::Immediate(result) => self.respond(key, result),
                        DispatchOutcome::Detached(context) => {
                            if let Some(conn) = self.conns.get_mut(index) {
                                conn.context = Some(context);
                            }
                        }
                        DispatchOutcome::Pending => {}
                    }
                    return;
                }
                Advanced::ParseFailure(response) => {
                    self.send_response(index, response);
                    return;
                }
            }
        }
    }

    /// Delivers a handler outcome; stale keys are dropped as no-ops.
    fn respond(&mut self, key: ConnKey, result: Result<Response, HandlerError>) {
        if !self.key_valid(key) {
            trace!("dropping response for dead connection");
            return;
        }
        let response = wire_response(result, &self.metrics);
        self.send_response(key.index, response);
    }

    fn send_response(&mut self, index: usize, mut response: Response) {
        let encode_failed = {
            let Some(conn) = self.conns.get_mut(index) else { return };

            let served_after = conn.requests_served + 1;
            let keep = !conn.close_after_write
                && self.shutdown_deadline.is_none()
                && decide_keep_alive(conn.req_keep_alive, &response, served_after, &self.config);
            finalize_response(&mut response, keep);

            let mut buf = BytesMut::with_capacity(self.config.write_buffer_bytes);
            match conn.encoder.encode_response(response, &mut buf) {
                Ok(()) => {
                    conn.keep_alive_decided = keep;
                    conn.phase = Phase::Responding;
                    conn.context = None;
                    conn.write_queue.push_back(buf.freeze());
                    false
                }
                Err(e) => {
                    error!("failed to encode response: {e}");
                    true
                }
            }
        };

        if encode_failed {
            self.close(index);
        } else {
            self.flush_writes(index);
        }
    }

    fn flush_writes(&mut self, index: usize) {
        let result = {
            let Some(conn) = self.conns.get_mut(index) else { return };
            let mut result = FlushResult::Drained;
            'queue: while let Some(chunk) = conn.write_queue.front().cloned() {
                while conn.write_offset < chunk.len() {
                    match conn.stream.write(&chunk[conn.write_offset..]) {
                        Ok(0) => {
                            result = FlushResult::Failed(io::ErrorKind::WriteZero.into());
                            break 'queue;
                        }
                        Ok(n) => {
                            conn.write_offset += n;
                            self.metrics.add_bytes_written(n as u64);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            result = FlushResult::Blocked;
                            break 'queue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            result = FlushResult::Failed(e);
                            break 'queue;
                        }
                    }
                }
                conn.write_offset = 0;
                conn.write_queue.pop_front();
            }
            result
        };

        match result {
            FlushResult::Drained => self.writes_drained(index),
            FlushResult::Blocked => self.update_registration(index),
            FlushResult::Failed(e) => {
                debug!("write failed: {e}");
                self.metrics.inc_transport_errors();
                self.close(index);
            }
        }
    }

    /// The write queue emptied; either the response is done or interim
    /// bytes (100-continue) went out.
    fn writes_drained(&mut self, index: usize) {
        let finished_response = {
            let Some(conn) = self.conns.get_mut(index) else { return };
            conn.phase == Phase::Responding
        };

        if !finished_response {
            self.update_registration(index);
            return;
        }

        let keep = {
            let Some(conn) = self.conns.get_mut(index) else { return };
            conn.requests_served += 1;
            self.metrics.inc_requests_completed();
            let keep = conn.keep_alive_decided && !conn.close_after_write;
            if keep {
                conn.phase = Phase::Reading;
                conn.context = None;
                conn.last_activity = Instant::now();
            }
            keep
        };

        if keep {
            self.update_registration(index);
            // pipelined requests already buffered become visible only now
            self.advance(index);
        } else {
            self.close(index);
        }
    }

    fn update_registration(&mut self, index: usize) {
        let Some(conn) = self.conns.get_mut(index) else { return };
        let desired = conn.desired_interest();

        let outcome = match (conn.registered, desired) {
            (None, Some(interest)) => {
                self.poll.registry().register(&mut conn.stream, Token(index), interest).map(|()| desired)
            }
            (Some(current), Some(interest)) if current != interest => {
                self.poll.registry().reregister(&mut conn.stream, Token(index), interest).map(|()| desired)
            }
            (Some(_), None) => self.poll.registry().deregister(&mut conn.stream).map(|()| None),
            (current, _) => Ok(current),
        };

        match outcome {
            Ok(registered) => conn.registered = registered,
            Err(e) => {
                warn!("interest update failed: {e}");
                self.close(index);
            }
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                ReactorTask::Respond { key, result } => self.respond(key, result),
                ReactorTask::AttachContext { key, context } => {
                    if self.key_valid(key) {
                        if let Some(conn) = self.conns.get_mut(key.index) {
                            conn.context = Some(context);
                        }
                    } else {
                        // connection died while the worker was detaching
                        self.contexts.cancel(context);
                    }
                }
                ReactorTask::Shutdown { grace } => self.begin_shutdown(grace),
            }
        }
    }

    fn sweep_idle(&mut self) {
        let timeout = self.config.socket_read_timeout;
        let now = Instant::now();
        let stale: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.phase == Phase::Reading && now.duration_since(conn.last_activity) > timeout)
            .map(|(index, _)| index)
            .collect();

        for index in stale {
            trace!("closing idle connection");
            self.close(index);
        }
    }

    fn begin_shutdown(&mut self, grace: Duration) {
        if self.shutdown_deadline.is_some() {
            return;
        }
        debug!(?grace, "reactor shutting down");
        self.shutdown_deadline = Some(Instant::now() + grace);
        let _ = self.poll.registry().deregister(&mut self.listener);

        // idle connections close now; in-flight ones get the grace period
        let idle: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.phase == Phase::Reading && conn.write_queue.is_empty())
            .map(|(index, _)| index)
            .collect();
        for index in idle {
            self.close(index);
        }
    }

    fn key_valid(&self, key: ConnKey) -> bool {
        self.conns.get(key.index).map(|conn| conn.generation == key.generation).unwrap_or(false)
    }

    fn close(&mut self, index: usize) {
        if let Some(mut conn) = self.conns.try_remove(index) {
            if conn.registered.is_some() {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            if let Some(context) = conn.context.take() {
                self.contexts.cancel(context);
            }
            self.metrics.inc_connections_closed();
        }
    }

    fn close_all(&mut self) {
        let all: Vec<usize> = self.conns.iter().map(|(index, _)| index).collect();
        for index in all {
            self.close(index);
        }
    }
}
