//! Thread-per-connection engine.
//!
//! A dedicated acceptor thread polls the listener; every accepted socket is
//! switched to blocking mode and handed to the adaptive worker pool, whose
//! eager-spawn policy means a waiting connection is preferentially answered
//! by a fresh thread rather than a queue slot. The worker then owns the
//! connection for its whole life: it reads, parses, routes, blocks on
//! deferred results (TPC intentionally does not detach) and writes, until
//! keep-alive ends or the peer goes away.
//!
//! The connection is the unit of failure isolation: a worker never lets an
//! error escape to the acceptor, and the acceptor survives any worker
//! failure.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use http::StatusCode;
use parking_lot::Mutex;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::engine::{
    bind_listener, decide_keep_alive, error_response, finalize_response, parse_error_response, route_request,
    wire_response, Engine, EngineError, CONTINUE_RESPONSE,
};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::pool::{PoolConfig, PoolError, WorkerPool};
use crate::router::Router;
use troika_http::codec::{RequestDecoder, ResponseEncoder};
use troika_http::protocol::{ParseError, Request};

/// Pause between accept polls while the listener has no pending peers.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The thread-per-connection engine.
pub struct TpcEngine {
    config: EngineConfig,
    router: Arc<Router>,
    metrics: Arc<ServerMetrics>,
    state: Option<Running>,
}

struct Running {
    shared: Arc<Shared>,
    pool: Arc<WorkerPool>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// State shared between the acceptor and the per-connection workers.
struct Shared {
    config: EngineConfig,
    router: Arc<Router>,
    metrics: Arc<ServerMetrics>,
    running: AtomicBool,
    /// Cloned handles of live sockets, for forced closure at stop time.
    open_sockets: Mutex<HashMap<u64, TcpStream>>,
    conn_seq: AtomicU64,
}

impl std::fmt::Debug for TpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpcEngine").field("running", &self.state.is_some()).finish_non_exhaustive()
    }
}

impl TpcEngine {
    /// Creates the engine from a routing table and a configuration.
    pub fn new(router: Router, config: EngineConfig) -> Self {
        Self { config, router: Arc::new(router), metrics: Arc::new(ServerMetrics::default()), state: None }
    }
}

impl Engine for TpcEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.state.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let listener = bind_listener(&self.config)?;
        let local_addr = listener.local_addr()?;

        let pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "tpc-worker".to_string(),
            core: self.config.pool_core,
            max: self.config.pool_max,
            queue_capacity: self.config.pool_queue_capacity,
            keep_alive: self.config.pool_keep_alive,
            scale_step: self.config.pool_scale_step,
            adaptive: false,
            sample_interval: Duration::from_secs(5),
        }));

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            router: Arc::clone(&self.router),
            metrics: Arc::clone(&self.metrics),
            running: AtomicBool::new(true),
            open_sockets: Mutex::new(HashMap::new()),
            conn_seq: AtomicU64::new(0),
        });

        let acceptor = std::thread::Builder::new().name("tpc-acceptor".to_string()).spawn({
            let shared = Arc::clone(&shared);
            let pool = Arc::clone(&pool);
            move || accept_loop(listener, shared, pool)
        })?;

        info!(addr = %local_addr, "tpc engine started");
        self.state = Some(Running { shared, pool, acceptor: Some(acceptor), local_addr });
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<(), EngineError> {
        if let Some(mut running) = self.state.take() {
            running.shared.running.store(false, Ordering::Release);

            // wait for outstanding workers up to the grace deadline
            running.pool.shutdown(grace);

            // whatever survived the grace period gets its socket cut
            let sockets: Vec<TcpStream> = running.shared.open_sockets.lock().drain().map(|(_, s)| s).collect();
            for socket in sockets {
                let _ = socket.shutdown(Shutdown::Both);
            }

            if let Some(acceptor) = running.acceptor.take() {
                let _ = acceptor.join();
            }
            info!("tpc engine stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.as_ref().map(|running| running.shared.running.load(Ordering::Acquire)).unwrap_or(false)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|running| running.local_addr)
    }

    fn metrics(&self) -> MetricsSnapshot {
        let utilization = self.state.as_ref().map(|running| running.pool.utilization()).unwrap_or(0.0);
        self.metrics.snapshot(utilization)
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, pool: Arc<WorkerPool>) {
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!(%peer, "accepted connection");
                if let Err(e) = hand_off(stream, &shared, &pool) {
                    debug!("connection hand-off failed: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
    debug!("acceptor stopped");
}

/// Configures an accepted socket and submits its connection loop.
///
/// Pool saturation drops the connection: TPC has no reactor to answer 503
/// from, so refusing the socket is its backpressure.
fn hand_off(stream: TcpStream, shared: &Arc<Shared>, pool: &Arc<WorkerPool>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.config.socket_read_timeout))?;

    shared.metrics.inc_connections_accepted();
    let conn_id = shared.conn_seq.fetch_add(1, Ordering::Relaxed);
    shared.open_sockets.lock().insert(conn_id, stream.try_clone()?);

    let task_shared = Arc::clone(shared);
    let submitted = pool.submit(0, move || {
        serve_connection(stream, conn_id, &task_shared);
    });

    match submitted {
        Ok(_task_handle) => Ok(()),
        Err(PoolError::Saturated) | Err(PoolError::ShutDown) => {
            shared.metrics.inc_rejected_tasks();
            shared.open_sockets.lock().remove(&conn_id);
            shared.metrics.inc_connections_closed();
            // dropping the stream closes it
            Ok(())
        }
    }
}

/// The blocking per-connection request loop, run on a pool worker.
fn serve_connection(mut stream: TcpStream, conn_id: u64, shared: &Arc<Shared>) {
    let config = &shared.config;
    let mut decoder = RequestDecoder::with_limits(config.max_header_bytes, config.max_body_bytes);
    let mut encoder = ResponseEncoder::new();
    let mut read_buf = BytesMut::new();
    let mut served: u32 = 0;

    loop {
        let request = match read_one_request(&mut stream, &mut decoder, &mut read_buf, shared) {
            Ok(Some(request)) => request,
            // EOF, read timeout or engine stop: close silently
            Ok(None) => break,
            Err(e) => {
                shared.metrics.inc_protocol_errors();
                let mut response = parse_error_response(&e);
                finalize_response(&mut response, false);
                let _ = write_response(&mut stream, &mut encoder, response, shared);
                break;
            }
        };

        let req_keep_alive = request.keeps_alive();
        let deferred = route_request(shared.router.as_ref(), request);

        // TPC blocks its worker on deferred results rather than detaching
        let (result, timed_out) = match deferred.wait(config.async_context_timeout) {
            Some(result) => (result, false),
            None => {
                shared.metrics.inc_timeout_errors();
                (Ok(error_response(StatusCode::GATEWAY_TIMEOUT)), true)
            }
        };

        let mut response = wire_response(result, &shared.metrics);
        served += 1;

        let keep = !timed_out
            && shared.running.load(Ordering::Acquire)
            && decide_keep_alive(req_keep_alive, &response, served, config);
        finalize_response(&mut response, keep);

        if write_response(&mut stream, &mut encoder, response, shared).is_err() {
            shared.metrics.inc_transport_errors();
            break;
        }
        shared.metrics.inc_requests_completed();

        if !keep {
            break;
        }
    }

    shared.open_sockets.lock().remove(&conn_id);
    let _ = stream.shutdown(Shutdown::Both);
    shared.metrics.inc_connections_closed();
    trace!("connection finished");
}

/// Blocks until one complete request is parsed.
///
/// `Ok(None)` covers every silent-close case: peer EOF, the socket read
/// timeout, transport errors and engine stop.
fn read_one_request(
    stream: &mut TcpStream,
    decoder: &mut RequestDecoder,
    read_buf: &mut BytesMut,
    shared: &Arc<Shared>,
) -> Result<Option<Request>, ParseError> {
    let mut scratch = [0u8; 8 * 1024];
    loop {
        if let Some(request) = decoder.decode(read_buf)? {
            return Ok(Some(request));
        }

        if decoder.take_expect_continue() {
            if stream.write_all(CONTINUE_RESPONSE).is_err() {
                return Ok(None);
            }
            shared.metrics.add_bytes_written(CONTINUE_RESPONSE.len() as u64);
        }

        if !shared.running.load(Ordering::Acquire) {
            return Ok(None);
        }

        match stream.read(&mut scratch) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                read_buf.extend_from_slice(&scratch[..n]);
                shared.metrics.add_bytes_read(n as u64);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                trace!("read timed out, closing connection");
                return Ok(None);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read failed: {e}");
                shared.metrics.inc_transport_errors();
                return Ok(None);
            }
        }
    }
}

fn write_response(
    stream: &mut TcpStream,
    encoder: &mut ResponseEncoder,
    response: troika_http::protocol::Response,
    shared: &Arc<Shared>,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(shared.config.write_buffer_bytes);
    encoder
        .encode_response(response, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    stream.write_all(&buf)?;
    stream.flush()?;
    shared.metrics.add_bytes_written(buf.len() as u64);
    Ok(())
}
