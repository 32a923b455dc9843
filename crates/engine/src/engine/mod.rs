//! The three engines and their shared plumbing.
//!
//! [`TpcEngine`], [`HrpEngine`] and [`StelEngine`] implement the common
//! [`Engine`] lifecycle over the same router/handler surface; this module
//! also holds the pieces they share: listener setup, the routing dispatch
//! step, error responses and response finalization.

pub mod hrp;
mod reactor;
pub mod stel;
pub mod tpc;

pub use hrp::HrpEngine;
pub use stel::StelEngine;
pub use tpc::TpcEngine;

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::Duration;

use http::{header, HeaderValue, StatusCode};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;
use crate::date::DateService;
use crate::deferred::Deferred;
use crate::handler::{invoke_caught, DeferredResponse, HandlerError};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::router::{RouteOutcome, Router};
use troika_http::protocol::{ParseError, Request, Response};

/// Value of the `Server` header stamped on every response.
pub(crate) const SERVER_NAME: &str = "troika";

/// Lifecycle surface shared by the three engines.
pub trait Engine {
    /// Binds and starts serving. Returns once the listener is bound; accept
    /// and I/O run on the engine's own threads.
    ///
    /// # Errors
    ///
    /// Fails if the engine is already running, the address does not
    /// resolve, or the bind fails (port in use).
    fn start(&mut self) -> Result<(), EngineError>;

    /// Stops accepting, drains in-flight work up to `grace`, then forces
    /// remaining connections closed. Idempotent.
    fn stop(&mut self, grace: Duration) -> Result<(), EngineError>;

    /// True between a successful `start` and the engine winding down.
    fn is_running(&self) -> bool;

    /// The bound address while running (useful with port 0).
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Read-only counter snapshot.
    fn metrics(&self) -> MetricsSnapshot;
}

/// Fatal engine errors surfaced to the caller of `start`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The bind address did not resolve or the bind/listen failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `start` called while already running.
    #[error("engine already running")]
    AlreadyRunning,

    /// Any other fatal I/O error during startup.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Binds the configured listener with the configured backlog.
///
/// The listener comes back in non-blocking mode; TPC's accept loop polls
/// it, the reactors hand it to mio.
pub(crate) fn bind_listener(config: &EngineConfig) -> Result<TcpListener, EngineError> {
    let addr_repr = format!("{}:{}", config.bind_address, config.port);
    let bind_error = |source: io::Error| EngineError::Bind { addr: addr_repr.clone(), source };

    let addr: SocketAddr = (config.bind_address.as_str(), config.port)
        .to_socket_addrs()
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| bind_error(io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(config.backlog as i32).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;

    Ok(socket.into())
}

/// Routes a request and invokes the matched chain.
///
/// Routing misses produce ready 404/405 responses; handler panics surface
/// as failed deferreds.
pub(crate) fn route_request(router: &Router, mut request: Request) -> DeferredResponse {
    match router.route(request.method(), request.path()) {
        RouteOutcome::Matched { handler, params } => {
            request.set_path_params(params);
            let handler = std::sync::Arc::clone(handler);
            invoke_caught(handler.as_ref(), request)
        }
        RouteOutcome::MethodNotAllowed(allowed) => {
            let allow = allowed.iter().map(http::Method::as_str).collect::<Vec<_>>().join(", ");
            let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED);
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response = response.with_header(header::ALLOW, value);
            }
            Deferred::ready(Ok(response))
        }
        RouteOutcome::NotFound => Deferred::ready(Ok(error_response(StatusCode::NOT_FOUND))),
    }
}

/// Builds a minimal plain-text response for an error status.
pub(crate) fn error_response(status: StatusCode) -> Response {
    let body = format!("{} {}", status.as_str(), status.canonical_reason().unwrap_or("Unknown"));
    Response::new(status)
        .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
        .with_body(body)
}

/// Maps a handler outcome to the wire response, bumping error counters.
pub(crate) fn wire_response(result: Result<Response, HandlerError>, metrics: &ServerMetrics) -> Response {
    match result {
        Ok(response) => response,
        Err(HandlerError::Overloaded) => {
            metrics.inc_rejected_tasks();
            error_response(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            warn!("handler failed: {e}");
            metrics.inc_handler_errors();
            error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Maps a parse error to its wire response (400, or 413 for a body over
/// the limit). The connection always closes after such a response.
pub(crate) fn parse_error_response(error: &ParseError) -> Response {
    let status =
        if error.is_body_too_large() { StatusCode::PAYLOAD_TOO_LARGE } else { StatusCode::BAD_REQUEST };
    error_response(status)
}

/// Decides whether the connection survives this exchange.
///
/// The peer must have asked for keep-alive, the response must not carry
/// `Connection: close`, and the per-connection request budget must not be
/// exhausted by the current request.
pub(crate) fn decide_keep_alive(
    request_keep_alive: bool,
    response: &Response,
    served_after_this: u32,
    config: &EngineConfig,
) -> bool {
    if !request_keep_alive {
        return false;
    }
    if config.requests_exhausted(served_after_this) {
        return false;
    }
    let response_closes = response
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false);
    !response_closes
}

/// Stamps the default headers the serializer owes every response: `Date`,
/// `Server` and `Connection` (the framing header is the encoder's job).
pub(crate) fn finalize_response(response: &mut Response, keep_alive: bool) {
    let Ok(headers) = response.headers_mut() else {
        // committed responses are never passed here
        return;
    };

    if !headers.contains_key(header::DATE) {
        headers.insert(header::DATE, DateService::global().header_value());
    }
    if !headers.contains_key(header::SERVER) {
        headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    }
    if !headers.contains_key(header::CONNECTION) {
        let value = if keep_alive { HeaderValue::from_static("keep-alive") } else { HeaderValue::from_static("close") };
        headers.insert(header::CONNECTION, value);
    }
}

/// The wire bytes of the interim `100 Continue` response.
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use bytes::Bytes;
    use std::time::Duration;
    use troika_http::protocol::RequestHeader;

    fn request(method: http::Method, path: &str) -> Request {
        let header: RequestHeader =
            http::Request::builder().method(method).uri(path).body(()).unwrap().into_parts().0.into();
        Request::from_header(header, Bytes::new()).unwrap()
    }

    #[test]
    fn route_request_maps_miss_to_404() {
        let router = Router::builder().get("/x", handler_fn(|_req| Response::ok())).build().unwrap();
        let response =
            route_request(&router, request(http::Method::GET, "/missing")).wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn route_request_maps_method_mismatch_to_405_with_allow() {
        let router = Router::builder().get("/x", handler_fn(|_req| Response::ok())).build().unwrap();
        let response =
            route_request(&router, request(http::Method::POST, "/x")).wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW), Some(&HeaderValue::from_static("GET")));
    }

    #[test]
    fn wire_response_maps_overload_to_503() {
        let metrics = ServerMetrics::default();
        let response = wire_response(Err(HandlerError::Overloaded), &metrics);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(metrics.snapshot(0.0).rejected_tasks, 1);
    }

    #[test]
    fn wire_response_maps_other_failures_to_500() {
        let metrics = ServerMetrics::default();
        let response = wire_response(Err(HandlerError::other("boom")), &metrics);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(metrics.snapshot(0.0).handler_errors, 1);
    }

    #[test]
    fn keep_alive_respects_budget_and_close_header() {
        let config = EngineConfig::default().with_max_requests_per_connection(2);

        assert!(decide_keep_alive(true, &Response::ok(), 1, &config));
        assert!(!decide_keep_alive(true, &Response::ok(), 2, &config));
        assert!(!decide_keep_alive(false, &Response::ok(), 1, &config));

        let closing = Response::ok().with_header(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!decide_keep_alive(true, &closing, 1, &config));
    }

    #[test]
    fn finalize_adds_default_headers_once() {
        let mut response = Response::ok().with_header(header::SERVER, HeaderValue::from_static("custom"));
        finalize_response(&mut response, true);

        assert_eq!(response.headers().get(header::SERVER), Some(&HeaderValue::from_static("custom")));
        assert!(response.headers().contains_key(header::DATE));
        assert_eq!(response.headers().get(header::CONNECTION), Some(&HeaderValue::from_static("keep-alive")));
    }
}
