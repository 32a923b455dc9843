//! HTTP request decoder module
//!
//! This module provides the per-connection incremental parser used by every
//! engine. Bytes are fed in arrival order and each call produces one of
//! three outcomes: need-more (`Ok(None)`), a complete request
//! (`Ok(Some(request))`), or a protocol error (`Err(ParseError)`).
//!
//! # Components
//!
//! - [`RequestDecoder`]: Main decoder that coordinates head and payload parsing
//! - Head parsing: Uses [`HeaderDecoder`] for the request line and headers
//! - Payload handling: Uses [`PayloadDecoder`] for the body, aggregating the
//!   chunks into one immutable body value
//!
//! The decoder never re-scans accumulated history: every stage consumes its
//! input through `BytesMut::split_to`, so a connection that trickles bytes
//! pays only for the bytes of each feed. After a complete request the
//! decoder resets itself, which is what allows pipelined requests on one
//! connection to be pulled out back to back.
//!
//! # Example
//!
//! ```no_run
//! use troika_http::codec::RequestDecoder;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut buffer = BytesMut::new();
//! // ... add request data to buffer ...
//! let result = decoder.decode(&mut buffer);
//! ```

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::ensure;
use crate::protocol::{ParseError, PayloadItem, PayloadSize, Request, RequestHeader};

/// Default ceiling for an aggregated request body (10 MiB).
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// A decoder for HTTP requests that handles both head and payload.
///
/// The decoder operates in two phases:
/// 1. Head parsing: request line and headers via [`HeaderDecoder`]
/// 2. Payload parsing: body bytes via [`PayloadDecoder`], aggregated until EOF
///
/// # State Machine
///
/// The phase is tracked by the `in_flight` field:
/// - `None`: currently parsing the head
/// - `Some(InFlight)`: head parsed, currently reading the body
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    in_flight: Option<InFlight>,
    max_body_bytes: usize,
    expect_continue: bool,
}

/// A request whose head has been parsed and whose body is still arriving.
struct InFlight {
    header: RequestHeader,
    payload_decoder: PayloadDecoder,
    body: BytesMut,
}

impl std::fmt::Debug for RequestDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDecoder")
            .field("reading_body", &self.in_flight.is_some())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl RequestDecoder {
    /// Creates a decoder with the default head and body limits.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a decoder with explicit head and body limits.
    pub fn with_limits(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            header_decoder: HeaderDecoder::with_max_header_bytes(max_header_bytes),
            in_flight: None,
            max_body_bytes,
            expect_continue: false,
        }
    }

    /// Returns true while a head has been parsed but its body is incomplete.
    pub fn is_reading_body(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Takes the pending `Expect: 100-continue` flag.
    ///
    /// Set when a head carrying the header arrives with a non-empty body;
    /// the engine owning the connection emits the interim response and the
    /// flag resets so it fires at most once per request.
    pub fn take_expect_continue(&mut self) -> bool {
        std::mem::take(&mut self.expect_continue)
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::with_limits(crate::codec::header::DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_BODY_BYTES)
    }
}

impl Decoder for RequestDecoder {
    type Item = Request;
    type Error = ParseError;

    /// Attempts to decode one complete HTTP request from the provided buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(request))`: a full request (head and body) was decoded;
    ///   the decoder has reset itself for the next pipelined request
    /// - `Ok(None)`: need more data
    /// - `Err(_)`: protocol error; the connection should emit an error
    ///   response and close
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // drain the body first if a head has already been parsed
            if let Some(in_flight) = &mut self.in_flight {
                match in_flight.payload_decoder.decode(src)? {
                    Some(PayloadItem::Chunk(bytes)) => {
                        ensure!(
                            in_flight.body.len() + bytes.len() <= self.max_body_bytes,
                            ParseError::too_large_body(self.max_body_bytes)
                        );
                        in_flight.body.extend_from_slice(&bytes);
                    }
                    Some(PayloadItem::Eof) => {
                        // the interim-response window is over once the body is complete
                        self.expect_continue = false;
                        // unwrap cannot fail: we are inside `if let Some`
                        let InFlight { header, body, .. } = self.in_flight.take().expect("in-flight request present");
                        let request = Request::from_header(header, body.freeze())?;
                        trace!(method = %request.method(), path = %request.path(), "decoded request");
                        return Ok(Some(request));
                    }
                    None => return Ok(None),
                }
                continue;
            }

            // otherwise parse the head
            match self.header_decoder.decode(src)? {
                Some((header, payload_size)) => {
                    if let PayloadSize::Length(declared) = payload_size {
                        ensure!(declared as usize <= self.max_body_bytes, ParseError::too_large_body(self.max_body_bytes));
                    }

                    self.expect_continue = !payload_size.is_empty() && expects_continue(&header);

                    self.in_flight =
                        Some(InFlight { header, payload_decoder: payload_size.into(), body: BytesMut::new() });
                }
                None => return Ok(None),
            }
        }
    }
}

fn expects_continue(header: &RequestHeader) -> bool {
    header
        .headers()
        .get(http::header::EXPECT)
        .map(|value| value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn decode_all(decoder: &mut RequestDecoder, input: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut buf = BytesMut::from(input);
        decoder.decode(&mut buf)
    }

    #[test]
    fn simple_get_in_one_feed() {
        let mut decoder = RequestDecoder::new();
        let request = decode_all(&mut decoder, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap().unwrap();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/hello");
        assert!(request.body().is_empty());
    }

    #[test]
    fn request_split_across_feeds() {
        let mut decoder = RequestDecoder::new();
        let wire = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";

        let mut buf = BytesMut::new();
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(request) = decoder.decode(&mut buf).unwrap() {
                assert_eq!(request.path(), "/echo");
                assert_eq!(&request.body()[..], b"hello");
                return;
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn chunked_body_is_aggregated() {
        let mut decoder = RequestDecoder::new();
        let wire =
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let request = decode_all(&mut decoder, wire).unwrap().unwrap();

        assert_eq!(&request.body()[..], b"hello world");
        assert_eq!(request.body().len(), 11);
    }

    #[test]
    fn pipelined_requests_come_out_in_order() {
        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::from(
            &b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        );

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.path(), "/first");

        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.path(), "/second");

        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn declared_body_over_limit_is_rejected() {
        let mut decoder = RequestDecoder::with_limits(64 * 1024, 16);
        let result = decode_all(&mut decoder, b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n");
        assert!(matches!(result, Err(ParseError::TooLargeBody { .. })));
    }

    #[test]
    fn chunked_body_over_limit_is_rejected() {
        let mut decoder = RequestDecoder::with_limits(64 * 1024, 8);
        let wire = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n9\r\n123456789\r\n0\r\n\r\n";
        let result = decode_all(&mut decoder, wire);
        assert!(matches!(result, Err(ParseError::TooLargeBody { .. })));
    }

    #[test]
    fn transfer_encoding_wins_over_content_length() {
        let mut decoder = RequestDecoder::new();
        let wire = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let request = decode_all(&mut decoder, wire).unwrap().unwrap();
        assert_eq!(&request.body()[..], b"hello");
    }

    #[test]
    fn expect_continue_flag_fires_once() {
        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n"[..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.take_expect_continue());
        assert!(!decoder.take_expect_continue());

        buf.extend_from_slice(b"hello");
        let request = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&request.body()[..], b"hello");
    }

    #[test]
    fn malformed_request_line_is_an_error() {
        let mut decoder = RequestDecoder::new();
        let result = decode_all(&mut decoder, b"NOT A REQUEST\r\n\r\n");
        assert!(result.is_err());
    }

    #[test]
    fn non_standard_method_is_rejected() {
        let mut decoder = RequestDecoder::new();
        let result = decode_all(&mut decoder, b"FROBNICATE / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(result, Err(ParseError::InvalidMethod)));
    }
}
