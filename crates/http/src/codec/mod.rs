//! HTTP codec module for encoding and decoding HTTP messages
//!
//! This module provides the incremental, per-connection HTTP/1.1 machinery
//! shared by all three engines. It uses a state machine pattern to handle
//! both heads and payload data over partial reads.
//!
//! # Architecture
//!
//! - Request handling:
//!   - [`RequestDecoder`]: Decodes incoming HTTP requests incrementally
//!   - Head parsing via the [`header`] module
//!   - Payload decoding via the [`body`] module
//!
//! - Response handling:
//!   - [`ResponseEncoder`]: Encodes outgoing HTTP responses
//!   - Head encoding via the [`header`] module
//!   - Payload encoding via the [`body`] module
//!
//! The decoder and encoder implement the sans-io `tokio_util::codec` traits
//! over `BytesMut`, so the same state machines are driven by a mio reactor
//! (HRP, STEL) and by a blocking read loop (TPC).
//!
//! # Example
//!
//! ```no_run
//! use troika_http::codec::{RequestDecoder, ResponseEncoder};
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! // Decode incoming request
//! let mut decoder = RequestDecoder::new();
//! let mut request_buffer = BytesMut::new();
//! let request = decoder.decode(&mut request_buffer);
//!
//! // Encode outgoing response
//! let mut encoder = ResponseEncoder::new();
//! let mut response_buffer = BytesMut::new();
//! // ... encode response ...
//! ```

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
