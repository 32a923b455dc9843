//! HTTP body handling module for processing request and response payloads
//!
//! This module provides functionality for encoding and decoding HTTP message
//! bodies using the two transfer strategies of HTTP/1.1: chunked transfer
//! encoding and content-length framing.
//!
//! # Components
//!
//! ## Decoders
//! - [`chunked_decoder::ChunkedDecoder`]: Handles chunked transfer encoded payloads
//! - [`length_decoder::LengthDecoder`]: Processes fixed-length payloads
//! - [`payload_decoder::PayloadDecoder`]: Coordinates the decoding strategies
//!
//! ## Encoders
//! - [`chunked_encoder::ChunkedEncoder`]: Implements chunked transfer encoding
//! - [`length_encoder::LengthEncoder`]: Handles fixed-length payload encoding
//! - [`payload_encoder::PayloadEncoder`]: Coordinates the encoding strategies

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
