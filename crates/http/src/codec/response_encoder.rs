//! HTTP response encoder module
//!
//! This module serializes complete [`Response`] values to wire bytes
//! through a two-phase encoder (head, then payload items).
//! [`ResponseEncoder::encode_response`] is the path the engines actually
//! use: it commits the response (enforcing the commit-exactly-once
//! invariant) and writes head and body in one call.
//!
//! # Components
//!
//! - [`ResponseEncoder`]: Main encoder that coordinates head and payload encoding
//! - Head encoding: Uses [`HeaderEncoder`] for status line and headers
//! - Payload handling: Uses [`PayloadEncoder`] for the response body

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadItem, PayloadSize, Response, ResponseHead, SendError};
use bytes::BytesMut;
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

/// A encoder for HTTP responses that handles both head and payload
///
/// The encoder operates in two phases:
/// 1. Head encoding: status line and headers via [`HeaderEncoder`]
/// 2. Payload encoding: body bytes via [`PayloadEncoder`]
#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    /// Creates a new `ResponseEncoder` instance
    pub fn new() -> Self {
        Default::default()
    }

    /// Commits and serializes a complete response into `dst`.
    ///
    /// This is the convenience path used by the engines: the response is
    /// committed here (so a second serialization attempt fails), then the
    /// head and the whole body are encoded back to back.
    ///
    /// # Errors
    ///
    /// Returns `SendError` if the response was already committed or if a
    /// payload encoding step fails.
    pub fn encode_response(&mut self, mut response: Response, dst: &mut BytesMut) -> Result<(), SendError> {
        response.commit()?;

        let (head, body) = response.into_parts();
        let payload_size = head.payload_size(body.len());

        self.encode(Message::Header((head, payload_size)), dst)?;
        if !body.is_empty() {
            self.encode(Message::Payload(PayloadItem::Chunk(body)), dst)?;
        }
        self.encode(Message::Payload(PayloadItem::Eof), dst)?;
        Ok(())
    }
}

impl Encoder<Message<(ResponseHead, PayloadSize)>> for ResponseEncoder {
    type Error = SendError;

    /// Attempts to encode an HTTP response message to the provided buffer
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Successfully encoded the message
    /// - `Err(_)`: Head/payload items arrived out of order, or encoding failed
    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize)>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                // If a payload encoder already exists, it's an error
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                self.payload_encoder = Some(payload_size.into());
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect response head but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let is_eof = payload_item.is_eof();
                let result = payload_encoder.encode(payload_item, dst);

                // the encoder is done once it saw EOF or wrote all declared bytes
                if is_eof || payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use http::{header, HeaderValue, StatusCode};

    #[test]
    fn encodes_full_response_with_content_length() {
        let response = Response::ok().with_body("hello");
        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode_response(response, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn encodes_chunked_response() {
        let response = Response::ok()
            .with_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
            .with_body("hello world");
        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode_response(response, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("B\r\nhello world\r\n0\r\n\r\n"));
    }

    #[test]
    fn committed_response_cannot_be_encoded_again() {
        let mut response = Response::new(StatusCode::NO_CONTENT);
        response.commit().unwrap();

        let mut dst = BytesMut::new();
        let result = ResponseEncoder::new().encode_response(response, &mut dst);
        assert!(matches!(result, Err(SendError::State { .. })));
        assert!(dst.is_empty());
    }

    #[test]
    fn encoder_resets_between_responses() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode_response(Response::ok().with_body("one"), &mut dst).unwrap();
        encoder.encode_response(Response::ok().with_body("two"), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }
}
