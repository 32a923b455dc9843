//! HTTP header encoder implementation for serializing HTTP response heads
//!
//! This module serializes the status line and header section of an HTTP/1.1
//! response, managing the content-length or transfer-encoding framing header
//! according to the payload size so that every emitted response carries
//! exactly one of the two.

use crate::protocol::{PayloadSize, ResponseHead, SendError};

use bytes::{BufMut, BytesMut};

use http::{header, HeaderValue};
use std::io;
use std::io::Write;

use tokio_util::codec::Encoder;

/// Initial buffer size reserved for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
///
/// This encoder serializes a [`ResponseHead`] and [`PayloadSize`] into raw
/// bytes, setting the Content-Length or Transfer-Encoding header based on
/// the payload size.
#[derive(Debug, Default)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    /// Encodes an HTTP response head into the provided bytes buffer.
    ///
    /// The status line always advertises HTTP/1.1; responding 1.1 to a 1.0
    /// peer is permitted and keep-alive defaults are decided per request
    /// version by the engine.
    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        write!(
            FastWrite(dst),
            "HTTP/1.1 {} {}\r\n",
            head.status().as_str(),
            head.status().canonical_reason().unwrap_or("Unknown")
        )
        .map_err(SendError::io)?;

        // Set the one framing header this response will carry
        match payload_size {
            PayloadSize::Length(n) => {
                head.headers_mut().insert(header::CONTENT_LENGTH, n.into());
            }
            PayloadSize::Chunked => {
                head.headers_mut().insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            PayloadSize::Empty => {
                const ZERO_VALUE: HeaderValue = HeaderValue::from_static("0");
                head.headers_mut().insert(header::CONTENT_LENGTH, ZERO_VALUE);
            }
        }

        for (header_name, header_value) in head.headers().iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Fast writer implementation for writing to BytesMut.
///
/// Avoids an intermediate allocation when formatting the status line into
/// the already-reserved buffer.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use http::StatusCode;

    #[test]
    fn writes_status_line_and_content_length() {
        let (head, body) = Response::ok().with_body("hello").into_parts();
        let payload_size = head.payload_size(body.len());

        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn empty_body_still_carries_content_length_zero() {
        let (head, body) = Response::new(StatusCode::NOT_FOUND).into_parts();
        let payload_size = head.payload_size(body.len());

        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }

    #[test]
    fn chunked_framing_replaces_content_length() {
        let response = Response::ok()
            .with_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
            .with_body("hello");
        let (head, body) = response.into_parts();
        let payload_size = head.payload_size(body.len());

        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(!text.contains("content-length"));
    }
}
