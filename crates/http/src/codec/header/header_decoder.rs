//! HTTP header decoder implementation for parsing HTTP request heads
//!
//! This module decodes the request line and header section of an HTTP/1.1
//! request from raw bytes into a structured [`RequestHeader`], and selects
//! the payload strategy for the body that follows.
//!
//! # Implementation Details
//!
//! The decoder works in multiple stages:
//!
//! 1. Discard empty lines preceding the request line
//! 2. Parse raw bytes using `httparse`
//! 3. Record header name/value byte ranges
//! 4. Convert to a typed [`RequestHeader`]
//! 5. Determine the payload size from the framing headers
//!
//! The implementation uses an index-based approach to avoid copying header
//! data, recording the byte ranges of header names and values for efficient
//! conversion to the final header structure. Bare-LF line terminators are
//! accepted leniently (httparse tolerates them), matching common client
//! behavior.

use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;

use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
const MAX_HEADER_NUM: usize = 100;

/// Maximum size in bytes allowed for the request line alone
const MAX_REQUEST_LINE_BYTES: usize = 8 * 1024;

/// Default ceiling for the entire header section
pub(crate) const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
///
/// Parses raw bytes into a structured [`RequestHeader`] and determines the
/// appropriate [`PayloadSize`] based on the Content-Length and
/// Transfer-Encoding headers.
#[derive(Debug, Clone)]
pub struct HeaderDecoder {
    max_header_bytes: usize,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self { max_header_bytes: DEFAULT_MAX_HEADER_BYTES }
    }
}

impl HeaderDecoder {
    /// Creates a decoder with a custom header-section ceiling.
    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    /// Attempts to decode an HTTP request head from the provided buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((header, payload_size)))` if a complete head was parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if parsing failed
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - The request line exceeds 8 KiB
    /// - The number of headers exceeds the maximum
    /// - The total header size exceeds the configured ceiling
    /// - The HTTP version is not supported
    /// - Headers contain invalid characters
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A peer is allowed to send empty lines before the request line;
        // discard them so they don't confuse httparse.
        discard_leading_empty_lines(src);

        if src.is_empty() {
            return Ok(None);
        }

        let mut req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] = [const { MaybeUninit::uninit() }; MAX_HEADER_NUM];

        let parsed_result = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed_result? {
            Status::Complete(head_size) => {
                trace!(head_size, "parsed request head");
                ensure!(head_size <= self.max_header_bytes, ParseError::too_large_header(head_size, self.max_header_bytes));

                let header_count = req.headers.len();
                ensure!(header_count <= MAX_HEADER_NUM, ParseError::too_many_headers(header_count));

                // Record byte range indices for each header before the
                // borrow of `src` ends.
                let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = [HeaderIndex::EMPTY; MAX_HEADER_NUM];
                HeaderIndex::record(src, req.headers, &mut header_index);

                let version = match req.version {
                    Some(0) => http::Version::HTTP_10,
                    Some(1) => http::Version::HTTP_11,
                    // HTTP/2 and HTTP/3 are out of scope
                    _ => return Err(ParseError::InvalidVersion(req.version)),
                };

                let mut header_builder = Request::builder()
                    .method(req.method.ok_or(ParseError::InvalidMethod)?)
                    .uri(req.path.ok_or(ParseError::InvalidUri)?)
                    .version(version);

                let headers = header_builder.headers_mut().ok_or(ParseError::InvalidUri)?;
                headers.reserve(header_count);

                // Consume the head portion, then build each header from the
                // recorded ranges over the frozen bytes.
                let header_bytes = src.split_to(head_size).freeze();
                for index in &header_index[..header_count] {
                    let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1])
                        .map_err(|e| ParseError::invalid_header(e.to_string()))?;

                    // httparse has verified the value contains only visible
                    // ASCII, so the unchecked conversion cannot produce an
                    // invalid HeaderValue.
                    let value = unsafe { HeaderValue::from_maybe_shared_unchecked(header_bytes.slice(index.value.0..index.value.1)) };

                    headers.append(name, value);
                }

                let header = RequestHeader::from(
                    header_builder.body(()).map_err(|e| ParseError::invalid_header(e.to_string()))?.into_parts().0,
                );
                let payload_size = parse_payload(&header)?;

                Ok(Some((header, payload_size)))
            }
            Status::Partial => {
                ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
                // The request line must terminate within its own limit even
                // while the head as a whole is still incomplete.
                if src.len() > MAX_REQUEST_LINE_BYTES && !src[..MAX_REQUEST_LINE_BYTES].contains(&b'\n') {
                    return Err(ParseError::too_long_request_line(MAX_REQUEST_LINE_BYTES));
                }
                Ok(None)
            }
        }
    }
}

fn discard_leading_empty_lines(src: &mut BytesMut) {
    loop {
        if src.starts_with(b"\r\n") {
            let _ = src.split_to(2);
        } else if src.starts_with(b"\n") {
            let _ = src.split_to(1);
        } else if src.len() == 1 && src[0] == b'\r' {
            // lone CR: wait for the next byte before deciding
            return;
        } else {
            return;
        }
    }
}

/// Stores the byte range positions of a header's name and value within the original buffer.
///
/// Used internally to perform zero-copy parsing of headers by recording the
/// positions of header names and values rather than copying the data.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    const EMPTY: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

    /// Records the byte positions of header names and values from the parsed headers.
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Determines the payload strategy from the framing headers.
///
/// Precedence per RFC 7230 section 3.3, with the both-present conflict
/// resolved in favor of `Transfer-Encoding` (the Content-Length is then
/// ignored rather than treated as a protocol error).
///
/// # Errors
///
/// Returns `ParseError` if the Content-Length value is not a valid
/// non-negative integer.
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = header.headers().get(http::header::CONTENT_LENGTH);

    if is_chunked(te_header) {
        return Ok(PayloadSize::Chunked);
    }

    match cl_header {
        Some(cl_value) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;

            let length =
                cl_str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

            if length == 0 {
                Ok(PayloadSize::Empty)
            } else {
                Ok(PayloadSize::Length(length))
            }
        }
        None => Ok(PayloadSize::Empty),
    }
}

/// Checks if the Transfer-Encoding header indicates chunked encoding.
///
/// According to RFC 7230, chunked must be the last encoding if present.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value {
        if let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next() {
            return bytes.trim_ascii() == CHUNKED;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Version};
    use indoc::indoc;

    #[test]
    fn check_is_chunked() {
        {
            let headers = HeaderMap::new();
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)))
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "gzip, chunked".parse().unwrap());
            assert!(is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "chunked, gzip".parse().unwrap());
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }
    }

    #[test]
    fn consumes_exactly_the_head() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        123"##};

        let mut bytes = BytesMut::from(str);
        let result = HeaderDecoder::default().decode(&mut bytes).unwrap();

        assert!(result.is_some());
        assert_eq!(&bytes[..], &b"123"[..]);
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let mut buf = BytesMut::from(str);

        let (header, payload_size) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();

        assert!(payload_size.is_empty());

        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.uri().path(), "/index.html");
        assert_eq!(header.headers().len(), 3);
        assert_eq!(header.headers().get(http::header::HOST), Some(&HeaderValue::from_static("127.0.0.1:8080")));
    }

    #[test]
    fn discards_leading_empty_lines() {
        let mut buf = BytesMut::from("\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let (header, payload_size) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();

        assert!(payload_size.is_empty());
        assert_eq!(header.uri().path(), "/");
    }

    #[test]
    fn needs_more_on_partial_head() {
        let mut buf = BytesMut::from("GET /index.html HTTP/1.1\r\nHost: 127.");
        assert!(HeaderDecoder::default().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn content_length_selects_length_payload() {
        let mut buf = BytesMut::from("POST /upload HTTP/1.1\r\nContent-Length: 11\r\n\r\n");
        let (_, payload_size) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Length(11));
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut buf = BytesMut::from("POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n");
        let (_, payload_size) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Chunked);
    }

    #[test]
    fn rejects_non_numeric_content_length() {
        let mut buf = BytesMut::from("POST /upload HTTP/1.1\r\nContent-Length: abc\r\n\r\n");
        let result = HeaderDecoder::default().decode(&mut buf);
        assert!(matches!(result, Err(ParseError::InvalidContentLength { .. })));
    }

    #[test]
    fn rejects_negative_content_length() {
        let mut buf = BytesMut::from("POST /upload HTTP/1.1\r\nContent-Length: -1\r\n\r\n");
        let result = HeaderDecoder::default().decode(&mut buf);
        assert!(matches!(result, Err(ParseError::InvalidContentLength { .. })));
    }

    #[test]
    fn rejects_oversized_head() {
        let mut decoder = HeaderDecoder::with_max_header_bytes(128);
        let mut buf = BytesMut::from("GET / HTTP/1.1\r\n");
        buf.extend_from_slice("X-Filler: ".as_bytes());
        buf.extend_from_slice(&vec![b'a'; 256]);
        let result = decoder.decode(&mut buf);
        assert!(matches!(result, Err(ParseError::TooLargeHeader { .. })));
    }

    #[test]
    fn rejects_unterminated_request_line() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET /");
        buf.extend_from_slice(&vec![b'a'; MAX_REQUEST_LINE_BYTES]);
        let result = HeaderDecoder::default().decode(&mut buf);
        assert!(matches!(result, Err(ParseError::TooLongRequestLine { .. })));
    }

    #[test]
    fn bare_lf_line_endings_are_accepted() {
        let mut buf = BytesMut::from("GET /lf HTTP/1.1\nHost: x\n\n");
        let (header, payload_size) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert!(payload_size.is_empty());
        assert_eq!(header.uri().path(), "/lf");
    }
}
