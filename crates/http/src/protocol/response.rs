//! HTTP response handling implementation.
//!
//! [`Response`] is the value handlers produce: a status code, headers and a
//! body, plus a commit-once flag. A response is committed exactly once per
//! request, just before serialization; any mutation attempted afterwards
//! fails with [`ResponseError::Committed`]. [`ResponseHead`] is the head
//! portion the encoder consumes once the body has been split off.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::protocol::{PayloadSize, ResponseError};

/// An HTTP response produced by a handler.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    committed: bool,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Bytes::new(), committed: false }
    }

    /// Creates an empty `200 OK` response.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Sets the body during construction.
    ///
    /// Has no effect once the response is committed.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        if !self.committed {
            self.body = body.into();
        }
        self
    }

    /// Adds a header during construction.
    ///
    /// Has no effect once the response is committed.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if !self.committed {
            self.headers.insert(name, value);
        }
        self
    }

    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns true once the response has been committed.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Replaces the status.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::Committed`] after the commit.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.ensure_uncommitted()?;
        self.status = status;
        Ok(())
    }

    /// Returns mutable access to the headers.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::Committed`] after the commit.
    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, ResponseError> {
        self.ensure_uncommitted()?;
        Ok(&mut self.headers)
    }

    /// Replaces the body.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::Committed`] after the commit.
    pub fn set_body(&mut self, body: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.ensure_uncommitted()?;
        self.body = body.into();
        Ok(())
    }

    /// Marks the response committed.
    ///
    /// Called by the serialization path exactly once per request.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::Committed`] on a second commit.
    pub fn commit(&mut self) -> Result<(), ResponseError> {
        self.ensure_uncommitted()?;
        self.committed = true;
        Ok(())
    }

    /// Splits the response into its head and body for encoding.
    pub fn into_parts(self) -> (ResponseHead, Bytes) {
        let head = ResponseHead { status: self.status, headers: self.headers };
        (head, self.body)
    }

    fn ensure_uncommitted(&self) -> Result<(), ResponseError> {
        if self.committed {
            return Err(ResponseError::Committed);
        }
        Ok(())
    }
}

/// The head portion of a response, consumed by the header encoder.
#[derive(Debug)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Determines the wire framing for a body of `body_len` bytes.
    ///
    /// An explicit `Transfer-Encoding: chunked` header selects chunked
    /// framing; everything else is emitted with a `Content-Length`
    /// (zero-length bodies included, so every response carries exactly one
    /// framing header).
    pub fn payload_size(&self, body_len: usize) -> PayloadSize {
        let chunked = self
            .headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false);

        if chunked {
            PayloadSize::Chunked
        } else if body_len == 0 {
            PayloadSize::Empty
        } else {
            PayloadSize::Length(body_len as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_fail_after_commit() {
        let mut response = Response::ok().with_body("hello");
        response.commit().unwrap();

        assert!(response.is_committed());
        assert_eq!(response.set_status(StatusCode::NOT_FOUND), Err(ResponseError::Committed));
        assert_eq!(response.set_body("other"), Err(ResponseError::Committed));
        assert!(response.headers_mut().is_err());
        assert_eq!(response.commit(), Err(ResponseError::Committed));

        // the committed state is intact
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&response.body()[..], b"hello");
    }

    #[test]
    fn payload_size_prefers_explicit_chunked() {
        let response = Response::ok()
            .with_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
            .with_body("hello");
        let (head, body) = response.into_parts();
        assert_eq!(head.payload_size(body.len()), PayloadSize::Chunked);
    }

    #[test]
    fn payload_size_uses_length_otherwise() {
        let (head, body) = Response::ok().with_body("hello").into_parts();
        assert_eq!(head.payload_size(body.len()), PayloadSize::Length(5));

        let (head, body) = Response::new(StatusCode::NO_CONTENT).into_parts();
        assert_eq!(head.payload_size(body.len()), PayloadSize::Empty);
    }
}
