//! HTTP request handling implementation.
//!
//! This module provides the request side of the data model. [`RequestHeader`]
//! wraps the head portion produced by the header decoder; [`Request`] is the
//! complete value delivered to the router once the body has been read,
//! carrying the decoded path, insertion-ordered query parameters, the body
//! bytes, and the two mutable bags a request accumulates during its
//! lifecycle (path parameters and attributes).

use std::any::Any;
use std::collections::HashMap;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method, Request as HttpRequest, Uri, Version};
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use crate::protocol::ParseError;

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Conversion from different request formats
/// - Request metadata inspection
#[derive(Debug)]
pub struct RequestHeader {
    inner: HttpRequest<()>,
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> HttpRequest<()> {
        self.inner
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: HttpRequest::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<HttpRequest<()>> for RequestHeader {
    #[inline]
    fn from(inner: HttpRequest<()>) -> Self {
        Self { inner }
    }
}

/// A fully-parsed HTTP request.
///
/// Created by the request decoder once the head and the complete body have
/// been read. After construction the method, path, query, headers and body
/// are immutable; path parameters and attributes are mutable for the
/// duration of a single request's lifecycle (the router binds path
/// parameters, middlewares communicate through attributes).
pub struct Request {
    method: Method,
    version: Version,
    path: String,
    raw_query: Option<String>,
    query_params: IndexMap<String, Vec<String>>,
    headers: HeaderMap,
    body: Bytes,
    path_params: HashMap<String, String>,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("version", &self.version)
            .field("path", &self.path)
            .field("raw_query", &self.raw_query)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("path_params", &self.path_params)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Assembles a request from a decoded header and its body bytes.
    ///
    /// Decodes the percent-encoding of the path and parses the query string
    /// into insertion-ordered name/value lists.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - The method is not one of the standard verbs
    /// - The path contains invalid percent-encoding or non-UTF-8 bytes
    /// - The query string cannot be decoded
    pub fn from_header(header: RequestHeader, body: Bytes) -> Result<Self, ParseError> {
        let (parts, ()) = header.into_inner().into_parts();

        ensure_standard_method(&parts.method)?;

        let path = percent_decode_str(parts.uri.path())
            .decode_utf8()
            .map_err(|_| ParseError::InvalidUri)?
            .into_owned();

        let raw_query = parts.uri.query().map(str::to_owned);
        let query_params = match raw_query.as_deref() {
            Some(query) => parse_query(query)?,
            None => IndexMap::new(),
        };

        Ok(Self {
            method: parts.method,
            version: parts.version,
            path,
            raw_query,
            query_params,
            headers: parts.headers,
            body,
            path_params: HashMap::new(),
            attributes: HashMap::new(),
        })
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the HTTP version the request was made with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw, undecoded query string if one was present.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Returns the parsed query parameters in insertion order.
    pub fn query_params(&self) -> &IndexMap<String, Vec<String>> {
        &self.query_params
    }

    /// Returns the first value of the named query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).and_then(|values| values.first()).map(String::as_str)
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the path parameters bound by the router.
    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    /// Returns the value of the named path parameter.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Replaces the path parameter bindings; called by the router on match.
    pub fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    /// Stores an attribute for later middleware or handler stages.
    pub fn set_attribute<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.attributes.insert(name.into(), Box::new(value));
    }

    /// Retrieves a typed attribute previously stored on this request.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.attributes.get(name).and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns true if the peer asked to keep the connection open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 closes unless `Connection: keep-alive` is explicit.
    pub fn keeps_alive(&self) -> bool {
        let connection = self.headers.get(http::header::CONNECTION).and_then(|value| value.to_str().ok());

        match self.version {
            Version::HTTP_11 => !connection_has_token(connection, "close"),
            Version::HTTP_10 => connection_has_token(connection, "keep-alive"),
            _ => false,
        }
    }

    /// Returns true if the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get(http::header::EXPECT)
            .map(|value| value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"))
            .unwrap_or(false)
    }
}

fn connection_has_token(value: Option<&str>, token: &str) -> bool {
    match value {
        Some(value) => value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)),
        None => false,
    }
}

fn ensure_standard_method(method: &Method) -> Result<(), ParseError> {
    match *method {
        Method::GET
        | Method::HEAD
        | Method::POST
        | Method::PUT
        | Method::DELETE
        | Method::OPTIONS
        | Method::PATCH
        | Method::TRACE
        | Method::CONNECT => Ok(()),
        _ => Err(ParseError::InvalidMethod),
    }
}

fn parse_query(query: &str) -> Result<IndexMap<String, Vec<String>>, ParseError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).map_err(|_| ParseError::InvalidUri)?;

    let mut params: IndexMap<String, Vec<String>> = IndexMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        params.entry(name).or_default().push(value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(method: Method, uri: &str, version: Version) -> RequestHeader {
        HttpRequest::builder().method(method).uri(uri).version(version).body(()).unwrap().into_parts().0.into()
    }

    #[test]
    fn decodes_path_and_query() {
        let header = header(Method::GET, "/users%20list/?a=1&b=2&a=3", Version::HTTP_11);
        let request = Request::from_header(header, Bytes::new()).unwrap();

        assert_eq!(request.path(), "/users list/");
        assert_eq!(request.raw_query(), Some("a=1&b=2&a=3"));
        assert_eq!(request.query_params().get("a").unwrap(), &vec!["1".to_string(), "3".to_string()]);
        assert_eq!(request.query_param("b"), Some("2"));
        assert_eq!(request.query_param("missing"), None);
    }

    #[test]
    fn query_params_preserve_insertion_order() {
        let header = header(Method::GET, "/?z=1&a=2&m=3", Version::HTTP_11);
        let request = Request::from_header(header, Bytes::new()).unwrap();

        let names: Vec<&str> = request.query_params().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let request = Request::from_header(header(Method::GET, "/", Version::HTTP_11), Bytes::new()).unwrap();
        assert!(request.keeps_alive());

        let request = Request::from_header(header(Method::GET, "/", Version::HTTP_10), Bytes::new()).unwrap();
        assert!(!request.keeps_alive());
    }

    #[test]
    fn keep_alive_honors_connection_header() {
        let head = HttpRequest::builder()
            .method(Method::GET)
            .uri("/")
            .version(Version::HTTP_11)
            .header(http::header::CONNECTION, "close")
            .body(())
            .unwrap()
            .into_parts()
            .0
            .into();
        let request = Request::from_header(head, Bytes::new()).unwrap();
        assert!(!request.keeps_alive());

        let head = HttpRequest::builder()
            .method(Method::GET)
            .uri("/")
            .version(Version::HTTP_10)
            .header(http::header::CONNECTION, "keep-alive")
            .body(())
            .unwrap()
            .into_parts()
            .0
            .into();
        let request = Request::from_header(head, Bytes::new()).unwrap();
        assert!(request.keeps_alive());
    }

    #[test]
    fn detects_expect_continue() {
        let head = HttpRequest::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(http::header::EXPECT, "100-continue")
            .body(())
            .unwrap()
            .into_parts()
            .0
            .into();
        let request = Request::from_header(head, Bytes::new()).unwrap();
        assert!(request.expects_continue());

        let request = Request::from_header(header(Method::POST, "/upload", Version::HTTP_11), Bytes::new()).unwrap();
        assert!(!request.expects_continue());
    }

    #[test]
    fn attributes_round_trip_typed_values() {
        let header = header(Method::GET, "/", Version::HTTP_11);
        let mut request = Request::from_header(header, Bytes::new()).unwrap();

        request.set_attribute("trace-id", 42u64);
        assert_eq!(request.attribute::<u64>("trace-id"), Some(&42));
        assert_eq!(request.attribute::<String>("trace-id"), None);
    }

    #[test]
    fn path_params_are_set_by_router_stage() {
        let header = header(Method::GET, "/users/42", Version::HTTP_11);
        let mut request = Request::from_header(header, Bytes::new()).unwrap();

        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        request.set_path_params(params);

        assert_eq!(request.path_param("id"), Some("42"));
    }
}
