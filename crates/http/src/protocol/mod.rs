//! Core HTTP protocol abstractions shared by the three engines.
//!
//! This module provides the fundamental building blocks for HTTP protocol
//! handling: the request/response data model, the streaming message types
//! used by the codec layer, and the error hierarchy.
//!
//! # Architecture
//!
//! - **Message Handling** ([`message`]): codec-facing message types
//!   - [`Message`]: Represents either headers or payload chunks
//!   - [`PayloadItem`]: Handles individual payload chunks and EOF
//!   - [`PayloadSize`]: Tracks payload size information
//!
//! - **Request Processing** ([`request`]): the fully-parsed request value
//!   - [`RequestHeader`]: head portion as produced by the header decoder
//!   - [`Request`]: complete request with decoded path, query parameters,
//!     body bytes, router-populated path parameters and an attribute bag
//!
//! - **Response Processing** ([`response`]): the response value
//!   - [`Response`]: status, headers and body with a commit-once flag
//!   - [`ResponseHead`]: head portion consumed by the response encoder
//!
//! - **Error Handling** ([`error`]): comprehensive error types
//!   - [`HttpError`]: top-level error type
//!   - [`ParseError`]: request parsing errors
//!   - [`SendError`]: response sending errors

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::Request;
pub use request::RequestHeader;

mod response;
pub use response::Response;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::ResponseError;
pub use error::SendError;
