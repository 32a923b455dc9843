//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module provides functionality to decode HTTP messages that use chunked transfer encoding
//! as specified in [RFC 7230 Section 4.1](https://tools.ietf.org/html/rfc7230#section-4.1).
//!
//! The decoder is line-oriented: chunk framing (the hex size line, the
//! terminator after each chunk's data, and the trailer section) is consumed
//! one line at a time, while chunk data itself is taken in bulk. Bare-LF
//! line endings are accepted for the framing lines, matching the leniency
//! of the header decoder. Framing violations surface as [`ParseError`]
//! values directly.

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Ceiling for one size line, chunk extensions included.
const MAX_SIZE_LINE_BYTES: usize = 1024;

/// Ceiling for one trailer line.
const MAX_TRAILER_LINE_BYTES: usize = 8 * 1024;

/// A decoder for handling HTTP chunked transfer encoding.
///
/// Wire format per chunk: a hexadecimal size line (optionally followed by
/// `;extension` data, which is ignored), the chunk bytes, and a CRLF. A
/// zero-sized chunk ends the message, followed by optional trailer lines
/// and a final empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Expecting the hex size line of the next chunk.
    SizeLine,
    /// Delivering chunk bytes; `remaining` still owed by the peer.
    Data { remaining: u64 },
    /// Expecting the line break that closes a chunk's data.
    DataEnd,
    /// Consuming trailer lines after the zero-sized chunk.
    Trailers,
    /// The terminal chunk and trailers have been consumed.
    Done,
}

impl ChunkedDecoder {
    /// Creates a new ChunkedDecoder, ready to read the first chunk size.
    pub fn new() -> Self {
        Self { state: ChunkedState::SizeLine }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(PayloadItem::Chunk(bytes)))` when chunk data is available
    ///   (partial chunks are surfaced as soon as their bytes arrive)
    /// - `Ok(Some(PayloadItem::Eof))` once the final chunk and trailers are
    ///   consumed
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked framing is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ChunkedState::SizeLine => {
                    let Some(line) = take_line(src, MAX_SIZE_LINE_BYTES)? else {
                        return Ok(None);
                    };
                    let size = parse_size_line(&line)?;
                    trace!(size, "read chunk size line");
                    self.state = if size == 0 { ChunkedState::Trailers } else { ChunkedState::Data { remaining: size } };
                }

                ChunkedState::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    // take what is buffered, capped at the chunk's remainder
                    let take = src.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let bytes = src.split_to(take).freeze();

                    let left = remaining - take as u64;
                    self.state = if left == 0 { ChunkedState::DataEnd } else { ChunkedState::Data { remaining: left } };

                    trace!(len = bytes.len(), "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                ChunkedState::DataEnd => {
                    // only CRLF (or a bare LF) may follow a chunk's data
                    match src.first() {
                        None => return Ok(None),
                        Some(b'\n') => {
                            src.advance(1);
                            self.state = ChunkedState::SizeLine;
                        }
                        Some(b'\r') => {
                            if src.len() < 2 {
                                return Ok(None);
                            }
                            ensure!(src[1] == b'\n', ParseError::invalid_body("chunk data not terminated by CRLF"));
                            src.advance(2);
                            self.state = ChunkedState::SizeLine;
                        }
                        Some(_) => return Err(ParseError::invalid_body("chunk data not terminated by CRLF")),
                    }
                }

                ChunkedState::Trailers => {
                    let Some(line) = take_line(src, MAX_TRAILER_LINE_BYTES)? else {
                        return Ok(None);
                    };
                    // trailer fields are consumed and ignored; the empty
                    // line ends the message
                    if line.is_empty() {
                        trace!("finished reading chunked data");
                        self.state = ChunkedState::Done;
                    }
                }

                ChunkedState::Done => return Ok(Some(PayloadItem::Eof)),
            }
        }
    }
}

/// Takes one framing line off the buffer, without its terminator.
///
/// Returns `Ok(None)` while the line is incomplete; a line that exceeds
/// `max` bytes before its LF arrives is rejected so a hostile peer cannot
/// grow the buffer without bound.
fn take_line(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>, ParseError> {
    match src.iter().position(|&b| b == b'\n') {
        Some(at) => {
            let mut line = src.split_to(at + 1);
            line.truncate(at);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            Ok(Some(line.freeze()))
        }
        None => {
            ensure!(src.len() <= max, ParseError::invalid_body("chunk framing line too long"));
            Ok(None)
        }
    }
}

/// Parses the hexadecimal chunk size from a size line.
///
/// Extensions after the first `;` are ignored, as is linear whitespace
/// between the digits and the `;` or line end. No digits, a non-hex digit,
/// or a size overflowing `u64` are framing errors.
fn parse_size_line(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(at) => &line[..at],
        None => line,
    };
    let digits = digits.trim_ascii_end();

    ensure!(!digits.is_empty(), ParseError::invalid_body("empty chunk size line"));

    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_body(format!("invalid chunk size byte {:?}", b as char))),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflows u64"))?;
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_then_eof() {
        let mut buffer: BytesMut = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(item.is_chunk());
        assert_eq!(&item.as_bytes().unwrap()[..], b"1234567890abcdef");

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(item.is_eof());
    }

    #[test]
    fn multiple_chunks() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b", world");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn chunks_with_extensions() {
        let mut buffer: BytesMut = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn size_line_tolerates_trailing_whitespace() {
        let mut buffer: BytesMut = BytesMut::from(&b"5 \t\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn chunks_with_trailers() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n0\r\nTrailer: value\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn bare_lf_framing_is_accepted() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\nhello\n0\n\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn incomplete_chunk_resumes() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = ChunkedDecoder::new();

        // partial data is surfaced as a chunk immediately
        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hel");

        buffer.extend_from_slice(b"lo\r\n0\r\n\r\n");

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"lo");

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn invalid_chunk_size_is_rejected() {
        let mut buffer: BytesMut = BytesMut::from(&b"xyz\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn overflowing_chunk_size_is_rejected() {
        let mut buffer: BytesMut = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn unterminated_size_line_is_bounded() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&vec![b'1'; MAX_SIZE_LINE_BYTES + 1]);
        let mut decoder = ChunkedDecoder::new();

        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn missing_crlf_is_rejected() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.as_bytes().unwrap()[..], b"hello");

        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn zero_size_chunk_is_eof() {
        let mut buffer: BytesMut = BytesMut::from(&b"0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }
}
