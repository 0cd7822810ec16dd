//! LSP Message Framing
//!
//! Every message on the wire is a header block followed by the payload:
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! {"jsonrpc":"2.0",...}
//! ```
//!
//! Encoding is stateless. Decoding keeps a buffer of bytes that do not yet form
//! a complete frame, so chunks split at arbitrary byte boundaries can be fed in
//! as they arrive.

use std::fmt::Write as _;
use std::iter::FusedIterator;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const LINE_ENDING: &str = "\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Frame a payload. The header carries the byte length, not the character count.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 32);
    encode_into(payload, &mut frame);
    frame.freeze()
}

/// Append a framed payload to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) {
    // fmt::Write for BytesMut never fails
    let _ = write!(dst, "{}: {}\r\n\r\n", CONTENT_LENGTH, payload.len());
    dst.put_slice(payload);
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Looking for the header terminator; `scanned` bytes are known not to contain it.
    Header { scanned: usize },
    /// Header consumed, waiting for `length` payload bytes.
    Body { length: usize },
}

/// Incremental decoder for a Content-Length framed byte stream.
///
/// A decoder is long-lived: feed it every chunk read from the stream, in order.
/// A framing error is terminal, after which the decoder discards all input.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_payload: Option<usize>,
    failure: Option<FramingError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Header { scanned: 0 },
            max_payload: None,
            failure: None,
        }
    }

    /// Reject frames whose declared length exceeds `limit` bytes. Zero disables the limit.
    pub fn with_max_payload(limit: usize) -> Self {
        Self {
            max_payload: (limit > 0).then_some(limit),
            ..Self::new()
        }
    }

    /// Append `chunk` and return the payloads that are now complete.
    ///
    /// The returned iterator is lazy: frames are cut from the buffer only as it
    /// is advanced. Frames left behind when the iterator is dropped early stay
    /// buffered and are yielded by the next call, including `feed(&[])`.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        if self.failure.is_none() {
            self.buffer.extend_from_slice(chunk);
        }
        Frames { decoder: self }
    }

    /// Number of buffered bytes not yet returned as a payload.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn failure(&self) -> Option<&FramingError> {
        self.failure.as_ref()
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        loop {
            match self.state {
                State::Header { scanned } => {
                    // The terminator may straddle the previous scan boundary
                    let start = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
                    let Some(offset) = find_terminator(&self.buffer[start..]) else {
                        self.state = State::Header {
                            scanned: self.buffer.len(),
                        };
                        return Ok(None);
                    };

                    let header_end = start + offset;
                    let length = parse_content_length(&self.buffer[..header_end])?;
                    if let Some(limit) = self.max_payload
                        && length > limit
                    {
                        return Err(FramingError::PayloadTooLarge { length, limit });
                    }

                    self.buffer.advance(header_end + HEADER_TERMINATOR.len());
                    self.state = State::Body { length };
                }
                State::Body { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(length).freeze();
                    self.state = State::Header { scanned: 0 };
                    return Ok(Some(payload));
                }
            }
        }
    }

    fn fail(&mut self, err: FramingError) {
        tracing::error!("Frame decoder failed: {}", err);
        self.buffer.clear();
        self.failure = Some(err);
    }
}

/// Payloads completed by one [`FrameDecoder::feed`] call.
///
/// Yields `Err` at most once, for the frame that broke the stream; nothing
/// follows it.
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.decoder.failure.is_some() {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(payload)) => {
                tracing::trace!("Decoded frame of {} bytes", payload.len());
                Some(Ok(payload))
            }
            Ok(None) => None,
            Err(err) => {
                self.decoder.fail(err.clone());
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for Frames<'_> {}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract Content-Length from a header block. Other headers are ignored.
fn parse_content_length(block: &[u8]) -> Result<usize, FramingError> {
    if !block.is_ascii() {
        return Err(FramingError::InvalidHeader);
    }
    let text = std::str::from_utf8(block).map_err(|_| FramingError::InvalidHeader)?;

    let mut content_length = None;
    for line in text.split(LINE_ENDING) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            let length = value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
            content_length = Some(length);
        }
    }

    content_length.ok_or(FramingError::MissingContentLength)
}
