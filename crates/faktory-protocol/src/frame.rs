//! Inbound reply frames and the buffering decoder.
//!
//! Replies follow RESP-style framing: `+inline\r\n`, `-error\r\n`,
//! `$len\r\n<bytes>\r\n`, and the null bulk `$-1\r\n`.  On top of the
//! framing, two payload shapes are recognized by prefix:
//!
//! 1. an inline line starting with `HI ` is the server greeting,
//! 2. a line starting with `{` is a bulk JSON object even without a
//!    length prefix (older servers emit these).
//!
//! The decoder buffers partial reads internally and emits a frame only once
//! it is complete on the wire.

use crate::handshake::Greeting;

/// A single decoded server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple status line, e.g. `OK` or `PONG`.
    Inline(String),
    /// Length-prefixed bulk string whose body is JSON.
    Bulk(serde_json::Value),
    /// The `HI {...}` greeting sent once per connection.
    Hello(Greeting),
    /// Null bulk (`$-1`): the server has nothing for us.
    Empty,
    /// Protocol-level error reply (`-message`).  Distinct from a decode
    /// failure: the server produced this frame deliberately.
    Error(String),
}

/// Decoder failure.
///
/// The two variants differ in what they mean for the session:
/// [`DecodeError::Framing`] means the frame boundary itself could not be
/// determined and the byte stream is unusable; [`DecodeError::Payload`]
/// means a correctly delimited frame carried an unparseable body — the
/// frame has been consumed and later frames decode normally.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Framing(String),
    #[error("invalid frame payload: {0}")]
    Payload(String),
}

impl DecodeError {
    /// Whether the stream remains aligned after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Payload(_))
    }
}

/// Buffering frame decoder.
///
/// Feed raw socket bytes with [`FrameDecoder::feed`], then drain completed
/// frames with [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from the socket to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, or `Ok(None)` if more bytes are
    /// needed.  On [`DecodeError::Payload`] the offending frame has been
    /// consumed; on [`DecodeError::Framing`] the buffer contents are
    /// unspecified and the connection should be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            return Ok(None);
        };

        match self.buf.first().copied() {
            Some(b'$') => self.decode_bulk(line_end),
            Some(b'+') => {
                let text = self.consume_line(1, line_end)?;
                match text.strip_prefix("HI ") {
                    Some(body) => parse_greeting(body).map(|g| Some(Frame::Hello(g))),
                    None => Ok(Some(Frame::Inline(text))),
                }
            }
            Some(b'-') => {
                let text = self.consume_line(1, line_end)?;
                Ok(Some(Frame::Error(text)))
            }
            Some(b'{') => {
                // Unprefixed JSON line: treat the whole line as a bulk body.
                let text = self.consume_line(0, line_end)?;
                match serde_json::from_str(&text) {
                    Ok(value) => Ok(Some(Frame::Bulk(value))),
                    Err(e) => Err(DecodeError::Payload(e.to_string())),
                }
            }
            Some(_) => {
                let text = self.consume_line(0, line_end)?;
                match text.strip_prefix("HI ") {
                    Some(body) => parse_greeting(body).map(|g| Some(Frame::Hello(g))),
                    None => Ok(Some(Frame::Inline(text))),
                }
            }
            None => Ok(None),
        }
    }

    /// Decode a `$len` bulk frame whose length line ends at `line_end`.
    fn decode_bulk(&mut self, line_end: usize) -> Result<Option<Frame>, DecodeError> {
        let len_text = std::str::from_utf8(&self.buf[1..line_end])
            .map_err(|_| DecodeError::Framing("non-UTF-8 bulk length".to_owned()))?;
        let len: i64 = len_text
            .parse()
            .map_err(|_| DecodeError::Framing(format!("bad bulk length '{len_text}'")))?;

        if len < 0 {
            if len != -1 {
                return Err(DecodeError::Framing(format!("bad bulk length {len}")));
            }
            self.buf.drain(..line_end + 2);
            return Ok(Some(Frame::Empty));
        }

        let len = usize::try_from(len)
            .map_err(|_| DecodeError::Framing(format!("oversized bulk length {len}")))?;
        let body_start = line_end + 2;
        let total = body_start + len + 2;
        if self.buf.len() < total {
            return Ok(None);
        }
        if &self.buf[body_start + len..total] != b"\r\n" {
            return Err(DecodeError::Framing("bulk body not CRLF-terminated".to_owned()));
        }

        let parsed = std::str::from_utf8(&self.buf[body_start..body_start + len])
            .map_err(|e| DecodeError::Payload(e.to_string()))
            .and_then(|text| {
                serde_json::from_str(text).map_err(|e| DecodeError::Payload(e.to_string()))
            });
        self.buf.drain(..total);
        Ok(Some(Frame::Bulk(parsed?)))
    }

    /// Take the current line as UTF-8 text, skipping `skip` prefix bytes,
    /// and consume it (including the CRLF) from the buffer.
    fn consume_line(&mut self, skip: usize, line_end: usize) -> Result<String, DecodeError> {
        let text = std::str::from_utf8(&self.buf[skip..line_end])
            .map(str::to_owned)
            .map_err(|e| DecodeError::Payload(e.to_string()));
        self.buf.drain(..line_end + 2);
        text
    }
}

/// Position of the first CRLF, i.e. the length of the first line.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_greeting(body: &str) -> Result<Greeting, DecodeError> {
    serde_json::from_str(body).map_err(|e| DecodeError::Payload(e.to_string()))
}
