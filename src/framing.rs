//! The LSP base-protocol framing layer.
//!
//! Messages on the wire are a block of HTTP-style headers terminated by
//! `\r\n\r\n`, followed by exactly `Content-Length` bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```
//!
//! [`FrameCodec`] implements [`Decoder`] and [`Encoder`] from `tokio_util` so
//! the byte stream halves of a connection can be wrapped in `FramedRead` /
//! `FramedWrite` and treated as a stream and sink of message payloads.
//!
//! A header block with a missing or malformed `Content-Length` is not fatal:
//! the codec logs, discards up to and including the offending block's
//! terminator, and resumes scanning for the next header block.  Only
//! unbounded garbage (no terminator within [`FrameCodec::max_header_bytes`])
//! or an absurd declared length is treated as unrecoverable.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header block terminator separating headers from payload.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The one header this protocol requires.  The LSP spec emits it with exactly
/// this casing; parsing tolerates surrounding whitespace in the value but not
/// alternate casings of the name.
const CONTENT_LENGTH: &str = "Content-Length";

/// Codec for `Content-Length`-delimited JSON-RPC frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Upper bound on the size of a header block before the input is declared
    /// unrecoverable garbage.
    max_header_bytes: usize,
    /// Upper bound on a declared payload length.
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum accepted payload length.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Parse one header block (everything before the `\r\n\r\n` terminator),
    /// returning the declared content length.
    ///
    /// Headers must be ASCII.  Unknown headers (such as `Content-Type`) are
    /// ignored.
    fn parse_content_length(header_block: &[u8]) -> Option<usize> {
        if !header_block.is_ascii() {
            return None;
        }

        // This can't fail after the ASCII check, but don't panic on it either
        let header_block = std::str::from_utf8(header_block).ok()?;

        for line in header_block.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };

            if name == CONTENT_LENGTH {
                // Tolerate leading whitespace after the colon and a stray
                // trailing `\r`; both show up in the wild.
                return value.trim_start().trim_end_matches(['\r', ' ', '\t']).parse().ok();
            }
        }

        None
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Loop so that a discarded (malformed) header block immediately
        // retries on whatever bytes follow it, rather than waiting for the
        // next read from the transport.
        loop {
            let Some(terminator) = find_subsequence(src, HEADER_TERMINATOR) else {
                // No complete header block yet.  If we've buffered more than any
                // sane header block could occupy, the stream is garbage we can't
                // resynchronize from.
                if src.len() > self.max_header_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "no header terminator found within the maximum header block size",
                    ));
                }
                return Ok(None);
            };

            let header_len = terminator + HEADER_TERMINATOR.len();

            let Some(content_length) = Self::parse_content_length(&src[..terminator]) else {
                // Missing or unparseable Content-Length.  Drop this header
                // block and rescan; the payload bytes (of unknown length) that
                // follow will be skipped as non-header garbage by the next
                // terminator search.
                tracing::warn!(
                    header_block = %String::from_utf8_lossy(&src[..terminator]),
                    "Discarding frame with missing or malformed Content-Length header"
                );
                src.advance(header_len);
                continue;
            };

            if content_length > self.max_frame_bytes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "declared Content-Length {content_length} exceeds maximum frame size \
                         {}",
                        self.max_frame_bytes
                    ),
                ));
            }

            if src.len() < header_len + content_length {
                // Payload not fully buffered.  Reserve space for the rest and
                // leave the buffer untouched; consuming nothing here is what
                // makes partial-read resumption safe.
                src.reserve(header_len + content_length - src.len());
                return Ok(None);
            }

            // Commit the whole frame at once
            src.advance(header_len);
            let payload = src.split_to(content_length);

            let payload = match String::from_utf8(payload.to_vec()) {
                Ok(payload) => payload,
                Err(e) => {
                    // The frame boundary is still intact, so this is
                    // recoverable.  Hand the lossy text up; JSON parsing will
                    // reject it and the peer gets a ParseError reply.
                    tracing::warn!(err = %e, "Frame payload is not valid UTF-8");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };

            return Ok(Some(payload));
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Emit the header and payload into the buffer in one go, so the frame
        // goes to the transport as a single write and message boundaries stay
        // atomic on byte-stream transports.
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

/// Locate `needle` in `haystack`, returning the offset of its first byte.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
