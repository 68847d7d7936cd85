//! Stdio framing
//!
//! Outbound: one JSON document per line. Inbound: newline-delimited JSON or
//! LSP-style `Content-Length` framed bodies, interleaved freely. Lines that
//! are not JSON-RPC (banners, stray logging on stdout) are skipped.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::protocol::JsonRpcMessage;
use crate::{Error, Result};

/// Upper bound for a single frame
const MAX_FRAME: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &[u8] = b"content-length:";

/// JSON-RPC codec for child process pipes
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    /// Create a codec
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn starts_with_ignore_case(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && buf[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn find(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}

/// Returns (header block length including the blank line, body length)
fn parse_header_block(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let end = match (find(buf, b"\r\n\r\n"), find(buf, b"\n\n")) {
        (Some(a), Some(b)) if b < a => b + 2,
        (Some(a), _) => a + 4,
        (None, Some(b)) => b + 2,
        (None, None) => return Ok(None),
    };

    let headers = String::from_utf8_lossy(&buf[..end]);
    let length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .ok_or_else(|| Error::Protocol("malformed Content-Length header".to_string()))?;

    if length > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {length} bytes exceeds limit")));
    }
    Ok(Some((end, length)))
}

impl Decoder for JsonRpcCodec {
    type Item = JsonRpcMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<JsonRpcMessage>> {
        loop {
            let Some(start) = buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                buf.clear();
                return Ok(None);
            };
            buf.advance(start);

            if starts_with_ignore_case(buf, CONTENT_LENGTH) {
                let Some((header_len, body_len)) = parse_header_block(buf)? else {
                    if buf.len() > MAX_FRAME {
                        return Err(Error::Protocol("unterminated header block".to_string()));
                    }
                    return Ok(None);
                };
                if buf.len() < header_len + body_len {
                    buf.reserve(header_len + body_len - buf.len());
                    return Ok(None);
                }
                buf.advance(header_len);
                let body = buf.split_to(body_len);
                match serde_json::from_slice::<JsonRpcMessage>(&body) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        debug!(error = %e, "Skipping undecodable framed message");
                    }
                }
                continue;
            }

            let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
                if buf.len() > MAX_FRAME {
                    return Err(Error::Protocol("line exceeds frame limit".to_string()));
                }
                return Ok(None);
            };

            let line = buf.split_to(newline + 1);
            match serde_json::from_slice::<JsonRpcMessage>(line.trim_ascii()) {
                Ok(message) => return Ok(Some(message)),
                Err(_) => {
                    let text = String::from_utf8_lossy(line.trim_ascii());
                    debug!(line = %text.chars().take(200).collect::<String>(), "Skipping non-JSON-RPC output line");
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<JsonRpcMessage>> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        // Final line without a trailing newline
        let rest = buf.split();
        let trimmed = rest.trim_ascii();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(trimmed).ok())
    }
}

impl Encoder<JsonRpcMessage> for JsonRpcCodec {
    type Error = Error;

    fn encode(&mut self, message: JsonRpcMessage, buf: &mut BytesMut) -> Result<()> {
        let mut writer = buf.writer();
        serde_json::to_writer(&mut writer, &message)?;
        writer.into_inner().put_u8(b'\n');
        Ok(())
    }
}
