//! Wire codec for STOMP 1.2 frames.
//!
//! `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` so a
//! connection can be driven through `Framed`. Incremental scanning is
//! delegated to [`crate::parser`]; this layer handles heartbeats, header
//! escaping, and the owned-`Frame` conversion.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, StompError};
use crate::frame::{headers, Frame};
use crate::parser::parse_frame_slice;

/// Escape a header name or value for wire transmission.
///
/// Per STOMP 1.2: backslash, carriage return, line feed, and colon must not
/// appear raw inside a header line.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverse [`escape`]. Only `\\`, `\n`, `\r`, and `\c` are accepted; any
/// other backslash sequence is a wire-format violation.
pub fn unescape(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\' {
            let Some(&next) = input.get(i + 1) else {
                return Err(StompError::InvalidWireFormat(
                    "incomplete escape sequence in header".into(),
                ));
            };
            out.push(match next {
                b'\\' => b'\\',
                b'n' => b'\n',
                b'r' => b'\r',
                b'c' => b':',
                other => {
                    return Err(StompError::InvalidWireFormat(format!(
                        "invalid escape sequence '\\{}' in header",
                        other as char
                    )));
                }
            });
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| {
        StompError::InvalidWireFormat(format!("invalid utf8 in {what}: {e}"))
    })
}

/// Items produced or consumed by the codec: a full frame or a single
/// heartbeat pulse (one line separator on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

/// Stream codec for STOMP 1.2.
///
/// Decoding tolerates arbitrary chunk boundaries: a frame is yielded only
/// once its terminating NUL (or declared content-length plus NUL) has
/// arrived; until then `decode` reports that more bytes are needed.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Inter-frame separators double as heartbeats.
        match src.first() {
            None => return Ok(None),
            Some(&b'\n') => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(&b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                src.advance(if src[1] == b'\n' { 2 } else { 1 });
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(_) => {}
        }

        let Some(raw) = parse_frame_slice(&src[..])? else {
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command = utf8(raw.command, "command")?;
        let mut frame_headers: Vec<(String, String)> = Vec::with_capacity(raw.headers.len());
        for (name, value) in raw.headers {
            let name = utf8(unescape(&name)?, "header name")?;
            let value = utf8(unescape(&value)?, "header value")?;
            // a repeated header name keeps its first occurrence
            if frame_headers.iter().any(|(n, _)| *n == name) {
                continue;
            }
            frame_headers.push((name, value));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers: frame_headers,
            body: raw.body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<()> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let mut hdrs = frame.headers;
        // A body the peer cannot NUL-scan needs an explicit length.
        let has_length = hdrs
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(headers::CONTENT_LENGTH));
        if !has_length
            && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err())
        {
            hdrs.push((headers::CONTENT_LENGTH.to_string(), frame.body.len().to_string()));
        }

        // sorted for deterministic wire output
        hdrs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in hdrs {
            dst.extend_from_slice(escape(&name).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape(&value).as_bytes());
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeats_are_consumed_one_at_a_time() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"\n\r\nSEND\ndestination:/q\n\nx\0"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(StompItem::Heartbeat));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(StompItem::Heartbeat));
        match codec.decode(&mut buf).unwrap() {
            Some(StompItem::Frame(f)) => assert_eq!(f.command, "SEND"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_header_keeps_first() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"SEND\ndestination:/a\ndestination:/b\n\n\0"[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(StompItem::Frame(f)) => {
                assert_eq!(f.headers.len(), 1);
                assert_eq!(f.get_header("destination"), Some("/a"));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn encoder_sorts_headers() {
        let mut codec = StompCodec::new();
        let frame = Frame::new("SEND")
            .header("zeta", "1")
            .header("destination", "/q")
            .header("alpha", "2");
        let mut buf = BytesMut::new();
        codec.encode(StompItem::Frame(frame), &mut buf).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        let alpha = text.find("alpha:").unwrap();
        let dest = text.find("destination:").unwrap();
        let zeta = text.find("zeta:").unwrap();
        assert!(alpha < dest && dest < zeta);
    }

    #[test]
    fn binary_body_gains_content_length() {
        let mut codec = StompCodec::new();
        let frame = Frame::new("SEND")
            .header("destination", "/q")
            .set_body(vec![0u8, 1, 2]);
        let mut buf = BytesMut::new();
        codec.encode(StompItem::Frame(frame), &mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("content-length:3"));
    }
}
