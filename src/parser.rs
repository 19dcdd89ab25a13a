//! Incremental STOMP frame scanner.
//!
//! [`parse_frame_slice`] inspects a byte slice that may hold a partial
//! frame, a complete frame, or several frames, and reports either how many
//! bytes one complete frame occupies or that more input is required. The
//! codec layer owns buffering; this module never copies more than the one
//! frame it returns.

use crate::error::{Result, StompError};

/// A raw frame as it appeared on the wire.
///
/// Header names and values are still escaped; the codec unescapes them when
/// it builds an owned [`crate::frame::Frame`].
#[derive(Debug)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Total bytes consumed from the input, including the terminating NUL
    /// and one optional trailing line separator.
    pub consumed: usize,
}

/// Find the next LF starting at `pos` and return the line up to it with any
/// trailing CR removed, along with the position just past the LF.
fn read_line(input: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = input[pos..].iter().position(|&b| b == b'\n')?;
    let mut line = &input[pos..pos + rel];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, pos + rel + 1))
}

/// Split a header line at its single unescaped colon.
///
/// The scan is escape-aware: a colon preceded by an active backslash was
/// transmitted as `\c` and never reaches this function unseparated, so any
/// bare `:` beyond the first means the peer failed to escape.
fn split_header_line(line: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut sep: Option<usize> = None;
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' => i += 2,
            b':' => {
                if sep.is_some() {
                    return Err(StompError::InvalidWireFormat(format!(
                        "header line has more than one ':': {:?}",
                        String::from_utf8_lossy(line)
                    )));
                }
                sep = Some(i);
                i += 1;
            }
            _ => i += 1,
        }
    }
    match sep {
        Some(at) => Ok((line[..at].to_vec(), line[at + 1..].to_vec())),
        None => Err(StompError::InvalidWireFormat(format!(
            "header line missing ':': {:?}",
            String::from_utf8_lossy(line)
        ))),
    }
}

fn parse_content_length(value: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(value).map_err(|_| {
        StompError::InvalidWireFormat("content-length is not valid UTF-8".into())
    })?;
    text.trim().parse::<usize>().map_err(|_| {
        StompError::InvalidWireFormat(format!("invalid content-length value '{}'", text.trim()))
    })
}

/// Parse one STOMP frame from the start of `input`.
///
/// Returns `Ok(Some(raw))` when a complete frame is present, `Ok(None)` when
/// more bytes are required, and `Err` on wire-format violations. The caller
/// is expected to have stripped leading heartbeat separators; a frame here
/// starts at its command line.
pub fn parse_frame_slice(input: &[u8]) -> Result<Option<RawFrame>> {
    // Command line. A buffer already holding the frame terminator without
    // any LF can never become a valid frame.
    let Some((command, mut pos)) = read_line(input, 0) else {
        if input.contains(&0) {
            return Err(StompError::InvalidWireFormat(
                "frame terminated before end of command line".into(),
            ));
        }
        return Ok(None);
    };
    let command = command.to_vec();

    // Header lines until the first empty line.
    let mut raw_headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut content_length: Option<usize> = None;
    loop {
        let Some((line, next)) = read_line(input, pos) else {
            return Ok(None);
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = split_header_line(line)?;
        if content_length.is_none() && name.eq_ignore_ascii_case(b"content-length") {
            content_length = Some(parse_content_length(&value)?);
        }
        raw_headers.push((name, value));
    }

    // Body: either exactly content-length bytes followed by NUL, or
    // everything up to the first NUL.
    let body;
    match content_length {
        Some(len) => {
            if pos + len + 1 > input.len() {
                return Ok(None);
            }
            if input[pos + len] != 0 {
                return Err(StompError::InvalidWireFormat(
                    "missing NUL after content-length body".into(),
                ));
            }
            body = input[pos..pos + len].to_vec();
            pos += len + 1;
        }
        None => {
            let Some(rel) = input[pos..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            body = input[pos..pos + rel].to_vec();
            pos += rel + 1;
        }
    }

    // One optional trailing line separator; further separators are
    // heartbeats handled upstream.
    if input.get(pos) == Some(&b'\r') {
        pos += 1;
    }
    if input.get(pos) == Some(&b'\n') {
        pos += 1;
    }

    Ok(Some(RawFrame {
        command,
        headers: raw_headers,
        body,
        consumed: pos,
    }))
}
