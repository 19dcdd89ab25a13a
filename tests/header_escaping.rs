//! STOMP 1.2 header escaping: the escape/unescape law and its behavior at
//! the codec boundary.
//!
//! On the wire, header names and values must not contain raw backslash,
//! CR, LF, or colon; they travel as `\\`, `\r`, `\n`, `\c`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tungsten_stomp::codec::{escape, unescape};
use tungsten_stomp::{Frame, StompCodec, StompItem};

fn decode_one(raw: &[u8]) -> Frame {
    let mut buf = BytesMut::from(raw);
    match StompCodec::new().decode(&mut buf).expect("decode failed") {
        Some(StompItem::Frame(frame)) => frame,
        other => panic!("expected a frame, got {other:?}"),
    }
}

fn encode_frame(frame: Frame) -> String {
    let mut buf = BytesMut::new();
    StompCodec::new()
        .encode(StompItem::Frame(frame), &mut buf)
        .expect("encode failed");
    String::from_utf8_lossy(&buf).into_owned()
}

// ---------------------------------------------------------------------------
// the escape law
// ---------------------------------------------------------------------------

#[test]
fn unescape_inverts_escape() {
    let samples = [
        "",
        "plain-value",
        "C:\\Users\\test\\file.txt",
        "line1\nline2\nline3",
        "before\rafter",
        "key:value",
        "a\nb\rc\\d:e",
        "\\\n\r:",
        "\n\n\n\\\\\\",
        "http://example.com:8080/path",
    ];
    for s in samples {
        let escaped = escape(s);
        let back = unescape(escaped.as_bytes()).expect("round trip failed");
        assert_eq!(back, s.as_bytes(), "law broken for {s:?}");
    }
}

#[test]
fn escape_leaves_no_raw_specials() {
    for s in ["a:b", "a\nb", "a\\b", "a\rb", "\\\n\r:"] {
        let escaped = escape(s);
        assert!(!escaped.contains('\n'), "raw LF in {escaped:?}");
        assert!(!escaped.contains('\r'), "raw CR in {escaped:?}");
        assert!(!escaped.contains(':'), "raw colon in {escaped:?}");
        // every backslash must start a legal sequence
        let bytes = escaped.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                assert!(matches!(bytes[i + 1], b'\\' | b'n' | b'r' | b'c'));
                i += 2;
            } else {
                i += 1;
            }
        }
    }
}

#[test]
fn unescape_rejects_unknown_and_incomplete_sequences() {
    let err = unescape(b"bad\\xescape").unwrap_err();
    assert!(err.to_string().contains("invalid escape"));

    let err = unescape(b"trailing\\").unwrap_err();
    assert!(err.to_string().contains("incomplete escape"));
}

// ---------------------------------------------------------------------------
// decoding escaped headers
// ---------------------------------------------------------------------------

#[test]
fn decoder_unescapes_values() {
    let cases: &[(&[u8], &str)] = &[
        (b"MESSAGE\nh:value\\\\with\\\\backslashes\n\n\0", "value\\with\\backslashes"),
        (b"MESSAGE\nh:line1\\nline2\n\n\0", "line1\nline2"),
        (b"MESSAGE\nh:before\\rafter\n\n\0", "before\rafter"),
        (b"MESSAGE\nh:key\\cvalue\n\n\0", "key:value"),
        (b"MESSAGE\nh:a\\nb\\rc\\\\d\\ce\n\n\0", "a\nb\rc\\d:e"),
    ];
    for (raw, expected) in cases {
        let frame = decode_one(raw);
        assert_eq!(frame.get_header("h"), Some(*expected));
    }
}

#[test]
fn decoder_unescapes_header_names() {
    let frame = decode_one(b"MESSAGE\nkey\\nname:value\n\n\0");
    assert_eq!(frame.get_header("key\nname"), Some("value"));
}

#[test]
fn decoder_rejects_bad_escapes() {
    let mut buf = BytesMut::from(&b"MESSAGE\nh:bad\\xescape\n\n\0"[..]);
    let err = StompCodec::new().decode(&mut buf).unwrap_err();
    assert!(err.to_string().contains("invalid escape"));

    let mut buf = BytesMut::from(&b"MESSAGE\nh:trailing\\\\\\\n\n\0"[..]);
    assert!(StompCodec::new().decode(&mut buf).is_err());
}

// ---------------------------------------------------------------------------
// encoding escapes and wire round trips
// ---------------------------------------------------------------------------

#[test]
fn encoder_escapes_values() {
    let wire = encode_frame(
        Frame::new("SEND")
            .header("destination", "/queue/test")
            .header("custom", "a\nb\rc\\d:e"),
    );
    assert!(wire.contains("custom:a\\nb\\rc\\\\d\\ce"));
}

#[test]
fn special_characters_survive_a_wire_round_trip() {
    for value in [
        "C:\\Users\\test\\file.txt",
        "first\nsecond\nthird",
        "line1\r\nline2",
        "http://example.com:8080/path",
        "path\\to\\file\nkey:value\r\nend",
        "",
        "\\\n\r:",
    ] {
        let wire = encode_frame(
            Frame::new("SEND")
                .header("destination", "/queue/test")
                .header("tricky", value),
        );
        let frame = decode_one(wire.as_bytes());
        assert_eq!(frame.get_header("tricky"), Some(value));
    }
}

#[test]
fn plain_values_are_not_touched() {
    let wire = encode_frame(
        Frame::new("SEND")
            .header("destination", "/queue/test")
            .header("normal", "just-a-normal-value"),
    );
    assert!(wire.contains("normal:just-a-normal-value"));
    assert!(!wire.contains('\\'));
}
