//! Streaming robustness: the decoder must produce the same frames no
//! matter how the byte stream is cut into chunks.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tungsten_stomp::{Frame, StompCodec, StompItem};

/// A wire image of several frames, with inter-frame separators and a
/// trailing heartbeat thrown in.
fn golden_stream() -> Vec<u8> {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    let frames = [
        Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", "/"),
        Frame::new("SUBSCRIBE")
            .header("destination", "/queue/foo")
            .header("id", "sub-1"),
        Frame::new("SEND")
            .header("destination", "/queue/foo")
            .header("tricky", "colon\\cand\\nnewline")
            .set_body(b"hello".to_vec()),
        Frame::new("SEND")
            .header("content-length", "3")
            .header("destination", "/queue/foo")
            .set_body(vec![0u8, 0, 7]),
        Frame::new("DISCONNECT").header("receipt", "BYE-BYE!"),
    ];
    for frame in frames {
        codec
            .encode(StompItem::Frame(frame), &mut buf)
            .expect("encode failed");
        buf.extend_from_slice(b"\n");
    }
    buf.to_vec()
}

/// Feed `data` to a fresh decoder in chunks of `chunk_size`, returning
/// only the decoded frames (heartbeats are inter-frame noise).
fn decode_chunked(data: &[u8], chunk_size: usize) -> Vec<Frame> {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    for chunk in data.chunks(chunk_size) {
        buf.extend_from_slice(chunk);
        loop {
            match codec.decode(&mut buf).expect("decode failed") {
                Some(StompItem::Frame(frame)) => frames.push(frame),
                Some(StompItem::Heartbeat) => {}
                None => break,
            }
        }
    }
    frames
}

#[test]
fn frame_sequence_is_chunking_invariant() {
    let data = golden_stream();
    let baseline = decode_chunked(&data, data.len());
    assert_eq!(baseline.len(), 5);

    for chunk_size in 1..=64 {
        let frames = decode_chunked(&data, chunk_size);
        assert_eq!(
            frames, baseline,
            "chunk size {chunk_size} produced a different frame sequence"
        );
    }
}

#[test]
fn byte_by_byte_yields_frame_only_at_the_terminator() {
    let raw = b"SEND\ncontent-length:5\n\nhello\0";
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    for (i, byte) in raw.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let item = codec.decode(&mut buf).expect("decode failed");
        if i < raw.len() - 1 {
            assert!(item.is_none(), "frame produced too early at byte {i}");
        } else {
            match item.expect("expected a frame at the final byte") {
                StompItem::Frame(frame) => assert_eq!(frame.body, b"hello"),
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }
}

#[test]
fn heartbeats_between_frames_are_tolerated_at_any_boundary() {
    let raw = b"\r\n\n\r\nSEND\ndestination:/q\n\nhi\0\r\n\nSEND\ndestination:/q\n\nbye\0";
    for chunk_size in 1..raw.len() {
        let frames = decode_chunked(raw, chunk_size);
        assert_eq!(frames.len(), 2, "chunk size {chunk_size}");
        assert_eq!(frames[0].body, b"hi");
        assert_eq!(frames[1].body, b"bye");
    }
}
