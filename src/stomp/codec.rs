use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::Frame;
use super::parser::{parse_frame_slice, unescape_header_value};

/// Escape a STOMP 1.2 header name or value for wire transmission.
///
/// - backslash (0x5c) → `\\`
/// - carriage return (0x0d) → `\r`
/// - line feed (0x0a) → `\n`
/// - colon (0x3a) → `\c`
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

fn invalid(what: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", what, e))
}

fn decode_header_part(raw: &[u8], what: &str) -> io::Result<String> {
    let unescaped = unescape_header_value(raw).map_err(|e| invalid(&format!("invalid escape in {}", what), e))?;
    String::from_utf8(unescaped).map_err(|e| invalid(&format!("invalid utf8 in {}", what), e))
}

/// Largest frame the decoder buffers before failing the stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single LF received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Encode `StompItem` back into bytes and emit `content-length` when the
///   body is not plain text.
#[derive(Debug)]
pub struct StompCodec {
    max_frame: usize,
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are
    /// needed. Invalid UTF-8, bad escapes and malformed frames are
    /// `InvalidData` errors.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // heartbeat: single LF (CRLF is accepted as well)
        match src.chunk() {
            [b'\n', ..] => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            [b'\r', b'\n', ..] => {
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            _ => {}
        }

        let Some(raw) = parse_frame_slice(src.chunk(), self.max_frame).map_err(|e| invalid("parse error", e))? else {
            if src.len() > self.max_frame {
                return Err(invalid(
                    "frame too large",
                    format!("{} bytes buffered, limit {}", src.len(), self.max_frame),
                ));
            }
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command = String::from_utf8(raw.command).map_err(|e| invalid("invalid utf8 in command", e))?;
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            headers.push((
                decode_header_part(&k, "header key")?,
                decode_header_part(&v, "header value")?,
            ));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    /// Append the wire form of `item` to `dst`.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let has_cl = frame
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        // CONNECT frames are sent unescaped per STOMP 1.2
        let escape = frame.command != "CONNECT";
        for (k, v) in &frame.headers {
            if escape {
                dst.extend_from_slice(escape_header_value(k).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header_value(v).as_bytes());
            } else {
                dst.extend_from_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !has_cl && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err()) {
            dst.extend_from_slice(b"content-length:");
            dst.extend_from_slice(frame.body.len().to_string().as_bytes());
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

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        StompCodec::new()
            .encode(StompItem::Frame(frame), &mut buf)
            .unwrap();
        buf.to_vec()
    }

    #[test]
    fn encodes_send_frame() {
        let bytes = encode(Frame::send("/queue/orders", b"x".to_vec()).header("content-type", "text/plain"));
        assert_eq!(
            bytes,
            b"SEND\ndestination:/queue/orders\ncontent-type:text/plain\n\nx\0".to_vec()
        );
    }

    #[test]
    fn binary_body_gets_content_length() {
        let bytes = encode(Frame::send("/queue/bin", vec![1u8, 0, 2]));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("content-length:3\n"));
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let bytes = encode(Frame::new("CONNECT").header("login", "a:b"));
        assert_eq!(bytes, b"CONNECT\nlogin:a:b\n\n\0".to_vec());
    }

    #[test]
    fn send_headers_are_escaped() {
        let bytes = encode(Frame::new("SEND").header("key", "a:b\nc"));
        assert_eq!(bytes, b"SEND\nkey:a\\cb\\nc\n\n\0".to_vec());
    }

    #[test]
    fn decodes_heartbeat_then_frame() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"\nRECEIPT\nreceipt-id:r-1\n\n\0"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(StompItem::Heartbeat));
        match codec.decode(&mut buf).unwrap() {
            Some(StompItem::Frame(f)) => {
                assert_eq!(f.command, "RECEIPT");
                assert_eq!(f.get_header("receipt-id"), Some("r-1"));
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_leaves_buffer_untouched() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"ERROR\nmessage:x"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"ERROR\nmessage:x");
    }

    #[test]
    fn decode_unescapes_headers() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"MESSAGE\nk:a\\cb\n\n\0"[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(StompItem::Frame(f)) => assert_eq!(f.get_header("k"), Some("a:b")),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn overflowing_content_length_is_invalid_data() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:18446744073709551615\n\n\0"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unterminated_frame_over_limit_is_rejected() {
        let mut codec = StompCodec::with_max_frame(32);
        let mut buf = BytesMut::from(&b"MESSAGE\nk:v\n\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[b'x'; 64]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_bad_escape() {
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::from(&b"MESSAGE\nk:a\\tb\n\n\0"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
