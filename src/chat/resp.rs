/// RESP2 codec — the Redis wire protocol, just enough for PUBLISH/SUBSCRIBE.
///
/// Frames are type-prefixed and `\r\n` terminated:
///   `+simple`, `-error`, `:integer`, `$len\r\nbulk`, `*count` followed by items.
/// Null bulk strings (`$-1`) and null arrays (`*-1`) are represented as `None`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Errors that can occur while framing RESP.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("invalid frame type byte {0:#04x}")]
    InvalidType(u8),
    #[error("invalid integer in frame header")]
    InvalidInteger,
    #[error("bulk string not terminated by CRLF")]
    MissingTerminator,
    #[error("arrays nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Deepest array nesting accepted from the wire.
pub const MAX_DEPTH: usize = 32;

/// A single RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Build a command: an array of bulk strings.
    pub fn command<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Frame::Array(Some(
            parts
                .into_iter()
                .map(|p| Frame::Bulk(Some(Bytes::copy_from_slice(p.as_ref()))))
                .collect(),
        ))
    }

    /// Text of a simple or bulk string, if this frame is one.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Items of a non-null array.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.put_slice(format!(":{n}\r\n").as_bytes());
            }
            Frame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                dst.put_slice(format!("${}\r\n", data.len()).as_bytes());
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(None) => dst.put_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.write_to(dst);
                }
            }
        }
    }
}

/// Find the end of the header line starting at `start`; returns the index of `\r`.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| start + p)
}

fn parse_int(bytes: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RespError::InvalidInteger)
}

/// Try to parse one frame starting at `start`.
///
/// Returns the frame and the index just past it, or `None` if more bytes are
/// needed. Nothing is consumed; the caller advances once a frame is complete.
/// `depth` counts the arrays enclosing this frame.
fn parse_frame(
    buf: &[u8],
    start: usize,
    depth: usize,
) -> Result<Option<(Frame, usize)>, RespError> {
    let Some(&kind) = buf.get(start) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, start + 1) else {
        return Ok(None);
    };
    let line = &buf[start + 1..line_end];
    let after = line_end + 2;

    match kind {
        b'+' => Ok(Some((
            Frame::Simple(String::from_utf8_lossy(line).into_owned()),
            after,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(line).into_owned()),
            after,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), after))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Frame::Bulk(None), after)));
            }
            let len = usize::try_from(len).map_err(|_| RespError::InvalidInteger)?;
            let end = after + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::MissingTerminator);
            }
            let data = Bytes::copy_from_slice(&buf[after..end]);
            Ok(Some((Frame::Bulk(Some(data)), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Frame::Array(None), after)));
            }
            if depth >= MAX_DEPTH {
                return Err(RespError::TooDeep);
            }
            let count = usize::try_from(count).map_err(|_| RespError::InvalidInteger)?;
            let mut items = Vec::with_capacity(count.min(64));
            let mut pos = after;
            for _ in 0..count {
                match parse_frame(buf, pos, depth + 1)? {
                    Some((item, next)) => {
                        items.push(item);
                        pos = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), pos)))
        }
        other => Err(RespError::InvalidType(other)),
    }
}

/// A tokio codec for RESP2 frames.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src, 0, 0)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_subscribe_confirmation() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("*3\r\n$9\r\nsubscribe\r\n$4\r\nchat\r\n:1\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(Some(vec![bulk("subscribe"), bulk("chat"), Frame::Integer(1)]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_pushed_message_with_newline_payload() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("*3\r\n$7\r\nmessage\r\n$4\r\nchat\r\n$7\r\nhi\r\nyou\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let items = frame.as_array().unwrap();
        assert_eq!(items[2].as_text().as_deref(), Some("hi\r\nyou"));
    }

    #[test]
    fn decode_waits_for_whole_array() {
        let mut codec = RespCodec;
        let full = b"*3\r\n$7\r\nmessage\r\n$4\r\nchat\r\n$5\r\nhello\r\n";
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap().as_array().unwrap()[2], bulk("hello"));
            }
        }
    }

    #[test]
    fn decode_scalars() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("+OK\r\n-ERR nope\r\n:42\r\n$-1\r\n*-1\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Simple("OK".into())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Error("ERR nope".into())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Integer(42)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Bulk(None)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Array(None)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("?what\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            RespError::InvalidType(b'?')
        ));
    }

    #[test]
    fn decode_rejects_bad_length() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("$abc\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            RespError::InvalidInteger
        ));
    }

    #[test]
    fn decode_rejects_unterminated_bulk() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("$2\r\nabcd");
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            RespError::MissingTerminator
        ));
    }

    #[test]
    fn decode_rejects_deep_nesting() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from("*1\r\n".repeat(200_000).as_str());
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            RespError::TooDeep
        ));
    }

    #[test]
    fn decode_accepts_nesting_up_to_limit() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(format!("{}:7\r\n", "*1\r\n".repeat(MAX_DEPTH)).as_str());
        let mut frame = codec.decode(&mut buf).unwrap().unwrap();
        for _ in 0..MAX_DEPTH {
            frame = frame.as_array().unwrap()[0].clone();
        }
        assert_eq!(frame, Frame::Integer(7));
        assert!(buf.is_empty());
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_publish_command() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::command(["PUBLISH", "chat", "bob says: hi"]), &mut buf)
            .unwrap();
        assert_eq!(
            &buf[..],
            b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nchat\r\n$12\r\nbob says: hi\r\n"
        );
    }

    #[test]
    fn encode_nulls() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::Bulk(None), &mut buf).unwrap();
        codec.encode(Frame::Array(None), &mut buf).unwrap();
        assert_eq!(&buf[..], b"$-1\r\n*-1\r\n");
    }
}
