/// Line codec — frames a TCP byte stream into newline-delimited chat lines.
///
/// Splits on `\n` only; the delimiter is stripped and nothing else is
/// trimmed. Outgoing text is written with a single `\n` terminator.
///
/// There is no line-length bound: a client that never sends `\n` grows its
/// read buffer without limit.
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec error. Framing itself cannot fail; only the transport can.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames chat lines on `\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// How far into the buffer we've already searched for `\n`.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let pos = self.next_index + offset;
                self.next_index = 0;

                let mut line_bytes = src.split_to(pos + 1);
                line_bytes.truncate(pos);

                // Invalid UTF-8 is replaced rather than killing the session.
                Ok(Some(String::from_utf8_lossy(&line_bytes).into_owned()))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // Unterminated tail on close is dropped, never delivered.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
