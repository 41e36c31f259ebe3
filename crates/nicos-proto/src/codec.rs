// ── Line codec ──
//
// Frames a byte stream into `Message`s. Lines end in LF or CRLF; blank
// and garbled lines are skipped.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::message::Message;

/// Longest line accepted before the connection is considered broken.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// `tokio_util` codec for the cache protocol.
#[derive(Debug, Clone)]
pub struct CacheCodec {
    max_length: usize,
    /// Bytes already scanned for a newline, so partial reads are not rescanned.
    next_index: usize,
}

impl Default for CacheCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl CacheCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for CacheCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_length {
                    return Err(Error::LineTooLong {
                        max: self.max_length,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let Ok(text) = std::str::from_utf8(&line) else {
                tracing::warn!(len = line.len(), "ignoring non-UTF-8 cache line");
                continue;
            };
            let text = text.trim_end_matches(['\r', '\n']);
            if text.trim().is_empty() {
                continue;
            }
            match Message::parse(text) {
                Ok(msg) => return Ok(Some(msg)),
                // Dropped; the connection stays up.
                Err(e) => tracing::warn!(error = %e, "ignoring garbled cache line"),
            }
        }
    }
}

impl Encoder<Message> for CacheCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        let line = msg.to_string();
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Op;

    #[test]
    fn decodes_multiple_lines_and_partial_tail() {
        let mut codec = CacheCodec::default();
        let mut buf = BytesMut::from("a/b=1\r\n\nc/d?\nc/e=");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.key, "a/b");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.op, Op::Ask);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"7\n");
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(third.key, "c/e");
        assert_eq!(third.value, "7");
    }

    #[test]
    fn skips_garbled_lines() {
        let mut codec = CacheCodec::default();
        let mut buf = BytesMut::from("garbage without op\nx/y=2\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.key, "x/y");
    }

    #[test]
    fn rejects_overlong_lines() {
        let mut codec = CacheCodec::new(8);
        let mut buf = BytesMut::from("abcdefghijk");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::LineTooLong { max: 8 })
        ));
    }

    #[test]
    fn encodes_with_newline() {
        let mut codec = CacheCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::tell("x/y", "1"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"x/y=1\n");
    }
}
