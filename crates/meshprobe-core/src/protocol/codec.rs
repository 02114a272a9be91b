//! Frame codec
//!
//! Splits a byte stream into `\r\n`-terminated text frames.
//!
//! The codec implements the `tokio_util` `Decoder`/`Encoder` traits but is
//! driven synchronously by the transport reader: every call to `decode`
//! yields at most one frame, so the reader keeps calling it until it returns
//! `Ok(None)` to flush all complete frames of a read before reading again.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{FrameError, DELIMITER, MAX_FRAME_SIZE};

/// Delimiter-based frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Index in the buffer where the next delimiter search resumes
    next_index: usize,
    /// Largest remainder allowed to sit in the buffer without a delimiter
    max_length: usize,
    /// Dropping an oversized frame until the next delimiter shows up
    is_discarding: bool,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame size limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            is_discarding: false,
        }
    }

    /// Frame size limit
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Position of the first delimiter at or after `from`
    fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
        buf.get(from..)?
            .windows(DELIMITER.len())
            .position(|w| w == DELIMITER)
            .map(|pos| pos + from)
    }

    /// Clear the buffer, keeping a trailing `\r` that may begin a delimiter
    fn clear_keeping_partial_delimiter(buf: &mut BytesMut) {
        let keep_cr = buf.last() == Some(&DELIMITER[0]);
        buf.clear();
        if keep_cr {
            buf.put_u8(DELIMITER[0]);
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        loop {
            // A delimiter may straddle the previous search boundary
            let from = self.next_index.saturating_sub(DELIMITER.len() - 1);

            match Self::find_delimiter(src, from) {
                Some(pos) if self.is_discarding => {
                    let _ = src.split_to(pos + DELIMITER.len());
                    self.next_index = 0;
                    self.is_discarding = false;
                }
                Some(pos) => {
                    let mut frame = src.split_to(pos + DELIMITER.len());
                    frame.truncate(pos);
                    self.next_index = 0;

                    // Back-to-back delimiters carry no message
                    if frame.is_empty() {
                        continue;
                    }

                    return String::from_utf8(frame.to_vec())
                        .map(Some)
                        .map_err(|e| FrameError::InvalidUtf8(e.to_string()));
                }
                None if self.is_discarding => {
                    Self::clear_keeping_partial_delimiter(src);
                    self.next_index = src.len();
                    return Ok(None);
                }
                None if src.len() > self.max_length => {
                    let len = src.len();
                    Self::clear_keeping_partial_delimiter(src);
                    self.next_index = src.len();
                    self.is_discarding = true;
                    return Err(FrameError::Oversized {
                        len,
                        limit: self.max_length,
                    });
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }
}

impl<'a> Encoder<&'a str> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > self.max_length {
            return Err(FrameError::Oversized {
                len: item.len(),
                limit: self.max_length,
            });
        }
        if Self::find_delimiter(item.as_bytes(), 0).is_some() {
            return Err(FrameError::EmbeddedDelimiter);
        }

        dst.reserve(item.len() + DELIMITER.len());
        dst.put_slice(item.as_bytes());
        dst.put_slice(DELIMITER);
        Ok(())
    }
}

/// Encode a single message into a frame
pub fn encode_frame(text: &str) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(text, &mut buf)?;
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Feed `chunks` one after another, collecting every frame as it completes
    fn decode_chunks(codec: &mut FrameCodec, buf: &mut BytesMut, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            loop {
                match codec.decode(buf) {
                    Ok(Some(frame)) => out.push(frame),
                    Ok(None) => break,
                    Err(_) => continue,
                }
            }
        }
        out
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frames = decode_chunks(&mut codec, &mut buf, &[b"{\"a\":1}\r\n{\"b\":2"]);

        assert_eq!(frames, vec!["{\"a\":1}".to_string()]);
        assert_eq!(&buf[..], b"{\"b\":2");

        let frames = decode_chunks(&mut codec, &mut buf, &[b"}\r\n"]);
        assert_eq!(frames, vec!["{\"b\":2}".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frames = decode_chunks(&mut codec, &mut buf, &[b"one\r\ntwo\r\nthree\r\n"]);

        assert_eq!(frames, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_chunking_invariance() {
        let stream: &[u8] =
            b"{\"origin\":\"n1\",\"class\":\"keepAlive\"}\r\n\r\nfirst\r\nsecond\r\nx\r\ntail";
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let whole = decode_chunks(&mut codec, &mut buf, &[stream]);
        assert_eq!(whole.len(), 4);

        // Every two-way split, including ones that cut the delimiter in half
        for split in 0..=stream.len() {
            let (a, b) = stream.split_at(split);
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            let frames = decode_chunks(&mut codec, &mut buf, &[a, b]);
            assert_eq!(frames, whole, "split at {}", split);
            assert_eq!(&buf[..], b"tail");
        }

        // Byte by byte
        let bytes: Vec<&[u8]> = stream.chunks(1).collect();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert_eq!(decode_chunks(&mut codec, &mut buf, &bytes), whole);
    }

    #[test]
    fn test_lone_line_feed_is_not_a_delimiter() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frames = decode_chunks(&mut codec, &mut buf, &[b"a\nb\r", b"c\r\n"]);

        assert_eq!(frames, vec!["a\nb\rc"]);
    }

    #[test]
    fn test_invalid_utf8_frame_is_dropped_alone() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"ok1\r\n\xff\xfe\r\nok2\r\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some("ok1".to_string()));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::InvalidUtf8(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("ok2".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_is_discarded_until_next_delimiter() {
        let mut codec = FrameCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);

        assert_eq!(
            codec.decode(&mut buf),
            Err(FrameError::Oversized { len: 10, limit: 8 })
        );
        assert!(buf.is_empty());

        // Rest of the oversized frame, then a good one
        buf.extend_from_slice(b"abc\r\nfine\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("fine".to_string()));
    }

    #[test]
    fn test_encode_appends_delimiter() {
        assert_eq!(encode_frame("{\"a\":1}").unwrap(), b"{\"a\":1}\r\n".to_vec());
    }

    #[test]
    fn test_encode_rejects_embedded_delimiter() {
        assert_eq!(encode_frame("a\r\nb"), Err(FrameError::EmbeddedDelimiter));
    }
}
