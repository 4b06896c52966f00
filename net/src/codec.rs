//! Newline-terminated JSON framing with the wire protocol's 0x7F byte mask.
//!
//! The mask and the ASCII-only envelope mean masking is a no-op for every
//! byte the protocol actually produces, but it is retained because existing
//! peers read/write it — see `DESIGN.md`.

use bytes::{BufMut, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Envelope;

/// Maximum size of one framed message, including the trailing newline.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub enum CodecError {
    FrameTooLarge,
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::FrameTooLarge => write!(f, "frame exceeded {MAX_FRAME_LEN} bytes"),
            CodecError::Json(e) => write!(f, "json decode error: {e}"),
            CodecError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

fn mask(byte: u8) -> u8 {
    byte & 0x7F
}

/// A codec producing `Envelope`s from a newline-delimited, 0x7F-masked byte
/// stream and vice versa.
pub struct MessageCodec {
    max_len: usize,
}

impl MessageCodec {
    #[must_use]
    pub fn builder() -> Builder {
        Builder {
            max_len: MAX_FRAME_LEN,
        }
    }
}

pub struct Builder {
    max_len: usize,
}

impl Builder {
    #[must_use]
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_len = len;
        self
    }

    #[must_use]
    pub fn finish(self) -> MessageCodec {
        MessageCodec {
            max_len: self.max_len,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::builder().finish()
    }
}

impl Decoder for MessageCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline_pos) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_len {
                return Err(CodecError::FrameTooLarge);
            }
            return Ok(None);
        };

        if newline_pos > self.max_len {
            return Err(CodecError::FrameTooLarge);
        }

        let mut line = src.split_to(newline_pos + 1);
        line.truncate(newline_pos);
        for byte in line.iter_mut() {
            *byte = mask(*byte);
        }

        let envelope: Envelope = serde_json::from_slice(&line)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = serde_json::to_vec(&item)?;
        if body.len() + 1 > self.max_len {
            return Err(CodecError::FrameTooLarge);
        }
        for byte in body.iter_mut() {
            *byte = mask(*byte);
        }
        dst.reserve(body.len() + 1);
        dst.put_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{checksum_of, MSG_PING};

    fn sample_envelope() -> Envelope {
        Envelope::new(MSG_PING, "{}".to_string())
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        let original = sample_envelope();
        codec.encode(original.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, original.msg_type);
        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.checksum, checksum_of(&original.data));
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&b"{\"t\":1000"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn fragmented_stream_reassembles_to_same_message() {
        let mut codec = MessageCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(sample_envelope(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in encoded.chunks(3) {
            buf.extend_from_slice(chunk);
            if let Some(env) = codec.decode(&mut buf).unwrap() {
                decoded = Some(env);
            }
        }
        assert_eq!(decoded.unwrap().msg_type, MSG_PING);
    }

    #[test]
    fn oversize_frame_without_newline_errors() {
        let mut codec = MessageCodec::builder().with_max_frame_len(8).finish();
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge)));
    }
}
