//! Length-prefixed packet framing
//!
//! Wire layout: `[u32 LE total length][u8 tag][payload]`. The total length
//! counts the length field and the tag byte, so the smallest frame is 5 bytes.

use thiserror::Error;

/// Size of the length prefix plus the tag byte.
pub const HEADER_LEN: usize = 5;

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Payload type carried in the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    Bytes = 0,
    Text = 1,
}

impl PayloadKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PayloadKind::Bytes),
            1 => Some(PayloadKind::Text),
            _ => None,
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Text(_) => PayloadKind::Text,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("declared frame length {0} is shorter than the 5 byte header")]
    TooShort(usize),
}

/// Encode one frame with an explicit tag byte.
pub fn encode_frame(tag: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN + payload.len();
    let len = u32::try_from(total).map_err(|_| FrameError::TooLarge {
        len: total,
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(tag);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a typed payload.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, FrameError> {
    encode_frame(payload.kind().tag(), payload.as_bytes())
}

/// Incremental decoder for one byte stream.
///
/// Bytes may arrive split at any position, including inside the length
/// prefix. Incomplete frames stay buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len: max_frame_len.max(HEADER_LEN),
        }
    }

    /// Bytes currently held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append `bytes` and return every payload completed by them.
    ///
    /// Frames with an unknown tag are skipped. A length field that can not
    /// be valid poisons the stream position, so the buffer is discarded and
    /// decoding resumes with the next chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Payload> {
        self.buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        let mut offset = 0;
        while self.buf.len() - offset >= 4 {
            let header = &self.buf[offset..offset + 4];
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;

            if let Err(err) = self.check_len(len) {
                tracing::error!(%err, buffered = self.buf.len() - offset, "malformed frame, dropping buffer");
                self.buf.clear();
                return payloads;
            }
            if self.buf.len() - offset < len {
                break;
            }

            let tag = self.buf[offset + 4];
            let body = &self.buf[offset + HEADER_LEN..offset + len];
            match PayloadKind::from_tag(tag) {
                Some(PayloadKind::Bytes) => payloads.push(Payload::Bytes(body.to_vec())),
                Some(PayloadKind::Text) => {
                    payloads.push(Payload::Text(String::from_utf8_lossy(body).into_owned()))
                }
                None => tracing::warn!(tag, len, "skipping frame with unknown tag"),
            }
            offset += len;
        }

        self.buf.drain(..offset);
        payloads
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len < HEADER_LEN {
            return Err(FrameError::TooShort(len));
        }
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
