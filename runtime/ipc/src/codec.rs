//! Message Envelope Codec
//!
//! Fixed little-endian header followed by the payload:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "KIPC"
//!      4     1  wire version
//!      5     1  message kind
//!      6     1  capability count (0..=4)
//!      7     1  reserved
//!      8     8  sender endpoint
//!     16     8  receiver endpoint
//!     24     8  message id
//!     32     4  payload length
//!     36     4  flags
//!     40     8  timestamp (ns)
//!     48    32  capability slots, 4 x u64 (unused slots are zero)
//!     80     4  CRC-32 over header (checksum zeroed) + payload
//!     84     -  payload
//! ```
//!
//! Decoding is total: every malformed input maps to a [`CodecError`].

use cap_broker::{CapHandle, Timestamp};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::buffer::IpcBuffer;
use crate::endpoint::Endpoint;
use crate::message::{Envelope, MessageFlags, MessageHeader, MessageKind, MAX_CAPS};

/// Envelope magic, "KIPC" read as little endian
pub const MAGIC: u32 = u32::from_le_bytes(*b"KIPC");

/// Wire format version
pub const WIRE_VERSION: u8 = 1;

/// Encoded header size
pub const HEADER_SIZE: usize = 84;

/// Largest encoded message
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Largest payload that fits in one message
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

const OFF_VERSION: usize = 4;
const OFF_KIND: usize = 5;
const OFF_CAP_COUNT: usize = 6;
const OFF_SENDER: usize = 8;
const OFF_RECEIVER: usize = 16;
const OFF_MSG_ID: usize = 24;
const OFF_PAYLOAD_LEN: usize = 32;
const OFF_FLAGS: usize = 36;
const OFF_TIMESTAMP: usize = 40;
const OFF_CAPS: usize = 48;
const OFF_CHECKSUM: usize = OFF_CAPS + MAX_CAPS * 8;

const_assert_eq!(OFF_CHECKSUM + 4, HEADER_SIZE);
const_assert_eq!(HEADER_SIZE + MAX_PAYLOAD_SIZE, MAX_MESSAGE_SIZE);

/// Protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{count} capabilities attached, at most {max} allowed", max = MAX_CAPS)]
    TooManyCaps { count: usize },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("checksum mismatch (header says {expected:#010x}, computed {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("truncated message: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Envelope encoder/decoder bound to a payload limit
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_payload: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl EnvelopeCodec {
    /// Create a codec; `max_payload` is clamped to the wire maximum
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Check payload size and attachment count without encoding
    pub fn check_bounds(&self, payload_len: usize, cap_count: usize) -> Result<(), CodecError> {
        if payload_len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }
        if cap_count > MAX_CAPS {
            return Err(CodecError::TooManyCaps { count: cap_count });
        }
        Ok(())
    }

    /// Encode header fields, payload and capability references
    ///
    /// # Errors
    /// `PayloadTooLarge` or `TooManyCaps`
    pub fn encode(
        &self,
        header: &MessageHeader,
        payload: &[u8],
        caps: &[CapHandle],
    ) -> Result<Vec<u8>, CodecError> {
        self.check_bounds(payload.len(), caps.len())?;

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.push(WIRE_VERSION);
        out.push(header.kind as u8);
        out.push(caps.len() as u8);
        out.push(0);
        out.extend_from_slice(&header.sender.to_raw().to_le_bytes());
        out.extend_from_slice(&header.receiver.to_raw().to_le_bytes());
        out.extend_from_slice(&header.msg_id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&header.flags.bits().to_le_bytes());
        out.extend_from_slice(&header.timestamp.as_nanos().to_le_bytes());
        for slot in 0..MAX_CAPS {
            let raw = caps.get(slot).map(|c| c.to_raw()).unwrap_or(0);
            out.extend_from_slice(&raw.to_le_bytes());
        }
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(payload);

        let crc = checksum(&out[..HEADER_SIZE], payload);
        out[OFF_CHECKSUM..HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        self.encode(&envelope.header, envelope.payload(), &envelope.caps)
    }

    /// Decode and verify one message
    ///
    /// # Errors
    /// Every malformed input maps to a specific [`CodecError`]
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                got: bytes.len(),
            });
        }

        let magic = le_u32(bytes, 0);
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let version = bytes[OFF_VERSION];
        if version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let payload_len = le_u32(bytes, OFF_PAYLOAD_LEN) as usize;
        if payload_len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let total = HEADER_SIZE + payload_len;
        if bytes.len() < total {
            return Err(CodecError::Truncated {
                needed: total,
                got: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(CodecError::TrailingBytes(bytes.len() - total));
        }

        let payload = &bytes[HEADER_SIZE..];
        let expected = le_u32(bytes, OFF_CHECKSUM);
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        header_bytes[OFF_CHECKSUM..].fill(0);
        let actual = checksum(&header_bytes, payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let kind = MessageKind::from_u8(bytes[OFF_KIND])
            .ok_or(CodecError::UnknownKind(bytes[OFF_KIND]))?;

        let cap_count = bytes[OFF_CAP_COUNT] as usize;
        if cap_count > MAX_CAPS {
            return Err(CodecError::TooManyCaps { count: cap_count });
        }
        let caps = (0..cap_count)
            .map(|slot| CapHandle::from_raw(le_u64(bytes, OFF_CAPS + slot * 8)))
            .collect();

        let header = MessageHeader {
            kind,
            sender: Endpoint::from_raw(le_u64(bytes, OFF_SENDER)),
            receiver: Endpoint::from_raw(le_u64(bytes, OFF_RECEIVER)),
            msg_id: le_u64(bytes, OFF_MSG_ID),
            flags: MessageFlags::from_bits_truncate(le_u32(bytes, OFF_FLAGS)),
            timestamp: Timestamp(le_u64(bytes, OFF_TIMESTAMP)),
        };

        Ok(Envelope {
            header,
            caps,
            payload: IpcBuffer::from_vec(payload.to_vec()),
        })
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

// Callers check lengths before reading fields.
fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
