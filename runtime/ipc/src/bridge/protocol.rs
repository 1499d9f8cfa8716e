//! Bridge wire bodies
//!
//! Every bridge body travels as an envelope payload:
//!
//! ```text
//! [0]     0xCB            bridge magic
//! [1]     version         BRIDGE_VERSION
//! [2..4]  op code (LE)    0xCB00..=0xCBFF
//! [4..]   bincode body    fixed-int, little endian, no trailing bytes
//! ```
//!
//! The op code range is reserved so bridge traffic cannot be mistaken for
//! ordinary application messages that happen to reach the authority.

use bincode::Options;
use cap_broker::{CapHandle, CapRights, Expiry, ValidationStatus};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use static_assertions::const_assert;

use super::BridgeError;
use crate::codec::MAX_PAYLOAD_SIZE;

pub const BRIDGE_MAGIC: u8 = 0xCB;
pub const BRIDGE_VERSION: u8 = 1;

/// Longest resource descriptor a construct-proof request may carry
pub const MAX_DESCRIPTOR_LEN: usize = 256;

const PREFIX_LEN: usize = 4;

/// Upper bound of any encoded bridge body: the construct-proof request
/// (user u64, rights u32, descriptor length u64 + bytes) is the largest
pub const MAX_BRIDGE_BODY: usize = PREFIX_LEN + 8 + 4 + 8 + MAX_DESCRIPTOR_LEN;

const_assert!(MAX_BRIDGE_BODY <= MAX_PAYLOAD_SIZE);

/// Bridge operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BridgeOp {
    ConstructProof = 0xCB01,
    ConstructProofReply = 0xCB02,
    ValidateHandle = 0xCB03,
    ValidateHandleReply = 0xCB04,
    ReleaseHandle = 0xCB05,
}

impl BridgeOp {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0xCB01 => Some(BridgeOp::ConstructProof),
            0xCB02 => Some(BridgeOp::ConstructProofReply),
            0xCB03 => Some(BridgeOp::ValidateHandle),
            0xCB04 => Some(BridgeOp::ValidateHandleReply),
            0xCB05 => Some(BridgeOp::ReleaseHandle),
            _ => None,
        }
    }
}

/// Server → authority: mint a proof for a user request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructProofRequest {
    pub user: u64,
    pub rights: u32,
    pub resource: Vec<u8>,
}

/// Outcome of a construct-proof request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantStatus {
    /// Everything requested was granted
    Granted,
    /// A strict, non-empty subset was granted
    Partial,
    /// Nothing could be granted; no handle was minted
    Denied,
}

/// Authority → server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructProofReply {
    pub status: GrantStatus,
    pub handle: u64,
    pub granted: u32,
    pub expiry: u64,
}

/// Server → authority: is a cached proof still good for `rights`?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateHandleRequest {
    pub handle: u64,
    pub rights: u32,
}

/// Wire form of a registry validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStatus {
    Granted,
    Expired,
    Insufficient { missing: u32 },
    Unknown,
}

impl From<ValidationStatus> for HandleStatus {
    fn from(status: ValidationStatus) -> Self {
        match status {
            ValidationStatus::Granted => HandleStatus::Granted,
            ValidationStatus::Expired => HandleStatus::Expired,
            ValidationStatus::Insufficient { missing } => HandleStatus::Insufficient {
                missing: missing.bits(),
            },
            ValidationStatus::Unknown => HandleStatus::Unknown,
        }
    }
}

impl From<HandleStatus> for ValidationStatus {
    fn from(status: HandleStatus) -> Self {
        match status {
            HandleStatus::Granted => ValidationStatus::Granted,
            HandleStatus::Expired => ValidationStatus::Expired,
            HandleStatus::Insufficient { missing } => ValidationStatus::Insufficient {
                missing: CapRights::from_bits_truncate(missing),
            },
            HandleStatus::Unknown => ValidationStatus::Unknown,
        }
    }
}

/// Authority → server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateHandleReply {
    pub status: HandleStatus,
    pub expiry: u64,
}

/// Server → authority, fire-and-forget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseHandleNotice {
    pub handle: u64,
}

/// Any bridge body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    ConstructProof(ConstructProofRequest),
    ConstructProofReply(ConstructProofReply),
    ValidateHandle(ValidateHandleRequest),
    ValidateHandleReply(ValidateHandleReply),
    ReleaseHandle(ReleaseHandleNotice),
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit((MAX_BRIDGE_BODY - PREFIX_LEN) as u64)
        .reject_trailing_bytes()
}

fn body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BridgeError> {
    body_options()
        .deserialize(bytes)
        .map_err(|e| BridgeError::Malformed(e.to_string()))
}

impl BridgeMessage {
    pub fn op(&self) -> BridgeOp {
        match self {
            BridgeMessage::ConstructProof(_) => BridgeOp::ConstructProof,
            BridgeMessage::ConstructProofReply(_) => BridgeOp::ConstructProofReply,
            BridgeMessage::ValidateHandle(_) => BridgeOp::ValidateHandle,
            BridgeMessage::ValidateHandleReply(_) => BridgeOp::ValidateHandleReply,
            BridgeMessage::ReleaseHandle(_) => BridgeOp::ReleaseHandle,
        }
    }

    /// Encode prefix and body
    ///
    /// # Errors
    /// `DescriptorTooLong` for an oversized resource descriptor
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        let body = match self {
            BridgeMessage::ConstructProof(req) => {
                if req.resource.len() > MAX_DESCRIPTOR_LEN {
                    return Err(BridgeError::DescriptorTooLong(req.resource.len()));
                }
                body_options().serialize(req)
            }
            BridgeMessage::ConstructProofReply(reply) => body_options().serialize(reply),
            BridgeMessage::ValidateHandle(req) => body_options().serialize(req),
            BridgeMessage::ValidateHandleReply(reply) => body_options().serialize(reply),
            BridgeMessage::ReleaseHandle(notice) => body_options().serialize(notice),
        }
        .map_err(|e| BridgeError::Malformed(e.to_string()))?;

        let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
        out.push(BRIDGE_MAGIC);
        out.push(BRIDGE_VERSION);
        out.extend_from_slice(&(self.op() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a payload received on the bridge
    ///
    /// # Errors
    /// `NotBridge`, `UnsupportedVersion`, `UnknownOp`, `DescriptorTooLong`
    /// or `Malformed`
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        if bytes.len() < PREFIX_LEN || bytes[0] != BRIDGE_MAGIC {
            return Err(BridgeError::NotBridge);
        }
        if bytes[1] != BRIDGE_VERSION {
            return Err(BridgeError::UnsupportedVersion(bytes[1]));
        }

        let code = u16::from_le_bytes([bytes[2], bytes[3]]);
        let op = BridgeOp::from_u16(code).ok_or(BridgeError::UnknownOp(code))?;
        let rest = &bytes[PREFIX_LEN..];

        Ok(match op {
            BridgeOp::ConstructProof => {
                let req: ConstructProofRequest = body(rest)?;
                if req.resource.len() > MAX_DESCRIPTOR_LEN {
                    return Err(BridgeError::DescriptorTooLong(req.resource.len()));
                }
                BridgeMessage::ConstructProof(req)
            }
            BridgeOp::ConstructProofReply => BridgeMessage::ConstructProofReply(body(rest)?),
            BridgeOp::ValidateHandle => BridgeMessage::ValidateHandle(body(rest)?),
            BridgeOp::ValidateHandleReply => BridgeMessage::ValidateHandleReply(body(rest)?),
            BridgeOp::ReleaseHandle => BridgeMessage::ReleaseHandle(body(rest)?),
        })
    }
}

impl ConstructProofReply {
    pub fn denied() -> Self {
        Self {
            status: GrantStatus::Denied,
            handle: CapHandle::NULL.to_raw(),
            granted: 0,
            expiry: 0,
        }
    }

    pub fn handle(&self) -> CapHandle {
        CapHandle::from_raw(self.handle)
    }

    pub fn granted(&self) -> CapRights {
        CapRights::from_bits_truncate(self.granted)
    }

    pub fn expiry(&self) -> Expiry {
        Expiry::from_raw(self.expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_op_range() {
        let bytes = BridgeMessage::ReleaseHandle(ReleaseHandleNotice { handle: 5 })
            .encode()
            .unwrap();
        assert_eq!(bytes[0], BRIDGE_MAGIC);
        assert_eq!(bytes[1], BRIDGE_VERSION);
        let op = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(op >> 8, 0xCB);
        assert_eq!(bytes.len(), PREFIX_LEN + 8);
    }

    #[test]
    fn test_construct_proof_roundtrip() {
        let msg = BridgeMessage::ConstructProof(ConstructProofRequest {
            user: 1000,
            rights: CapRights::READ_WRITE.bits(),
            resource: b"/home/alice/notes.txt".to_vec(),
        });
        assert_eq!(BridgeMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_largest_body_fits() {
        let msg = BridgeMessage::ConstructProof(ConstructProofRequest {
            user: u64::MAX,
            rights: u32::MAX,
            resource: vec![b'x'; MAX_DESCRIPTOR_LEN],
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), MAX_BRIDGE_BODY);
        assert_eq!(BridgeMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_descriptor_too_long() {
        let msg = BridgeMessage::ConstructProof(ConstructProofRequest {
            user: 1,
            rights: 1,
            resource: vec![0; MAX_DESCRIPTOR_LEN + 1],
        });
        assert_eq!(
            msg.encode(),
            Err(BridgeError::DescriptorTooLong(MAX_DESCRIPTOR_LEN + 1))
        );
    }

    #[test]
    fn test_rejects_foreign_payloads() {
        assert_eq!(BridgeMessage::decode(b"hello"), Err(BridgeError::NotBridge));
        assert_eq!(BridgeMessage::decode(&[]), Err(BridgeError::NotBridge));
        assert_eq!(
            BridgeMessage::decode(&[BRIDGE_MAGIC, 9, 0x01, 0xCB]),
            Err(BridgeError::UnsupportedVersion(9))
        );
        assert_eq!(
            BridgeMessage::decode(&[BRIDGE_MAGIC, BRIDGE_VERSION, 0xFF, 0xCB]),
            Err(BridgeError::UnknownOp(0xCBFF))
        );
        assert!(matches!(
            BridgeMessage::decode(&[BRIDGE_MAGIC, BRIDGE_VERSION, 0x05, 0xCB, 1, 2]),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        let status = ValidationStatus::Insufficient {
            missing: CapRights::WRITE,
        };
        let wire = HandleStatus::from(status);
        assert_eq!(ValidationStatus::from(wire), status);
    }
}
