//! Capability Bridge Protocol
//!
//! # Purpose
//! A privileged but non-kernel server (a filesystem, say) must hold a
//! kernel-minted capability before acting on behalf of a user. The bridge
//! is the exchange it uses to get one:
//!
//! - **construct-proof** (call): user, requested rights, resource
//!   descriptor → handle, granted rights, expiry
//! - **validate-handle** (call): cached handle, rights → status, refreshed
//!   expiry
//! - **release-handle** (send): best-effort hint that the handle is no
//!   longer needed
//!
//! # Architecture
//! - [`protocol`]: versioned wire bodies carried as envelope payloads
//! - [`authority`]: kernel side, mints through the capability registry
//! - [`client`]: server side, caches proofs and revalidates them
//!
//! Release is only an optimization. The registry's expiry sweep is what
//! eventually reclaims proofs nobody released.

pub mod authority;
pub mod client;
pub mod protocol;

pub use authority::BridgeAuthority;
pub use client::{BridgeClient, Proof};
pub use protocol::{
    BridgeMessage, BridgeOp, ConstructProofReply, ConstructProofRequest, GrantStatus,
    HandleStatus, ReleaseHandleNotice, ValidateHandleReply, ValidateHandleRequest,
};

use thiserror::Error;

use crate::IpcError;

/// Bridge errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("payload is not a bridge message")]
    NotBridge,

    #[error("unsupported bridge version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown bridge op {0:#06x}")]
    UnknownOp(u16),

    #[error("resource descriptor of {0} bytes exceeds {max}", max = protocol::MAX_DESCRIPTOR_LEN)]
    DescriptorTooLong(usize),

    #[error("malformed bridge body: {0}")]
    Malformed(String),

    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedOp { expected: BridgeOp, got: BridgeOp },

    #[error("proof denied")]
    Denied,

    #[error(transparent)]
    Ipc(#[from] IpcError),
}
