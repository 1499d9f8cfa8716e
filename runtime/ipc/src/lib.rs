//! KaaL IPC - message passing and capability mediation
//!
//! # Purpose
//! The mechanism by which isolated components exchange fixed-format
//! messages, attach capabilities to them, and invoke privileged operations
//! across a trust boundary.
//!
//! # Integration Points
//! - Depends on: `cap-broker` (capability registry, the single choke point
//!   for every capability check)
//! - Provides to: kernel-call handlers and privileged servers
//! - IPC endpoints: created per component through [`Ipc::endpoint_create`]
//! - Capabilities required: handles attached to a message must be live and
//!   owned by the sending endpoint's subject
//!
//! # Architecture
//! Leaf-first:
//! - [`buffer`]: reference-counted payload buffers (zero copy)
//! - [`endpoint`]: generation-checked endpoint table with bounded inboxes
//! - [`message`] / [`codec`]: envelope types and the checksummed wire format
//! - [`engine`]: blocking call/reply pairing with timeout and cancellation
//! - [`ring`] / [`broker`]: lock-free SPSC byte channels and their bookkeeping
//! - [`bridge`]: construct-proof / validate-handle / release-handle exchange
//! - [`ipc`]: the facade tying everything to one process-wide instance
//!
//! Only `call` ever blocks. Every other operation completes or fails
//! immediately; backpressure is reported, never absorbed.
//!
//! # Testing Strategy
//! - Unit tests: per module
//! - Property tests: codec round-trip, ring FIFO byte-exactness
//! - Integration tests: threaded call/reply, teardown during calls, bridge
//!   scenarios against a live authority

pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod ipc;
pub mod message;
pub mod ring;
pub mod stats;

pub use broker::ChannelId;
pub use buffer::{BufferFlags, BufferPool, IpcBuffer};
pub use codec::{CodecError, EnvelopeCodec, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
pub use config::{BridgeConfig, ConfigError, IpcConfig};
pub use endpoint::{
    Endpoint, EP_ANY, EP_INVALID, MAX_ENDPOINTS, NOTIFY_FAST_DATA, NOTIFY_FAST_SPACE,
    NOTIFY_RESERVED, NOTIFY_UNDELIVERABLE,
};
pub use ipc::{Delivery, Ipc};
pub use message::{Envelope, MessageFlags, MessageHeader, MessageKind, MAX_CAPS};
pub use ring::{FastReceiver, FastSender};
pub use stats::IpcStatsSnapshot;

use cap_broker::{CapHandle, CapabilityError, ValidationStatus};
use thiserror::Error;

/// IPC error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("{0:?} is not an addressable endpoint")]
    InvalidEndpoint(Endpoint),

    #[error("endpoint {0} not found")]
    EndpointNotFound(Endpoint),

    #[error("destination {0} is gone")]
    DestGone(Endpoint),

    #[error("endpoint {0} would block")]
    WouldBlock(Endpoint),

    #[error("out of buffer memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("endpoint limit reached ({max})")]
    TooManyEndpoints { max: usize },

    #[error("outstanding call limit reached ({max})")]
    TooManyCalls { max: usize },

    #[error("no outstanding call {msg_id} from {caller}")]
    NoSuchRequest { caller: Endpoint, msg_id: u64 },

    #[error("fast channel full")]
    Full,

    #[error("fast channel empty")]
    Empty,

    #[error("fast channel closed")]
    ChannelClosed,

    #[error("invalid fast channel size {capacity}")]
    InvalidChannelSize { capacity: usize },

    #[error("call timed out")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("call from {caller} to {dest} would deadlock")]
    Deadlock { caller: Endpoint, dest: Endpoint },

    #[error("one-shot buffer already delivered")]
    BufferConsumed,

    #[error("capability {handle} rejected: {status:?}")]
    CapabilityDenied {
        handle: CapHandle,
        status: ValidationStatus,
    },

    #[error("{0:?} messages cannot be submitted as raw bytes")]
    UnsupportedKind(MessageKind),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed message; detected at decode time
    Protocol,
    /// Capability missing, expired, insufficient or refused
    Capability,
    /// Saturation or absence; recoverable by backoff or an alternate path
    Resource,
    /// Terminal for the call, not for the process
    Liveness,
}

impl IpcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IpcError::Codec(_) | IpcError::UnsupportedKind(_) => ErrorClass::Protocol,
            IpcError::CapabilityDenied { .. } | IpcError::Capability(_) => ErrorClass::Capability,
            IpcError::Timeout | IpcError::Cancelled | IpcError::Deadlock { .. } => {
                ErrorClass::Liveness
            }
            IpcError::InvalidEndpoint(_)
            | IpcError::EndpointNotFound(_)
            | IpcError::DestGone(_)
            | IpcError::WouldBlock(_)
            | IpcError::OutOfMemory { .. }
            | IpcError::BufferConsumed
            | IpcError::TooManyEndpoints { .. }
            | IpcError::TooManyCalls { .. }
            | IpcError::NoSuchRequest { .. }
            | IpcError::Full
            | IpcError::Empty
            | IpcError::ChannelClosed
            | IpcError::InvalidChannelSize { .. } => ErrorClass::Resource,
        }
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;
