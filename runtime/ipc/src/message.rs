//! Message envelope types
//!
//! An [`Envelope`] is a [`MessageHeader`], up to [`MAX_CAPS`] attached
//! capability references and a shared payload buffer. The envelope never
//! interprets the capability references it carries; the registry does that
//! when a receiver presents them.

use bitflags::bitflags;
use cap_broker::{CapHandle, Timestamp};

use crate::buffer::IpcBuffer;
use crate::endpoint::Endpoint;

/// Capability references one envelope can carry
pub const MAX_CAPS: usize = 4;

/// Message kind, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Invalid = 0,
    Call = 1,
    Reply = 2,
    Send = 3,
    Notify = 4,
    Interrupt = 5,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Invalid),
            1 => Some(MessageKind::Call),
            2 => Some(MessageKind::Reply),
            3 => Some(MessageKind::Send),
            4 => Some(MessageKind::Notify),
            5 => Some(MessageKind::Interrupt),
            _ => None,
        }
    }
}

bitflags! {
    /// Delivery hints carried in the header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        const URGENT = 1 << 0;
        const RELIABLE = 1 << 1;
        const ENCRYPTED = 1 << 2;
        const COMPRESSED = 1 << 3;
    }
}

/// Fixed header fields
///
/// Payload length, capability count and checksum are derived from the
/// envelope contents at encode time, so they cannot disagree with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub sender: Endpoint,
    pub receiver: Endpoint,
    /// Pairs a reply with its call
    pub msg_id: u64,
    pub flags: MessageFlags,
    pub timestamp: Timestamp,
}

impl MessageHeader {
    pub fn new(kind: MessageKind, sender: Endpoint, receiver: Endpoint, msg_id: u64) -> Self {
        Self {
            kind,
            sender,
            receiver,
            msg_id,
            flags: MessageFlags::empty(),
            timestamp: Timestamp::ZERO,
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Header plus payload plus attached capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: MessageHeader,
    pub caps: Vec<CapHandle>,
    pub payload: IpcBuffer,
}

impl Envelope {
    pub fn new(header: MessageHeader, payload: IpcBuffer) -> Self {
        Self {
            header,
            caps: Vec::new(),
            payload,
        }
    }

    pub fn with_caps(mut self, caps: &[CapHandle]) -> Self {
        self.caps = caps.to_vec();
        self
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    #[inline]
    pub fn sender(&self) -> Endpoint {
        self.header.sender
    }

    #[inline]
    pub fn msg_id(&self) -> u64 {
        self.header.msg_id
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }
}
