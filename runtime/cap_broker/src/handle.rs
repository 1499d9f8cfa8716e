//! Opaque capability handles and the identities they refer to
//!
//! A [`CapHandle`] packs a slot index and the slot's generation into one
//! 64-bit token. Holding a handle grants nothing by itself: every use goes
//! through the registry, which checks the generation against the live slot.
//! A handle whose slot has been reclaimed and reused therefore resolves to
//! `Unknown` instead of aliasing the new occupant.

use core::fmt;

use static_assertions::assert_eq_size;

/// Opaque reference to a capability registry entry
///
/// Layout of the raw value: `generation << 32 | (index + 1)`. The index is
/// biased by one so the raw value `0` never names a slot and can be used as
/// the "empty" marker in wire formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapHandle(u64);

assert_eq_size!(CapHandle, u64);

impl CapHandle {
    /// The never-valid handle (raw value `0`)
    pub const NULL: CapHandle = CapHandle(0);

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    /// Rebuild a handle from its transport representation
    ///
    /// Any value is accepted; forged or stale values are rejected when the
    /// registry looks them up.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Transport representation of this handle
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Check whether this is the null handle
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> Option<usize> {
        let low = (self.0 & 0xFFFF_FFFF) as u32;
        low.checked_sub(1).map(|i| i as usize)
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for CapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapHandle({:#018x})", self.0)
    }
}

impl fmt::Display for CapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap:{:x}", self.0)
    }
}

/// Identity of the subject (user, process, service) owning a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(pub u64);

impl SubjectId {
    /// The kernel itself
    pub const KERNEL: SubjectId = SubjectId(0);
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject:{}", self.0)
    }
}

/// Back-reference to the resource a capability denotes
///
/// The registry never interprets this value; it belongs to whichever
/// component minted the root capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef(pub u64);
