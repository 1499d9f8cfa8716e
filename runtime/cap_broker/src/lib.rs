//! Capability Broker - capability authority for KaaL IPC
//!
//! # Purpose
//! Owns the capability handle registry: the table that maps opaque handles
//! to (subject, rights, expiry) grants. Every privileged operation in the
//! IPC layer is gated by a `validate` call against this registry.
//!
//! # Integration Points
//! - Depends on: nothing beyond a [`Clock`]
//! - Provides to: `kaal-ipc` (capability transfer checks, bridge authority)
//! - Capabilities required: none, this crate *is* the authority
//!
//! # Architecture
//! Handles are generation-checked slot indices. Derived and delegated
//! handles are linked to their parent, forming a derivation tree; revoking
//! a node invalidates its whole subtree. Rights only ever narrow along
//! the tree.
//!
//! # Testing Strategy
//! - Unit tests: per-module (rights algebra, handle packing, registry ops)
//! - Property tests: monotonic attenuation and transitive revocation
//! - Integration tests: concurrent validate/revoke, delegation chains

mod handle;
mod policy;
mod registry;
mod rights;
mod time;

#[cfg(test)]
mod tests_prop;

pub use handle::{CapHandle, ResourceRef, SubjectId};
pub use policy::{EntitlementPolicy, StaticEntitlements};
pub use registry::{
    CapInfo, CapState, CapabilityRegistry, RegistryStatsSnapshot, ValidationStatus,
    DEFAULT_MAX_CAPABILITIES, MAX_CAPABILITIES,
};
pub use rights::CapRights;
pub use time::{Clock, Expiry, ManualClock, MonotonicClock, Timestamp};

use thiserror::Error;

/// Error types for capability operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("requested rights {requested} exceed available rights {available}")]
    RightsExceeded {
        requested: CapRights,
        available: CapRights,
    },

    #[error("capability {0} has expired")]
    Expired(CapHandle),

    #[error("capability {0} has been revoked")]
    Revoked(CapHandle),

    #[error("unknown capability handle {0}")]
    UnknownHandle(CapHandle),

    #[error("capability table full ({capacity} entries)")]
    TableFull { capacity: usize },
}

pub type Result<T> = core::result::Result<T, CapabilityError>;
