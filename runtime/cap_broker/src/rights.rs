//! Capability rights vocabulary
//!
//! Rights are a fixed bitmask. Every operation that narrows or checks
//! authority is expressed as a subset test over this mask.

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Rights granted by a capability handle
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapRights: u32 {
        /// Read the denoted resource
        const READ = 1 << 0;
        /// Modify the denoted resource
        const WRITE = 1 << 1;
        /// Execute / invoke the denoted resource
        const EXECUTE = 1 << 2;
        /// Derive further handles from this one
        const DERIVE = 1 << 3;
        /// Hand the capability to another subject
        const GRANT = 1 << 4;
        /// Destroy the denoted resource
        const DELETE = 1 << 5;
        /// Administrative control over the resource
        const ADMIN = 1 << 6;
    }
}

impl CapRights {
    /// Read + write, the common data-access pair
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Check that `self` is a (non-strict) subset of `parent`
    #[inline]
    pub fn is_subset_of(self, parent: CapRights) -> bool {
        parent.contains(self)
    }

    /// Rights present in `self` but absent from `available`
    #[inline]
    pub fn missing_from(self, available: CapRights) -> CapRights {
        self.difference(available)
    }
}

impl fmt::Debug for CapRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapRights({})", self)
    }
}

impl fmt::Display for CapRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }

        const LETTERS: [(CapRights, char); 7] = [
            (CapRights::READ, 'r'),
            (CapRights::WRITE, 'w'),
            (CapRights::EXECUTE, 'x'),
            (CapRights::DERIVE, 'd'),
            (CapRights::GRANT, 'g'),
            (CapRights::DELETE, 'D'),
            (CapRights::ADMIN, 'A'),
        ];

        for (flag, letter) in LETTERS {
            if self.contains(flag) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}
