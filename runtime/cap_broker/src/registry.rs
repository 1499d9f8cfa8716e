//! Capability Handle Registry
//!
//! The authority table mapping opaque [`CapHandle`]s to
//! (subject, rights, expiry) grants. It is the only component that can mint
//! or invalidate handles.
//!
//! ## Structure
//!
//! Entries live in a slot arena. Each slot carries a generation counter that
//! is bumped whenever the slot is reclaimed, so stale handles fail the
//! generation check instead of aliasing a newer entry.
//!
//! Derivation links form a tree (the KaaL CDT model): every derived or
//! delegated entry records its parent, and every parent records its
//! children. Revocation walks the subtree and marks each entry invalid.
//!
//! ## State machine
//!
//! ```text
//! ACTIVE --restrict--> ACTIVE
//! ACTIVE --revoke / expiry--> INVALID   (terminal)
//! any    --release / sweep--> slot reclaimed, handle becomes Unknown
//! ```
//!
//! ## Concurrency
//!
//! The whole table sits behind one `RwLock`. `validate` takes the read side,
//! every mutation takes the write side, so a `validate` observing `Granted`
//! is ordered before any `revoke` that has not yet completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, trace, warn};

use crate::handle::{CapHandle, ResourceRef, SubjectId};
use crate::rights::CapRights;
use crate::time::{Clock, Expiry, Timestamp};
use crate::{CapabilityError, Result};

/// Default bound on registry entries
pub const DEFAULT_MAX_CAPABILITIES: usize = 4096;

/// Largest capacity a registry accepts; a slot index must stay below the
/// handle's generation bits after the +1 bias
pub const MAX_CAPABILITIES: usize = u32::MAX as usize - 1;

/// Outcome of [`CapabilityRegistry::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    /// Handle is live and carries every requested right
    Granted,
    /// Handle reached its expiry or was revoked
    Expired,
    /// Handle is live but lacks `missing`
    Insufficient { missing: CapRights },
    /// Handle does not name a registry entry (never issued, released, or stale)
    Unknown,
}

impl ValidationStatus {
    #[inline]
    pub fn is_granted(&self) -> bool {
        matches!(self, ValidationStatus::Granted)
    }

    /// Compact status code used on the wire
    pub fn code(&self) -> u8 {
        match self {
            ValidationStatus::Granted => 0,
            ValidationStatus::Expired => 1,
            ValidationStatus::Insufficient { .. } => 2,
            ValidationStatus::Unknown => 3,
        }
    }
}

/// Lifecycle state of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapState {
    Active,
    Invalid,
}

/// Read-only snapshot of a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapInfo {
    pub subject: SubjectId,
    pub rights: CapRights,
    pub expiry: Expiry,
    pub resource: Option<ResourceRef>,
    pub parent: Option<CapHandle>,
    pub state: CapState,
}

#[derive(Debug)]
struct CapEntry {
    subject: SubjectId,
    rights: CapRights,
    expiry: Expiry,
    resource: Option<ResourceRef>,
    parent: Option<CapHandle>,
    children: Vec<CapHandle>,
    state: CapState,
}

impl CapEntry {
    fn root(
        subject: SubjectId,
        rights: CapRights,
        expiry: Expiry,
        resource: Option<ResourceRef>,
    ) -> Self {
        Self {
            subject,
            rights,
            expiry,
            resource,
            parent: None,
            children: Vec::new(),
            state: CapState::Active,
        }
    }

    fn child_of(
        parent_handle: CapHandle,
        parent: &CapEntry,
        subject: SubjectId,
        rights: CapRights,
    ) -> Self {
        Self {
            subject,
            rights,
            expiry: parent.expiry,
            resource: parent.resource,
            parent: Some(parent_handle),
            children: Vec::new(),
            state: CapState::Active,
        }
    }

    fn info(&self) -> CapInfo {
        CapInfo {
            subject: self.subject,
            rights: self.rights,
            expiry: self.expiry,
            resource: self.resource,
            parent: self.parent,
            state: self.state,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<CapEntry>,
}

/// Slot arena holding every entry
#[derive(Debug)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
}

impl Table {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    fn get(&self, handle: CapHandle) -> Option<&CapEntry> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, handle: CapHandle) -> Option<&mut CapEntry> {
        let slot = self.slots.get_mut(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Look up an entry that may be used as a source of authority
    fn live(&self, handle: CapHandle, now: Timestamp) -> Result<&CapEntry> {
        let entry = self
            .get(handle)
            .ok_or(CapabilityError::UnknownHandle(handle))?;
        if entry.state == CapState::Invalid {
            return Err(CapabilityError::Revoked(handle));
        }
        if entry.expiry.has_passed(now) {
            return Err(CapabilityError::Expired(handle));
        }
        Ok(entry)
    }

    fn insert(&mut self, entry: CapEntry) -> Result<CapHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Ok(CapHandle::new(index, slot.generation));
        }

        if self.slots.len() >= self.capacity {
            return Err(CapabilityError::TableFull {
                capacity: self.capacity,
            });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Ok(CapHandle::new(index, 0))
    }

    /// Mark `root` and every live descendant invalid; returns how many
    /// entries changed state
    fn invalidate_subtree(&mut self, root: CapHandle) -> usize {
        let mut changed = 0;
        let mut stack = vec![root];

        while let Some(handle) = stack.pop() {
            if let Some(entry) = self.get_mut(handle) {
                if entry.state == CapState::Active {
                    entry.state = CapState::Invalid;
                    changed += 1;
                }
                stack.extend(entry.children.iter().copied());
            }
        }

        changed
    }

    /// Reclaim the slot behind `handle`, unlinking it from its parent
    fn reclaim(&mut self, handle: CapHandle) {
        let Some(index) = handle.index() else { return };
        let Some(slot) = self.slots.get_mut(index) else { return };
        if slot.generation != handle.generation() {
            return;
        }
        let Some(entry) = slot.entry.take() else { return };

        // Generation bump turns every outstanding copy of the handle stale
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index as u32);

        if let Some(parent) = entry.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|c| *c != handle);
        }
    }

    fn handles(&self) -> impl Iterator<Item = (CapHandle, &CapEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|e| (CapHandle::new(i as u32, slot.generation), e))
        })
    }

    fn occupied(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Registry counters
#[derive(Debug, Default)]
struct RegistryStats {
    validations: AtomicU64,
    grants: AtomicU64,
    denials: AtomicU64,
    derivations: AtomicU64,
    failed_derivations: AtomicU64,
    revocations: AtomicU64,
    releases: AtomicU64,
    swept: AtomicU64,
}

/// Point-in-time copy of the registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStatsSnapshot {
    pub validations: u64,
    pub grants: u64,
    pub denials: u64,
    pub derivations: u64,
    pub failed_derivations: u64,
    pub revocations: u64,
    pub releases: u64,
    pub swept: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// The capability authority table
pub struct CapabilityRegistry {
    table: RwLock<Table>,
    clock: Arc<dyn Clock>,
    stats: RegistryStats,
}

impl CapabilityRegistry {
    /// Create a registry holding at most `capacity` entries
    ///
    /// `capacity` is clamped to [`MAX_CAPABILITIES`].
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        if capacity > MAX_CAPABILITIES {
            warn!("registry capacity {} clamped to {}", capacity, MAX_CAPABILITIES);
        }
        Self {
            table: RwLock::new(Table::new(capacity.min(MAX_CAPABILITIES))),
            clock,
            stats: RegistryStats::default(),
        }
    }

    /// The clock expiry is measured against
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the registry clock
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Construct a root capability
    ///
    /// This is the only way to create authority that is not derived from
    /// an existing handle. Reserved for the kernel and the bridge authority.
    ///
    /// # Errors
    /// `TableFull` when the registry is at capacity
    pub fn mint(
        &self,
        subject: SubjectId,
        rights: CapRights,
        expiry: Expiry,
        resource: Option<ResourceRef>,
    ) -> Result<CapHandle> {
        let handle = self
            .write()
            .insert(CapEntry::root(subject, rights, expiry, resource))?;
        debug!("mint {} for {} rights={} expiry={:?}", handle, subject, rights, expiry);
        Ok(handle)
    }

    /// Derive a child handle with `requested` rights for the same subject
    ///
    /// # Errors
    /// - `RightsExceeded` if `requested` is not a subset of the parent's
    ///   current rights
    /// - `Expired` / `Revoked` / `UnknownHandle` if the parent cannot act
    ///   as a source of authority
    /// - `TableFull` when the registry is at capacity
    pub fn derive(&self, parent: CapHandle, requested: CapRights) -> Result<CapHandle> {
        let result = self.attach_child(parent, requested, None);
        match &result {
            Ok(child) => {
                bump(&self.stats.derivations);
                debug!("derive {} -> {} rights={}", parent, child, requested);
            }
            Err(err) => {
                bump(&self.stats.failed_derivations);
                debug!("derive from {} refused: {}", parent, err);
            }
        }
        result
    }

    /// Delegate a handle to `target` with the source's full rights
    pub fn delegate(&self, handle: CapHandle, target: SubjectId) -> Result<CapHandle> {
        let rights = self.read().live(handle, self.now())?.rights;
        self.delegate_with(handle, target, rights)
    }

    /// Delegate a handle to `target` with attenuated rights
    ///
    /// The delegated entry is a child of `handle`, so revoking the source
    /// also revokes the delegation.
    pub fn delegate_with(
        &self,
        handle: CapHandle,
        target: SubjectId,
        rights: CapRights,
    ) -> Result<CapHandle> {
        let delegated = self.attach_child(handle, rights, Some(target))?;
        debug!("delegate {} -> {} to {} rights={}", handle, delegated, target, rights);
        Ok(delegated)
    }

    fn attach_child(
        &self,
        parent: CapHandle,
        rights: CapRights,
        subject: Option<SubjectId>,
    ) -> Result<CapHandle> {
        let now = self.now();
        let mut table = self.write();

        let source = table.live(parent, now)?;
        if !rights.is_subset_of(source.rights) {
            return Err(CapabilityError::RightsExceeded {
                requested: rights,
                available: source.rights,
            });
        }

        let child = CapEntry::child_of(parent, source, subject.unwrap_or(source.subject), rights);
        let handle = table.insert(child)?;
        if let Some(source) = table.get_mut(parent) {
            source.children.push(handle);
        }
        Ok(handle)
    }

    /// Narrow a handle's rights in place
    ///
    /// Live descendants are clamped to the new rights as well, so no
    /// derived handle ever holds more than its ancestors.
    ///
    /// # Errors
    /// `RightsExceeded` if `new_rights` would widen the handle
    pub fn restrict(&self, handle: CapHandle, new_rights: CapRights) -> Result<()> {
        let now = self.now();
        let mut table = self.write();

        let entry = table.live(handle, now)?;
        if !new_rights.is_subset_of(entry.rights) {
            return Err(CapabilityError::RightsExceeded {
                requested: new_rights,
                available: entry.rights,
            });
        }

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            if let Some(entry) = table.get_mut(current) {
                entry.rights &= new_rights;
                stack.extend(entry.children.iter().copied());
            }
        }

        debug!("restrict {} to {}", handle, new_rights);
        Ok(())
    }

    /// Invalidate a handle and, transitively, every handle derived from it
    ///
    /// Idempotent: revoking an already revoked, released, stale or
    /// never-issued handle is a no-op. Returns the number of entries that
    /// changed state.
    pub fn revoke(&self, handle: CapHandle) -> usize {
        let changed = self.write().invalidate_subtree(handle);
        if changed > 0 {
            self.stats.revocations.fetch_add(changed as u64, Ordering::Relaxed);
            debug!("revoke {} invalidated {} entries", handle, changed);
        }
        changed
    }

    /// Check a handle for `requested` rights
    ///
    /// The single choke point in front of every privileged operation. Has
    /// no side effects on the table.
    pub fn validate(&self, handle: CapHandle, requested: CapRights) -> ValidationStatus {
        let now = self.now();
        let status = match self.read().get(handle) {
            None => ValidationStatus::Unknown,
            Some(entry) => Self::judge(entry, requested, now),
        };
        self.record(handle, status);
        status
    }

    /// Like [`validate`](Self::validate), but the handle must also belong
    /// to `subject`
    ///
    /// A handle presented by someone other than its owner resolves to
    /// `Unknown`, which reveals nothing about the entry.
    pub fn validate_for(
        &self,
        subject: SubjectId,
        handle: CapHandle,
        requested: CapRights,
    ) -> ValidationStatus {
        let now = self.now();
        let status = match self.read().get(handle) {
            Some(entry) if entry.subject == subject => Self::judge(entry, requested, now),
            _ => ValidationStatus::Unknown,
        };
        self.record(handle, status);
        status
    }

    fn judge(entry: &CapEntry, requested: CapRights, now: Timestamp) -> ValidationStatus {
        if entry.state == CapState::Invalid || entry.expiry.has_passed(now) {
            ValidationStatus::Expired
        } else if !requested.is_subset_of(entry.rights) {
            ValidationStatus::Insufficient {
                missing: requested.missing_from(entry.rights),
            }
        } else {
            ValidationStatus::Granted
        }
    }

    fn record(&self, handle: CapHandle, status: ValidationStatus) {
        bump(&self.stats.validations);
        if status.is_granted() {
            bump(&self.stats.grants);
        } else {
            bump(&self.stats.denials);
        }
        trace!("validate {} -> {:?}", handle, status);
    }

    /// Explicitly destroy a handle
    ///
    /// Invalidates the subtree rooted at `handle` and reclaims the handle's
    /// own slot. Descendants stay as invalid tombstones until the next sweep.
    ///
    /// # Errors
    /// `UnknownHandle` if the handle does not name an entry
    pub fn release(&self, handle: CapHandle) -> Result<()> {
        let mut table = self.write();
        if table.get(handle).is_none() {
            return Err(CapabilityError::UnknownHandle(handle));
        }

        table.invalidate_subtree(handle);
        table.reclaim(handle);
        bump(&self.stats.releases);
        debug!("release {}", handle);
        Ok(())
    }

    /// Extend a live handle's expiry to `until`
    ///
    /// The new expiry never exceeds the parent's expiry and never moves
    /// earlier than the current one. Returns the effective expiry.
    pub fn renew(&self, handle: CapHandle, until: Expiry) -> Result<Expiry> {
        let now = self.now();
        let mut table = self.write();

        let entry = table.live(handle, now)?;
        let ceiling = entry
            .parent
            .and_then(|p| table.get(p))
            .map(|p| p.expiry)
            .unwrap_or(Expiry::Never);
        let current = entry.expiry;
        let candidate = until.min(ceiling);

        let effective = match (current, candidate) {
            (Expiry::Never, _) => Expiry::Never,
            (_, Expiry::Never) => Expiry::Never,
            (Expiry::At(a), Expiry::At(b)) => Expiry::At(a.max(b)),
        };

        if let Some(entry) = table.get_mut(handle) {
            entry.expiry = effective;
        }
        trace!("renew {} until {:?}", handle, effective);
        Ok(effective)
    }

    /// Reclaim the slots of every expired or revoked entry
    ///
    /// This is the correctness backstop for handles nobody released.
    /// Returns the number of slots reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();
        let mut table = self.write();

        let expired: Vec<CapHandle> = table
            .handles()
            .filter(|(_, e)| e.state == CapState::Active && e.expiry.has_passed(now))
            .map(|(h, _)| h)
            .collect();
        for handle in expired {
            table.invalidate_subtree(handle);
        }

        let dead: Vec<CapHandle> = table
            .handles()
            .filter(|(_, e)| e.state == CapState::Invalid)
            .map(|(h, _)| h)
            .collect();
        for handle in &dead {
            table.reclaim(*handle);
        }

        if !dead.is_empty() {
            self.stats.swept.fetch_add(dead.len() as u64, Ordering::Relaxed);
            debug!("sweep reclaimed {} entries", dead.len());
        }
        dead.len()
    }

    /// Snapshot of the entry behind `handle`, if any
    pub fn info(&self, handle: CapHandle) -> Option<CapInfo> {
        self.read().get(handle).map(CapEntry::info)
    }

    /// Number of occupied slots (live entries plus tombstones)
    pub fn len(&self) -> usize {
        self.read().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        let s = &self.stats;
        RegistryStatsSnapshot {
            validations: s.validations.load(Ordering::Relaxed),
            grants: s.grants.load(Ordering::Relaxed),
            denials: s.denials.load(Ordering::Relaxed),
            derivations: s.derivations.load(Ordering::Relaxed),
            failed_derivations: s.failed_derivations.load(Ordering::Relaxed),
            revocations: s.revocations.load(Ordering::Relaxed),
            releases: s.releases.load(Ordering::Relaxed),
            swept: s.swept.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::time::Duration;

    fn registry() -> (CapabilityRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        (CapabilityRegistry::new(64, clock.clone()), clock)
    }

    const ALICE: SubjectId = SubjectId(1);
    const BOB: SubjectId = SubjectId(2);

    #[test]
    fn test_mint_and_validate() {
        let (reg, _) = registry();
        let h = reg.mint(ALICE, CapRights::READ_WRITE, Expiry::Never, None).unwrap();

        assert_eq!(reg.validate(h, CapRights::READ), ValidationStatus::Granted);
        assert_eq!(reg.validate(h, CapRights::READ_WRITE), ValidationStatus::Granted);
        assert_eq!(
            reg.validate(h, CapRights::EXECUTE),
            ValidationStatus::Insufficient {
                missing: CapRights::EXECUTE
            }
        );
    }

    #[test]
    fn test_derive_rights_exceeded() {
        let (reg, _) = registry();
        let parent = reg.mint(ALICE, CapRights::READ_WRITE, Expiry::Never, None).unwrap();

        let result = reg.derive(parent, CapRights::READ_WRITE | CapRights::EXECUTE);
        assert_eq!(
            result,
            Err(CapabilityError::RightsExceeded {
                requested: CapRights::READ_WRITE | CapRights::EXECUTE,
                available: CapRights::READ_WRITE,
            })
        );
        assert_eq!(reg.stats().failed_derivations, 1);
    }

    #[test]
    fn test_derive_inherits_subject_and_expiry() {
        let (reg, _) = registry();
        let expiry = Expiry::At(Timestamp(5_000));
        let parent = reg
            .mint(ALICE, CapRights::READ_WRITE, expiry, Some(ResourceRef(9)))
            .unwrap();
        let child = reg.derive(parent, CapRights::READ).unwrap();

        let info = reg.info(child).unwrap();
        assert_eq!(info.subject, ALICE);
        assert_eq!(info.rights, CapRights::READ);
        assert_eq!(info.expiry, expiry);
        assert_eq!(info.resource, Some(ResourceRef(9)));
        assert_eq!(info.parent, Some(parent));
    }

    #[test]
    fn test_derive_from_revoked_parent_fails() {
        let (reg, _) = registry();
        let parent = reg.mint(ALICE, CapRights::all(), Expiry::Never, None).unwrap();
        reg.revoke(parent);
        assert_eq!(
            reg.derive(parent, CapRights::READ),
            Err(CapabilityError::Revoked(parent))
        );
    }

    #[test]
    fn test_derive_from_expired_parent_fails() {
        let (reg, clock) = registry();
        let parent = reg
            .mint(ALICE, CapRights::all(), Expiry::At(Timestamp(2_000)), None)
            .unwrap();
        clock.advance(Duration::from_nanos(1_000));
        assert_eq!(
            reg.derive(parent, CapRights::READ),
            Err(CapabilityError::Expired(parent))
        );
    }

    #[test]
    fn test_restrict_narrows_and_clamps_children() {
        let (reg, _) = registry();
        let root = reg.mint(ALICE, CapRights::all(), Expiry::Never, None).unwrap();
        let child = reg.derive(root, CapRights::READ_WRITE).unwrap();

        reg.restrict(root, CapRights::READ).unwrap();
        assert_eq!(reg.info(root).unwrap().rights, CapRights::READ);
        assert_eq!(reg.info(child).unwrap().rights, CapRights::READ);

        // Never widens
        assert!(matches!(
            reg.restrict(root, CapRights::READ_WRITE),
            Err(CapabilityError::RightsExceeded { .. })
        ));
    }

    #[test]
    fn test_revoke_is_transitive() {
        let (reg, _) = registry();
        let root = reg.mint(ALICE, CapRights::all(), Expiry::Never, None).unwrap();
        let child = reg.derive(root, CapRights::READ_WRITE).unwrap();
        let grandchild = reg.derive(child, CapRights::READ).unwrap();
        let delegated = reg.delegate(child, BOB).unwrap();

        assert_eq!(reg.revoke(root), 4);
        for h in [root, child, grandchild, delegated] {
            assert_eq!(reg.validate(h, CapRights::empty()), ValidationStatus::Expired);
        }
    }

    #[test]
    fn test_revoke_subtree_leaves_siblings() {
        let (reg, _) = registry();
        let root = reg.mint(ALICE, CapRights::all(), Expiry::Never, None).unwrap();
        let left = reg.derive(root, CapRights::READ).unwrap();
        let right = reg.derive(root, CapRights::WRITE).unwrap();

        reg.revoke(left);
        assert_eq!(reg.validate(left, CapRights::READ), ValidationStatus::Expired);
        assert_eq!(reg.validate(right, CapRights::WRITE), ValidationStatus::Granted);
        assert_eq!(reg.validate(root, CapRights::all()), ValidationStatus::Granted);
    }

    #[test]
    fn test_revoke_idempotent() {
        let (reg, _) = registry();
        let root = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();

        assert_eq!(reg.revoke(root), 1);
        let after_first = reg.info(root);
        assert_eq!(reg.revoke(root), 0);
        assert_eq!(reg.info(root), after_first);

        // Never-issued handles are fine too
        assert_eq!(reg.revoke(CapHandle::from_raw(0xdead_beef)), 0);
        assert_eq!(reg.revoke(CapHandle::NULL), 0);
    }

    #[test]
    fn test_delegate_changes_subject() {
        let (reg, _) = registry();
        let h = reg.mint(ALICE, CapRights::READ_WRITE, Expiry::Never, None).unwrap();
        let d = reg.delegate(h, BOB).unwrap();

        assert_eq!(reg.info(d).unwrap().subject, BOB);
        assert_eq!(reg.info(d).unwrap().rights, CapRights::READ_WRITE);
        assert_eq!(reg.validate_for(BOB, d, CapRights::READ), ValidationStatus::Granted);
        assert_eq!(reg.validate_for(ALICE, d, CapRights::READ), ValidationStatus::Unknown);

        assert!(matches!(
            reg.delegate_with(h, BOB, CapRights::ADMIN),
            Err(CapabilityError::RightsExceeded { .. })
        ));
    }

    #[test]
    fn test_expiry_beats_cached_state() {
        let (reg, clock) = registry();
        let h = reg
            .mint(ALICE, CapRights::READ, Expiry::At(Timestamp(1_500)), None)
            .unwrap();
        assert!(reg.validate(h, CapRights::READ).is_granted());

        clock.advance(Duration::from_nanos(500));
        assert_eq!(reg.validate(h, CapRights::READ), ValidationStatus::Expired);
    }

    #[test]
    fn test_release_makes_handle_unknown() {
        let (reg, _) = registry();
        let h = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        let child = reg.derive(h, CapRights::READ).unwrap();

        reg.release(h).unwrap();
        assert_eq!(reg.validate(h, CapRights::READ), ValidationStatus::Unknown);
        assert_eq!(reg.validate(child, CapRights::READ), ValidationStatus::Expired);
        assert_eq!(reg.release(h), Err(CapabilityError::UnknownHandle(h)));
    }

    #[test]
    fn test_reused_slot_does_not_alias() {
        let (reg, _) = registry();
        let old = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        reg.release(old).unwrap();

        let new = reg.mint(BOB, CapRights::all(), Expiry::Never, None).unwrap();
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
        assert_eq!(reg.validate(old, CapRights::READ), ValidationStatus::Unknown);

        // Revoking the stale handle must not touch the new occupant
        assert_eq!(reg.revoke(old), 0);
        assert!(reg.validate(new, CapRights::all()).is_granted());
    }

    #[test]
    fn test_table_full() {
        let clock = Arc::new(ManualClock::default());
        let reg = CapabilityRegistry::new(2, clock);
        reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        assert_eq!(
            reg.mint(ALICE, CapRights::READ, Expiry::Never, None),
            Err(CapabilityError::TableFull { capacity: 2 })
        );
    }

    #[test]
    fn test_capacity_clamped_to_handle_range() {
        let reg = CapabilityRegistry::new(usize::MAX, Arc::new(ManualClock::default()));
        assert_eq!(reg.capacity(), MAX_CAPABILITIES);

        let handle = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        assert_eq!(handle.generation(), 0);
    }

    #[test]
    fn test_sweep_reclaims_expired_and_revoked() {
        let (reg, clock) = registry();
        let short = reg
            .mint(ALICE, CapRights::READ, Expiry::At(Timestamp(1_100)), None)
            .unwrap();
        let revoked = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        let keep = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        reg.revoke(revoked);

        clock.advance(Duration::from_nanos(200));
        assert_eq!(reg.sweep_expired(), 2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.validate(short, CapRights::READ), ValidationStatus::Unknown);
        assert_eq!(reg.validate(revoked, CapRights::READ), ValidationStatus::Unknown);
        assert!(reg.validate(keep, CapRights::READ).is_granted());
    }

    #[test]
    fn test_renew_capped_by_parent() {
        let (reg, _) = registry();
        let parent = reg
            .mint(ALICE, CapRights::all(), Expiry::At(Timestamp(10_000)), None)
            .unwrap();
        let child = reg.derive(parent, CapRights::READ).unwrap();
        reg.restrict(child, CapRights::READ).unwrap();

        let effective = reg.renew(child, Expiry::At(Timestamp(50_000))).unwrap();
        assert_eq!(effective, Expiry::At(Timestamp(10_000)));

        let root_effective = reg.renew(parent, Expiry::At(Timestamp(50_000))).unwrap();
        assert_eq!(root_effective, Expiry::At(Timestamp(50_000)));

        // Renewing to an earlier time keeps the later expiry
        let kept = reg.renew(parent, Expiry::At(Timestamp(20_000))).unwrap();
        assert_eq!(kept, Expiry::At(Timestamp(50_000)));
    }

    #[test]
    fn test_stats_count_validations() {
        let (reg, _) = registry();
        let h = reg.mint(ALICE, CapRights::READ, Expiry::Never, None).unwrap();
        reg.validate(h, CapRights::READ);
        reg.validate(h, CapRights::WRITE);
        reg.validate(CapHandle::NULL, CapRights::READ);

        let stats = reg.stats();
        assert_eq!(stats.validations, 3);
        assert_eq!(stats.grants, 1);
        assert_eq!(stats.denials, 2);
    }
}
