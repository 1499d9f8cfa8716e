//! Buffer Pool - reference-counted payload storage
//!
//! # Purpose
//! Message payloads are shared between sender and receiver instead of being
//! copied. An [`IpcBuffer`] is a counted reference to one allocation; the
//! storage is returned to its pool exactly when the last reference drops.
//!
//! # Architecture
//! The count is an `Arc`, so:
//! - `retain` is `Clone` and cannot fail
//! - `release` consumes the handle, so releasing twice does not type-check
//! - mutation is only possible while the holder is the sole reference
//!
//! The pool itself only tracks a byte budget; it hands out heap storage and
//! refuses allocations that would exceed the budget.
//!
//! A buffer flagged [`BufferFlags::DISCARD_AFTER_USE`] can be claimed for
//! delivery once. The claim lives in the shared storage, so a retained copy
//! of a delivered one-shot buffer cannot be sent again either.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::trace;

use crate::{IpcError, Result};

bitflags! {
    /// Per-buffer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Payload is consumed by a single delivery and must not be re-sent
        const DISCARD_AFTER_USE = 1 << 0;
    }
}

#[derive(Debug)]
struct PoolState {
    budget: usize,
    in_use: AtomicUsize,
    allocations: AtomicU64,
}

impl PoolState {
    fn reserve(&self, size: usize) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.budget)
            })
            .is_ok()
    }

    fn give_back(&self, size: usize) {
        self.in_use.fetch_sub(size, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Storage {
    data: Box<[u8]>,
    flags: BufferFlags,
    consumed: AtomicBool,
    pool: Option<Arc<PoolState>>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.give_back(self.data.len());
            trace!("buffer of {} bytes returned to pool", self.data.len());
        }
    }
}

/// Counted reference to a payload allocation
#[derive(Debug, Clone)]
pub struct IpcBuffer {
    storage: Arc<Storage>,
}

impl IpcBuffer {
    /// Wrap owned bytes in an unpooled buffer
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            storage: Arc::new(Storage {
                data: data.into_boxed_slice(),
                flags: BufferFlags::empty(),
                consumed: AtomicBool::new(false),
                pool: None,
            }),
        }
    }

    /// Empty unpooled buffer
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Take another reference to the same storage
    #[inline]
    pub fn retain(&self) -> IpcBuffer {
        self.clone()
    }

    /// Drop this reference; storage is freed when it was the last one
    #[inline]
    pub fn release(self) {
        drop(self)
    }

    /// Number of live references to the storage
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.data
    }

    /// Writable view, available only to the sole holder
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.storage).map(|s| &mut s.data[..])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.storage.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.data.is_empty()
    }

    pub fn flags(&self) -> BufferFlags {
        self.storage.flags
    }

    /// Mark a one-shot buffer as delivered
    ///
    /// Buffers without `DISCARD_AFTER_USE` can always be claimed.
    ///
    /// # Errors
    /// `BufferConsumed` if the storage was already claimed
    pub fn claim_delivery(&self) -> Result<()> {
        if !self.storage.flags.contains(BufferFlags::DISCARD_AFTER_USE) {
            return Ok(());
        }
        self.storage
            .consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IpcError::BufferConsumed)
    }

    /// Undo a claim whose delivery never happened
    pub(crate) fn unclaim_delivery(&self) {
        if self.storage.flags.contains(BufferFlags::DISCARD_AFTER_USE) {
            self.storage.consumed.store(false, Ordering::Release);
        }
    }

    /// A one-shot buffer that has already been delivered
    pub fn is_consumed(&self) -> bool {
        self.storage.consumed.load(Ordering::Acquire)
    }

    /// Check whether two references share storage
    pub fn ptr_eq(&self, other: &IpcBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl AsRef<[u8]> for IpcBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for IpcBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for IpcBuffer {}

/// Byte-budgeted allocator for [`IpcBuffer`]s
#[derive(Debug, Clone)]
pub struct BufferPool {
    state: Arc<PoolState>,
}

impl BufferPool {
    /// Create a pool that never holds more than `budget` bytes at once
    pub fn new(budget: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                budget,
                in_use: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes
    ///
    /// # Errors
    /// `OutOfMemory` when the allocation would exceed the pool budget
    pub fn allocate(&self, size: usize) -> Result<IpcBuffer> {
        self.allocate_with_flags(size, BufferFlags::empty())
    }

    pub fn allocate_with_flags(&self, size: usize, flags: BufferFlags) -> Result<IpcBuffer> {
        if !self.state.reserve(size) {
            return Err(IpcError::OutOfMemory { requested: size });
        }
        self.state.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(IpcBuffer {
            storage: Arc::new(Storage {
                data: vec![0u8; size].into_boxed_slice(),
                flags,
                consumed: AtomicBool::new(false),
                pool: Some(self.state.clone()),
            }),
        })
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn allocate_from(&self, bytes: &[u8]) -> Result<IpcBuffer> {
        let mut buffer = self.allocate(bytes.len())?;
        if let Some(dst) = buffer.as_mut_slice() {
            dst.copy_from_slice(bytes);
        }
        Ok(buffer)
    }

    /// Bytes currently held by live buffers
    pub fn in_use(&self) -> usize {
        self.state.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.state.budget.saturating_sub(self.in_use())
    }

    pub fn budget(&self) -> usize {
        self.state.budget
    }

    /// Total successful allocations over the pool's lifetime
    pub fn allocations(&self) -> u64 {
        self.state.allocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release_returns_bytes() {
        let pool = BufferPool::new(1024);
        let buffer = pool.allocate(100).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(pool.in_use(), 100);

        buffer.release();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let pool = BufferPool::new(128);
        let _held = pool.allocate(100).unwrap();
        assert_eq!(
            pool.allocate(64).unwrap_err(),
            IpcError::OutOfMemory { requested: 64 }
        );
        assert_eq!(pool.in_use(), 100);
    }

    #[test]
    fn test_freed_only_at_last_reference() {
        let pool = BufferPool::new(1024);
        let first = pool.allocate_from(b"hello").unwrap();
        let second = first.retain();
        assert_eq!(first.ref_count(), 2);
        assert!(first.ptr_eq(&second));

        first.release();
        assert_eq!(pool.in_use(), 5);
        assert_eq!(second.as_slice(), b"hello");

        second.release();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_mutation_requires_sole_reference() {
        let pool = BufferPool::new(64);
        let mut buffer = pool.allocate(4).unwrap();
        buffer.as_mut_slice().unwrap().copy_from_slice(b"abcd");

        let shared = buffer.retain();
        assert!(buffer.as_mut_slice().is_none());
        drop(shared);
        assert!(buffer.as_mut_slice().is_some());
    }

    #[test]
    fn test_unpooled_buffer() {
        let buffer = IpcBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        assert_eq!(buffer.flags(), BufferFlags::empty());
        assert!(IpcBuffer::empty().is_empty());
    }

    #[test]
    fn test_flags_preserved() {
        let pool = BufferPool::new(64);
        let buffer = pool
            .allocate_with_flags(8, BufferFlags::DISCARD_AFTER_USE)
            .unwrap();
        assert!(buffer.flags().contains(BufferFlags::DISCARD_AFTER_USE));
        assert!(buffer.retain().flags().contains(BufferFlags::DISCARD_AFTER_USE));
    }

    #[test]
    fn test_one_shot_claimed_once_across_references() {
        let pool = BufferPool::new(64);
        let buffer = pool
            .allocate_with_flags(8, BufferFlags::DISCARD_AFTER_USE)
            .unwrap();
        let copy = buffer.retain();

        buffer.claim_delivery().unwrap();
        assert!(copy.is_consumed());
        assert_eq!(copy.claim_delivery(), Err(IpcError::BufferConsumed));

        copy.unclaim_delivery();
        assert!(buffer.claim_delivery().is_ok());
    }

    #[test]
    fn test_plain_buffer_claims_freely() {
        let buffer = IpcBuffer::from_vec(vec![1]);
        buffer.claim_delivery().unwrap();
        buffer.claim_delivery().unwrap();
        assert!(!buffer.is_consumed());
    }
}
