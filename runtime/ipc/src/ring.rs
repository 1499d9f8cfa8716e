//! Fast IPC Ring Channel
//!
//! # Purpose
//! Single-producer/single-consumer byte channel for latency-sensitive
//! same-node traffic. It bypasses envelopes and capability checks entirely;
//! peers establish trust over the general path before switching to it.
//!
//! # Architecture
//! Lock-free ring with two monotonically advancing cursors:
//! - `head`: total bytes written (producer owned, Release on publish)
//! - `tail`: total bytes read (consumer owned, Release on publish)
//!
//! The channel is full when `head - tail == capacity` and empty when they
//! are equal. Capacity is a power of two so the slot of a cursor is
//! `cursor & mask`. Ownership of [`FastSender`] and [`FastReceiver`] enforces
//! the single producer and single consumer; both take `&mut self`.
//!
//! Partial writes and reads are reported by count.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::endpoint::Endpoint;
use crate::{IpcError, Result};

struct Ring {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    closed: AtomicBool,
    sender: Endpoint,
    receiver: Endpoint,
}

// SAFETY: the producer only writes bytes in [head, tail + capacity) and the
// consumer only reads bytes in [tail, head). The two ranges never overlap,
// and each cursor is published with Release after the bytes it covers are
// written or read, and loaded with Acquire by the other side.
unsafe impl Sync for Ring {}

impl Ring {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent), so the cells are contiguous bytes
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Copy `data` into the ring starting at `cursor`, wrapping at the end
    ///
    /// # Safety
    /// Caller must be the producer and own `[cursor, cursor + data.len())`.
    unsafe fn write_at(&self, cursor: usize, data: &[u8]) {
        let start = cursor & self.mask;
        let first = data.len().min(self.capacity() - start);
        ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(start), first);
        ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), data.len() - first);
    }

    /// Copy bytes out of the ring starting at `cursor`, wrapping at the end
    ///
    /// # Safety
    /// Caller must be the consumer and `[cursor, cursor + out.len())` must
    /// hold published bytes.
    unsafe fn read_at(&self, cursor: usize, out: &mut [u8]) {
        let start = cursor & self.mask;
        let first = out.len().min(self.capacity() - start);
        ptr::copy_nonoverlapping(self.base().add(start), out.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), out.len() - first);
    }
}

/// Constructor for fast channel pairs
pub struct FastChannel;

impl FastChannel {
    /// Create a channel from `sender` to `receiver` holding `capacity` bytes
    ///
    /// # Errors
    /// `InvalidChannelSize` unless `capacity` is a non-zero power of two
    pub fn create(
        sender: Endpoint,
        receiver: Endpoint,
        capacity: usize,
    ) -> Result<(FastSender, FastReceiver)> {
        if !capacity.is_power_of_two() {
            return Err(IpcError::InvalidChannelSize { capacity });
        }

        let storage = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let ring = Arc::new(Ring {
            storage,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            sender,
            receiver,
        });

        Ok((
            FastSender { ring: ring.clone() },
            FastReceiver { ring },
        ))
    }
}

/// Producer half
pub struct FastSender {
    ring: Arc<Ring>,
}

impl FastSender {
    /// Write as much of `data` as fits; returns the bytes written
    ///
    /// # Errors
    /// - `Full` if no byte could be written
    /// - `ChannelClosed` once either side closed the channel
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let ring = &*self.ring;
        if ring.is_closed() {
            return Err(IpcError::ChannelClosed);
        }

        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        let free = ring.capacity() - head.wrapping_sub(tail);
        if free == 0 && !data.is_empty() {
            return Err(IpcError::Full);
        }

        let n = data.len().min(free);
        // SAFETY: we are the only producer and [head, head + n) is free
        unsafe { ring.write_at(head, &data[..n]) };
        ring.head.store(head.wrapping_add(n), Ordering::Release);
        Ok(n)
    }

    /// Bytes queued and not yet read
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn sender(&self) -> Endpoint {
        self.ring.sender
    }

    pub fn receiver(&self) -> Endpoint {
        self.ring.receiver
    }

    /// Teardown handle that does not keep the ring alive
    pub fn control(&self) -> ChannelControl {
        ChannelControl {
            ring: Arc::downgrade(&self.ring),
            sender: self.ring.sender,
            receiver: self.ring.receiver,
        }
    }

    pub fn close(&self) {
        self.ring.close();
    }
}

impl Drop for FastSender {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// Consumer half
pub struct FastReceiver {
    ring: Arc<Ring>,
}

impl FastReceiver {
    /// Read up to `max` bytes
    ///
    /// Bytes written before the channel closed can still be drained.
    ///
    /// # Errors
    /// - `Empty` if nothing is queued
    /// - `ChannelClosed` if nothing is queued and the channel is closed
    pub fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let available = self.available()?;
        let mut out = vec![0u8; available.min(max)];
        let n = self.receive_into(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Read into `out`; returns the bytes read
    pub fn receive_into(&mut self, out: &mut [u8]) -> Result<usize> {
        let ring = &*self.ring;
        let available = self.available()?;

        let tail = ring.tail.load(Ordering::Relaxed);
        let n = available.min(out.len());
        // SAFETY: we are the only consumer and [tail, tail + n) is published
        unsafe { ring.read_at(tail, &mut out[..n]) };
        ring.tail.store(tail.wrapping_add(n), Ordering::Release);
        Ok(n)
    }

    fn available(&self) -> Result<usize> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Acquire);
        let tail = ring.tail.load(Ordering::Relaxed);
        let available = head.wrapping_sub(tail);
        if available == 0 {
            return Err(if ring.is_closed() {
                IpcError::ChannelClosed
            } else {
                IpcError::Empty
            });
        }
        Ok(available)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn sender(&self) -> Endpoint {
        self.ring.sender
    }

    pub fn receiver(&self) -> Endpoint {
        self.ring.receiver
    }

    pub fn close(&self) {
        self.ring.close();
    }
}

impl Drop for FastReceiver {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// Weak handle used to close a channel when one of its endpoints goes away
#[derive(Debug, Clone)]
pub struct ChannelControl {
    ring: Weak<Ring>,
    sender: Endpoint,
    receiver: Endpoint,
}

impl ChannelControl {
    pub fn involves(&self, endpoint: Endpoint) -> bool {
        self.sender == endpoint || self.receiver == endpoint
    }

    /// Both halves still exist and the channel is open
    pub fn is_live(&self) -> bool {
        self.ring.upgrade().map(|r| !r.is_closed()).unwrap_or(false)
    }

    pub fn close(&self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.close();
        }
    }
}

impl core::fmt::Debug for Ring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    const TX: Endpoint = Endpoint::from_raw(1);
    const RX: Endpoint = Endpoint::from_raw(2);

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(matches!(
            FastChannel::create(TX, RX, 1000),
            Err(IpcError::InvalidChannelSize { capacity: 1000 })
        ));
        assert!(FastChannel::create(TX, RX, 0).is_err());
        assert!(FastChannel::create(TX, RX, 1024).is_ok());
    }

    #[test]
    fn test_send_receive() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 16).unwrap();
        assert_eq!(tx.send(b"hello").unwrap(), 5);
        assert_eq!(rx.receive(64).unwrap(), b"hello");
        assert_eq!(rx.receive(64).unwrap_err(), IpcError::Empty);
    }

    #[test]
    fn test_partial_write_then_full() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 8).unwrap();
        assert_eq!(tx.send(b"0123456789").unwrap(), 8);
        assert_eq!(tx.send(b"x").unwrap_err(), IpcError::Full);
        assert_eq!(tx.len(), 8);

        assert_eq!(rx.receive(3).unwrap(), b"012");
        assert_eq!(tx.send(b"abcdef").unwrap(), 3);
        assert_eq!(rx.receive(64).unwrap(), b"34567abc");
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 4).unwrap();
        for round in 0u8..20 {
            let chunk = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert_eq!(tx.send(&chunk).unwrap(), 3);
            assert_eq!(rx.receive(3).unwrap(), chunk);
        }
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 8).unwrap();
        tx.send(b"ab").unwrap();
        drop(tx);

        assert_eq!(rx.receive(8).unwrap(), b"ab");
        assert_eq!(rx.receive(8).unwrap_err(), IpcError::ChannelClosed);
    }

    #[test]
    fn test_control_closes_both_sides() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 8).unwrap();
        let control = tx.control();
        assert!(control.involves(RX));
        assert!(control.is_live());

        control.close();
        assert!(!control.is_live());
        assert_eq!(tx.send(b"a").unwrap_err(), IpcError::ChannelClosed);
        assert_eq!(rx.receive(1).unwrap_err(), IpcError::ChannelClosed);
    }

    #[test]
    fn test_threaded_fifo() {
        let (mut tx, mut rx) = FastChannel::create(TX, RX, 64).unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let producer = thread::spawn(move || {
            let mut sent = 0;
            while sent < data.len() {
                match tx.send(&data[sent..]) {
                    Ok(n) => sent += n,
                    Err(IpcError::Full) => thread::yield_now(),
                    Err(e) => panic!("send failed: {}", e),
                }
            }
        });

        let mut received = Vec::with_capacity(expected.len());
        while received.len() < expected.len() {
            match rx.receive(17) {
                Ok(bytes) => received.extend_from_slice(&bytes),
                Err(IpcError::Empty) => thread::yield_now(),
                Err(IpcError::ChannelClosed) => break,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        producer.join().unwrap();
        // Producer dropped: whatever is left is still readable
        while let Ok(bytes) = rx.receive(usize::MAX) {
            received.extend_from_slice(&bytes);
        }

        assert_eq!(received, expected);
    }

    proptest! {
        #[test]
        fn fifo_byte_exact(
            ops in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..40), 0usize..40), 1..64)
        ) {
            let (mut tx, mut rx) = FastChannel::create(TX, RX, 32).unwrap();
            let mut written = Vec::new();
            let mut read = Vec::new();

            for (chunk, want) in ops {
                if let Ok(n) = tx.send(&chunk) {
                    written.extend_from_slice(&chunk[..n]);
                }
                if let Ok(bytes) = rx.receive(want) {
                    read.extend_from_slice(&bytes);
                }
            }
            while let Ok(bytes) = rx.receive(32) {
                read.extend_from_slice(&bytes);
            }

            prop_assert_eq!(read, written);
        }
    }
}
