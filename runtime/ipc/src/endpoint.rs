//! Endpoint Registry
//!
//! Maps communication addresses to live endpoint state. Like capability
//! handles, an [`Endpoint`] is a slot index plus generation, so an address
//! kept after `destroy` can never reach a newer endpoint in the same slot.
//!
//! Each endpoint owns:
//! - a bounded inbox for call and send envelopes
//! - a notification word (pending bits are OR-ed together, level-triggered)
//! - the counter it draws outgoing message identifiers from
//!
//! Destruction closes the inbox under its lock. A sender racing with
//! `destroy` either enqueues before the close (and its envelope is handed
//! back to the caller of `destroy`) or observes the closed inbox and gets
//! `DestGone`. No envelope is ever half delivered.

use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use cap_broker::SubjectId;
use log::{debug, warn};

use crate::message::Envelope;
use crate::{IpcError, Result};

/// Communication address
///
/// Raw layout: `generation << 32 | (index + 1)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(u64);

/// Never a valid endpoint
pub const EP_INVALID: Endpoint = Endpoint(0);

/// Receive filter accepting any sender; never a destination
pub const EP_ANY: Endpoint = Endpoint(u64::MAX);

/// Notification bit raised on a sender whose queued message was discarded
/// because its destination was destroyed
pub const NOTIFY_UNDELIVERABLE: u64 = 1 << 63;

/// Notification bit raised on a fast channel receiver after each write
pub const NOTIFY_FAST_DATA: u64 = 1 << 62;

/// Notification bit raised on a fast channel sender after each read
pub const NOTIFY_FAST_SPACE: u64 = 1 << 61;

/// Most endpoints a registry can address; the slot index must fit below the
/// generation bits after the +1 bias
pub const MAX_ENDPOINTS: usize = u32::MAX as usize - 1;

/// Bits reserved for the IPC core; masked out of user notifications
pub const NOTIFY_RESERVED: u64 = NOTIFY_UNDELIVERABLE | NOTIFY_FAST_DATA | NOTIFY_FAST_SPACE;

impl Endpoint {
    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Neither of the sentinels
    #[inline]
    pub fn is_addressable(self) -> bool {
        self != EP_INVALID && self != EP_ANY
    }

    fn index(self) -> Option<usize> {
        let low = (self.0 & 0xFFFF_FFFF) as u32;
        low.checked_sub(1).map(|i| i as usize)
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EP_INVALID => f.write_str("EP_INVALID"),
            EP_ANY => f.write_str("EP_ANY"),
            Endpoint(raw) => write!(f, "Endpoint({:#x})", raw),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep:{:x}", self.0)
    }
}

#[derive(Debug)]
struct Inbox {
    open: bool,
    queue: VecDeque<Envelope>,
}

/// Live state behind an endpoint address
#[derive(Debug)]
pub struct EndpointState {
    id: Endpoint,
    owner: SubjectId,
    depth: usize,
    inbox: Mutex<Inbox>,
    notification: AtomicU64,
    next_msg_id: AtomicU64,
}

impl EndpointState {
    fn new(id: Endpoint, owner: SubjectId, depth: usize) -> Self {
        Self {
            id,
            owner,
            depth,
            inbox: Mutex::new(Inbox {
                open: true,
                queue: VecDeque::with_capacity(depth.min(64)),
            }),
            notification: AtomicU64::new(0),
            next_msg_id: AtomicU64::new(1),
        }
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Endpoint {
        self.id
    }

    /// Subject that created the endpoint
    pub fn owner(&self) -> SubjectId {
        self.owner
    }

    /// Fresh message identifier for an outgoing message
    pub fn next_message_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an envelope for delivery
    ///
    /// # Errors
    /// - `DestGone` if the endpoint was destroyed
    /// - `WouldBlock` if the inbox is at capacity
    pub fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let mut inbox = self.inbox();
        if !inbox.open {
            return Err(IpcError::DestGone(self.id));
        }
        if inbox.queue.len() >= self.depth {
            return Err(IpcError::WouldBlock(self.id));
        }
        inbox.queue.push_back(envelope);
        Ok(())
    }

    /// Take the oldest envelope from `from` (or from anyone, with `EP_ANY`)
    pub fn take(&self, from: Endpoint) -> Option<Envelope> {
        let mut inbox = self.inbox();
        if from == EP_ANY {
            return inbox.queue.pop_front();
        }
        let position = inbox.queue.iter().position(|e| e.sender() == from)?;
        inbox.queue.remove(position)
    }

    /// Pull a queued, undelivered envelope back out of the inbox
    ///
    /// The caller owns whatever capability copies it carries.
    pub fn withdraw(&self, sender: Endpoint, msg_id: u64) -> Option<Envelope> {
        let mut inbox = self.inbox();
        let position = inbox
            .queue
            .iter()
            .position(|e| e.sender() == sender && e.msg_id() == msg_id)?;
        inbox.queue.remove(position)
    }

    /// Queued envelopes
    pub fn pending(&self) -> usize {
        self.inbox().queue.len()
    }

    pub fn is_open(&self) -> bool {
        self.inbox().open
    }

    /// Raise notification bits (coalescing)
    pub fn signal(&self, bits: u64) {
        self.notification.fetch_or(bits, Ordering::AcqRel);
    }

    /// Take and clear every pending notification bit
    pub fn take_notifications(&self) -> u64 {
        self.notification.swap(0, Ordering::AcqRel)
    }

    /// Close the inbox and hand back everything still queued
    fn close(&self) -> Vec<Envelope> {
        let mut inbox = self.inbox();
        inbox.open = false;
        inbox.queue.drain(..).collect()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    state: Option<Arc<EndpointState>>,
}

#[derive(Debug, Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked table of live endpoints
#[derive(Debug)]
pub struct EndpointRegistry {
    table: RwLock<Table>,
    max_endpoints: usize,
    mailbox_depth: usize,
}

impl EndpointRegistry {
    /// `max_endpoints` is clamped to [`MAX_ENDPOINTS`]
    pub fn new(max_endpoints: usize, mailbox_depth: usize) -> Self {
        if max_endpoints > MAX_ENDPOINTS {
            warn!("endpoint limit {} clamped to {}", max_endpoints, MAX_ENDPOINTS);
        }
        Self {
            table: RwLock::new(Table::default()),
            max_endpoints: max_endpoints.min(MAX_ENDPOINTS),
            mailbox_depth,
        }
    }

    /// Create an endpoint owned by `owner`
    ///
    /// # Errors
    /// `TooManyEndpoints` when `max_endpoints` are already live
    pub fn create(&self, owner: SubjectId) -> Result<Endpoint> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.live >= self.max_endpoints {
            return Err(IpcError::TooManyEndpoints {
                max: self.max_endpoints,
            });
        }

        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                table.slots.push(Slot::default());
                (table.slots.len() - 1) as u32
            }
        };

        let slot = &mut table.slots[index as usize];
        let id = Endpoint::new(index, slot.generation);
        slot.state = Some(Arc::new(EndpointState::new(id, owner, self.mailbox_depth)));
        table.live += 1;

        debug!("endpoint {} created for {}", id, owner);
        Ok(id)
    }

    /// Remove an endpoint and close its inbox
    ///
    /// Returns the endpoint state (for teardown bookkeeping) and the
    /// envelopes that were queued but never delivered.
    ///
    /// # Errors
    /// - `InvalidEndpoint` for a sentinel
    /// - `EndpointNotFound` if it is not live
    pub fn destroy(&self, endpoint: Endpoint) -> Result<(Arc<EndpointState>, Vec<Envelope>)> {
        if !endpoint.is_addressable() {
            return Err(IpcError::InvalidEndpoint(endpoint));
        }

        let state = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let index = endpoint
                .index()
                .ok_or(IpcError::EndpointNotFound(endpoint))?;
            let slot = table
                .slots
                .get_mut(index)
                .filter(|s| s.generation == endpoint.generation())
                .ok_or(IpcError::EndpointNotFound(endpoint))?;
            let state = slot
                .state
                .take()
                .ok_or(IpcError::EndpointNotFound(endpoint))?;

            slot.generation = slot.generation.wrapping_add(1);
            table.free.push(index as u32);
            table.live -= 1;
            state
        };

        let undelivered = state.close();
        debug!(
            "endpoint {} destroyed, {} undelivered envelopes",
            endpoint,
            undelivered.len()
        );
        Ok((state, undelivered))
    }

    /// Resolve an address to its live state
    ///
    /// # Errors
    /// - `InvalidEndpoint` for a sentinel
    /// - `EndpointNotFound` if it is not live
    pub fn lookup(&self, endpoint: Endpoint) -> Result<Arc<EndpointState>> {
        if !endpoint.is_addressable() {
            return Err(IpcError::InvalidEndpoint(endpoint));
        }

        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        endpoint
            .index()
            .and_then(|i| table.slots.get(i))
            .filter(|s| s.generation == endpoint.generation())
            .and_then(|s| s.state.clone())
            .ok_or(IpcError::EndpointNotFound(endpoint))
    }

    pub fn is_alive(&self, endpoint: Endpoint) -> bool {
        self.lookup(endpoint).is_ok()
    }

    pub fn max_endpoints(&self) -> usize {
        self.max_endpoints
    }

    /// Live endpoints
    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
