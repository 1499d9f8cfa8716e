//! Channel Broker - fast channel bookkeeping
//!
//! Tracks every fast ring channel established through the IPC core so that
//! channels can be listed per endpoint and closed when either endpoint is
//! destroyed. The broker only holds weak references; dropping both halves
//! of a channel frees it regardless of the broker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::endpoint::Endpoint;
use crate::ring::{ChannelControl, FastChannel, FastReceiver, FastSender};
use crate::{IpcError, Result};

/// Channel identifier
pub type ChannelId = u64;

#[derive(Debug)]
pub struct ChannelBroker {
    channels: Mutex<BTreeMap<ChannelId, ChannelControl>>,
    next_id: AtomicU64,
    max_capacity: usize,
}

impl ChannelBroker {
    /// Create a broker refusing channels larger than `max_capacity` bytes
    pub fn new(max_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_capacity,
        }
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<ChannelId, ChannelControl>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establish a channel between two endpoints
    ///
    /// # Arguments
    /// * `producer` - Endpoint allowed to write
    /// * `consumer` - Endpoint allowed to read
    /// * `capacity` - Ring size in bytes (power of two)
    ///
    /// # Errors
    /// `InvalidChannelSize` for a capacity that is not a power of two or
    /// exceeds the configured maximum
    pub fn establish_channel(
        &self,
        producer: Endpoint,
        consumer: Endpoint,
        capacity: usize,
    ) -> Result<(ChannelId, FastSender, FastReceiver)> {
        if capacity > self.max_capacity {
            return Err(IpcError::InvalidChannelSize { capacity });
        }

        let (tx, rx) = FastChannel::create(producer, consumer, capacity)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.channels();
        channels.retain(|_, c| c.is_live());
        channels.insert(id, tx.control());

        debug!(
            "channel {} established {} -> {} ({} bytes)",
            id, producer, consumer, capacity
        );
        Ok((id, tx, rx))
    }

    /// Close one channel; false if it is unknown or already gone
    pub fn close_channel(&self, id: ChannelId) -> bool {
        match self.channels().remove(&id) {
            Some(control) => {
                let was_live = control.is_live();
                control.close();
                was_live
            }
            None => false,
        }
    }

    /// Live channels an endpoint participates in
    pub fn list_channels(&self, endpoint: Endpoint) -> Vec<ChannelId> {
        self.channels()
            .iter()
            .filter(|(_, c)| c.involves(endpoint) && c.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Close every channel involving `endpoint`; returns how many were live
    pub fn cleanup(&self, endpoint: Endpoint) -> usize {
        let mut channels = self.channels();
        let doomed: Vec<ChannelId> = channels
            .iter()
            .filter(|(_, c)| c.involves(endpoint))
            .map(|(id, _)| *id)
            .collect();

        let mut closed = 0;
        for id in doomed {
            if let Some(control) = channels.remove(&id) {
                if control.is_live() {
                    closed += 1;
                }
                control.close();
            }
        }
        closed
    }
}
