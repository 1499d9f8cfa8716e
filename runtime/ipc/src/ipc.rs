//! IPC facade - the process-boundary surface
//!
//! One [`Ipc`] instance owns the endpoint table, the call engine, the buffer
//! pool and the fast channel broker, and shares the capability registry
//! with whoever mints capabilities (bootstrap code, the bridge authority).
//!
//! ## Capability transfer
//! Handles attached to `send`, `call` and `reply` must be live, unexpired
//! and owned by the subject that owns the sending endpoint. On delivery each
//! one is delegated to the receiving endpoint's owner, so the receiver gets
//! its own handle and revoking the sender's original also revokes the copy.
//!
//! An envelope that is thrown away instead of received (inbox full,
//! destination destroyed, call cancelled or timed out before pickup) is
//! recalled: its capability copies are released and a one-shot payload
//! becomes sendable again.
//!
//! ## Teardown
//! `endpoint_destroy` closes the inbox first, so nothing new can arrive.
//! It then fails calls addressed to the endpoint with `DestGone`, cancels
//! calls it made, raises [`NOTIFY_UNDELIVERABLE`] on the senders of queued
//! async messages, and closes every fast channel it took part in.

use std::sync::Arc;
use std::time::Duration;

use cap_broker::{CapHandle, CapRights, CapabilityRegistry, MonotonicClock, SubjectId};
use log::{debug, trace, warn};

use crate::broker::{ChannelBroker, ChannelId};
use crate::buffer::{BufferFlags, BufferPool, IpcBuffer};
use crate::codec::{CodecError, EnvelopeCodec};
use crate::config::{ConfigError, IpcConfig};
use crate::endpoint::{
    Endpoint, EndpointRegistry, EndpointState, NOTIFY_FAST_DATA, NOTIFY_FAST_SPACE,
    NOTIFY_RESERVED, NOTIFY_UNDELIVERABLE,
};
use crate::engine::CallEngine;
use crate::message::{Envelope, MessageFlags, MessageHeader, MessageKind};
use crate::ring::{FastReceiver, FastSender};
use crate::stats::{IpcStats, IpcStatsSnapshot};
use crate::{IpcError, Result};

/// What `receive` hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Pending notification bits, coalesced since the last receive
    Notification { bits: u64 },
    /// A queued call or send
    Message(Envelope),
}

/// Process-wide IPC instance
pub struct Ipc {
    config: IpcConfig,
    registry: Arc<CapabilityRegistry>,
    endpoints: EndpointRegistry,
    engine: CallEngine,
    pool: BufferPool,
    codec: EnvelopeCodec,
    channels: ChannelBroker,
    stats: IpcStats,
}

impl Ipc {
    /// Bring up the IPC core around an existing capability registry
    ///
    /// # Errors
    /// - Any bound rejected by [`IpcConfig::validate`]
    /// - `CapacityMismatch` if the registry was not sized to
    ///   `max_capabilities`
    pub fn init(
        config: IpcConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        if registry.capacity() != config.max_capabilities {
            return Err(ConfigError::CapacityMismatch {
                configured: config.max_capabilities,
                registry: registry.capacity(),
            });
        }

        debug!(
            "ipc init: {} endpoints, {} calls, {} byte payloads, {} byte pool",
            config.max_endpoints,
            config.max_outstanding_calls,
            config.max_payload_size,
            config.buffer_pool_bytes
        );

        Ok(Self {
            endpoints: EndpointRegistry::new(config.max_endpoints, config.mailbox_depth),
            engine: CallEngine::new(config.max_outstanding_calls),
            pool: BufferPool::new(config.buffer_pool_bytes),
            codec: EnvelopeCodec::new(config.max_payload_size),
            channels: ChannelBroker::new(config.fast_ipc_buffer_size),
            stats: IpcStats::default(),
            registry,
            config,
        })
    }

    /// Bring up the IPC core with its own registry on the monotonic clock
    pub fn init_default(config: IpcConfig) -> core::result::Result<Self, ConfigError> {
        let registry = Arc::new(CapabilityRegistry::new(
            config.max_capabilities,
            Arc::new(MonotonicClock::new()),
        ));
        Self::init(config, registry)
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Count failures on the way out
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.stats.add_errors(1);
        }
        result
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Create an endpoint owned by `owner`
    pub fn endpoint_create(&self, owner: SubjectId) -> Result<Endpoint> {
        self.track(self.endpoints.create(owner))
    }

    /// Destroy an endpoint and settle everything that referenced it
    ///
    /// # Errors
    /// `InvalidEndpoint` for a sentinel, `EndpointNotFound` if not live
    pub fn endpoint_destroy(&self, endpoint: Endpoint) -> Result<()> {
        let (_state, undelivered) = self.track(self.endpoints.destroy(endpoint))?;

        let failed = self.engine.fail_calls_to(endpoint);

        let cancelled = self.engine.cancel_all_from(endpoint);
        for (key, target) in &cancelled {
            if let Ok(target) = self.endpoints.lookup(*target) {
                if let Some(request) = target.withdraw(key.caller, key.msg_id) {
                    self.recall(request);
                }
            }
        }

        let mut bounced = 0;
        for envelope in undelivered {
            let kind = envelope.kind();
            let sender = envelope.sender();
            self.recall(envelope);

            // Queued calls were settled by fail_calls_to
            if kind == MessageKind::Call {
                continue;
            }
            if let Ok(sender) = self.endpoints.lookup(sender) {
                sender.signal(NOTIFY_UNDELIVERABLE);
                bounced += 1;
            }
        }

        let channels = self.channels.cleanup(endpoint);

        debug!(
            "teardown {}: {} calls failed, {} cancelled, {} sends bounced, {} channels closed",
            endpoint,
            failed,
            cancelled.len(),
            bounced,
            channels
        );
        Ok(())
    }

    pub fn endpoint_alive(&self, endpoint: Endpoint) -> bool {
        self.endpoints.is_alive(endpoint)
    }

    /// Owner of a live endpoint
    pub fn endpoint_owner(&self, endpoint: Endpoint) -> Result<SubjectId> {
        self.endpoints.lookup(endpoint).map(|s| s.owner())
    }

    /// Destination lookup; a vanished destination is `DestGone`
    fn destination(&self, dest: Endpoint) -> Result<Arc<EndpointState>> {
        self.endpoints.lookup(dest).map_err(|err| match err {
            IpcError::EndpointNotFound(ep) => IpcError::DestGone(ep),
            other => other,
        })
    }

    // ------------------------------------------------------------------
    // Capability transfer
    // ------------------------------------------------------------------

    /// Check every attachment, then delegate each to `receiver`
    ///
    /// All-or-nothing: if any delegation fails the ones already made are
    /// released.
    fn transfer_caps(
        &self,
        sender: &EndpointState,
        receiver: SubjectId,
        caps: &[CapHandle],
    ) -> Result<Vec<CapHandle>> {
        for &handle in caps {
            let status = self
                .registry
                .validate_for(sender.owner(), handle, CapRights::empty());
            if !status.is_granted() {
                warn!("{} attached unusable {}: {:?}", sender.id(), handle, status);
                return Err(IpcError::CapabilityDenied { handle, status });
            }
        }

        let mut transferred = Vec::with_capacity(caps.len());
        for &handle in caps {
            match self.registry.delegate(handle, receiver) {
                Ok(copy) => transferred.push(copy),
                Err(err) => {
                    self.discard_caps(&transferred);
                    return Err(err.into());
                }
            }
        }
        Ok(transferred)
    }

    fn discard_caps(&self, caps: &[CapHandle]) {
        for &handle in caps {
            let _ = self.registry.release(handle);
        }
    }

    /// Undo an envelope that will never be received
    fn recall(&self, envelope: Envelope) {
        envelope.payload.unclaim_delivery();
        self.discard_caps(&envelope.caps);
    }

    /// Queue `envelope` on `target`, recalling it if the inbox refuses
    fn deliver(&self, target: &EndpointState, envelope: Envelope) -> Result<()> {
        let payload = envelope.payload.retain();
        let caps = envelope.caps.clone();
        target.enqueue(envelope).map_err(|err| {
            payload.unclaim_delivery();
            self.discard_caps(&caps);
            err
        })
    }

    fn header(
        &self,
        kind: MessageKind,
        sender: Endpoint,
        receiver: Endpoint,
        msg_id: u64,
        flags: MessageFlags,
    ) -> MessageHeader {
        MessageHeader::new(kind, sender, receiver, msg_id)
            .with_flags(flags)
            .with_timestamp(self.registry.now())
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Queue a message for `dest` without blocking
    ///
    /// # Errors
    /// - `WouldBlock` if the destination inbox is full
    /// - `DestGone` if the destination does not exist
    /// - `PayloadTooLarge` / `TooManyCaps` / `CapabilityDenied`
    /// - `BufferConsumed` for a one-shot payload that was already delivered
    pub fn send(
        &self,
        src: Endpoint,
        dest: Endpoint,
        payload: IpcBuffer,
        caps: &[CapHandle],
        flags: MessageFlags,
    ) -> Result<()> {
        self.track(self.send_inner(src, dest, payload, caps, flags))
    }

    fn send_inner(
        &self,
        src: Endpoint,
        dest: Endpoint,
        payload: IpcBuffer,
        caps: &[CapHandle],
        flags: MessageFlags,
    ) -> Result<()> {
        let sender = self.endpoints.lookup(src)?;
        let target = self.destination(dest)?;
        self.codec.check_bounds(payload.len(), caps.len())?;
        payload.claim_delivery()?;

        let transferred = match self.transfer_caps(&sender, target.owner(), caps) {
            Ok(caps) => caps,
            Err(err) => {
                payload.unclaim_delivery();
                return Err(err);
            }
        };
        let header = self.header(MessageKind::Send, src, dest, sender.next_message_id(), flags);
        let envelope = Envelope {
            header,
            caps: transferred.clone(),
            payload,
        };
        self.deliver(&target, envelope)?;

        self.stats.add_sent(1);
        self.stats.add_caps(transferred.len() as u64);
        trace!("send {} -> {} ({} caps)", src, dest, transferred.len());
        Ok(())
    }

    /// Take the next delivery for `endpoint`
    ///
    /// Pending notifications come first. Otherwise the oldest message from
    /// `from` (or from anyone, with [`EP_ANY`](crate::EP_ANY)) is returned.
    ///
    /// # Errors
    /// `WouldBlock` when nothing is pending
    pub fn receive(&self, endpoint: Endpoint, from: Endpoint) -> Result<Delivery> {
        let state = self.track(self.endpoints.lookup(endpoint))?;

        let bits = state.take_notifications();
        if bits != 0 {
            return Ok(Delivery::Notification { bits });
        }

        match state.take(from) {
            Some(envelope) => {
                self.stats.add_received(1);
                Ok(Delivery::Message(envelope))
            }
            None => Err(IpcError::WouldBlock(endpoint)),
        }
    }

    /// Send a request and block until the matching reply arrives
    ///
    /// `timeout = None` waits indefinitely.
    ///
    /// # Errors
    /// - `Timeout` when no reply arrives in time
    /// - `DestGone` when the destination is or becomes gone
    /// - `Cancelled` when the call is cancelled externally
    /// - `Deadlock` when `dest` is `caller` or is itself waiting on `caller`
    /// - `WouldBlock` if the request cannot be queued (the call never starts)
    pub fn call(
        &self,
        caller: Endpoint,
        dest: Endpoint,
        payload: IpcBuffer,
        caps: &[CapHandle],
        flags: MessageFlags,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        self.track(self.call_inner(caller, dest, payload, caps, flags, timeout))
    }

    fn call_inner(
        &self,
        caller: Endpoint,
        dest: Endpoint,
        payload: IpcBuffer,
        caps: &[CapHandle],
        flags: MessageFlags,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let sender = self.endpoints.lookup(caller)?;
        let target = self.destination(dest)?;
        self.codec.check_bounds(payload.len(), caps.len())?;

        let msg_id = sender.next_message_id();
        // Registered before the request is visible, so teardown finds it
        let ticket = self
            .engine
            .register(caller, msg_id, dest, payload.retain())
            .map_err(|err| {
                if let IpcError::Deadlock { .. } = err {
                    self.stats.add_deadlocks(1);
                }
                err
            })?;

        if let Err(err) = payload.claim_delivery() {
            self.engine.cancel(caller, msg_id);
            return Err(err);
        }

        let transferred = match self.transfer_caps(&sender, target.owner(), caps) {
            Ok(caps) => caps,
            Err(err) => {
                self.engine.cancel(caller, msg_id);
                payload.unclaim_delivery();
                return Err(err);
            }
        };

        let header = self.header(MessageKind::Call, caller, dest, msg_id, flags);
        let envelope = Envelope {
            header,
            caps: transferred.clone(),
            payload,
        };
        if let Err(err) = self.deliver(&target, envelope) {
            self.engine.cancel(caller, msg_id);
            return Err(err);
        }

        self.stats.add_calls(1);
        self.stats.add_caps(transferred.len() as u64);
        trace!("call {} -> {} id={}", caller, dest, msg_id);

        match self.engine.wait(ticket, timeout) {
            Ok(reply) => {
                self.stats.add_received(1);
                Ok(reply)
            }
            Err(err @ (IpcError::Timeout | IpcError::Cancelled)) => {
                // Drop the request if the server never picked it up
                if let Some(request) = target.withdraw(caller, msg_id) {
                    self.recall(request);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Answer the call `msg_id` made by `caller`
    ///
    /// # Errors
    /// `NoSuchRequest` if that call is not outstanding against `replier`
    pub fn reply(
        &self,
        replier: Endpoint,
        caller: Endpoint,
        msg_id: u64,
        payload: IpcBuffer,
        caps: &[CapHandle],
    ) -> Result<()> {
        self.track(self.reply_inner(replier, caller, msg_id, payload, caps))
    }

    fn reply_inner(
        &self,
        replier: Endpoint,
        caller: Endpoint,
        msg_id: u64,
        payload: IpcBuffer,
        caps: &[CapHandle],
    ) -> Result<()> {
        let server = self.endpoints.lookup(replier)?;
        let client = self
            .endpoints
            .lookup(caller)
            .map_err(|_| IpcError::NoSuchRequest { caller, msg_id })?;
        self.codec.check_bounds(payload.len(), caps.len())?;
        payload.claim_delivery()?;

        let transferred = match self.transfer_caps(&server, client.owner(), caps) {
            Ok(caps) => caps,
            Err(err) => {
                payload.unclaim_delivery();
                return Err(err);
            }
        };
        let header =
            self.header(MessageKind::Reply, replier, caller, msg_id, MessageFlags::empty());
        let claimed = payload.retain();
        let envelope = Envelope {
            header,
            caps: transferred.clone(),
            payload,
        };

        if let Err(err) = self.engine.resolve_reply(replier, caller, msg_id, envelope) {
            claimed.unclaim_delivery();
            self.discard_caps(&transferred);
            return Err(err);
        }

        self.stats.add_replies(1);
        self.stats.add_caps(transferred.len() as u64);
        Ok(())
    }

    /// Raise notification bits on `dest`
    ///
    /// Bits reserved for the IPC core are masked off. Pending bits coalesce
    /// until the destination receives them.
    pub fn notify(&self, dest: Endpoint, value: u64) -> Result<()> {
        let target = self.track(self.destination(dest))?;
        target.signal(value & !NOTIFY_RESERVED);
        self.stats.add_notifications(1);
        Ok(())
    }

    /// Cancel an outstanding call; false if it already resolved
    ///
    /// A request the server has not picked up yet is recalled.
    pub fn cancel_call(&self, caller: Endpoint, msg_id: u64) -> bool {
        let Some(target) = self.engine.cancel(caller, msg_id) else {
            return false;
        };
        if let Ok(target) = self.endpoints.lookup(target) {
            if let Some(request) = target.withdraw(caller, msg_id) {
                self.recall(request);
            }
        }
        true
    }

    /// Calls waiting for a reply
    pub fn outstanding_calls(&self) -> usize {
        self.engine.outstanding()
    }

    /// Decode a wire message and route it
    ///
    /// Only non-blocking kinds are accepted: `Send` is queued like
    /// [`send`](Self::send); `Notify` carries its value in at most eight
    /// payload bytes (little endian, zero extended).
    ///
    /// # Errors
    /// `Codec(TrailingBytes)` for a `Notify` payload longer than eight bytes
    pub fn submit(&self, bytes: &[u8]) -> Result<()> {
        let envelope = self.track(self.codec.decode(bytes).map_err(IpcError::from))?;
        let header = envelope.header;

        match header.kind {
            MessageKind::Send => {
                let caps = envelope.caps;
                self.send(header.sender, header.receiver, envelope.payload, &caps, header.flags)
            }
            MessageKind::Notify => {
                self.track(self.endpoints.lookup(header.sender))?;
                let payload = envelope.payload();
                if payload.len() > 8 {
                    let extra = CodecError::TrailingBytes(payload.len() - 8);
                    return self.track(Err(extra.into()));
                }
                let mut raw = [0u8; 8];
                raw[..payload.len()].copy_from_slice(payload);
                self.notify(header.receiver, u64::from_le_bytes(raw))
            }
            other => self.track(Err(IpcError::UnsupportedKind(other))),
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn buffer_alloc(&self, size: usize) -> Result<IpcBuffer> {
        self.track(self.pool.allocate(size))
    }

    /// Allocate a buffer carrying `flags`, e.g. a one-shot payload
    pub fn buffer_alloc_with_flags(&self, size: usize, flags: BufferFlags) -> Result<IpcBuffer> {
        self.track(self.pool.allocate_with_flags(size, flags))
    }

    /// Allocate a pool buffer holding a copy of `bytes`
    pub fn buffer_from(&self, bytes: &[u8]) -> Result<IpcBuffer> {
        self.track(self.pool.allocate_from(bytes))
    }

    pub fn buffer_ref(&self, buffer: &IpcBuffer) -> IpcBuffer {
        buffer.retain()
    }

    pub fn buffer_unref(&self, buffer: IpcBuffer) {
        buffer.release()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Fast IPC
    // ------------------------------------------------------------------

    /// Establish a fast channel from `sender` to `receiver`
    ///
    /// # Errors
    /// `InvalidChannelSize` unless `capacity` is a power of two no larger
    /// than `fast_ipc_buffer_size`
    pub fn fast_ipc_create(
        &self,
        sender: Endpoint,
        receiver: Endpoint,
        capacity: usize,
    ) -> Result<(ChannelId, FastSender, FastReceiver)> {
        self.track(self.endpoints.lookup(sender))?;
        self.track(self.destination(receiver))?;
        self.track(self.channels.establish_channel(sender, receiver, capacity))
    }

    /// Write to a fast channel and signal the receiver
    pub fn fast_ipc_send(&self, tx: &mut FastSender, data: &[u8]) -> Result<usize> {
        let written = self.track(tx.send(data))?;
        if written > 0 {
            if let Ok(receiver) = self.endpoints.lookup(tx.receiver()) {
                receiver.signal(NOTIFY_FAST_DATA);
            }
        }
        self.stats.add_fast_ops(1);
        Ok(written)
    }

    /// Read from a fast channel and signal the sender
    pub fn fast_ipc_receive(&self, rx: &mut FastReceiver, max: usize) -> Result<Vec<u8>> {
        let bytes = self.track(rx.receive(max))?;
        if !bytes.is_empty() {
            if let Ok(sender) = self.endpoints.lookup(rx.sender()) {
                sender.signal(NOTIFY_FAST_SPACE);
            }
        }
        self.stats.add_fast_ops(1);
        Ok(bytes)
    }

    pub fn fast_ipc_close(&self, id: ChannelId) -> bool {
        self.channels.close_channel(id)
    }

    pub fn fast_ipc_channels(&self, endpoint: Endpoint) -> Vec<ChannelId> {
        self.channels.list_channels(endpoint)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> IpcStatsSnapshot {
        self.stats.snapshot()
    }
}
