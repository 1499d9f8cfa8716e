//! Bridge authority (kernel side)
//!
//! Answers construct-proof and validate-handle calls and consumes
//! release-handle notices arriving on its endpoint.
//!
//! Grant policy: the authority grants `requested ∩ entitled`, never fails a
//! request merely for asking too much, and always reports what it actually
//! granted. Proofs are minted for the *user*, with a lease that each
//! successful validate-handle refreshes up to a fixed maximum lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cap_broker::{
    CapHandle, CapRights, CapabilityRegistry, EntitlementPolicy, Expiry, ResourceRef, SubjectId,
    Timestamp, ValidationStatus,
};
use log::{debug, trace, warn};

use super::protocol::{
    BridgeMessage, ConstructProofReply, ConstructProofRequest, GrantStatus, ReleaseHandleNotice,
    ValidateHandleReply, ValidateHandleRequest, MAX_DESCRIPTOR_LEN,
};
use super::BridgeError;
use crate::config::BridgeConfig;
use crate::endpoint::{Endpoint, EP_ANY};
use crate::ipc::{Delivery, Ipc};
use crate::message::{Envelope, MessageKind};
use crate::IpcError;

#[derive(Debug, Clone, Copy)]
struct Issue {
    server: Endpoint,
    /// Lease refreshes never extend past this
    deadline: Timestamp,
}

pub struct BridgeAuthority {
    endpoint: Endpoint,
    registry: Arc<CapabilityRegistry>,
    policy: Arc<dyn EntitlementPolicy>,
    config: BridgeConfig,
    issued: Mutex<HashMap<CapHandle, Issue>>,
}

impl BridgeAuthority {
    /// Create the authority and its kernel-owned endpoint
    pub fn new(ipc: &Ipc, policy: Arc<dyn EntitlementPolicy>) -> Result<Self, BridgeError> {
        let endpoint = ipc.endpoint_create(SubjectId::KERNEL)?;
        debug!("bridge authority listening on {}", endpoint);

        Ok(Self {
            endpoint,
            registry: ipc.registry().clone(),
            policy,
            config: ipc.config().bridge.clone(),
            issued: Mutex::new(HashMap::new()),
        })
    }

    /// Endpoint servers address bridge traffic to
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn issued(&self) -> MutexGuard<'_, HashMap<CapHandle, Issue>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Proofs currently tracked as issued
    pub fn outstanding_proofs(&self) -> usize {
        self.issued().len()
    }

    /// Mint a proof for `server` on behalf of a user
    pub fn construct_proof(
        &self,
        server: Endpoint,
        request: &ConstructProofRequest,
    ) -> ConstructProofReply {
        if request.resource.len() > MAX_DESCRIPTOR_LEN {
            warn!("{} sent oversized resource descriptor", server);
            return ConstructProofReply::denied();
        }

        let user = SubjectId(request.user);
        let requested = CapRights::from_bits_truncate(request.rights);
        let entitled = self.policy.entitled_rights(user, &request.resource);
        let granted = requested & entitled;

        if granted.is_empty() {
            debug!(
                "proof for {} denied: requested {}, entitled {}",
                user, requested, entitled
            );
            return ConstructProofReply::denied();
        }

        let now = self.registry.now();
        let expiry = Expiry::after(now, self.config.lease());
        let resource = ResourceRef(u64::from(crc32fast::hash(&request.resource)));

        let handle = match self.registry.mint(user, granted, expiry, Some(resource)) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("proof for {} not minted: {}", user, err);
                return ConstructProofReply::denied();
            }
        };

        self.issued().insert(
            handle,
            Issue {
                server,
                deadline: now.saturating_add(self.config.max_lifetime()),
            },
        );

        let status = if granted == requested {
            GrantStatus::Granted
        } else {
            GrantStatus::Partial
        };
        debug!(
            "proof {} for {} via {}: requested {}, granted {}",
            handle, user, server, requested, granted
        );

        ConstructProofReply {
            status,
            handle: handle.to_raw(),
            granted: granted.bits(),
            expiry: expiry.to_raw(),
        }
    }

    /// Report the current status of a proof issued to `server`
    ///
    /// Never changes the proof's rights. A granted check refreshes the
    /// lease, capped at the proof's maximum lifetime.
    pub fn validate_handle(
        &self,
        server: Endpoint,
        request: &ValidateHandleRequest,
    ) -> ValidateHandleReply {
        let handle = CapHandle::from_raw(request.handle);
        let rights = CapRights::from_bits_truncate(request.rights);

        let issue = self.issued().get(&handle).copied();
        let Some(issue) = issue.filter(|i| i.server == server) else {
            return ValidateHandleReply {
                status: ValidationStatus::Unknown.into(),
                expiry: Expiry::At(Timestamp::ZERO).to_raw(),
            };
        };

        let status = self.registry.validate(handle, rights);
        let mut expiry = self
            .registry
            .info(handle)
            .map(|info| info.expiry)
            .unwrap_or(Expiry::At(Timestamp::ZERO));

        match status {
            ValidationStatus::Granted => {
                let lease = Expiry::after(self.registry.now(), self.config.lease());
                let capped = lease.min(Expiry::At(issue.deadline));
                if let Ok(refreshed) = self.registry.renew(handle, capped) {
                    expiry = refreshed;
                }
            }
            ValidationStatus::Unknown => {
                self.issued().remove(&handle);
            }
            _ => {}
        }

        trace!("validate-handle {} for {}: {:?}", handle, server, status);
        ValidateHandleReply {
            status: status.into(),
            expiry: expiry.to_raw(),
        }
    }

    /// Act on a release hint; only the server the proof was issued to may
    /// release it
    ///
    /// The proof stops validating immediately and its slot is reclaimed by
    /// the next [`sweep`](Self::sweep).
    pub fn release_handle(&self, server: Endpoint, notice: &ReleaseHandleNotice) -> bool {
        let handle = CapHandle::from_raw(notice.handle);
        let mut issued = self.issued();

        match issued.get(&handle) {
            Some(issue) if issue.server == server => {
                issued.remove(&handle);
                drop(issued);
                // Invalidate now, reclaim on the next sweep
                let revoked = self.registry.revoke(handle);
                debug!("proof {} released by {} ({} entries)", handle, server, revoked);
                true
            }
            Some(_) => {
                warn!("{} tried to release proof {} it does not hold", server, handle);
                false
            }
            None => false,
        }
    }

    /// Process one envelope taken from the authority endpoint
    pub fn handle(&self, ipc: &Ipc, envelope: Envelope) -> Result<(), BridgeError> {
        let sender = envelope.sender();

        let response = match BridgeMessage::decode(envelope.payload()) {
            Ok(BridgeMessage::ConstructProof(request)) => Some(BridgeMessage::ConstructProofReply(
                self.construct_proof(sender, &request),
            )),
            Ok(BridgeMessage::ValidateHandle(request)) => Some(BridgeMessage::ValidateHandleReply(
                self.validate_handle(sender, &request),
            )),
            Ok(BridgeMessage::ReleaseHandle(notice)) => {
                self.release_handle(sender, &notice);
                None
            }
            Ok(other) => {
                warn!("{} sent unexpected {:?}", sender, other.op());
                None
            }
            Err(err) => {
                warn!("malformed bridge message from {}: {}", sender, err);
                None
            }
        };

        if envelope.kind() != MessageKind::Call {
            return Ok(());
        }

        // Calls always get an answer, even an empty one, so callers never hang
        let bytes = match response {
            Some(message) => message.encode()?,
            None => Vec::new(),
        };
        let payload = ipc.buffer_from(&bytes)?;
        match ipc.reply(self.endpoint, sender, envelope.msg_id(), payload, &[]) {
            Ok(()) => Ok(()),
            Err(IpcError::NoSuchRequest { .. }) => {
                debug!("{} gave up before its bridge reply", sender);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drain the authority inbox; returns the number of messages handled
    pub fn serve_pending(&self, ipc: &Ipc) -> Result<usize, BridgeError> {
        let mut served = 0;
        loop {
            match ipc.receive(self.endpoint, EP_ANY) {
                Ok(Delivery::Message(envelope)) => {
                    if let Err(err) = self.handle(ipc, envelope) {
                        warn!("bridge message dropped: {}", err);
                    }
                    served += 1;
                }
                Ok(Delivery::Notification { .. }) => continue,
                Err(IpcError::WouldBlock(_)) => return Ok(served),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reclaim expired proofs and forget them
    pub fn sweep(&self) -> usize {
        let reclaimed = self.registry.sweep_expired();
        self.issued()
            .retain(|handle, _| self.registry.info(*handle).is_some());
        reclaimed
    }
}
