//! Bridge client (server side)
//!
//! A privileged server holds one `BridgeClient` bound to its own endpoint.
//! Proofs are cached per (user, resource, rights) and revalidated before
//! reuse, so the common path is one validate-handle call instead of a fresh
//! construct-proof.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cap_broker::{CapHandle, CapRights, Expiry, SubjectId, ValidationStatus};
use log::{debug, trace};

use super::protocol::{
    BridgeMessage, BridgeOp, ConstructProofRequest, GrantStatus, ReleaseHandleNotice,
    ValidateHandleRequest,
};
use super::BridgeError;
use crate::endpoint::Endpoint;
use crate::ipc::Ipc;
use crate::message::MessageFlags;

/// A proof held by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proof {
    pub handle: CapHandle,
    pub granted: CapRights,
    pub expiry: Expiry,
    /// `Granted` or `Partial`; denied proofs are never handed out
    pub status: GrantStatus,
}

type CacheKey = (SubjectId, Vec<u8>, CapRights);

pub struct BridgeClient {
    endpoint: Endpoint,
    authority: Endpoint,
    timeout: Option<Duration>,
    cache: Mutex<HashMap<CacheKey, Proof>>,
}

impl BridgeClient {
    pub fn new(endpoint: Endpoint, authority: Endpoint) -> Self {
        Self {
            endpoint,
            authority,
            timeout: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Bound every bridge call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<CacheKey, Proof>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached proofs
    pub fn cached(&self) -> usize {
        self.cache().len()
    }

    fn request(
        &self,
        ipc: &Ipc,
        message: &BridgeMessage,
        expected: BridgeOp,
    ) -> Result<BridgeMessage, BridgeError> {
        let payload = ipc.buffer_from(&message.encode()?)?;
        let reply = ipc.call(
            self.endpoint,
            self.authority,
            payload,
            &[],
            MessageFlags::RELIABLE,
            self.timeout,
        )?;

        let answer = BridgeMessage::decode(reply.payload())?;
        if answer.op() != expected {
            return Err(BridgeError::UnexpectedOp {
                expected,
                got: answer.op(),
            });
        }
        Ok(answer)
    }

    /// Ask the authority for a proof covering `rights` on `resource`
    ///
    /// The result may carry fewer rights than requested; check
    /// [`Proof::granted`].
    ///
    /// # Errors
    /// - `Denied` when nothing at all was granted
    /// - `Ipc` when the call itself failed (timeout, authority gone, ...)
    pub fn construct_proof(
        &self,
        ipc: &Ipc,
        user: SubjectId,
        rights: CapRights,
        resource: &[u8],
    ) -> Result<Proof, BridgeError> {
        let message = BridgeMessage::ConstructProof(ConstructProofRequest {
            user: user.0,
            rights: rights.bits(),
            resource: resource.to_vec(),
        });

        let BridgeMessage::ConstructProofReply(reply) =
            self.request(ipc, &message, BridgeOp::ConstructProofReply)?
        else {
            return Err(BridgeError::NotBridge);
        };

        if reply.status == GrantStatus::Denied {
            return Err(BridgeError::Denied);
        }

        let proof = Proof {
            handle: reply.handle(),
            granted: reply.granted(),
            expiry: reply.expiry(),
            status: reply.status,
        };
        debug!("proof {} for {}: {:?} {}", proof.handle, user, proof.status, proof.granted);
        Ok(proof)
    }

    /// Ask the authority whether `handle` still grants `rights`
    pub fn validate_handle(
        &self,
        ipc: &Ipc,
        handle: CapHandle,
        rights: CapRights,
    ) -> Result<(ValidationStatus, Expiry), BridgeError> {
        let message = BridgeMessage::ValidateHandle(ValidateHandleRequest {
            handle: handle.to_raw(),
            rights: rights.bits(),
        });

        let BridgeMessage::ValidateHandleReply(reply) =
            self.request(ipc, &message, BridgeOp::ValidateHandleReply)?
        else {
            return Err(BridgeError::NotBridge);
        };

        let status = ValidationStatus::from(reply.status);
        trace!("validate {} -> {:?}", handle, status);
        Ok((status, Expiry::from_raw(reply.expiry)))
    }

    /// Cached proof for this request if still valid, otherwise a fresh one
    pub fn obtain(
        &self,
        ipc: &Ipc,
        user: SubjectId,
        rights: CapRights,
        resource: &[u8],
    ) -> Result<Proof, BridgeError> {
        let key = (user, resource.to_vec(), rights);

        let cached = self.cache().get(&key).copied();
        if let Some(proof) = cached {
            let (status, expiry) = self.validate_handle(ipc, proof.handle, proof.granted)?;
            if status.is_granted() {
                let refreshed = Proof { expiry, ..proof };
                self.cache().insert(key, refreshed);
                return Ok(refreshed);
            }
            debug!("cached proof {} is {:?}, reconstructing", proof.handle, status);
            self.cache().remove(&key);
        }

        let proof = self.construct_proof(ipc, user, rights, resource)?;
        self.cache().insert(key, proof);
        Ok(proof)
    }

    /// Tell the authority the proof is no longer needed
    ///
    /// Fire and forget. A lost notice only delays reclamation until the
    /// proof expires.
    pub fn release(&self, ipc: &Ipc, handle: CapHandle) -> Result<(), BridgeError> {
        self.cache().retain(|_, proof| proof.handle != handle);

        let notice = BridgeMessage::ReleaseHandle(ReleaseHandleNotice {
            handle: handle.to_raw(),
        });
        let payload = ipc.buffer_from(&notice.encode()?)?;
        ipc.send(
            self.endpoint,
            self.authority,
            payload,
            &[],
            MessageFlags::empty(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeAuthority;
    use crate::config::IpcConfig;
    use crate::IpcError;
    use cap_broker::StaticEntitlements;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    const USER: SubjectId = SubjectId(7);

    /// Run `f` against a live authority served from a polling thread
    fn with_authority<R>(f: impl FnOnce(&Ipc, &BridgeClient, &BridgeAuthority) -> R) -> R {
        let ipc = Ipc::init_default(IpcConfig::default()).unwrap();
        let policy = StaticEntitlements::new().grant(USER, "db/", CapRights::READ_WRITE);
        let authority = BridgeAuthority::new(&ipc, Arc::new(policy)).unwrap();
        let server = ipc.endpoint_create(SubjectId(90)).unwrap();
        let client =
            BridgeClient::new(server, authority.endpoint()).with_timeout(Duration::from_secs(5));

        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    if authority.serve_pending(&ipc).unwrap() == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            });
            let result = f(&ipc, &client, &authority);
            stop.store(true, Ordering::Release);
            result
        })
    }

    #[test]
    fn test_construct_and_validate() {
        with_authority(|ipc, client, _| {
            let proof = client
                .construct_proof(ipc, USER, CapRights::READ, b"db/users")
                .unwrap();
            assert_eq!(proof.status, GrantStatus::Granted);
            assert_eq!(proof.granted, CapRights::READ);

            let (status, _) = client
                .validate_handle(ipc, proof.handle, CapRights::READ)
                .unwrap();
            assert_eq!(status, ValidationStatus::Granted);

            let (status, _) = client
                .validate_handle(ipc, proof.handle, CapRights::READ_WRITE)
                .unwrap();
            assert_eq!(
                status,
                ValidationStatus::Insufficient {
                    missing: CapRights::WRITE
                }
            );
        });
    }

    #[test]
    fn test_denied_request() {
        with_authority(|ipc, client, _| {
            let err = client
                .construct_proof(ipc, SubjectId(8), CapRights::READ, b"db/users")
                .unwrap_err();
            assert_eq!(err, BridgeError::Denied);
        });
    }

    #[test]
    fn test_obtain_reuses_cached_proof() {
        with_authority(|ipc, client, authority| {
            let first = client.obtain(ipc, USER, CapRights::READ, b"db/a").unwrap();
            let second = client.obtain(ipc, USER, CapRights::READ, b"db/a").unwrap();

            assert_eq!(first.handle, second.handle);
            assert_eq!(client.cached(), 1);
            assert_eq!(authority.outstanding_proofs(), 1);
        });
    }

    #[test]
    fn test_obtain_replaces_revoked_proof() {
        with_authority(|ipc, client, _| {
            let first = client.obtain(ipc, USER, CapRights::READ, b"db/a").unwrap();
            ipc.registry().revoke(first.handle);

            let second = client.obtain(ipc, USER, CapRights::READ, b"db/a").unwrap();
            assert_ne!(first.handle, second.handle);
        });
    }

    #[test]
    fn test_release_drops_cache_entry() {
        with_authority(|ipc, client, _| {
            let proof = client.obtain(ipc, USER, CapRights::READ, b"db/a").unwrap();
            client.release(ipc, proof.handle).unwrap();
            assert_eq!(client.cached(), 0);
        });
    }

    #[test]
    fn test_authority_gone() {
        let ipc = Ipc::init_default(IpcConfig::default()).unwrap();
        let authority = BridgeAuthority::new(&ipc, Arc::new(StaticEntitlements::new())).unwrap();
        let server = ipc.endpoint_create(SubjectId(90)).unwrap();
        let client = BridgeClient::new(server, authority.endpoint());

        ipc.endpoint_destroy(authority.endpoint()).unwrap();
        let err = client
            .construct_proof(&ipc, USER, CapRights::READ, b"db/a")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Ipc(IpcError::DestGone(_))));
    }
}
