//! Synchronous Call/Reply Engine
//!
//! Every outstanding call has one entry in the pending table, keyed by the
//! caller's endpoint and the message identifier of the request. The entry
//! owns the sending half of a one-slot channel; the caller blocks on the
//! receiving half.
//!
//! An entry is resolved by removing it from the table and sending exactly
//! one outcome, both under the table lock. Whoever removes the entry wins:
//! a reply, a teardown, or a cancellation. A caller whose wait times out
//! tries to remove its own entry; if someone else got there first, the
//! outcome is already in the channel and the caller takes that instead.
//! Hence no double wake and no lost wake.
//!
//! Registration refuses a call that would close a wait cycle: if `dest` is
//! itself blocked, directly or through a chain of calls, on `caller`, nobody
//! in the cycle could ever reply.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{trace, warn};

use crate::buffer::IpcBuffer;
use crate::endpoint::Endpoint;
use crate::message::Envelope;
use crate::{IpcError, Result};

/// Identity of an outstanding call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub caller: Endpoint,
    pub msg_id: u64,
}

struct PendingCall {
    target: Endpoint,
    // Held until the call resolves, so the request payload outlives delivery
    _request: IpcBuffer,
    resolve: Sender<Result<Envelope>>,
}

impl PendingCall {
    fn resolve(self, outcome: Result<Envelope>) {
        // The channel has one slot and this is the only send
        let _ = self.resolve.try_send(outcome);
    }
}

/// Waiting side of a registered call
#[derive(Debug)]
pub struct CallTicket {
    key: CallKey,
    outcome: Receiver<Result<Envelope>>,
}

impl CallTicket {
    pub fn key(&self) -> CallKey {
        self.key
    }
}

/// True if `from` is `to`, or is blocked on a call whose chain of targets
/// reaches `to`
fn waits_on(table: &HashMap<CallKey, PendingCall>, from: Endpoint, to: Endpoint) -> bool {
    let mut frontier = vec![from];
    let mut seen = HashSet::new();

    while let Some(node) = frontier.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        frontier.extend(
            table
                .iter()
                .filter(|(key, _)| key.caller == node)
                .map(|(_, pending)| pending.target),
        );
    }
    false
}

/// Table of outstanding calls
pub struct CallEngine {
    pending: Mutex<HashMap<CallKey, PendingCall>>,
    max_outstanding: usize,
}

impl CallEngine {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_outstanding,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CallKey, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call before its request is delivered
    ///
    /// # Errors
    /// - `Deadlock` when `target` is `caller`, or is waiting on `caller`
    ///   through a chain of outstanding calls
    /// - `TooManyCalls` when `max_outstanding` calls are already pending
    pub fn register(
        &self,
        caller: Endpoint,
        msg_id: u64,
        target: Endpoint,
        request: IpcBuffer,
    ) -> Result<CallTicket> {
        let mut table = self.table();
        if waits_on(&table, target, caller) {
            warn!("call {} -> {} refused: wait cycle", caller, target);
            return Err(IpcError::Deadlock {
                caller,
                dest: target,
            });
        }
        if table.len() >= self.max_outstanding {
            return Err(IpcError::TooManyCalls {
                max: self.max_outstanding,
            });
        }

        let key = CallKey { caller, msg_id };
        let (tx, rx) = channel::bounded(1);
        table.insert(
            key,
            PendingCall {
                target,
                _request: request,
                resolve: tx,
            },
        );
        Ok(CallTicket { key, outcome: rx })
    }

    /// Block until the call resolves or `timeout` elapses
    ///
    /// `None` waits without a deadline.
    ///
    /// # Errors
    /// `Timeout`, `DestGone` or `Cancelled`
    pub fn wait(&self, ticket: CallTicket, timeout: Option<Duration>) -> Result<Envelope> {
        let Some(timeout) = timeout else {
            return ticket.outcome.recv().unwrap_or(Err(IpcError::Cancelled));
        };

        match ticket.outcome.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.table().remove(&ticket.key).is_some() {
                    trace!("call {:?} timed out", ticket.key);
                    return Err(IpcError::Timeout);
                }
                // Resolved between the deadline and the removal
                ticket.outcome.recv().unwrap_or(Err(IpcError::Cancelled))
            }
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::Cancelled),
        }
    }

    /// Complete a call with its reply
    ///
    /// # Errors
    /// `NoSuchRequest` if no call from `caller` with `msg_id` is pending,
    /// or if it was addressed to someone other than `replier`
    pub fn resolve_reply(
        &self,
        replier: Endpoint,
        caller: Endpoint,
        msg_id: u64,
        reply: Envelope,
    ) -> Result<()> {
        let key = CallKey { caller, msg_id };
        let mut table = self.table();

        match table.get(&key) {
            Some(pending) if pending.target == replier => {}
            Some(pending) => {
                warn!(
                    "{} replied to call {:?} addressed to {}",
                    replier, key, pending.target
                );
                return Err(IpcError::NoSuchRequest { caller, msg_id });
            }
            None => {
                warn!("{} replied to unknown call {:?}", replier, key);
                return Err(IpcError::NoSuchRequest { caller, msg_id });
            }
        }

        if let Some(pending) = table.remove(&key) {
            pending.resolve(Ok(reply));
        }
        Ok(())
    }

    /// Cancel one call; returns its target if it was still pending
    pub fn cancel(&self, caller: Endpoint, msg_id: u64) -> Option<Endpoint> {
        let pending = self.table().remove(&CallKey { caller, msg_id })?;
        let target = pending.target;
        pending.resolve(Err(IpcError::Cancelled));
        Some(target)
    }

    /// Cancel every call made by `caller`; returns the cancelled keys and
    /// their targets
    pub fn cancel_all_from(&self, caller: Endpoint) -> Vec<(CallKey, Endpoint)> {
        let mut table = self.table();
        let keys: Vec<CallKey> = table.keys().filter(|k| k.caller == caller).copied().collect();

        keys.into_iter()
            .filter_map(|key| {
                let pending = table.remove(&key)?;
                let target = pending.target;
                pending.resolve(Err(IpcError::Cancelled));
                Some((key, target))
            })
            .collect()
    }

    /// Fail every call addressed to `target` with `DestGone`
    pub fn fail_calls_to(&self, target: Endpoint) -> usize {
        let mut table = self.table();
        let keys: Vec<CallKey> = table
            .iter()
            .filter(|(_, p)| p.target == target)
            .map(|(k, _)| *k)
            .collect();

        for key in &keys {
            if let Some(pending) = table.remove(key) {
                pending.resolve(Err(IpcError::DestGone(target)));
            }
        }
        keys.len()
    }

    /// Calls currently waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageHeader, MessageKind};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const CALLER: Endpoint = Endpoint::from_raw(1);
    const SERVER: Endpoint = Endpoint::from_raw(2);

    fn reply(msg_id: u64) -> Envelope {
        Envelope::new(
            MessageHeader::new(MessageKind::Reply, SERVER, CALLER, msg_id),
            IpcBuffer::from_vec(b"pong".to_vec()),
        )
    }

    #[test]
    fn test_reply_resolves_call() {
        let engine = CallEngine::new(8);
        let ticket = engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();

        engine.resolve_reply(SERVER, CALLER, 1, reply(1)).unwrap();
        let got = engine.wait(ticket, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(got.payload(), b"pong");
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn test_reply_without_request() {
        let engine = CallEngine::new(8);
        assert_eq!(
            engine.resolve_reply(SERVER, CALLER, 99, reply(99)),
            Err(IpcError::NoSuchRequest {
                caller: CALLER,
                msg_id: 99
            })
        );
    }

    #[test]
    fn test_reply_from_wrong_endpoint() {
        let engine = CallEngine::new(8);
        let _ticket = engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();
        let imposter = Endpoint::from_raw(3);

        assert!(engine.resolve_reply(imposter, CALLER, 1, reply(1)).is_err());
        assert_eq!(engine.outstanding(), 1);
    }

    #[test]
    fn test_timeout_removes_entry() {
        let engine = CallEngine::new(8);
        let ticket = engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();

        let start = Instant::now();
        assert_eq!(
            engine.wait(ticket, Some(Duration::from_millis(50))),
            Err(IpcError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(engine.outstanding(), 0);

        // A late reply is reported, not silently accepted
        assert!(engine.resolve_reply(SERVER, CALLER, 1, reply(1)).is_err());
    }

    #[test]
    fn test_cancel_and_dest_gone() {
        let engine = CallEngine::new(8);
        let cancelled = engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();
        let orphaned = engine.register(CALLER, 2, SERVER, IpcBuffer::empty()).unwrap();

        assert_eq!(engine.cancel(CALLER, 1), Some(SERVER));
        assert_eq!(engine.cancel(CALLER, 1), None);
        assert_eq!(engine.wait(cancelled, None), Err(IpcError::Cancelled));

        assert_eq!(engine.fail_calls_to(SERVER), 1);
        assert_eq!(engine.wait(orphaned, None), Err(IpcError::DestGone(SERVER)));
    }

    #[test]
    fn test_cancel_all_from_caller() {
        let engine = CallEngine::new(8);
        let other = Endpoint::from_raw(4);
        engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();
        engine.register(CALLER, 2, SERVER, IpcBuffer::empty()).unwrap();
        engine.register(other, 1, SERVER, IpcBuffer::empty()).unwrap();

        assert_eq!(engine.cancel_all_from(CALLER).len(), 2);
        assert_eq!(engine.outstanding(), 1);
    }

    #[test]
    fn test_outstanding_limit() {
        let engine = CallEngine::new(1);
        engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();
        assert!(matches!(
            engine.register(CALLER, 2, SERVER, IpcBuffer::empty()),
            Err(IpcError::TooManyCalls { max: 1 })
        ));
    }

    #[test]
    fn test_self_call_refused() {
        let engine = CallEngine::new(8);
        assert_eq!(
            engine.register(CALLER, 1, CALLER, IpcBuffer::empty()).unwrap_err(),
            IpcError::Deadlock {
                caller: CALLER,
                dest: CALLER
            }
        );
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn test_wait_cycle_refused() {
        let engine = CallEngine::new(8);
        let third = Endpoint::from_raw(3);
        engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();
        engine.register(SERVER, 1, third, IpcBuffer::empty()).unwrap();

        // third -> CALLER would close CALLER -> SERVER -> third -> CALLER
        assert!(matches!(
            engine.register(third, 1, CALLER, IpcBuffer::empty()),
            Err(IpcError::Deadlock { .. })
        ));
        // A chain without a cycle is fine
        engine.register(third, 2, Endpoint::from_raw(4), IpcBuffer::empty()).unwrap();

        // Once the first call resolves the cycle is gone
        engine.cancel(CALLER, 1);
        engine.register(third, 3, CALLER, IpcBuffer::empty()).unwrap();
    }

    #[test]
    fn test_request_buffer_held_until_resolution() {
        let engine = CallEngine::new(8);
        let request = IpcBuffer::from_vec(vec![1, 2, 3]);
        let _ticket = engine.register(CALLER, 1, SERVER, request.retain()).unwrap();
        assert_eq!(request.ref_count(), 2);

        engine.cancel(CALLER, 1);
        assert_eq!(request.ref_count(), 1);
    }

    #[test]
    fn test_exactly_one_outcome_under_race() {
        for _ in 0..200 {
            let engine = Arc::new(CallEngine::new(8));
            let ticket = engine.register(CALLER, 1, SERVER, IpcBuffer::empty()).unwrap();

            let replier = {
                let engine = engine.clone();
                thread::spawn(move || engine.resolve_reply(SERVER, CALLER, 1, reply(1)).is_ok())
            };
            let canceller = {
                let engine = engine.clone();
                thread::spawn(move || engine.cancel(CALLER, 1).is_some())
            };

            let replied = replier.join().unwrap();
            let cancelled = canceller.join().unwrap();
            assert!(replied ^ cancelled);

            let outcome = engine.wait(ticket, Some(Duration::from_secs(1)));
            assert_eq!(outcome.is_ok(), replied);
        }
    }
}
