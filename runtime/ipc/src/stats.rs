//! IPC counters
//!
//! Relaxed atomics; a snapshot is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct IpcStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    calls_made: AtomicU64,
    replies_sent: AtomicU64,
    notifications_sent: AtomicU64,
    fast_ipc_ops: AtomicU64,
    caps_transferred: AtomicU64,
    deadlocks_detected: AtomicU64,
    errors: AtomicU64,
}

/// Copy of the counters at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IpcStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub calls_made: u64,
    pub replies_sent: u64,
    pub notifications_sent: u64,
    pub fast_ipc_ops: u64,
    pub caps_transferred: u64,
    pub deadlocks_detected: u64,
    pub errors: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl IpcStats {
    counter! {
        add_sent => messages_sent,
        add_received => messages_received,
        add_calls => calls_made,
        add_replies => replies_sent,
        add_notifications => notifications_sent,
        add_fast_ops => fast_ipc_ops,
        add_caps => caps_transferred,
        add_deadlocks => deadlocks_detected,
        add_errors => errors,
    }

    pub fn snapshot(&self) -> IpcStatsSnapshot {
        IpcStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            calls_made: self.calls_made.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            fast_ipc_ops: self.fast_ipc_ops.load(Ordering::Relaxed),
            caps_transferred: self.caps_transferred.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let stats = IpcStats::default();
        stats.add_sent(2);
        stats.add_caps(3);
        stats.add_errors(1);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.caps_transferred, 3);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.calls_made, 0);
    }
}
