//! Transport statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the send path and the receive task
#[derive(Debug, Default)]
pub struct TransportStats {
    datagrams_received: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_domain: AtomicU64,
    dropped_self: AtomicU64,
    dropped_expired: AtomicU64,
    updates_accepted: AtomicU64,
    updates_rejected: AtomicU64,
    rebroadcasts: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_dropped: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time copy of `TransportStats`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams_received: u64,
    pub dropped_malformed: u64,
    pub dropped_domain: u64,
    pub dropped_self: u64,
    pub dropped_expired: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub rebroadcasts: u64,
    pub datagrams_sent: u64,
    /// Outgoing datagrams discarded by the packet scheduler
    pub datagrams_dropped: u64,
    pub receive_errors: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        bump(&self.datagrams_received, 1);
    }

    pub(crate) fn record_malformed(&self) {
        bump(&self.dropped_malformed, 1);
    }

    pub(crate) fn record_domain_mismatch(&self) {
        bump(&self.dropped_domain, 1);
    }

    pub(crate) fn record_self_originated(&self) {
        bump(&self.dropped_self, 1);
    }

    pub(crate) fn record_expired(&self) {
        bump(&self.dropped_expired, 1);
    }

    pub(crate) fn record_applied(&self, accepted: u64, rejected: u64) {
        bump(&self.updates_accepted, accepted);
        bump(&self.updates_rejected, rejected);
    }

    pub(crate) fn record_rebroadcast(&self) {
        bump(&self.rebroadcasts, 1);
    }

    pub(crate) fn record_sent(&self) {
        bump(&self.datagrams_sent, 1);
    }

    pub(crate) fn record_send_dropped(&self) {
        bump(&self.datagrams_dropped, 1);
    }

    pub(crate) fn record_receive_error(&self) {
        bump(&self.receive_errors, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams_received: load(&self.datagrams_received),
            dropped_malformed: load(&self.dropped_malformed),
            dropped_domain: load(&self.dropped_domain),
            dropped_self: load(&self.dropped_self),
            dropped_expired: load(&self.dropped_expired),
            updates_accepted: load(&self.updates_accepted),
            updates_rejected: load(&self.updates_rejected),
            rebroadcasts: load(&self.rebroadcasts),
            datagrams_sent: load(&self.datagrams_sent),
            datagrams_dropped: load(&self.datagrams_dropped),
            receive_errors: load(&self.receive_errors),
        }
    }
}
