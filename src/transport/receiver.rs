//! Inbound path: decode, filter, apply and forward
//!
//! The receive task is a single loop that waits for a datagram with a
//! timeout so it can notice shutdown between reads:
//!
//! ```text
//! WAIT_FOR_DATA -> DECODE -> FILTER -> APPLY -> REBROADCAST? -> WAIT_FOR_DATA
//!       |             |         |
//!       |             +---------+--> (dropped) -> WAIT_FOR_DATA
//!       +--> SHUTDOWN
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{BandwidthMonitor, Medium, Sender, TransportSettings, TransportStats};
use crate::protocol::{decode_header, decode_updates, unix_now, CodecError, MessageHeader, Update};
use crate::store::{apply, KnowledgeStore};

/// What a processed datagram changed
#[derive(Debug, Clone)]
pub struct ReceivedBatch {
    /// Sender identity; `None` for reduced headers
    pub originator: Option<String>,
    pub remote: SocketAddr,
    pub clock: u64,
    pub quality: u32,
    /// Updates that replaced the local value
    pub accepted: Vec<Update>,
    /// Number of updates that lost to the local value
    pub rejected: usize,
}

/// Callback run after each batch that changed the store, outside the store lock
pub type ReceiveHook = Arc<dyn Fn(&ReceivedBatch) + Send + Sync>;

/// Why a datagram was dropped before touching the store
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Malformed(CodecError),
    SelfOriginated,
    DomainMismatch(String),
    Expired { age_secs: u64 },
}

/// Outcome of processing one datagram
#[derive(Debug)]
pub enum Disposition {
    Dropped(DropReason),
    Applied {
        header: MessageHeader,
        accepted: Vec<Update>,
        rejected: usize,
    },
}

/// Header to forward a message under, if it should be rebroadcast.
///
/// Reduced messages are never forwarded. A full message is forwarded while
/// its TTL is positive, and the forwarded TTL is one less, capped by the
/// local ceiling, so a message can be forwarded at most `ttl` times.
pub fn forward_header(header: &MessageHeader, rebroadcast_ttl: u8) -> Option<MessageHeader> {
    match header {
        MessageHeader::Reduced(_) => None,
        MessageHeader::Full(h) => {
            if h.ttl == 0 || rebroadcast_ttl == 0 {
                return None;
            }
            let mut forwarded = h.clone();
            forwarded.ttl = (h.ttl - 1).min(rebroadcast_ttl);
            Some(MessageHeader::Full(forwarded))
        }
    }
}

pub(crate) struct ReceivePipeline<S: KnowledgeStore> {
    store: Arc<S>,
    settings: Arc<TransportSettings>,
    identity: Arc<str>,
    sender: Sender,
    monitor: Arc<BandwidthMonitor>,
    stats: Arc<TransportStats>,
}

impl<S: KnowledgeStore> ReceivePipeline<S> {
    pub(crate) fn new(
        store: Arc<S>,
        settings: Arc<TransportSettings>,
        identity: Arc<str>,
        sender: Sender,
        monitor: Arc<BandwidthMonitor>,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self {
            store,
            settings,
            identity,
            sender,
            monitor,
            stats,
        }
    }

    /// Decode, filter and apply one datagram.
    ///
    /// The whole message is decoded before the store lock is taken, so a
    /// malformed datagram never mutates the store.
    pub(crate) fn process(&self, data: &[u8]) -> Disposition {
        let (header, body) = match decode_header(data) {
            Ok(decoded) => decoded,
            Err(e) => return Disposition::Dropped(DropReason::Malformed(e)),
        };

        if let MessageHeader::Full(h) = &header {
            if h.originator == *self.identity {
                return Disposition::Dropped(DropReason::SelfOriginated);
            }
            if h.domain != self.settings.domain {
                return Disposition::Dropped(DropReason::DomainMismatch(h.domain.clone()));
            }
            if let Some(deadline) = self.settings.deadline {
                let age_secs = unix_now().saturating_sub(h.timestamp);
                if age_secs > deadline.as_secs() {
                    return Disposition::Dropped(DropReason::Expired { age_secs });
                }
            }
        }

        let updates = match decode_updates(body, header.updates()) {
            Ok(updates) => updates,
            Err(e) => return Disposition::Dropped(DropReason::Malformed(e)),
        };

        let clock = header.clock();
        let quality = header.quality();
        let (accepted, rejected) = self.store.transact(|entries| {
            let mut accepted = Vec::new();
            let mut rejected = 0;
            for update in updates {
                let outcome = apply(entries, &update.key, &update.value, clock, quality);
                tracing::trace!("{} = {} -> {:?}", update.key, update.value, outcome);
                if outcome.is_accepted() {
                    accepted.push(update);
                } else {
                    rejected += 1;
                }
            }
            (accepted, rejected)
        });

        Disposition::Applied {
            header,
            accepted,
            rejected,
        }
    }

    async fn handle(&self, data: &[u8], remote: SocketAddr) {
        self.monitor.add(data.len() as u64);
        self.stats.record_received();

        match self.process(data) {
            Disposition::Dropped(reason) => self.record_drop(reason, remote),
            Disposition::Applied {
                header,
                accepted,
                rejected,
            } => {
                self.stats
                    .record_applied(accepted.len() as u64, rejected as u64);
                tracing::debug!(
                    "Applied {} of {} updates from {}",
                    accepted.len(),
                    accepted.len() + rejected,
                    remote
                );
                if accepted.is_empty() {
                    return;
                }
                self.store.set_changed();

                if let Some(hook) = &self.settings.on_data_received {
                    let batch = ReceivedBatch {
                        originator: header.originator().map(str::to_string),
                        remote,
                        clock: header.clock(),
                        quality: header.quality(),
                        accepted: accepted.clone(),
                        rejected,
                    };
                    hook(&batch);
                }

                if let Some(forwarded) = forward_header(&header, self.settings.rebroadcast_ttl) {
                    tracing::debug!(
                        "Rebroadcasting {} updates with ttl {}",
                        accepted.len(),
                        forwarded.ttl()
                    );
                    if let Err(e) = self.sender.rebroadcast(&forwarded, &accepted).await {
                        tracing::warn!("Rebroadcast failed: {}", e);
                    }
                }
            }
        }
    }

    fn record_drop(&self, reason: DropReason, remote: SocketAddr) {
        match reason {
            DropReason::Malformed(e) => {
                self.stats.record_malformed();
                tracing::debug!("Dropped malformed datagram from {}: {}", remote, e);
            }
            DropReason::SelfOriginated => self.stats.record_self_originated(),
            DropReason::DomainMismatch(domain) => {
                self.stats.record_domain_mismatch();
                tracing::debug!("Dropped datagram from {} for domain {:?}", remote, domain);
            }
            DropReason::Expired { age_secs } => {
                self.stats.record_expired();
                tracing::debug!("Dropped datagram from {} aged {}s", remote, age_secs);
            }
        }
    }

    /// Receive until a shutdown signal arrives or the sender half is dropped
    pub(crate) async fn run(self, medium: Arc<dyn Medium>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut buf = vec![0u8; self.settings.queue_length];
        let read_timeout = self.settings.read_timeout;
        tracing::info!("Receive task started on {}", medium.name());

        loop {
            let received = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = tokio::time::timeout(read_timeout, medium.recv_from(&mut buf)) => result,
            };

            match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    self.stats.record_receive_error();
                    tracing::warn!("Receive error on {}: {}", medium.name(), e);
                    tokio::time::sleep(read_timeout.min(Duration::from_millis(100))).await;
                }
                Ok(Ok((n, remote))) => self.handle(&buf[..n], remote).await,
            }
        }

        tracing::info!("Receive task stopped on {}", medium.name());
    }
}
