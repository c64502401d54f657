//! Outbound path: pack updates into datagrams and put them on the medium

use bytes::Bytes;
use std::sync::Arc;

use super::{BandwidthMonitor, Medium, PacketScheduler, TransportResult, TransportSettings, TransportStats};
use crate::protocol::{encode, CodecError, CodecResult, MessageHeader, Update};

/// Split `updates` into as few datagrams as fit in `capacity`.
///
/// Updates are packed greedily in order and a record is never split. Every
/// datagram repeats `header` with its own update count. Fails without
/// producing anything if a single record cannot fit beside the header.
pub fn pack_datagrams(
    header: &MessageHeader,
    updates: &[Update],
    capacity: usize,
) -> CodecResult<Vec<Bytes>> {
    let header_len = header.encoded_len();
    if header_len > capacity {
        return Err(CodecError::Overflow {
            needed: header_len,
            remaining: capacity,
        });
    }
    let room = capacity - header_len;

    let mut chunks: Vec<&[Update]> = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, update) in updates.iter().enumerate() {
        let len = update.encoded_len();
        if len > room {
            return Err(CodecError::Overflow {
                needed: header_len + len,
                remaining: capacity,
            });
        }
        if used + len > room {
            chunks.push(&updates[start..i]);
            start = i;
            used = 0;
        }
        used += len;
    }
    if start < updates.len() {
        chunks.push(&updates[start..]);
    }

    chunks
        .into_iter()
        .map(|chunk| encode(header, chunk, capacity))
        .collect()
}

/// Shared handle on the outbound path.
///
/// Cloned into the receive task so rebroadcasts go through the same
/// scheduler, monitor and counters as local sends.
#[derive(Clone)]
pub struct Sender {
    medium: Arc<dyn Medium>,
    settings: Arc<TransportSettings>,
    identity: Arc<str>,
    monitor: Arc<BandwidthMonitor>,
    scheduler: Arc<PacketScheduler>,
    stats: Arc<TransportStats>,
}

impl Sender {
    pub(crate) fn new(
        medium: Arc<dyn Medium>,
        settings: Arc<TransportSettings>,
        identity: Arc<str>,
        monitor: Arc<BandwidthMonitor>,
        scheduler: Arc<PacketScheduler>,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self {
            medium,
            settings,
            identity,
            monitor,
            scheduler,
            stats,
        }
    }

    /// Header for a locally originated batch
    pub fn header_for(&self, clock: u64, quality: u32) -> MessageHeader {
        if self.settings.reduced_header {
            MessageHeader::reduced(clock)
        } else {
            MessageHeader::full(
                self.settings.domain.as_str(),
                &*self.identity,
                quality,
                clock,
                self.settings.ttl,
            )
        }
    }

    /// Send a batch of local updates. Returns the bytes put on the medium.
    pub async fn send_batch(
        &self,
        updates: &[Update],
        clock: u64,
        quality: u32,
    ) -> TransportResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let header = self.header_for(clock, quality);
        let frames = pack_datagrams(&header, updates, self.settings.queue_length)?;
        tracing::debug!(
            "Sending {} updates in {} datagrams (clock {}, quality {})",
            updates.len(),
            frames.len(),
            clock,
            quality
        );
        self.send_frames(&frames).await
    }

    /// Re-send accepted updates under a forwarded header
    pub(crate) async fn rebroadcast(
        &self,
        header: &MessageHeader,
        updates: &[Update],
    ) -> TransportResult<usize> {
        let frames = pack_datagrams(header, updates, self.settings.queue_length)?;
        let sent = self.send_frames(&frames).await?;
        self.stats.record_rebroadcast();
        Ok(sent)
    }

    async fn send_frames(&self, frames: &[Bytes]) -> TransportResult<usize> {
        let mut total = 0;
        for frame in frames {
            if !self.scheduler.add() {
                tracing::debug!("Scheduler dropped outgoing datagram of {} bytes", frame.len());
                self.stats.record_send_dropped();
                continue;
            }
            let sent = self.medium.send(frame).await?;
            tracing::trace!("Sent {} bytes on {}", sent, self.medium.name());
            self.monitor.add(sent as u64);
            self.stats.record_sent();
            total += sent;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, ReducedHeader, Value};
    use crate::transport::{DropPolicy, LoopbackNetwork, TransportError};

    fn three_updates() -> Vec<Update> {
        vec![
            Update::new("a", Value::Integer(1)),
            Update::new("b", Value::Integer(2)),
            Update::new("c", Value::Integer(3)),
        ]
    }

    #[test]
    fn test_pack_splits_without_breaking_records() {
        let header = MessageHeader::reduced(7);
        // Room for exactly two 21-byte records
        let capacity = ReducedHeader::ENCODED_LEN + 42;
        let frames = pack_datagrams(&header, &three_updates(), capacity).unwrap();
        assert_eq!(frames.len(), 2);

        let (first_header, first) = decode(&frames[0]).unwrap();
        let (_, second) = decode(&frames[1]).unwrap();
        assert_eq!(first_header.updates(), 2);
        assert_eq!(first_header.clock(), 7);
        assert_eq!(first.len(), 2);
        assert_eq!(second, vec![Update::new("c", Value::Integer(3))]);
        assert!(frames.iter().all(|f| f.len() <= capacity));
    }

    #[test]
    fn test_pack_oversized_record() {
        let header = MessageHeader::reduced(1);
        let updates = vec![
            Update::new("small", Value::Integer(1)),
            Update::new("big", Value::Binary(vec![0; 256])),
        ];
        let err = pack_datagrams(&header, &updates, 128).unwrap_err();
        assert!(matches!(err, CodecError::Overflow { .. }));
    }

    #[test]
    fn test_pack_nothing() {
        let header = MessageHeader::reduced(1);
        assert!(pack_datagrams(&header, &[], 512).unwrap().is_empty());
    }

    fn sender_on(network: &LoopbackNetwork, settings: TransportSettings) -> (Sender, Arc<TransportStats>) {
        let stats = Arc::new(TransportStats::new());
        let scheduler = PacketScheduler::new(settings.drop_rate, settings.drop_policy);
        let sender = Sender::new(
            Arc::new(network.attach_named("sender")),
            Arc::new(settings),
            Arc::from("sender"),
            Arc::new(BandwidthMonitor::default()),
            Arc::new(scheduler),
            stats.clone(),
        );
        (sender, stats)
    }

    #[tokio::test]
    async fn test_send_batch_reaches_listener() {
        let network = LoopbackNetwork::new();
        let listener = network.attach();
        let settings = TransportSettings {
            reduced_header: true,
            queue_length: ReducedHeader::ENCODED_LEN + 42,
            ..Default::default()
        };
        let (sender, stats) = sender_on(&network, settings);

        let sent = sender.send_batch(&three_updates(), 3, 0).await.unwrap();
        assert!(sent > 0);
        assert_eq!(stats.snapshot().datagrams_sent, 2);

        let mut buf = [0u8; 256];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        let (_, updates) = decode(&buf[..n]).unwrap();
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_sends_nothing() {
        let network = LoopbackNetwork::new();
        let (sender, stats) = sender_on(
            &network,
            TransportSettings {
                queue_length: 256,
                ..Default::default()
            },
        );

        let updates = vec![
            Update::new("ok", Value::Integer(1)),
            Update::new("huge", Value::Binary(vec![1; 1024])),
        ];
        let result = sender.send_batch(&updates, 1, 0).await;
        assert!(matches!(result, Err(TransportError::Codec(CodecError::Overflow { .. }))));
        assert_eq!(stats.snapshot().datagrams_sent, 0);
    }

    #[tokio::test]
    async fn test_scheduler_drops_counted() {
        let network = LoopbackNetwork::new();
        let (sender, stats) = sender_on(
            &network,
            TransportSettings {
                drop_rate: 1.0,
                drop_policy: DropPolicy::Deterministic,
                ..Default::default()
            },
        );

        let sent = sender.send_batch(&three_updates(), 1, 0).await.unwrap();
        assert_eq!(sent, 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.datagrams_sent, 0);
        assert_eq!(snapshot.datagrams_dropped, 1);
    }
}
