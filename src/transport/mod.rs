//! Transport module - Disseminates knowledge over a shared datagram medium
//!
//! Provides:
//! - Settings and validation for one transport instance
//! - A send path that packs local updates into datagrams
//! - A receive task that filters, applies and optionally rebroadcasts
//! - Bandwidth monitoring and simulated packet loss

mod bandwidth;
mod medium;
mod receiver;
mod scheduler;
mod sender;
mod stats;

pub use bandwidth::*;
pub use medium::*;
pub use receiver::*;
pub use scheduler::*;
pub use sender::*;
pub use stats::*;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{
    CodecError, FullHeader, ReducedHeader, Update, DEFAULT_GROUP, DOMAIN_FIELD_LEN,
    MAX_DATAGRAM_SIZE, ORIGINATOR_FIELD_LEN,
};
use crate::store::KnowledgeStore;

/// Default knowledge domain
pub const DEFAULT_DOMAIN: &str = "swarm";

/// Default datagram capacity in bytes
pub const DEFAULT_QUEUE_LENGTH: usize = 8192;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("No tokio runtime: {0}")]
    NoRuntime(String),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Settings for one transport instance
#[derive(Clone)]
pub struct TransportSettings {
    /// Group address and port (multicast group or broadcast address)
    pub group: SocketAddr,
    pub kind: MediumKind,
    /// Originator identity; derived from host and port when unset
    pub id: Option<String>,
    /// Knowledge domain; messages from other domains are ignored
    pub domain: String,
    /// Datagram capacity for sending and receiving
    pub queue_length: usize,
    /// Rebroadcast TTL stamped on originated messages
    pub ttl: u8,
    /// Ceiling on the TTL of forwarded messages; 0 disables forwarding
    pub rebroadcast_ttl: u8,
    /// IP multicast hop limit
    pub multicast_hops: u32,
    /// Send the compact header without domain or originator
    pub reduced_header: bool,
    /// How long one receive wait lasts before checking for shutdown
    pub read_timeout: Duration,
    /// Drop full-header messages older than this
    pub deadline: Option<Duration>,
    /// Simulated loss rate for outgoing datagrams
    pub drop_rate: f64,
    pub drop_policy: DropPolicy,
    pub bandwidth_window_secs: u64,
    pub on_data_received: Option<ReceiveHook>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([239, 255, 0, 1], 4150))),
            kind: MediumKind::Multicast,
            id: None,
            domain: DEFAULT_DOMAIN.to_string(),
            queue_length: DEFAULT_QUEUE_LENGTH,
            ttl: 0,
            rebroadcast_ttl: 0,
            multicast_hops: 1,
            reduced_header: false,
            read_timeout: Duration::from_millis(500),
            deadline: None,
            drop_rate: 0.0,
            drop_policy: DropPolicy::default(),
            bandwidth_window_secs: DEFAULT_WINDOW_SECS,
            on_data_received: None,
        }
    }
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("group", &self.group)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("queue_length", &self.queue_length)
            .field("ttl", &self.ttl)
            .field("rebroadcast_ttl", &self.rebroadcast_ttl)
            .field("reduced_header", &self.reduced_header)
            .field("read_timeout", &self.read_timeout)
            .field("deadline", &self.deadline)
            .field("drop_rate", &self.drop_rate)
            .field("on_data_received", &self.on_data_received.is_some())
            .finish()
    }
}

impl TransportSettings {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rebroadcast(mut self, ttl: u8, rebroadcast_ttl: u8) -> Self {
        self.ttl = ttl;
        self.rebroadcast_ttl = rebroadcast_ttl;
        self
    }

    pub fn with_hook(mut self, hook: ReceiveHook) -> Self {
        self.on_data_received = Some(hook);
        self
    }

    /// Smallest queue length that can hold a header and one minimal record
    pub fn min_queue_length(&self) -> usize {
        let header = if self.reduced_header {
            ReducedHeader::ENCODED_LEN
        } else {
            FullHeader::ENCODED_LEN
        };
        header + 12
    }

    pub fn validate(&self) -> TransportResult<()> {
        let invalid = |msg: String| Err(TransportError::InvalidSettings(msg));

        if self.domain.is_empty() {
            return invalid("domain must not be empty".to_string());
        }
        if self.domain.contains('\0') {
            return invalid(format!("domain {:?} contains a NUL byte", self.domain));
        }
        if self.domain.len() >= DOMAIN_FIELD_LEN {
            return invalid(format!(
                "domain {:?} exceeds {} bytes",
                self.domain,
                DOMAIN_FIELD_LEN - 1
            ));
        }
        if let Some(id) = &self.id {
            if id.contains('\0') {
                return invalid(format!("id {:?} contains a NUL byte", id));
            }
            if id.is_empty() || id.len() >= ORIGINATOR_FIELD_LEN {
                return invalid(format!(
                    "id {:?} must be 1 to {} bytes",
                    id,
                    ORIGINATOR_FIELD_LEN - 1
                ));
            }
        }
        if self.queue_length > MAX_DATAGRAM_SIZE || self.queue_length < self.min_queue_length() {
            return invalid(format!(
                "queue_length {} outside {}..={}",
                self.queue_length,
                self.min_queue_length(),
                MAX_DATAGRAM_SIZE
            ));
        }
        if self.read_timeout.is_zero() {
            return invalid("read_timeout must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return invalid(format!("drop_rate {} outside [0, 1]", self.drop_rate));
        }
        Ok(())
    }
}

/// A running transport bound to one store.
///
/// Owns the receive task and, through the sender, the medium. `close` stops
/// the task, waits for it and releases the medium; dropping the transport
/// only signals the task.
pub struct Transport<S: KnowledgeStore> {
    settings: Arc<TransportSettings>,
    identity: Arc<str>,
    store: Arc<S>,
    sender: Option<Sender>,
    send_monitor: Arc<BandwidthMonitor>,
    receive_monitor: Arc<BandwidthMonitor>,
    stats: Arc<TransportStats>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl<S: KnowledgeStore> Transport<S> {
    /// Open the UDP medium described by `settings` and start receiving
    pub async fn open(settings: TransportSettings, store: Arc<S>) -> TransportResult<Self> {
        settings.validate()?;
        let medium = UdpMedium::open(settings.kind, settings.group, settings.multicast_hops)
            .await
            .map_err(|e| {
                TransportError::BindFailed(format!("Failed to open {}: {}", settings.group, e))
            })?;
        Self::with_medium(settings, store, Arc::new(medium))
    }

    /// Start a transport on an already opened medium.
    ///
    /// Fails with `NoRuntime` outside a tokio runtime.
    pub fn with_medium(
        settings: TransportSettings,
        store: Arc<S>,
        medium: Arc<dyn Medium>,
    ) -> TransportResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        settings.validate()?;

        let identity: Arc<str> = match &settings.id {
            Some(id) => Arc::from(id.as_str()),
            None => {
                let mut id = medium.local_identity();
                truncate_to(&mut id, ORIGINATOR_FIELD_LEN - 1);
                Arc::from(id)
            }
        };

        let settings = Arc::new(settings);
        let stats = Arc::new(TransportStats::new());
        let send_monitor = Arc::new(BandwidthMonitor::new(settings.bandwidth_window_secs));
        let receive_monitor = Arc::new(BandwidthMonitor::new(settings.bandwidth_window_secs));
        let scheduler = Arc::new(PacketScheduler::new(settings.drop_rate, settings.drop_policy));

        let sender = Sender::new(
            medium.clone(),
            settings.clone(),
            identity.clone(),
            send_monitor.clone(),
            scheduler,
            stats.clone(),
        );

        let pipeline = ReceivePipeline::new(
            store.clone(),
            settings.clone(),
            identity.clone(),
            sender.clone(),
            receive_monitor.clone(),
            stats.clone(),
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reader = runtime.spawn(pipeline.run(medium, shutdown_rx));

        tracing::info!(
            "Transport {} started for domain {:?} on {}",
            identity,
            settings.domain,
            settings.group
        );

        Ok(Self {
            settings,
            identity,
            store,
            sender: Some(sender),
            send_monitor,
            receive_monitor,
            stats,
            shutdown_tx: Some(shutdown_tx),
            reader: Some(reader),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    fn sender(&self) -> TransportResult<&Sender> {
        self.sender.as_ref().ok_or(TransportError::Closed)
    }

    /// Send a batch of updates stamped with `clock` and `quality`
    pub async fn send_batch(
        &self,
        updates: &[Update],
        clock: u64,
        quality: u32,
    ) -> TransportResult<usize> {
        self.sender()?.send_batch(updates, clock, quality).await
    }

    /// Drain the store's local updates and send them.
    ///
    /// The header carries the store's clock and the highest quality among
    /// the drained updates, and the store re-stamps its copies to match.
    /// Updates drained by a failed send are not requeued.
    pub async fn send_data(&self) -> TransportResult<usize> {
        let sender = self.sender()?;
        let Some(batch) = self.store.drain_batch() else {
            return Ok(0);
        };
        sender
            .send_batch(&batch.updates, batch.clock, batch.quality)
            .await
    }

    /// Bytes per second sent over the monitoring window
    pub fn send_bandwidth(&self) -> u64 {
        self.send_monitor.bytes_per_second()
    }

    /// Bytes per second received over the monitoring window
    pub fn receive_bandwidth(&self) -> u64 {
        self.receive_monitor.bytes_per_second()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the receive task, wait for it to finish and release the medium
    pub async fn close(&mut self) -> TransportResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        let _ = shutdown_tx.send(()).await;

        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                tracing::warn!("Receive task ended abnormally: {}", e);
            }
        }
        // Last handle on the medium once the task has exited
        self.sender = None;
        tracing::info!("Transport {} closed", self.identity);
        Ok(())
    }
}

impl<S: KnowledgeStore> Drop for Transport<S> {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
    }
}

fn truncate_to(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::store::KnowledgeBase;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn loopback_settings(id: &str) -> TransportSettings {
        TransportSettings {
            read_timeout: Duration::from_millis(20),
            ..TransportSettings::new("swarm").with_id(id)
        }
    }

    async fn wait_for(store: &KnowledgeBase, key: &str, expected: Value) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.get(key) != Some(expected.clone()) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never became {}",
                key,
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Loopback medium that records when it is dropped
    struct TrackedMedium {
        inner: LoopbackMedium,
        released: Arc<AtomicBool>,
    }

    impl Drop for TrackedMedium {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Medium for TrackedMedium {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn local_identity(&self) -> String {
            self.inner.local_identity()
        }

        async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            self.inner.recv_from(buf).await
        }

        async fn send(&self, datagram: &[u8]) -> std::io::Result<usize> {
            self.inner.send(datagram).await
        }
    }

    #[test]
    fn test_validate() {
        assert!(TransportSettings::default().validate().is_ok());
        assert!(TransportSettings::new("").validate().is_err());
        assert!(TransportSettings::new("x".repeat(32)).validate().is_err());
        assert!(TransportSettings::default().with_id("h".repeat(64)).validate().is_err());

        let settings = TransportSettings {
            queue_length: 100,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        let settings = TransportSettings {
            queue_length: 100,
            reduced_header: true,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = TransportSettings {
            drop_rate: 1.5,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(TransportError::InvalidSettings(_))));
    }

    #[test]
    fn test_validate_rejects_nul() {
        let result = TransportSettings::new("sw\0arm").validate();
        assert!(matches!(result, Err(TransportError::InvalidSettings(_))));
        let result = TransportSettings::default().with_id("scout\0one").validate();
        assert!(matches!(result, Err(TransportError::InvalidSettings(_))));
    }

    #[test]
    fn test_with_medium_outside_runtime() {
        let network = LoopbackNetwork::new();
        let result = Transport::with_medium(
            loopback_settings("agent-a"),
            Arc::new(KnowledgeBase::new()),
            Arc::new(network.attach()),
        );
        assert!(matches!(result, Err(TransportError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_close_releases_medium() {
        let network = LoopbackNetwork::new();
        let released = Arc::new(AtomicBool::new(false));
        let medium = TrackedMedium {
            inner: network.attach_named("tracked"),
            released: released.clone(),
        };
        let mut transport = Transport::with_medium(
            loopback_settings("tracked"),
            Arc::new(KnowledgeBase::new()),
            Arc::new(medium),
        )
        .unwrap();
        assert!(!released.load(Ordering::SeqCst));

        transport.close().await.unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert!(!transport.is_running());
        assert!(matches!(
            transport.send_batch(&[], 1, 0).await,
            Err(TransportError::Closed)
        ));

        // A second close is a no-op
        tokio_test::assert_ok!(transport.close().await);
    }

    #[tokio::test]
    async fn test_sender_and_receiver_agree_after_third_write() {
        let network = LoopbackNetwork::new();
        let store_a = Arc::new(KnowledgeBase::new());
        let store_b = Arc::new(KnowledgeBase::new());
        let store_c = Arc::new(KnowledgeBase::new());

        let mut a = Transport::with_medium(
            loopback_settings("agent-a"),
            store_a.clone(),
            Arc::new(network.attach_named("a")),
        )
        .unwrap();
        let mut b = Transport::with_medium(
            loopback_settings("agent-b"),
            store_b.clone(),
            Arc::new(network.attach_named("b")),
        )
        .unwrap();
        let mut c = Transport::with_medium(
            loopback_settings("agent-c"),
            store_c,
            Arc::new(network.attach_named("c")),
        )
        .unwrap();

        // k is written at clock 1, but the batch goes out at clock 2
        store_a.set("k", Value::Integer(1));
        store_a.set("other", Value::Integer(0));
        a.send_data().await.unwrap();
        wait_for(&store_b, "other", Value::Integer(0)).await;
        assert_eq!(store_a.record("k"), store_b.record("k"));
        assert_eq!(store_a.record("k").map(|r| r.clock), Some(2));

        // A competing write with the same stamps and a lower value loses everywhere
        c.send_batch(&[Update::new("k", Value::Integer(0))], 2, 0)
            .await
            .unwrap();
        wait_until("both agents to resolve k", || {
            a.stats().updates_rejected == 1 && b.stats().updates_rejected == 1
        })
        .await;

        assert_eq!(store_a.get("k"), Some(Value::Integer(1)));
        assert_eq!(store_a.record("k"), store_b.record("k"));

        a.close().await.unwrap();
        b.close().await.unwrap();
        c.close().await.unwrap();
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let mut s = "héllo".to_string();
        truncate_to(&mut s, 2);
        assert_eq!(s, "h");
    }

    #[tokio::test]
    async fn test_agents_converge() {
        let network = LoopbackNetwork::new();
        let store_a = Arc::new(KnowledgeBase::new());
        let store_b = Arc::new(KnowledgeBase::new());

        let mut a = Transport::with_medium(
            loopback_settings("agent-a"),
            store_a.clone(),
            Arc::new(network.attach_named("a")),
        )
        .unwrap();
        let mut b = Transport::with_medium(
            loopback_settings("agent-b"),
            store_b.clone(),
            Arc::new(network.attach_named("b")),
        )
        .unwrap();
        assert_eq!(a.identity(), "agent-a");

        store_a.set("pos.x", Value::Double(1.5));
        store_a.set("mode", Value::String("search".to_string()));
        assert!(a.send_data().await.unwrap() > 0);
        wait_for(&store_b, "mode", Value::String("search".to_string())).await;
        assert_eq!(store_b.get("pos.x"), Some(Value::Double(1.5)));

        // B's later write supersedes A's value on both sides
        store_b.set("mode", Value::String("return".to_string()));
        b.send_data().await.unwrap();
        wait_for(&store_a, "mode", Value::String("return".to_string())).await;

        // A ignored its own echo
        assert_eq!(a.stats().dropped_self, 1);
        assert!(a.send_bandwidth() > 0);
        assert!(b.receive_bandwidth() > 0);

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert!(matches!(a.send_data().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_rebroadcast_relays_once() {
        let network = LoopbackNetwork::new();
        let relay_store = Arc::new(KnowledgeBase::new());
        let origin_store = Arc::new(KnowledgeBase::new());

        let mut relay = Transport::with_medium(
            loopback_settings("relay").with_rebroadcast(0, 3),
            relay_store.clone(),
            Arc::new(network.attach_named("relay")),
        )
        .unwrap();
        let mut origin = Transport::with_medium(
            loopback_settings("origin").with_rebroadcast(2, 0),
            origin_store.clone(),
            Arc::new(network.attach_named("origin")),
        )
        .unwrap();

        origin_store.set("target", Value::IntegerArray(vec![4, 2]));
        origin.send_data().await.unwrap();
        wait_for(&relay_store, "target", Value::IntegerArray(vec![4, 2])).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The relay forwarded once; its own echo and the origin's copy add nothing
        assert_eq!(relay.stats().rebroadcasts, 1);
        assert_eq!(origin.stats().rebroadcasts, 0);

        relay.close().await.unwrap();
        origin.close().await.unwrap();
    }
}
