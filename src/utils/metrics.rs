//! Observability and Metrics
//!
//! Passive counters fed by the network, its participants, streams and the
//! scheduler. Every counter is an atomic so any task can record into it.
//!
//! One [`Metrics`] instance belongs to one [`crate::network::Network`]; tests
//! can therefore assert on exact counts without seeing other networks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::transport::ProtocolKind;

/// Counters split by transport kind.
#[derive(Debug, Default)]
pub struct PerProtocol {
    counts: [AtomicU64; ProtocolKind::COUNT],
}

impl PerProtocol {
    fn inc(&self, protocol: ProtocolKind) {
        self.counts[protocol.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, protocol: ProtocolKind) -> u64 {
        self.counts[protocol.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// Metrics collector for one network
#[derive(Debug)]
pub struct Metrics {
    /// `listen` calls per transport
    pub listen_requests: PerProtocol,
    /// `connect` calls per transport
    pub connect_requests: PerProtocol,
    /// Accepted physical connections per transport
    pub incoming_connections: PerProtocol,
    /// Handshakes that failed, either direction
    pub failed_handshakes: AtomicU64,
    /// Participants registered
    pub participants_connected: AtomicU64,
    /// Participants torn down
    pub participants_disconnected: AtomicU64,
    /// Streams opened, locally or by the remote
    pub streams_opened: AtomicU64,
    /// Streams closed
    pub streams_closed: AtomicU64,
    /// Channels registered on participants
    pub channels_connected: AtomicU64,
    /// Channels removed from participants
    pub channels_disconnected: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Reliable messages sent again after the retry interval
    pub resends: AtomicU64,
    /// Reliable closes that gave up waiting for the peer
    pub close_timeouts: AtomicU64,
    /// Tasks handed to the scheduler
    pub scheduler_queued: AtomicU64,
    /// Tasks the scheduler ran to completion
    pub scheduler_executed: AtomicU64,
    /// Tasks abandoned after the scheduler task timeout
    pub scheduler_timeouts: AtomicU64,
    /// Most recent bandwidth sample of any participant, bytes per second
    pub last_bandwidth: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            listen_requests: PerProtocol::default(),
            connect_requests: PerProtocol::default(),
            incoming_connections: PerProtocol::default(),
            failed_handshakes: AtomicU64::new(0),
            participants_connected: AtomicU64::new(0),
            participants_disconnected: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            channels_connected: AtomicU64::new(0),
            channels_disconnected: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            close_timeouts: AtomicU64::new(0),
            scheduler_queued: AtomicU64::new(0),
            scheduler_executed: AtomicU64::new(0),
            scheduler_timeouts: AtomicU64::new(0),
            last_bandwidth: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn listen_request(&self, protocol: ProtocolKind) {
        self.listen_requests.inc(protocol);
    }

    pub fn connect_request(&self, protocol: ProtocolKind) {
        self.connect_requests.inc(protocol);
    }

    pub fn incoming_connection(&self, protocol: ProtocolKind) {
        self.incoming_connections.inc(protocol);
    }

    pub fn handshake_failed(&self) {
        self.failed_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participant_connected(&self) {
        self.participants_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participant_disconnected(&self) {
        self.participants_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_connected(&self) {
        self.channels_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_disconnected(&self) {
        self.channels_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn resend(&self) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_timeout(&self) {
        self.close_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scheduler_task_queued(&self) {
        self.scheduler_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scheduler_task_executed(&self) {
        self.scheduler_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scheduler_task_timeout(&self) {
        self.scheduler_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bandwidth_sample(&self, bytes_per_second: u64) {
        self.last_bandwidth.store(bytes_per_second, Ordering::Relaxed);
    }

    /// Streams opened and not yet closed
    pub fn streams_active(&self) -> u64 {
        let opened = self.streams_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.streams_closed.load(Ordering::Relaxed))
    }

    /// Participants registered and not yet torn down
    pub fn participants_active(&self) -> u64 {
        let connected = self.participants_connected.load(Ordering::Relaxed);
        connected.saturating_sub(self.participants_disconnected.load(Ordering::Relaxed))
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            listen_requests: self.listen_requests.total(),
            connect_requests: self.connect_requests.total(),
            incoming_connections: self.incoming_connections.total(),
            failed_handshakes: self.failed_handshakes.load(Ordering::Relaxed),
            participants_active: self.participants_active(),
            streams_active: self.streams_active(),
            channels_connected: self.channels_connected.load(Ordering::Relaxed),
            channels_disconnected: self.channels_disconnected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            close_timeouts: self.close_timeouts.load(Ordering::Relaxed),
            scheduler_queued: self.scheduler_queued.load(Ordering::Relaxed),
            scheduler_executed: self.scheduler_executed.load(Ordering::Relaxed),
            scheduler_timeouts: self.scheduler_timeouts.load(Ordering::Relaxed),
            last_bandwidth: self.last_bandwidth.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            listen_requests = snapshot.listen_requests,
            connect_requests = snapshot.connect_requests,
            incoming_connections = snapshot.incoming_connections,
            failed_handshakes = snapshot.failed_handshakes,
            participants_active = snapshot.participants_active,
            streams_active = snapshot.streams_active,
            channels_connected = snapshot.channels_connected,
            channels_disconnected = snapshot.channels_disconnected,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            resends = snapshot.resends,
            close_timeouts = snapshot.close_timeouts,
            scheduler_queued = snapshot.scheduler_queued,
            scheduler_executed = snapshot.scheduler_executed,
            scheduler_timeouts = snapshot.scheduler_timeouts,
            last_bandwidth = snapshot.last_bandwidth,
            uptime_seconds = snapshot.uptime_seconds,
            "Network metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub listen_requests: u64,
    pub connect_requests: u64,
    pub incoming_connections: u64,
    pub failed_handshakes: u64,
    pub participants_active: u64,
    pub streams_active: u64,
    pub channels_connected: u64,
    pub channels_disconnected: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resends: u64,
    pub close_timeouts: u64,
    pub scheduler_queued: u64,
    pub scheduler_executed: u64,
    pub scheduler_timeouts: u64,
    pub last_bandwidth: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_protocol_counters() {
        let metrics = Metrics::new();
        metrics.connect_request(ProtocolKind::Tcp);
        metrics.connect_request(ProtocolKind::Tcp);
        metrics.connect_request(ProtocolKind::Mpsc);
        assert_eq!(metrics.connect_requests.get(ProtocolKind::Tcp), 2);
        assert_eq!(metrics.connect_requests.get(ProtocolKind::Udp), 0);
        assert_eq!(metrics.snapshot().connect_requests, 3);
    }

    #[test]
    fn test_active_gauges_never_underflow() {
        let metrics = Metrics::new();
        metrics.stream_closed();
        assert_eq!(metrics.streams_active(), 0);
        metrics.stream_opened();
        metrics.stream_opened();
        metrics.stream_closed();
        assert_eq!(metrics.snapshot().streams_active, 1);
    }

    #[test]
    fn test_message_accounting() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.bytes_received, 7);
    }
}
