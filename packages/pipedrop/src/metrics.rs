//! Server metrics for observability
//!
//! Provides runtime counters for signaling connections and streamed transfers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Signaling metrics
    /// Currently open signaling connections
    pub active_connections: AtomicU64,
    /// Total signaling connections since server start
    pub total_connections: AtomicU64,
    /// Control messages forwarded to their recipient
    pub messages_relayed: AtomicU64,
    /// Control messages dropped because the recipient was gone
    pub messages_dropped: AtomicU64,

    // Transfer metrics
    pub uploads_started: AtomicU64,
    pub downloads_started: AtomicU64,
    /// Downloads that reached a clean end-of-stream
    pub transfers_completed: AtomicU64,
    /// Stream sides that ended in a copy error or an aborted peer
    pub stream_failures: AtomicU64,
    /// Stream sides whose counterpart never attached
    pub streams_expired: AtomicU64,
    /// Bytes delivered to receivers
    pub bytes_streamed: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Transfer tracking
    pub fn upload_started(&self) {
        self.uploads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_completed(&self, bytes: u64) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_streamed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stream_failed(&self) {
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_expired(&self) {
        self.streams_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                relayed: self.messages_relayed.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            transfers: TransferMetrics {
                uploads_started: self.uploads_started.load(Ordering::Relaxed),
                downloads_started: self.downloads_started.load(Ordering::Relaxed),
                completed: self.transfers_completed.load(Ordering::Relaxed),
                failures: self.stream_failures.load(Ordering::Relaxed),
                expired: self.streams_expired.load(Ordering::Relaxed),
                bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub transfers: TransferMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub relayed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetrics {
    pub uploads_started: u64,
    pub downloads_started: u64,
    pub completed: u64,
    pub failures: u64,
    pub expired: u64,
    pub bytes_streamed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub clients: u64,
    pub pending_transfers: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_transfer_tracking() {
        let metrics = ServerMetrics::new();

        metrics.upload_started();
        metrics.download_started();
        metrics.transfer_completed(1024);
        metrics.transfer_completed(1);
        metrics.stream_failed();
        metrics.stream_expired();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transfers.uploads_started, 1);
        assert_eq!(snapshot.transfers.downloads_started, 1);
        assert_eq!(snapshot.transfers.completed, 2);
        assert_eq!(snapshot.transfers.bytes_streamed, 1025);
        assert_eq!(snapshot.transfers.failures, 1);
        assert_eq!(snapshot.transfers.expired, 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.message_relayed();
        metrics.message_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.messages.relayed, 1);
        assert_eq!(snapshot.messages.dropped, 1);
    }
}
