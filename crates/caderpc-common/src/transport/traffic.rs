use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// How often a live connection reports its traffic.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-connection byte and message counters.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_read: AtomicU64,
    messages_written: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub messages_read: u64,
    pub messages_written: u64,
}

impl TrafficStats {
    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
        }
    }

    /// Logs the totals every `interval` until the returned task is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, peer: String, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let s = stats.snapshot();
                tracing::info!(
                    target: "traffic",
                    peer = %peer,
                    "traffic report: read {} ({} msgs), written {} ({} msgs)",
                    format_bytes(s.bytes_read),
                    s.messages_read,
                    format_bytes(s.bytes_written),
                    s.messages_written
                );
            }
        })
    }

    pub fn log_final(&self, peer: &str) {
        let s = self.snapshot();
        tracing::info!(
            target: "traffic",
            peer = %peer,
            "connection closed, final traffic: read {} ({} msgs), written {} ({} msgs)",
            format_bytes(s.bytes_read),
            s.messages_read,
            format_bytes(s.bytes_written),
            s.messages_written
        );
    }
}

/// Human-readable byte count (`512 B`, `1.50 KB`, `2.00 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
