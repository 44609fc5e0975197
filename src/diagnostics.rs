// =============================================================================
// Diagnostics - error log and ingestion counters
// =============================================================================
//
// Every non-fatal failure in the core lands here: malformed messages,
// corrupt stored series, transport drops, rejected selections. The log is a
// bounded ring; counters are lock-free atomics that any task may read.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::IngestError;

/// A recorded failure for the diagnostics log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Machine-readable kind, see [`IngestError::kind`].
    pub kind: &'static str,
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub messages_received: u64,
    pub candles_appended: u64,
    pub unclosed_ignored: u64,
    pub messages_dropped: u64,
    pub stale_events: u64,
    pub disconnects: u64,
}

pub struct Diagnostics {
    recent_errors: RwLock<Vec<ErrorRecord>>,
    max_recent_errors: usize,

    messages_received: AtomicU64,
    candles_appended: AtomicU64,
    unclosed_ignored: AtomicU64,
    messages_dropped: AtomicU64,
    stale_events: AtomicU64,
    disconnects: AtomicU64,
}

impl Diagnostics {
    pub fn new(max_recent_errors: usize) -> Self {
        Self {
            recent_errors: RwLock::new(Vec::new()),
            max_recent_errors: max_recent_errors.max(1),
            messages_received: AtomicU64::new(0),
            candles_appended: AtomicU64::new(0),
            unclosed_ignored: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
        }
    }

    /// Append an error to the log, evicting the oldest entries past the cap.
    pub fn record(&self, err: &IngestError) {
        match err {
            IngestError::MalformedMessage(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            IngestError::TransportFailure(_) => {
                self.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let record = ErrorRecord {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > self.max_recent_errors {
            errors.remove(0);
        }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_appended(&self) {
        self.candles_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unclosed_ignored(&self) {
        self.unclosed_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_event(&self) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            candles_appended: self.candles_appended.load(Ordering::Relaxed),
            unclosed_ignored: self.unclosed_ignored.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}
