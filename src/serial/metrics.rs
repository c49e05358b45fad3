use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters kept per connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub commands_sent: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub responses_captured: u64,
    pub responses_absent: u64,
    // Bytes found in the input buffer right before a command went out
    pub stale_bytes_discarded: u64,
    pub desync_events: u64,
    pub last_desync_at: Option<DateTime<Utc>>,
    pub release_failures: u64,
    pub last_error: Option<String>,
}

impl ConnectionMetrics {
    pub(crate) fn record_response(&mut self, captured: bool) {
        if captured {
            self.responses_captured += 1;
        } else {
            self.responses_absent += 1;
        }
    }

    pub(crate) fn record_discard(&mut self, discarded: usize) {
        self.stale_bytes_discarded += discarded as u64;
        self.desync_events += 1;
        self.last_desync_at = Some(Utc::now());
    }
}
