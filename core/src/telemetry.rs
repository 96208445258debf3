use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::source::Record;

/// Installs the global subscriber. Logs go to stderr; stdout belongs to the
/// record sink.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "poller_core=info,eh_console_consumer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PartitionMetrics {
    pub receive_calls: usize,
    pub batches_received: usize,
    pub empty_batches: usize,
    pub records_delivered: usize,
    pub bytes_delivered: u64,
    pub receive_failures: usize,
    pub last_offset: Option<i64>,
    pub latest_enqueued_at: Option<DateTime<Utc>>,
}

impl PartitionMetrics {
    pub fn record_batch(&mut self, size: usize) {
        if size == 0 {
            self.empty_batches += 1;
        } else {
            self.batches_received += 1;
        }
    }

    pub fn record_delivery(&mut self, record: &Record) {
        self.records_delivered += 1;
        self.bytes_delivered += record.payload.len() as u64;
        self.last_offset = Some(record.offset);
        if record.enqueued_at > self.latest_enqueued_at {
            self.latest_enqueued_at = record.enqueued_at;
        }
    }

    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_received == 0 {
            0.0
        } else {
            self.records_delivered as f64 / self.batches_received as f64
        }
    }
}
