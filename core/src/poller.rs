use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{PollerError, Result};
use crate::retry::RetryPolicy;
use crate::sink::RecordSink;
use crate::source::{PartitionId, PartitionReceiver, Record};
use crate::telemetry::PartitionMetrics;

/// Drains one partition until cancelled or a terminal error.
pub struct PartitionPoller<R, S: ?Sized> {
    receiver: R,
    sink: Arc<S>,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    metrics: PartitionMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionOutcome {
    /// Stopped by the cancellation signal.
    Cancelled,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: PartitionId,
    pub outcome: PartitionOutcome,
    pub metrics: PartitionMetrics,
}

impl PartitionReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, PartitionOutcome::Failed { .. })
    }
}

impl<R, S> PartitionPoller<R, S>
where
    R: PartitionReceiver,
    S: RecordSink + ?Sized,
{
    pub fn new(
        receiver: R,
        sink: Arc<S>,
        batch_size: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            sink,
            batch_size,
            retry,
            cancel,
            metrics: PartitionMetrics::default(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.receiver.partition()
    }

    /// Runs the receive loop to completion and releases the receiver.
    pub async fn run(mut self) -> PartitionReport {
        let partition = self.partition();
        info!(partition = %partition, batch_size = self.batch_size, "Partition poller started");

        let outcome = match self.poll().await {
            Ok(()) => PartitionOutcome::Cancelled,
            Err(e) => {
                error!(partition = %partition, error = %e, "Partition poller stopped");
                PartitionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.receiver.close() {
            warn!(partition = %partition, error = %e, "Failed to release partition receiver");
        }

        info!(
            partition = %partition,
            records = self.metrics.records_delivered,
            avg_batch_size = self.metrics.avg_batch_size(),
            failures = self.metrics.receive_failures,
            "Partition poller finished"
        );

        PartitionReport {
            partition,
            outcome,
            metrics: self.metrics,
        }
    }

    async fn poll(&mut self) -> Result<()> {
        let partition = self.partition();
        let mut backoff = self.retry.backoff();

        loop {
            self.metrics.receive_calls += 1;
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                received = self.receiver.receive(self.batch_size) => received,
            };

            match received {
                Ok(records) => {
                    backoff.reset();
                    self.deliver(records)?;
                }
                Err(e) if e.is_retryable() => {
                    self.metrics.receive_failures += 1;
                    let Some(delay) = backoff.next_delay() else {
                        return Err(PollerError::RetriesExhausted {
                            partition,
                            attempts: backoff.failures(),
                            last: e,
                        });
                    };

                    warn!(
                        partition = %partition,
                        attempt = backoff.failures(),
                        max_attempts = self.retry.max_attempts(),
                        ?delay,
                        error = %e,
                        "Receive failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn deliver(&mut self, records: Vec<Record>) -> Result<()> {
        self.metrics.record_batch(records.len());
        if records.is_empty() {
            return Ok(());
        }

        debug!(partition = %self.partition(), count = records.len(), "Delivering batch");
        for record in records {
            self.metrics.record_delivery(&record);
            self.sink.deliver(record)?;
        }
        Ok(())
    }
}
