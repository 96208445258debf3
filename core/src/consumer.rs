use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::errors::{ConfigError, PollerError, Result};
use crate::poller::{PartitionPoller, PartitionReport};
use crate::retry::RetryPolicy;
use crate::sink::RecordSink;
use crate::source::{PartitionId, RuntimeInfo, StartPosition, StreamClient};

/// Settings the consumer hands to every partition poller.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub batch_size: usize,
    pub start_position: StartPosition,
    pub partitions: Option<Vec<PartitionId>>,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
}

impl From<&ConsumerConfig> for PollSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            batch_size: config.polling.batch_size,
            start_position: config.polling.start_position,
            partitions: config.polling.partition_filter(),
            retry: RetryPolicy::from(&config.retry),
            shutdown_grace: config.polling.shutdown_grace(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            start_position: StartPosition::StartOfStream,
            partitions: None,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPartition {
    pub partition: PartitionId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerReport {
    pub resource: String,
    pub partitions: Vec<PartitionReport>,
    pub skipped: Vec<SkippedPartition>,
}

impl ConsumerReport {
    pub fn has_failures(&self) -> bool {
        !self.skipped.is_empty() || self.partitions.iter().any(PartitionReport::is_failure)
    }

    pub fn records_delivered(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.metrics.records_delivered)
            .sum()
    }
}

/// Enumerates the partitions of a stream and drives one poller per partition.
pub struct EventConsumer<C, S: ?Sized> {
    client: Arc<C>,
    sink: Arc<S>,
    settings: PollSettings,
    cancel: CancellationToken,
}

impl<C, S> EventConsumer<C, S>
where
    C: StreamClient,
    S: RecordSink + ?Sized + 'static,
{
    pub fn new(client: Arc<C>, sink: Arc<S>, settings: PollSettings) -> Self {
        Self {
            client,
            sink,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops every poller when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.cancel.cancel();
    }

    /// Runs until every poller has stopped, either on its own or because the
    /// cancellation token fired.
    pub async fn run(&self) -> Result<ConsumerReport> {
        let info = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Ok(ConsumerReport {
                    resource: String::new(),
                    partitions: Vec::new(),
                    skipped: Vec::new(),
                });
            }
            info = self.client.runtime_info() => info?,
        };

        let partitions = self.select_partitions(&info)?;
        let mut pollers = JoinSet::new();
        let mut skipped = Vec::new();

        for partition in partitions {
            match self
                .client
                .create_receiver(partition, self.settings.start_position)
            {
                Ok(receiver) => {
                    let poller = PartitionPoller::new(
                        receiver,
                        Arc::clone(&self.sink),
                        self.settings.batch_size,
                        self.settings.retry.clone(),
                        self.cancel.child_token(),
                    );
                    pollers.spawn(poller.run());
                }
                Err(e) => {
                    error!(partition = %partition, error = %e, "Failed to open partition receiver, skipping");
                    skipped.push(SkippedPartition {
                        partition,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if pollers.is_empty() {
            return Err(PollerError::NoPartitions {
                resource: info.resource,
            });
        }

        info!(
            resource = %info.resource,
            polling = pollers.len(),
            skipped = skipped.len(),
            "Polling partitions"
        );

        let mut reports = Vec::with_capacity(pollers.len());
        loop {
            tokio::select! {
                joined = pollers.join_next() => match joined {
                    Some(joined) => collect(joined, &mut reports),
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        if !pollers.is_empty() {
            self.drain(&mut pollers, &mut reports).await;
        }

        reports.sort_by_key(|report| report.partition);
        Ok(ConsumerReport {
            resource: info.resource,
            partitions: reports,
            skipped,
        })
    }

    /// Waits out the grace period for cancelled pollers, then aborts stragglers.
    async fn drain(
        &self,
        pollers: &mut JoinSet<PartitionReport>,
        reports: &mut Vec<PartitionReport>,
    ) {
        let grace = self.settings.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = pollers.join_next().await {
                collect(joined, reports);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = pollers.len(),
                ?grace,
                "Pollers did not stop within the grace period, aborting"
            );
            pollers.abort_all();
            while pollers.join_next().await.is_some() {}
        }
    }

    fn select_partitions(&self, info: &RuntimeInfo) -> Result<Vec<PartitionId>> {
        let Some(requested) = &self.settings.partitions else {
            return Ok(info.partition_ids.clone());
        };

        if let Some(unknown) = requested
            .iter()
            .find(|id| !info.partition_ids.contains(id))
        {
            return Err(ConfigError::Invalid {
                message: format!(
                    "partition {unknown} does not exist, {} has {} partitions",
                    info.resource,
                    info.partition_count()
                ),
            }
            .into());
        }

        let mut selected = requested.clone();
        selected.sort();
        selected.dedup();
        Ok(selected)
    }
}

fn collect(
    joined: std::result::Result<PartitionReport, JoinError>,
    reports: &mut Vec<PartitionReport>,
) {
    match joined {
        Ok(report) => reports.push(report),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "Partition poller task panicked"),
    }
}
