//! Scriptable in-process transport.
//!
//! Every partition owns a queue of steps (a batch, a failure, a pause). A
//! receiver pops one step per `receive` call and parks when the queue is empty
//! until more steps are pushed, the way an idle partition blocks a real
//! receiver. Counters record how receivers were opened, used and released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use crate::errors::SourceError;
use crate::source::{
    PartitionId, PartitionReceiver, Record, RuntimeInfo, StartPosition, StreamClient,
};

#[derive(Debug)]
enum Step {
    Batch(Vec<Vec<u8>>),
    Fail(String),
    Fatal(String),
    Pause(Duration),
}

pub struct MemoryStreamClient {
    resource: String,
    partitions: Vec<Arc<MemoryPartition>>,
    info_error: Mutex<Option<String>>,
}

#[derive(Debug)]
pub struct MemoryPartition {
    id: PartitionId,
    steps: Mutex<VecDeque<Step>>,
    pushed: Notify,
    open_error: Mutex<Option<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    receive_calls: AtomicUsize,
}

pub struct MemoryReceiver {
    partition: Arc<MemoryPartition>,
    next_offset: i64,
    closed: bool,
}

impl MemoryStreamClient {
    pub fn new(resource: impl Into<String>, partition_count: usize) -> Self {
        let partitions = (0..partition_count as i32)
            .map(|id| Arc::new(MemoryPartition::new(PartitionId(id))))
            .collect();
        Self {
            resource: resource.into(),
            partitions,
            info_error: Mutex::new(None),
        }
    }

    /// Scripting handle for one partition.
    ///
    /// Panics if the partition does not exist.
    pub fn partition(&self, id: i32) -> Arc<MemoryPartition> {
        Arc::clone(&self.partitions[id as usize])
    }

    pub fn partitions(&self) -> &[Arc<MemoryPartition>] {
        &self.partitions
    }

    /// Makes the runtime information query fail.
    pub fn fail_runtime_info(&self, reason: impl Into<String>) {
        *lock(&self.info_error) = Some(reason.into());
    }

    /// Partitions that currently have a receiver open.
    pub fn open_receivers(&self) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|p| p.opened() > p.closed())
            .map(|p| p.id)
            .collect()
    }
}

impl StreamClient for MemoryStreamClient {
    type Receiver = MemoryReceiver;

    async fn runtime_info(&self) -> Result<RuntimeInfo, SourceError> {
        if let Some(reason) = lock(&self.info_error).clone() {
            return Err(SourceError::connection(reason));
        }
        Ok(RuntimeInfo {
            resource: self.resource.clone(),
            partition_ids: self.partitions.iter().map(|p| p.id).collect(),
        })
    }

    fn create_receiver(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<MemoryReceiver, SourceError> {
        let slot = usize::try_from(partition.0)
            .ok()
            .and_then(|idx| self.partitions.get(idx))
            .ok_or_else(|| {
                SourceError::unrecoverable(format!("partition {partition} does not exist"))
            })?;

        if let Some(reason) = lock(&slot.open_error).clone() {
            return Err(SourceError::connection(reason));
        }

        slot.opened.fetch_add(1, Ordering::SeqCst);
        if start == StartPosition::EndOfStream {
            // Only steps pushed after the receiver opened are served.
            lock(&slot.steps).clear();
        }
        Ok(MemoryReceiver {
            partition: Arc::clone(slot),
            next_offset: match start {
                StartPosition::Offset(offset) => offset,
                StartPosition::StartOfStream | StartPosition::EndOfStream => 0,
            },
            closed: false,
        })
    }
}

impl MemoryPartition {
    fn new(id: PartitionId) -> Self {
        Self {
            id,
            steps: Mutex::new(VecDeque::new()),
            pushed: Notify::new(),
            open_error: Mutex::new(None),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            receive_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_batch<I, P>(&self, payloads: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.push(Step::Batch(payloads.into_iter().map(Into::into).collect()));
    }

    /// Queues a retryable receive failure.
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.push(Step::Fail(reason.into()));
    }

    /// Queues an unrecoverable receive failure.
    pub fn push_fatal(&self, reason: impl Into<String>) {
        self.push(Step::Fatal(reason.into()));
    }

    /// Queues a pause before the next step is served.
    pub fn push_pause(&self, duration: Duration) {
        self.push(Step::Pause(duration));
    }

    /// Makes every future `create_receiver` call for this partition fail.
    pub fn fail_open(&self, reason: impl Into<String>) {
        *lock(&self.open_error) = Some(reason.into());
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once a receiver was opened and every opened receiver was released.
    pub fn is_released(&self) -> bool {
        let opened = self.opened();
        opened > 0 && opened == self.closed()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn pending_steps(&self) -> usize {
        lock(&self.steps).len()
    }

    fn push(&self, step: Step) {
        lock(&self.steps).push_back(step);
        self.pushed.notify_one();
    }

    fn pop(&self) -> Option<Step> {
        lock(&self.steps).pop_front()
    }

    fn push_front(&self, step: Step) {
        lock(&self.steps).push_front(step);
    }
}

impl MemoryReceiver {
    fn stamp(&mut self, payloads: Vec<Vec<u8>>) -> Vec<Record> {
        payloads
            .into_iter()
            .map(|payload| {
                let record = Record {
                    partition: self.partition.id,
                    offset: self.next_offset,
                    payload,
                    enqueued_at: Some(Utc::now()),
                };
                self.next_offset += 1;
                record
            })
            .collect()
    }
}

impl PartitionReceiver for MemoryReceiver {
    fn partition(&self) -> PartitionId {
        self.partition.id
    }

    async fn receive(&mut self, max_count: usize) -> Result<Vec<Record>, SourceError> {
        self.partition.receive_calls.fetch_add(1, Ordering::SeqCst);

        loop {
            let step = self.partition.pop();
            match step {
                Some(Step::Batch(mut payloads)) => {
                    if payloads.len() > max_count {
                        let rest = payloads.split_off(max_count);
                        self.partition.push_front(Step::Batch(rest));
                    }
                    return Ok(self.stamp(payloads));
                }
                Some(Step::Fail(reason)) => return Err(SourceError::transient(reason)),
                Some(Step::Fatal(reason)) => return Err(SourceError::unrecoverable(reason)),
                Some(Step::Pause(duration)) => tokio::time::sleep(duration).await,
                None => self.partition.pushed.notified().await,
            }
        }
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if !self.closed {
            self.closed = true;
            self.partition.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runtime_info_lists_partitions() {
        let client = MemoryStreamClient::new("hub", 3);
        let info = client.runtime_info().await.unwrap();

        assert_eq!(info.resource, "hub");
        assert_eq!(info.partition_count(), 3);
        assert_eq!(
            info.partition_ids,
            vec![PartitionId(0), PartitionId(1), PartitionId(2)]
        );
    }

    #[tokio::test]
    async fn test_batches_are_split_at_max_count() {
        let client = MemoryStreamClient::new("hub", 1);
        client.partition(0).push_batch(["a", "b", "c"]);

        let mut receiver = client
            .create_receiver(PartitionId(0), StartPosition::StartOfStream)
            .unwrap();

        let first = receiver.receive(2).await.unwrap();
        let second = receiver.receive(2).await.unwrap();

        assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, b"c".to_vec());
        assert_eq!(second[0].offset, 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let client = MemoryStreamClient::new("hub", 1);
        let partition = client.partition(0);
        partition.push_failure("flaky");
        partition.push_fatal("gone");

        let mut receiver = client
            .create_receiver(PartitionId(0), StartPosition::StartOfStream)
            .unwrap();

        assert!(receiver.receive(10).await.unwrap_err().is_retryable());
        assert!(!receiver.receive(10).await.unwrap_err().is_retryable());
        assert_eq!(partition.receive_calls(), 2);
    }

    #[tokio::test]
    async fn test_idle_receiver_wakes_on_push() {
        let client = MemoryStreamClient::new("hub", 1);
        let partition = client.partition(0);
        let mut receiver = client
            .create_receiver(PartitionId(0), StartPosition::StartOfStream)
            .unwrap();

        let pending = tokio::spawn(async move { receiver.receive(10).await });
        tokio::task::yield_now().await;
        partition.push_batch(["late"]);

        let records = pending.await.unwrap().unwrap();
        assert_eq!(records[0].payload_text(), "late");
    }

    #[tokio::test]
    async fn test_end_of_stream_skips_earlier_steps() {
        let client = MemoryStreamClient::new("hub", 1);
        let partition = client.partition(0);
        partition.push_batch(["old-1", "old-2"]);
        partition.push_failure("old failure");

        let mut receiver = client
            .create_receiver(PartitionId(0), StartPosition::EndOfStream)
            .unwrap();
        assert_eq!(partition.pending_steps(), 0);

        partition.push_batch(["new"]);
        let records = receiver.receive(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload_text(), "new");
    }

    #[test]
    fn test_open_failure_and_unknown_partition() {
        let client = MemoryStreamClient::new("hub", 2);
        client.partition(1).fail_open("no link");

        assert!(
            client
                .create_receiver(PartitionId(1), StartPosition::StartOfStream)
                .is_err()
        );
        assert!(
            client
                .create_receiver(PartitionId(7), StartPosition::StartOfStream)
                .is_err()
        );
        assert_eq!(client.partition(1).opened(), 0);
    }

    #[test]
    fn test_close_and_drop_release_once() {
        let client = MemoryStreamClient::new("hub", 1);
        let mut receiver = client
            .create_receiver(PartitionId(0), StartPosition::StartOfStream)
            .unwrap();
        assert_eq!(client.open_receivers(), vec![PartitionId(0)]);

        receiver.close().unwrap();
        receiver.close().unwrap();
        drop(receiver);

        let partition = client.partition(0);
        assert_eq!(partition.closed(), 1);
        assert!(partition.is_released());
        assert!(client.open_receivers().is_empty());
    }
}
