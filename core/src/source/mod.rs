pub mod kafka;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, SourceError};

/// Index of a partition within a stream resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub i32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for PartitionId {
    fn from(id: i32) -> Self {
        PartitionId(id)
    }
}

/// Where a freshly opened receiver starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest record still retained by the stream.
    #[default]
    StartOfStream,
    /// Only records enqueued after the receiver is opened.
    EndOfStream,
    Offset(i64),
}

impl FromStr for StartPosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "start" | "start_of_stream" | "earliest" => Ok(StartPosition::StartOfStream),
            "end" | "end_of_stream" | "latest" => Ok(StartPosition::EndOfStream),
            other => other
                .parse::<i64>()
                .ok()
                .filter(|offset| *offset >= 0)
                .map(StartPosition::Offset)
                .ok_or_else(|| ConfigError::Invalid {
                    message: format!(
                        "start position must be 'start', 'end' or a non-negative offset, got '{other}'"
                    ),
                }),
        }
    }
}

/// A record received from a partition. The payload is opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: PartitionId,
    /// Position of the record within its partition.
    pub offset: i64,
    pub payload: Vec<u8>,
    /// Time the stream accepted the record, when the source reports it.
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Answer to the one-off runtime information query made at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub resource: String,
    pub partition_ids: Vec<PartitionId>,
}

impl RuntimeInfo {
    pub fn partition_count(&self) -> usize {
        self.partition_ids.len()
    }
}

/// A connected client for one stream resource.
///
/// The client is shared read-only by every partition poller; all per-partition
/// state lives in the receivers it hands out.
pub trait StreamClient: Send + Sync + 'static {
    type Receiver: PartitionReceiver;

    /// Queries the partition layout of the stream resource.
    fn runtime_info(&self) -> impl Future<Output = Result<RuntimeInfo, SourceError>> + Send;

    /// Opens a receiver bound to a single partition.
    fn create_receiver(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<Self::Receiver, SourceError>;
}

/// A stateful handle that pulls batches from exactly one partition.
pub trait PartitionReceiver: Send + 'static {
    fn partition(&self) -> PartitionId;

    /// Receives up to `max_count` records.
    ///
    /// Suspends until at least one record is available or the receive timeout
    /// of the underlying transport elapses. An empty batch means the timeout
    /// elapsed without new records.
    fn receive(
        &mut self,
        max_count: usize,
    ) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;

    /// Releases the partition. Calling it more than once is a no-op.
    fn close(&mut self) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_parsing() {
        assert_eq!("start".parse::<StartPosition>().unwrap(), StartPosition::StartOfStream);
        assert_eq!("latest".parse::<StartPosition>().unwrap(), StartPosition::EndOfStream);
        assert_eq!("42".parse::<StartPosition>().unwrap(), StartPosition::Offset(42));
        assert!("-1".parse::<StartPosition>().is_err());
        assert!("yesterday".parse::<StartPosition>().is_err());
    }

    #[test]
    fn test_start_position_from_yaml() {
        let start: StartPosition = serde_yaml::from_str("start_of_stream").unwrap();
        assert_eq!(start, StartPosition::StartOfStream);

        let end: StartPosition = serde_yaml::from_str("end_of_stream").unwrap();
        assert_eq!(end, StartPosition::EndOfStream);
    }

    #[test]
    fn test_payload_text_is_lossy() {
        let record = Record {
            partition: PartitionId(0),
            offset: 0,
            payload: vec![b'h', b'i', 0xff],
            enqueued_at: None,
        };
        assert_eq!(record.payload_text(), "hi\u{fffd}");
    }
}
