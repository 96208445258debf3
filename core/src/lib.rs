pub mod config;
pub mod consumer;
pub mod errors;
pub mod poller;
pub mod retry;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use config::{ConsumerConfig, StreamResource, TuningConfig};
pub use consumer::{ConsumerReport, EventConsumer, PollSettings};
pub use errors::{PollerError, Result};
pub use sink::RecordSink;
pub use source::{PartitionId, PartitionReceiver, Record, StartPosition, StreamClient};
