use thiserror::Error;

use crate::source::PartitionId;

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stream source error: {0}")]
    Source(#[from] SourceError),

    #[error("Output sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Partition {partition} gave up after {attempts} consecutive failed receives: {last}")]
    RetriesExhausted {
        partition: PartitionId,
        attempts: u32,
        #[source]
        last: SourceError,
    },

    #[error("No partition receiver could be opened for {resource}")]
    NoPartitions { resource: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source: {source}")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source: {0}")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SourceError {
    pub fn transient(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SourceError::Transient {
            source: source.into(),
        }
    }

    pub fn connection(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SourceError::Connection {
            source: source.into(),
        }
    }

    pub fn unrecoverable(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SourceError::Unrecoverable(source.into())
    }

    /// Connection hiccups and transient failures are worth another receive;
    /// anything the source flags as unrecoverable is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Unrecoverable(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to fetch metadata for topic {topic}: {reason}")]
    Metadata { topic: String, reason: String },

    #[error("Failed to assign partition {partition} of topic {topic}: {reason}")]
    Assignment {
        topic: String,
        partition: PartitionId,
        reason: String,
    },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write record from partition {partition}: {source}")]
    Write {
        partition: PartitionId,
        #[source]
        source: std::io::Error,
    },

    #[error("Output sink lock was poisoned by a panicking writer")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, PollerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_retryability() {
        assert!(SourceError::transient("socket reset").is_retryable());
        assert!(SourceError::connection("broker down").is_retryable());
        assert!(!SourceError::unrecoverable("bad credentials").is_retryable());
    }

    #[test]
    fn test_exhausted_retries_message() {
        let err = PollerError::RetriesExhausted {
            partition: PartitionId(3),
            attempts: 5,
            last: SourceError::transient("timeout"),
        };
        assert!(err.to_string().contains("Partition 3 gave up after 5"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_source_error_converts_to_poller_error() {
        let err: PollerError = SourceError::unrecoverable("topic deleted").into();
        assert!(matches!(err, PollerError::Source(SourceError::Unrecoverable(_))));
    }
}
