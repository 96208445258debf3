pub mod console;
pub mod memory;

use crate::errors::SinkError;
use crate::source::Record;

/// A destination for received records.
///
/// Implementations are shared by every partition poller, so `deliver` must
/// write each record as one indivisible unit.
#[cfg_attr(test, mockall::automock)]
pub trait RecordSink: Send + Sync {
    fn deliver(&self, record: Record) -> Result<(), SinkError>;
}

/// Renders a record as `Partition <id>, Event <payload>`.
pub fn format_record(record: &Record) -> String {
    format!(
        "Partition {}, Event {}",
        record.partition,
        record.payload_text()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PartitionId;

    #[test]
    fn test_format_record() {
        let record = Record {
            partition: PartitionId(2),
            offset: 7,
            payload: b"hello".to_vec(),
            enqueued_at: None,
        };
        assert_eq!(format_record(&record), "Partition 2, Event hello");
    }

    #[test]
    fn test_format_keeps_payload_verbatim() {
        let record = Record {
            partition: PartitionId(0),
            offset: 0,
            payload: br#"{"pageKey": "home", "memberId": 42}"#.to_vec(),
            enqueued_at: None,
        };
        assert_eq!(
            format_record(&record),
            r#"Partition 0, Event {"pageKey": "home", "memberId": 42}"#
        );
    }
}
