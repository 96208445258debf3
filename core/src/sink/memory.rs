use std::sync::Mutex;

use crate::errors::SinkError;
use crate::sink::{RecordSink, format_record};
use crate::source::{PartitionId, Record};

/// Keeps every delivered record in arrival order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.records().iter().map(format_record).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads delivered for one partition, as text, in delivery order.
    pub fn payloads_for(&self, partition: PartitionId) -> Vec<String> {
        self.records()
            .iter()
            .filter(|record| record.partition == partition)
            .map(|record| record.payload_text().into_owned())
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn deliver(&self, record: Record) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .push(record);
        Ok(())
    }
}
