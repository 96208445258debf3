use std::io::{self, Stdout, Write};
use std::sync::Mutex;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::trace;

use crate::errors::SinkError;
use crate::sink::{RecordSink, format_record};
use crate::source::Record;

/// Line-oriented writer, one line per record.
pub struct ConsoleSink<W: Write + Send = Stdout> {
    out: Mutex<W>,
}

impl ConsoleSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.out.into_inner().map_err(|_| SinkError::Poisoned)
    }
}

impl<W: Write + Send> RecordSink for ConsoleSink<W> {
    fn deliver(&self, record: Record) -> Result<(), SinkError> {
        let mut line = format_record(&record);
        line.push('\n');

        // The whole line goes out under one lock so partitions never interleave mid-line.
        blocking(|| {
            let mut out = self.out.lock().map_err(|_| SinkError::Poisoned)?;
            out.write_all(line.as_bytes())
                .and_then(|_| out.flush())
                .map_err(|source| SinkError::Write {
                    partition: record.partition,
                    source,
                })
        })?;

        trace!(partition = %record.partition, offset = record.offset, "Record written");
        Ok(())
    }
}

/// Runs a blocking write off the async scheduler when the runtime allows it.
/// `block_in_place` is unavailable on a current-thread runtime, where the
/// write simply runs inline.
fn blocking<T>(write: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(write)
        }
        _ => write(),
    }
}
