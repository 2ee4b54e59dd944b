//! Global completion coordinator.
//!
//! Sinks every finalized [`InvocationRecord`] and decides when the
//! experiment's output is complete. The expected total is unknown until all
//! schedulers finish, so it starts out unreachable and is delivered later on
//! its own channel.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::LoaderError;
use crate::metrics::RECORDS_WRITTEN_TOTAL;
use crate::percentiles::{FunctionLatencyTracker, PercentileStats};
use crate::record::InvocationRecord;

/// Destination of finalized records.
pub trait RecordSink: Send {
    fn write(&mut self, record: &InvocationRecord) -> Result<(), LoaderError>;
    fn flush(&mut self) -> Result<(), LoaderError>;
}

/// Writes records as CSV rows with a header, one column per record field.
pub struct CsvRecordSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvRecordSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(inner),
        }
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, LoaderError> {
        self.writer.into_inner().map_err(|e| {
            LoaderError::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
        })
    }
}

impl CsvRecordSink<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`, creating parent
    /// directories as needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> RecordSink for CsvRecordSink<W> {
    fn write(&mut self, record: &InvocationRecord) -> Result<(), LoaderError> {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LoaderError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink, handy when the caller post-processes records itself.
#[derive(Debug, Default)]
pub struct VecRecordSink {
    pub records: Vec<InvocationRecord>,
}

impl RecordSink for VecRecordSink {
    fn write(&mut self, record: &InvocationRecord) -> Result<(), LoaderError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LoaderError> {
        Ok(())
    }
}

/// What the coordinator saw once it finished.
#[derive(Debug, Clone)]
pub struct CollectorSummary {
    /// Records received and handed to the sink
    pub written: u64,
    /// Records carrying a failure flag
    pub failed: u64,
    /// Records the sink rejected; still counted towards `written`
    pub sink_errors: u64,
    /// Response time percentiles per function
    pub latency: HashMap<String, PercentileStats>,
}

/// Handle to a running coordinator.
pub struct GlobalMetricsCollector<S: RecordSink> {
    records: mpsc::UnboundedSender<InvocationRecord>,
    total: Option<oneshot::Sender<u64>>,
    task: JoinHandle<(CollectorSummary, S)>,
}

impl<S: RecordSink + 'static> GlobalMetricsCollector<S> {
    /// Starts the coordinator task writing into `sink`.
    pub fn spawn(sink: S) -> Self {
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (total_tx, total_rx) = oneshot::channel();
        let task = tokio::spawn(run_collector(sink, records_rx, total_rx));

        Self {
            records: records_tx,
            total: Some(total_tx),
            task,
        }
    }

    /// Sender for finalized records; clone one per producer.
    pub fn sender(&self) -> mpsc::UnboundedSender<InvocationRecord> {
        self.records.clone()
    }

    /// Delivers the number of records that will ever be produced.
    /// Only the first call has an effect.
    pub fn deliver_total(&mut self, total: u64) {
        if let Some(tx) = self.total.take() {
            info!(expected = total, "Delivering total number of records");
            if tx.send(total).is_err() {
                error!("Record collector stopped before the total was delivered");
            }
        }
    }

    /// True once the expected total has been sunk.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until every expected record is sunk.
    ///
    /// Without a delivered total this waits until every record sender is
    /// dropped; the caller compares `written` against what it expected.
    pub async fn finish(self) -> Result<(CollectorSummary, S), LoaderError> {
        let GlobalMetricsCollector {
            records,
            total,
            task,
        } = self;
        drop(records);
        drop(total);
        Ok(task.await?)
    }
}

async fn run_collector<S: RecordSink>(
    mut sink: S,
    mut records: mpsc::UnboundedReceiver<InvocationRecord>,
    mut total_rx: oneshot::Receiver<u64>,
) -> (CollectorSummary, S) {
    let latency = FunctionLatencyTracker::new();
    let mut expected = u64::MAX;
    let mut total_pending = true;
    let mut records_open = true;
    let mut written = 0u64;
    let mut failed = 0u64;
    let mut sink_errors = 0u64;

    while written < expected {
        tokio::select! {
            total = &mut total_rx, if total_pending => {
                total_pending = false;
                match total {
                    Ok(total) => {
                        debug!(expected = total, written = written, "Received total number of records");
                        expected = total;
                    }
                    Err(_) => debug!("Total sender dropped without delivering"),
                }
            }
            record = records.recv(), if records_open => {
                let Some(record) = record else {
                    records_open = false;
                    continue;
                };

                if let Err(e) = sink.write(&record) {
                    error!(
                        function = %record.function,
                        invocation_id = %record.invocation_id,
                        error = %e,
                        "Failed to write record"
                    );
                    sink_errors += 1;
                }
                if record.failed() {
                    failed += 1;
                }
                latency.record(&record.function, record.response_time_us);
                written += 1;
                RECORDS_WRITTEN_TOTAL.inc();
            }
            else => {
                // Nothing left that could ever satisfy `expected`
                error!(
                    written = written,
                    expected = expected,
                    "Record collector has no more inputs"
                );
                break;
            }
        }
    }

    if let Err(e) = sink.flush() {
        error!(error = %e, "Failed to flush record sink");
    }
    info!(written = written, failed = failed, "All records have been written");

    let summary = CollectorSummary {
        written,
        failed,
        sink_errors,
        latency: latency.all_stats(),
    };
    (summary, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_sink_writes_header_and_rows() {
        let mut sink = CsvRecordSink::new(Vec::new());
        let record = InvocationRecord {
            phase: 2,
            function: "f".to_string(),
            invocation_id: "min0.inv0".to_string(),
            function_timeout: true,
            ..Default::default()
        };
        sink.write(&record).unwrap();
        sink.flush().unwrap();

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let mut lines = output.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("phase,function,instance,invocation_id,start_time"));
        assert!(header.ends_with("deserialization_warning"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("2,f,,min0.inv0,"));
        assert!(row.contains("true"));
    }

    #[tokio::test]
    async fn test_zero_total_completes_immediately() {
        let mut collector = GlobalMetricsCollector::spawn(VecRecordSink::default());
        collector.deliver_total(0);
        let (summary, sink) = collector.finish().await.unwrap();
        assert_eq!(summary.written, 0);
        assert!(sink.records.is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts_failures() {
        let mut collector = GlobalMetricsCollector::spawn(VecRecordSink::default());
        let tx = collector.sender();
        tx.send(InvocationRecord {
            function: "f".to_string(),
            response_time_us: 1_000,
            ..Default::default()
        })
        .unwrap();
        tx.send(InvocationRecord {
            function: "f".to_string(),
            connection_timeout: true,
            ..Default::default()
        })
        .unwrap();
        collector.deliver_total(2);

        let (summary, sink) = collector.finish().await.unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.latency["f"].count, 2);
        assert_eq!(sink.records.len(), 2);
    }
}
