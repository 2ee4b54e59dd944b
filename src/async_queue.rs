//! Pending async invocations and their deferred collection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{error, info, warn};

use crate::metrics::ASYNC_QUEUE_DEPTH;
use crate::record::InvocationRecord;
use crate::transport::ResultFetcher;
use crate::utils::duration_micros;

/// Unbounded multi-producer FIFO of records still waiting for their result.
///
/// Dispatch tasks enqueue; only the [`AsyncResultCollector`] dequeues.
#[derive(Debug, Default)]
pub struct AsyncQueue {
    records: Mutex<VecDeque<InvocationRecord>>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InvocationRecord>> {
        // A panicking producer cannot leave the deque half-updated
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn enqueue(&self, record: InvocationRecord) {
        let mut records = self.lock();
        records.push_back(record);
        ASYNC_QUEUE_DEPTH.set(records.len() as i64);
    }

    pub fn dequeue(&self) -> Option<InvocationRecord> {
        let mut records = self.lock();
        let record = records.pop_front();
        ASYNC_QUEUE_DEPTH.set(records.len() as i64);
        record
    }

    /// Removes up to `max` records from the head of the queue.
    pub fn dequeue_batch(&self, max: usize) -> Vec<InvocationRecord> {
        let mut records = self.lock();
        let take = max.min(records.len());
        let batch: Vec<_> = records.drain(..take).collect();
        ASYNC_QUEUE_DEPTH.set(records.len() as i64);
        batch
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drains the [`AsyncQueue`] once all schedulers have finished dispatching.
pub struct AsyncResultCollector {
    fetcher: Arc<dyn ResultFetcher>,
    batch_size: usize,
    fetch_timeout: Duration,
}

impl AsyncResultCollector {
    pub fn new(fetcher: Arc<dyn ResultFetcher>, batch_size: usize, fetch_timeout: Duration) -> Self {
        Self {
            fetcher,
            batch_size: batch_size.max(1),
            fetch_timeout,
        }
    }

    /// Waits `grace`, then fetches every queued result in fixed-size batches
    /// and forwards each finalized record to `output`.
    ///
    /// Every dequeued record is forwarded exactly once, whether or not its
    /// result could be fetched. Returns the number of records forwarded.
    pub async fn collect(
        &self,
        grace: Duration,
        queue: &AsyncQueue,
        output: &mpsc::UnboundedSender<InvocationRecord>,
    ) -> u64 {
        if !grace.is_zero() {
            info!(
                grace_secs = grace.as_secs(),
                pending = queue.len(),
                "Waiting before collecting async responses"
            );
            time::sleep(grace).await;
        }

        let total_batches = queue.len().div_ceil(self.batch_size);
        let mut current_batch = 0;
        let mut forwarded = 0u64;

        info!(total_batches = total_batches, "Gathering function responses");
        loop {
            let batch = queue.dequeue_batch(self.batch_size);
            if batch.is_empty() {
                break;
            }
            current_batch += 1;

            let handles: Vec<_> = batch
                .iter()
                .map(|record| {
                    let fetcher = self.fetcher.clone();
                    let guid = record.async_response_guid.clone();
                    let fetch_timeout = self.fetch_timeout;
                    tokio::spawn(async move {
                        let start = Instant::now();
                        let (body, e2e) =
                            match time::timeout(fetch_timeout, fetcher.fetch_result(&guid)).await {
                                Ok(result) => result,
                                Err(_) => {
                                    warn!(guid = %guid, "Async response fetch timed out");
                                    (Vec::new(), 0)
                                }
                            };
                        (body, e2e, start.elapsed())
                    })
                })
                .collect();

            for (mut record, handle) in batch.into_iter().zip(handles) {
                let (body, e2e, fetch_time) = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(guid = %record.async_response_guid, error = %e, "Fetch task failed");
                        (Vec::new(), 0, Duration::ZERO)
                    }
                };
                finalize_record(&mut record, &body, e2e, fetch_time);

                if output.send(record).is_err() {
                    error!("Record output channel closed while collecting async responses");
                } else {
                    forwarded += 1;
                }
            }

            info!(
                batch = current_batch,
                total_batches = total_batches,
                "Processed batch of async response gatherings"
            );
        }

        info!(forwarded = forwarded, "Finished gathering async responses");
        forwarded
    }
}

/// Merges a fetched result into a pending record.
///
/// Latencies are added to the submission latency already on the record.
pub fn finalize_record(record: &mut InvocationRecord, body: &[u8], e2e: i64, fetch_time: Duration) {
    if body.is_empty() {
        error!(
            function = %record.function,
            invocation_id = %record.invocation_id,
            "Failed to fetch response. The function has probably not yet completed"
        );
        record.function_timeout = true;
        record.async_response_guid.clear();
    } else {
        record.merge_response_body(body);
    }

    let fetch_micros = duration_micros(fetch_time);
    record.user_code_execution_us = e2e;
    record.time_to_get_response_us = fetch_micros;
    record.response_time_us += e2e + fetch_micros;
}
