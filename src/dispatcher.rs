//! Execution of one scheduled tick: a full chain of dependent invocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::async_queue::AsyncQueue;
use crate::function::{compose_invocation_id, DagChain, ExperimentPhase, TraceGranularity};
use crate::metrics::{observe_record, IN_FLIGHT_INVOCATIONS};
use crate::record::InvocationRecord;
use crate::transport::Invoker;

/// Success and failure tallies of one scheduler, shared with its dispatch
/// tasks.
#[derive(Debug)]
pub struct InvocationCounters {
    successful: AtomicU64,
    failed: AtomicU64,
    issued: AtomicU64,
    records_emitted: AtomicU64,
    successful_by_minute: Vec<AtomicU64>,
    failed_by_minute: Vec<AtomicU64>,
}

impl InvocationCounters {
    pub fn new(minutes: usize) -> Self {
        Self {
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            successful_by_minute: (0..minutes).map(|_| AtomicU64::new(0)).collect(),
            failed_by_minute: (0..minutes).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record_issued(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self, minute: usize) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        if let Some(count) = self.successful_by_minute.get(minute) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_failure(&self, minute: usize) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(count) = self.failed_by_minute.get(minute) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful chain elements.
    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    /// Failed ticks; a chain abandoned part-way counts once.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Ticks dispatched.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Records handed to the output channel or the async queue.
    pub fn records_emitted(&self) -> u64 {
        self.records_emitted.load(Ordering::Relaxed)
    }

    pub fn failed_in_minute(&self, minute: usize) -> u64 {
        self.failed_by_minute
            .get(minute)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn successful_in_minute(&self, minute: usize) -> u64 {
        self.successful_by_minute
            .get(minute)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn failed_by_minute(&self) -> Vec<u64> {
        self.failed_by_minute
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

/// Where in the trace a tick sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub phase: ExperimentPhase,
    pub minute_index: usize,
    pub invocation_index: usize,
    /// Index into the root function's trace arrays
    pub iat_index: usize,
}

/// Result of walking one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Chain elements actually invoked
    pub invoked: usize,
    /// Position of the element that failed, if any
    pub failed_at: Option<usize>,
}

/// Walks a chain through the transport and routes every record.
#[derive(Clone)]
pub struct InvocationDispatcher {
    invoker: Arc<dyn Invoker>,
    async_mode: bool,
    granularity: TraceGranularity,
    output: mpsc::UnboundedSender<InvocationRecord>,
    async_queue: Arc<AsyncQueue>,
}

impl InvocationDispatcher {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        async_mode: bool,
        granularity: TraceGranularity,
        output: mpsc::UnboundedSender<InvocationRecord>,
        async_queue: Arc<AsyncQueue>,
    ) -> Self {
        Self {
            invoker,
            async_mode,
            granularity,
            output,
            async_queue,
        }
    }

    /// Invokes the chain's elements in order, stopping at the first failure.
    ///
    /// Emits one record per element invoked. A failure is counted once
    /// against the tick's minute and the remaining elements are skipped.
    pub async fn dispatch(
        &self,
        chain: &DagChain,
        tick: Tick,
        counters: &InvocationCounters,
    ) -> DispatchOutcome {
        IN_FLIGHT_INVOCATIONS.inc();

        let invocation_id =
            compose_invocation_id(self.granularity, tick.minute_index, tick.invocation_index);
        let mut outcome = DispatchOutcome {
            invoked: 0,
            failed_at: None,
        };

        for (position, function) in chain.functions().iter().enumerate() {
            let spec = function.runtime_spec(tick.iat_index);
            let (success, mut record) = self.invoker.invoke(function, &spec).await;
            outcome.invoked += 1;

            record.set_phase(tick.phase);
            record.invocation_id = invocation_id.clone();
            observe_record(&record, success);
            self.route(record);
            counters.record_emitted();

            if !success {
                debug!(
                    function = %function.name,
                    minute = tick.minute_index,
                    invocation_id = %invocation_id,
                    chain_position = position,
                    "Invocation failed"
                );
                counters.record_failure(tick.minute_index);
                outcome.failed_at = Some(position);
                break;
            }

            counters.record_success(tick.minute_index);
        }

        IN_FLIGHT_INVOCATIONS.dec();
        outcome
    }

    fn route(&self, mut record: InvocationRecord) {
        if !self.async_mode || !record.is_async_pending() {
            if self.output.send(record).is_err() {
                debug!("Record output channel closed, dropping record");
            }
        } else {
            record.time_to_submit_us = record.response_time_us;
            self.async_queue.enqueue(record);
        }
    }
}
