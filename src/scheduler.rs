//! Per-function trace replay.
//!
//! [`SchedulerState`] holds the timing state of one chain's replay and
//! exposes pure transitions, so pacing and minute bookkeeping can be tested
//! without timers. [`FunctionScheduler`] drives it against the clock and
//! fans ticks out to the [`InvocationDispatcher`].

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{InvocationCounters, InvocationDispatcher, Tick};
use crate::function::{DagChain, ExperimentPhase, FunctionSpecification, TraceGranularity};
use crate::metrics::INVOCATIONS_ISSUED_TOTAL;

/// What the scheduler should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Trace duration reached or the IAT array is exhausted
    Done,
    /// The current minute has no invocations
    IdleMinute,
    /// Fire `tick` after waiting out its inter-arrival time
    Dispatch { tick: Tick, iat_micros: u64 },
}

/// Whether a dispatch closed its minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    SameMinute,
    NextMinute {
        finished_minute: usize,
        issued_in_minute: usize,
    },
}

/// Timing state of one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub phase: ExperimentPhase,
    pub minute_index: usize,
    pub invocation_index: usize,
    /// Sum of the IATs already waited out in this minute, in microseconds
    pub previous_iat_sum: u64,
    pub start_of_minute: Instant,
    /// IAT index of the first invocation of `minute_index`
    minute_offset: usize,
    trace_duration: usize,
    warmup_duration: usize,
    granularity: TraceGranularity,
}

impl SchedulerState {
    /// Initial state at `now`.
    ///
    /// With a warmup configured the scheduler starts in the warmup phase at
    /// minute 1; minute 0 is reserved for profiling and never replayed.
    pub fn new(
        spec: &FunctionSpecification,
        trace_duration: usize,
        warmup_duration: usize,
        granularity: TraceGranularity,
        now: Instant,
    ) -> Self {
        let (phase, minute_index) = if warmup_duration > 0 {
            (ExperimentPhase::Warmup, 1)
        } else {
            (ExperimentPhase::Execution, 0)
        };

        Self {
            phase,
            minute_index,
            invocation_index: 0,
            previous_iat_sum: 0,
            start_of_minute: now,
            minute_offset: spec.minute_offset(minute_index),
            trace_duration,
            warmup_duration,
            granularity,
        }
    }

    pub fn iat_index(&self) -> usize {
        self.minute_offset + self.invocation_index
    }

    pub fn next_action(&self, spec: &FunctionSpecification) -> SchedulerAction {
        if self.minute_index >= self.trace_duration {
            return SchedulerAction::Done;
        }
        let Some(&count) = spec.per_minute_count.get(self.minute_index) else {
            return SchedulerAction::Done;
        };
        if count == 0 {
            return SchedulerAction::IdleMinute;
        }

        let iat_index = self.iat_index();
        match spec.iat_micros(iat_index) {
            Some(iat_micros) => SchedulerAction::Dispatch {
                tick: Tick {
                    phase: self.phase,
                    minute_index: self.minute_index,
                    invocation_index: self.invocation_index,
                    iat_index,
                },
                iat_micros,
            },
            None => SchedulerAction::Done,
        }
    }

    /// How long to sleep before firing an invocation whose IAT is
    /// `iat_micros`.
    ///
    /// Lateness accumulated by earlier sleeps in this minute is subtracted,
    /// so the minute as a whole converges to the trace's schedule. A late
    /// scheduler gets zero and fires immediately.
    pub fn pacing_delay(&self, iat_micros: u64, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.start_of_minute).as_micros() as i128;
        let scheduling_delay = elapsed - self.previous_iat_sum as i128;
        let sleep_for = iat_micros as i128 - scheduling_delay;
        if sleep_for > 0 {
            Duration::from_micros(sleep_for as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Account for a dispatched invocation.
    ///
    /// The minute ends once its budget is spent or more than one
    /// granularity unit has passed since it started; in both cases the next
    /// minute is anchored at `now`.
    pub fn after_dispatch(
        &mut self,
        iat_micros: u64,
        now: Instant,
        spec: &FunctionSpecification,
    ) -> Progress {
        self.previous_iat_sum += iat_micros;

        let count = spec
            .per_minute_count
            .get(self.minute_index)
            .copied()
            .unwrap_or(0);
        let issued_in_minute = self.invocation_index + 1;
        let overrun =
            now.saturating_duration_since(self.start_of_minute) > self.granularity.unit();

        if issued_in_minute >= count || overrun {
            if overrun && issued_in_minute < count {
                debug!(
                    minute = self.minute_index,
                    issued = issued_in_minute,
                    requested = count,
                    "Minute overran, skipping remaining invocations"
                );
            }
            let finished_minute = self.minute_index;
            self.advance_minute(now, spec);
            Progress::NextMinute {
                finished_minute,
                issued_in_minute,
            }
        } else {
            self.invocation_index += 1;
            Progress::SameMinute
        }
    }

    /// Skip an idle minute. The next anchor is the current one plus one
    /// granularity unit, independent of when the scheduler resumes.
    pub fn skip_idle_minute(&mut self, spec: &FunctionSpecification) -> Instant {
        let anchor = self.start_of_minute + self.granularity.unit();
        self.advance_minute(anchor, spec);
        anchor
    }

    fn advance_minute(&mut self, anchor: Instant, spec: &FunctionSpecification) {
        self.minute_offset += spec
            .per_minute_count
            .get(self.minute_index)
            .copied()
            .unwrap_or(0);
        self.minute_index += 1;
        self.invocation_index = 0;
        self.previous_iat_sum = 0;
        self.start_of_minute = anchor;

        if self.warmup_duration > 0 && self.minute_index == self.warmup_duration + 1 {
            self.phase = ExperimentPhase::Execution;
            info!(
                minute = self.minute_index,
                "Warmup phase has finished. Starting the execution phase"
            );
        }
    }
}

/// Early-termination guard for schedulers that fall far behind the trace
/// or whose invocations mostly fail. Only applies to minute-granularity
/// traces and is disabled by default.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceCheck {
    pub enabled: bool,
    pub requested_vs_issued_warn: f64,
    pub requested_vs_issued_terminate: f64,
    pub failed_warn: f64,
    pub failed_terminate: f64,
}

impl Default for DivergenceCheck {
    fn default() -> Self {
        Self {
            enabled: false,
            requested_vs_issued_warn: 0.1,
            requested_vs_issued_terminate: 0.2,
            failed_warn: 0.5,
            failed_terminate: 0.75,
        }
    }
}

impl DivergenceCheck {
    /// Returns true when the scheduler should stop after `minute`.
    pub fn should_terminate(
        &self,
        function: &str,
        granularity: TraceGranularity,
        spec: &FunctionSpecification,
        minute: usize,
        issued_in_minute: usize,
        counters: &InvocationCounters,
    ) -> bool {
        if !self.enabled || granularity != TraceGranularity::Minute {
            return false;
        }

        let requested = spec.per_minute_count.get(minute).copied().unwrap_or(0);
        let ratio = shortfall_ratio(requested, issued_in_minute);
        if ratio >= self.requested_vs_issued_terminate {
            warn!(
                function = function,
                minute = minute,
                ratio = ratio,
                "Requested and issued invocations diverged too far. Terminating function driver"
            );
            return true;
        } else if ratio >= self.requested_vs_issued_warn {
            warn!(
                function = function,
                minute = minute,
                ratio = ratio,
                "Requested and issued invocations are diverging"
            );
        }

        for m in 0..=minute {
            let requested = spec.per_minute_count.get(m).copied().unwrap_or(0);
            let not_failed =
                (requested as u64).saturating_sub(counters.failed_in_minute(m)) as usize;
            let ratio = shortfall_ratio(requested, not_failed);
            if ratio >= self.failed_terminate {
                warn!(
                    function = function,
                    minute = m,
                    ratio = ratio,
                    "Too many failed invocations. Terminating function driver"
                );
                return true;
            } else if ratio >= self.failed_warn {
                warn!(
                    function = function,
                    minute = m,
                    ratio = ratio,
                    "Failed invocations within a minute are increasing"
                );
            }
        }

        false
    }
}

/// `(ideal - real) / ideal`, clamped to `[0, 1]`; zero when nothing was
/// requested.
fn shortfall_ratio(ideal: usize, real: usize) -> f64 {
    if ideal == 0 {
        return 0.0;
    }
    ((ideal as f64 - real as f64) / ideal as f64).clamp(0.0, 1.0)
}

/// Final tallies of one scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Name of the chain's root function
    pub function: String,
    pub successful: u64,
    pub failed: u64,
    pub issued: u64,
    pub records_emitted: u64,
    pub failed_by_minute: Vec<u64>,
}

/// Timing parameters shared by every scheduler of an experiment.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub trace_duration: usize,
    pub warmup_duration: usize,
    pub granularity: TraceGranularity,
    pub divergence_check: DivergenceCheck,
}

/// Replays one chain's trace.
pub struct FunctionScheduler {
    chain: DagChain,
    dispatcher: InvocationDispatcher,
    settings: SchedulerSettings,
}

impl FunctionScheduler {
    pub fn new(
        chain: DagChain,
        dispatcher: InvocationDispatcher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            chain,
            dispatcher,
            settings,
        }
    }

    /// Runs the replay to completion.
    ///
    /// Returns only after every dispatched tick has finished.
    pub async fn run(self) -> SchedulerReport {
        let root = self.chain.root().clone();
        let spec = &root.specification;
        let settings = &self.settings;

        if !spec.is_consistent() {
            warn!(
                function = %root.name,
                per_minute_total = spec.total_invocations(),
                iat_len = spec.iat.len(),
                "Specification is inconsistent, replay stops at the shorter bound"
            );
        }

        let counters = Arc::new(InvocationCounters::new(settings.trace_duration));
        let chain = Arc::new(self.chain);
        let mut in_flight = JoinSet::new();

        let mut state = SchedulerState::new(
            spec,
            settings.trace_duration,
            settings.warmup_duration,
            settings.granularity,
            Instant::now(),
        );
        if state.phase == ExperimentPhase::Warmup {
            info!(function = %root.name, "Warmup phase has started");
        }

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(function = %root.name, error = %e, "Dispatch task failed");
                }
            }

            match state.next_action(spec) {
                SchedulerAction::Done => break,
                SchedulerAction::IdleMinute => {
                    let finished_minute = state.minute_index;
                    let anchor = state.skip_idle_minute(spec);
                    debug!(
                        function = %root.name,
                        minute = finished_minute,
                        "No invocations in this minute"
                    );
                    if settings.divergence_check.should_terminate(
                        &root.name,
                        settings.granularity,
                        spec,
                        finished_minute,
                        0,
                        &counters,
                    ) {
                        break;
                    }
                    time::sleep_until(anchor).await;
                }
                SchedulerAction::Dispatch { tick, iat_micros } => {
                    let delay = state.pacing_delay(iat_micros, Instant::now());
                    if !delay.is_zero() {
                        time::sleep(delay).await;
                    }

                    let dispatcher = self.dispatcher.clone();
                    let chain = chain.clone();
                    let tick_counters = counters.clone();
                    in_flight.spawn(async move {
                        dispatcher.dispatch(&chain, tick, &tick_counters).await;
                    });
                    counters.record_issued();
                    INVOCATIONS_ISSUED_TOTAL.inc();

                    if let Progress::NextMinute {
                        finished_minute,
                        issued_in_minute,
                    } = state.after_dispatch(iat_micros, Instant::now(), spec)
                    {
                        if settings.divergence_check.should_terminate(
                            &root.name,
                            settings.granularity,
                            spec,
                            finished_minute,
                            issued_in_minute,
                            &counters,
                        ) {
                            break;
                        }
                    }
                }
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!(function = %root.name, error = %e, "Dispatch task failed");
            }
        }
        debug!(function = %root.name, "All the invocations for function have been completed");

        SchedulerReport {
            function: root.name.clone(),
            successful: counters.successful(),
            failed: counters.failed(),
            issued: counters.issued(),
            records_emitted: counters.records_emitted(),
            failed_by_minute: counters.failed_by_minute(),
        }
    }
}
