//! Chain walking and record routing.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use faas_trace_loader::async_queue::AsyncQueue;
use faas_trace_loader::dispatcher::{InvocationCounters, InvocationDispatcher, Tick};
use faas_trace_loader::function::{
    DagChain, ExperimentPhase, Function, RuntimeSpecification, TraceGranularity,
};
use faas_trace_loader::record::InvocationRecord;
use faas_trace_loader::transport::Invoker;

/// Fails the functions named in `failing`; answers with `guid` when set.
#[derive(Default)]
struct ScriptedInvoker {
    failing: HashSet<String>,
    guid: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_guid(guid: &str) -> Self {
        Self {
            guid: Some(guid.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(
        &self,
        function: &Function,
        spec: &RuntimeSpecification,
    ) -> (bool, InvocationRecord) {
        self.calls.lock().unwrap().push(function.name.clone());
        let mut record = InvocationRecord::for_function(&function.name, spec.runtime);
        record.response_time_us = 250;

        if self.failing.contains(&function.name) {
            record.function_timeout = true;
            return (false, record);
        }
        if let Some(guid) = &self.guid {
            record.async_response_guid = guid.clone();
        }
        (true, record)
    }
}

fn chain(names: &[&str]) -> DagChain {
    let functions = names
        .iter()
        .map(|name| Arc::new(Function::new(*name, "localhost:8080")))
        .collect();
    DagChain::new(functions).unwrap()
}

fn tick(minute_index: usize, invocation_index: usize) -> Tick {
    Tick {
        phase: ExperimentPhase::Execution,
        minute_index,
        invocation_index,
        iat_index: 0,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<InvocationRecord>) -> Vec<InvocationRecord> {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records
}

#[tokio::test]
async fn chain_stops_at_first_failure() {
    let invoker = Arc::new(ScriptedInvoker::failing(&["f1"]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = InvocationDispatcher::new(
        invoker.clone(),
        false,
        TraceGranularity::Minute,
        tx,
        Arc::new(AsyncQueue::new()),
    );
    let counters = InvocationCounters::new(2);

    let outcome = dispatcher
        .dispatch(&chain(&["f0", "f1", "f2"]), tick(0, 3), &counters)
        .await;

    assert_eq!(outcome.invoked, 2);
    assert_eq!(outcome.failed_at, Some(1));
    assert_eq!(invoker.calls(), vec!["f0", "f1"]);

    let records = drain(&mut rx);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.invocation_id == "min0.inv3"));
    assert!(records
        .iter()
        .all(|r| r.phase == ExperimentPhase::Execution.as_i32()));
    assert!(!records[0].failed());
    assert!(records[1].failed());

    assert_eq!(counters.successful(), 1);
    assert_eq!(counters.failed(), 1);
    assert_eq!(counters.failed_in_minute(0), 1);
    assert_eq!(counters.records_emitted(), 2);
}

#[tokio::test]
async fn whole_chain_succeeds() {
    let invoker = Arc::new(ScriptedInvoker::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = InvocationDispatcher::new(
        invoker.clone(),
        false,
        TraceGranularity::Second,
        tx,
        Arc::new(AsyncQueue::new()),
    );
    let counters = InvocationCounters::new(1);

    let outcome = dispatcher
        .dispatch(&chain(&["f0", "f1", "f2"]), tick(0, 0), &counters)
        .await;

    assert_eq!(outcome.invoked, 3);
    assert_eq!(outcome.failed_at, None);
    let ids: Vec<_> = drain(&mut rx).into_iter().map(|r| r.invocation_id).collect();
    assert_eq!(ids, vec!["sec0.inv0"; 3]);
    assert_eq!(counters.successful(), 3);
    assert_eq!(counters.failed(), 0);
}

#[tokio::test]
async fn async_acknowledgement_goes_to_queue() {
    let invoker = Arc::new(ScriptedInvoker::with_guid("guid-1"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = Arc::new(AsyncQueue::new());
    let dispatcher =
        InvocationDispatcher::new(invoker, true, TraceGranularity::Minute, tx, queue.clone());
    let counters = InvocationCounters::new(1);

    dispatcher
        .dispatch(&chain(&["f0"]), tick(0, 0), &counters)
        .await;

    assert!(drain(&mut rx).is_empty());
    let pending = queue.dequeue().unwrap();
    assert_eq!(pending.async_response_guid, "guid-1");
    assert_eq!(pending.time_to_submit_us, 250);
    assert_eq!(counters.records_emitted(), 1);
}

#[tokio::test]
async fn async_failure_without_handle_goes_to_output() {
    let invoker = Arc::new(ScriptedInvoker::failing(&["f0"]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = Arc::new(AsyncQueue::new());
    let dispatcher =
        InvocationDispatcher::new(invoker, true, TraceGranularity::Minute, tx, queue.clone());
    let counters = InvocationCounters::new(1);

    dispatcher
        .dispatch(&chain(&["f0"]), tick(0, 0), &counters)
        .await;

    assert!(queue.is_empty());
    let records = drain(&mut rx);
    assert_eq!(records.len(), 1);
    assert!(records[0].function_timeout);
}

#[tokio::test]
async fn sync_mode_ignores_response_handle() {
    let invoker = Arc::new(ScriptedInvoker::with_guid("guid-1"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = Arc::new(AsyncQueue::new());
    let dispatcher =
        InvocationDispatcher::new(invoker, false, TraceGranularity::Minute, tx, queue.clone());
    let counters = InvocationCounters::new(1);

    dispatcher
        .dispatch(&chain(&["f0"]), tick(0, 0), &counters)
        .await;

    assert!(queue.is_empty());
    assert_eq!(drain(&mut rx).len(), 1);
}
