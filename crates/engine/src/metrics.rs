use lazy_static::lazy_static;
use prometheus::{
    core::Collector, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tripwire_executions_total", "Workflow runs by final status."),
        &["status"]
    )
    .unwrap();
    pub static ref NODES_EXECUTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tripwire_nodes_executed_total", "Nodes executed by node type."),
        &["type"]
    )
    .unwrap();
    pub static ref TRIGGER_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tripwire_trigger_events_total",
            "Inbound trigger events by outcome (resumed, started, dropped)."
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref TIMEOUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tripwire_timeouts_total", "Expired waits by timeout policy."),
        &["policy"]
    )
    .unwrap();
    pub static ref PENDING_EXECUTIONS: IntGauge = IntGauge::new(
        "tripwire_pending_executions",
        "Paused executions waiting for an event."
    )
    .unwrap();
    pub static ref EXECUTION_DURATION_SECONDS: Histogram = Histogram::with_opts(HistogramOpts::new(
        "tripwire_execution_duration_seconds",
        "Wall time of one driver-loop pass."
    ))
    .unwrap();
}

/// Registers every metric with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(EXECUTIONS_TOTAL.clone()),
        Box::new(NODES_EXECUTED_TOTAL.clone()),
        Box::new(TRIGGER_EVENTS_TOTAL.clone()),
        Box::new(TIMEOUTS_TOTAL.clone()),
        Box::new(PENDING_EXECUTIONS.clone()),
        Box::new(EXECUTION_DURATION_SECONDS.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(Error::Internal(format!("Failed to register metric: {}", e))),
        }
    }
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}
