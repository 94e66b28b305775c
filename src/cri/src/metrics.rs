//! Prometheus metrics for the CRI daemon.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::registry::Registry as StateRegistry;

/// Operation counters, latencies and state gauges.
pub struct CriMetrics {
    registry: Registry,
    operations: IntCounterVec,
    latency: HistogramVec,
    sandboxes: IntGaugeVec,
    containers: IntGaugeVec,
    exits_observed: IntCounter,
    unknown_exits: IntCounter,
}

impl CriMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("kiln_operations_total", "CRI operations by verb and status code"),
            &["operation", "code"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "kiln_operation_duration_seconds",
                "CRI operation latency in seconds",
            ),
            &["operation"],
        )?;
        let sandboxes = IntGaugeVec::new(
            Opts::new("kiln_sandboxes", "Pod sandboxes by state"),
            &["state"],
        )?;
        let containers = IntGaugeVec::new(
            Opts::new("kiln_containers", "Containers by state"),
            &["state"],
        )?;
        let exits_observed = IntCounter::new(
            "kiln_container_exits_total",
            "Container exits observed by the exit watcher",
        )?;
        let unknown_exits = IntCounter::new(
            "kiln_container_unknown_exits_total",
            "Containers recorded with an unknown exit status",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(sandboxes.clone()))?;
        registry.register(Box::new(containers.clone()))?;
        registry.register(Box::new(exits_observed.clone()))?;
        registry.register(Box::new(unknown_exits.clone()))?;

        Ok(Self {
            registry,
            operations,
            latency,
            sandboxes,
            containers,
            exits_observed,
            unknown_exits,
        })
    }

    /// Record one completed RPC.
    pub fn observe(&self, operation: &str, code: tonic::Code, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation, code_name(code)])
            .inc();
        self.latency
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn exit_observed(&self) {
        self.exits_observed.inc();
    }

    pub fn unknown_exit(&self) {
        self.unknown_exits.inc();
    }

    /// Recompute the state gauges from the registry.
    pub async fn refresh(&self, state: &StateRegistry) {
        self.sandboxes.reset();
        for entry in state.sandboxes() {
            let record = entry.lock().await;
            self.sandboxes
                .with_label_values(&[record.state.as_str()])
                .inc();
        }
        self.containers.reset();
        for entry in state.containers() {
            let record = entry.lock().await;
            self.containers
                .with_label_values(&[record.state.as_str()])
                .inc();
        }
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn code_name(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "Canceled",
        Unknown => "Unknown",
        InvalidArgument => "InvalidArgument",
        DeadlineExceeded => "DeadlineExceeded",
        NotFound => "NotFound",
        AlreadyExists => "AlreadyExists",
        PermissionDenied => "PermissionDenied",
        ResourceExhausted => "ResourceExhausted",
        FailedPrecondition => "FailedPrecondition",
        Aborted => "Aborted",
        OutOfRange => "OutOfRange",
        Unimplemented => "Unimplemented",
        Internal => "Internal",
        Unavailable => "Unavailable",
        DataLoss => "DataLoss",
        Unauthenticated => "Unauthenticated",
    }
}
