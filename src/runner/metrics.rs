use crate::access::BindOutcome;
use crate::remote::ApplyAction;
use crate::resource::ResourceKind;

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

use std::fmt::{self, Debug};
use std::time::Duration;

const KIND: &[&str] = &["kind"];
const KIND_AND_ACTION: &[&str] = &["kind", "action"];
const OUTCOME: &[&str] = &["outcome"];

/// Metrics for provisioning runs. A single instance is shared by every run of a `Provisioner`.
pub struct Metrics {
    registry: Registry,
    apply_durations: HistogramVec,
    applied_by_kind: IntCounterVec,
    failures_by_kind: IntCounterVec,
    skipped: IntCounter,
    status_polls: IntCounter,
    unavailable_status_polls: IntCounter,
    in_flight: IntGauge,
    access_bindings: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        // 0.5s up to about 68 minutes, since clusters and caches can take a long time
        let apply_duration_opts = HistogramOpts::new(
            "apply_duration_seconds",
            "Time from the first apply call until the resource was ready",
        )
        .namespace("kubestack")
        .buckets(exponential_buckets(0.5, 2.0, 14).unwrap());
        let apply_durations = HistogramVec::new(apply_duration_opts, KIND).unwrap();
        registry.register(Box::new(apply_durations.clone())).unwrap();

        let applied_opts = Opts::new("resources_applied", "number of resources that became ready, by kind and action")
            .namespace("kubestack");
        let applied_by_kind = IntCounterVec::new(applied_opts, KIND_AND_ACTION).unwrap();
        registry.register(Box::new(applied_by_kind.clone())).unwrap();

        let failure_opts = Opts::new("resource_failures", "number of resources that failed or timed out, by kind")
            .namespace("kubestack");
        let failures_by_kind = IntCounterVec::new(failure_opts, KIND).unwrap();
        registry.register(Box::new(failures_by_kind.clone())).unwrap();

        let skipped_opts = Opts::new("resources_skipped", "number of resources that were not attempted because a dependency failed or the run was cancelled")
            .namespace("kubestack");
        let skipped = IntCounter::with_opts(skipped_opts).unwrap();
        registry.register(Box::new(skipped.clone())).unwrap();

        let poll_opts = Opts::new("status_polls", "number of status requests sent to the control plane")
            .namespace("kubestack");
        let status_polls = IntCounter::with_opts(poll_opts).unwrap();
        registry.register(Box::new(status_polls.clone())).unwrap();

        let unavailable_opts = Opts::new("status_polls_unavailable", "number of status requests that returned an error and were treated as pending")
            .namespace("kubestack");
        let unavailable_status_polls = IntCounter::with_opts(unavailable_opts).unwrap();
        registry.register(Box::new(unavailable_status_polls.clone())).unwrap();

        let in_flight_opts = Opts::new("applies_in_flight", "number of resources currently being applied")
            .namespace("kubestack");
        let in_flight = IntGauge::with_opts(in_flight_opts).unwrap();
        registry.register(Box::new(in_flight.clone())).unwrap();

        let access_opts = Opts::new("access_bindings", "number of access bindings applied, by outcome")
            .namespace("kubestack");
        let access_bindings = IntCounterVec::new(access_opts, OUTCOME).unwrap();
        registry.register(Box::new(access_bindings.clone())).unwrap();

        Metrics {
            registry,
            apply_durations,
            applied_by_kind,
            failures_by_kind,
            skipped,
            status_polls,
            unavailable_status_polls,
            in_flight,
            access_bindings,
        }
    }

    pub fn apply_started(&self) {
        self.in_flight.inc();
    }

    pub fn apply_finished(&self) {
        self.in_flight.dec();
    }

    pub fn resource_applied(&self, kind: ResourceKind, action: ApplyAction, duration: Duration) {
        self.applied_by_kind
            .with_label_values(&[kind.as_str(), action.as_str()])
            .inc();
        self.apply_durations
            .with_label_values(&[kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    pub fn resource_failed(&self, kind: ResourceKind) {
        self.failures_by_kind.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn resources_skipped(&self, count: usize) {
        self.skipped.inc_by(count as u64);
    }

    pub fn status_polled(&self) {
        self.status_polls.inc();
    }

    pub fn status_unavailable(&self) {
        self.unavailable_status_polls.inc();
    }

    pub fn access_bound(&self, outcome: BindOutcome) {
        self.access_bindings.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn access_failed(&self) {
        self.access_bindings.with_label_values(&["failed"]).inc();
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.get()
    }

    pub fn applied_count(&self, kind: ResourceKind, action: ApplyAction) -> u64 {
        self.applied_by_kind
            .with_label_values(&[kind.as_str(), action.as_str()])
            .get()
    }

    pub fn failure_count(&self, kind: ResourceKind) -> u64 {
        self.failures_by_kind.with_label_values(&[kind.as_str()]).get()
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}
