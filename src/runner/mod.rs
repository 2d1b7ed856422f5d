//! The provisioning orchestrator. A run validates the plan, orders it into a dependency graph and
//! then applies the resources, starting each one as soon as all of its dependencies are ready.
//! Independent branches of the graph are applied concurrently, up to the configured limit.
//!
//! All of the state of a run (the graph, the state of each resource and the outputs of the
//! resources that have been applied) is owned by a single coordinator task. Workers only ever
//! report back to it through a channel.
mod apply;
mod compare;
pub mod metrics;
pub mod summary;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::compare::{compare_values, Diff, Diffs};
pub use self::metrics::Metrics;
pub use self::summary::{
    AccessOutcome, AccessResult, ApplyRecord, FailedResource, PreviousState, RunSummary,
};

use self::apply::{AppliedResource, ApplyTask};
use crate::access::{unique_bindings, AccessBinder, AccessBinding, BindOutcome};
use crate::config::ProvisionConfig;
use crate::error::{FailureReason, ProvisionError};
use crate::graph::DependencyGraph;
use crate::plan::StackPlan;
use crate::remote::ControlPlane;
use crate::resolve::AppliedOutputs;
use crate::validate::validate_plan;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Determines what happens to resources that are still being applied when a run is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Wait for every in-flight apply to finish and report its result
    Drain,
    /// Stop waiting for in-flight applies. They are listed as `abandoned` in the summary.
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Continue,
    Cancel(CancelMode),
}

/// A handle to a run that was started with `Provisioner::start`. Dropping the handle does not
/// cancel the run.
#[derive(Debug)]
pub struct RunHandle {
    cancelled: Arc<AtomicBool>,
    signal: watch::Sender<RunSignal>,
}

impl RunHandle {
    /// Stops the run from issuing any new apply calls. Resources that were not started yet are
    /// reported as skipped.
    pub fn cancel(&self, mode: CancelMode) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log::info!("Cancelling provisioning run with mode: {:?}", mode);
            // the run may already be finished, in which case there's nothing left to cancel
            let _ = self.signal.send(RunSignal::Cancel(mode));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Applies `StackPlan`s against a remote control plane. Clones share the same control plane and
/// metrics.
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<ProvisionConfig>,
    control_plane: Arc<dyn ControlPlane>,
    metrics: Arc<Metrics>,
}

impl Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .finish()
    }
}

impl Provisioner {
    pub fn new(config: ProvisionConfig, control_plane: impl ControlPlane) -> Provisioner {
        Provisioner {
            config: Arc::new(config),
            control_plane: Arc::new(control_plane),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Applies the plan and returns once every resource is either applied, failed or skipped.
    /// Errors are only returned for problems with the plan itself. Failures of individual
    /// resources are reported in the summary instead.
    pub async fn provision(&self, plan: StackPlan) -> Result<RunSummary, ProvisionError> {
        let (signal, receiver) = watch::channel(RunSignal::Continue);
        let result = self.run(plan, receiver).await;
        drop(signal);
        result
    }

    /// Starts applying the plan in the background, and returns a handle that can be used to
    /// cancel the run. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        plan: StackPlan,
    ) -> (RunHandle, JoinHandle<Result<RunSummary, ProvisionError>>) {
        let (signal, receiver) = watch::channel(RunSignal::Continue);
        let handle = RunHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            signal,
        };
        let provisioner = self.clone();
        let join_handle = tokio::spawn(async move { provisioner.run(plan, receiver).await });
        (handle, join_handle)
    }

    async fn run(
        &self,
        plan: StackPlan,
        signal: watch::Receiver<RunSignal>,
    ) -> Result<RunSummary, ProvisionError> {
        let start_time = Instant::now();
        validate_plan(&plan)?;
        let StackPlan {
            descriptors,
            access_bindings,
            outputs,
        } = plan;
        let graph = DependencyGraph::build(descriptors)?;
        let bindings = unique_bindings(&access_bindings).map_err(ProvisionError::Validation)?;
        log::info!(
            "Starting provisioning run of {} resources and {} access bindings, in order: {:?}",
            graph.len(),
            bindings.len(),
            graph.names_in_order()
        );

        let coordinator = Coordinator::new(self.clone(), graph, bindings);
        let result = coordinator.run(signal, &outputs).await;
        match result.as_ref() {
            Ok(summary) => log::info!(
                "Finished provisioning run in {}ms with {} applied, {} failed, {} skipped and {} abandoned resources",
                duration_to_millis(start_time.elapsed()),
                summary.applied.len(),
                summary.failed.len(),
                summary.skipped.len(),
                summary.abandoned.len()
            ),
            Err(err) => log::error!(
                "Provisioning run aborted after {}ms: {}",
                duration_to_millis(start_time.elapsed()),
                err
            ),
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    InFlight,
    Applied,
    Failed,
    Skipped,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Work {
    Resource(usize),
    Access(usize),
}

#[derive(Debug)]
enum WorkerMessage {
    Resource {
        index: usize,
        result: Result<AppliedResource, FailureReason>,
    },
    Access {
        index: usize,
        result: Result<BindOutcome, String>,
    },
}

enum Wakeup {
    Message(Option<WorkerMessage>),
    Signal { closed: bool },
}

struct Coordinator {
    provisioner: Provisioner,
    graph: DependencyGraph,
    states: Vec<NodeState>,
    bindings: Vec<AccessBinding>,
    access_outcomes: Vec<Option<AccessOutcome>>,
    applied: AppliedOutputs,
    in_flight: HashMap<Work, JoinHandle<()>>,
    summary: RunSummary,
    cancelled: Option<CancelMode>,
    fatal: Option<ProvisionError>,
}

impl Coordinator {
    fn new(provisioner: Provisioner, graph: DependencyGraph, bindings: Vec<AccessBinding>) -> Coordinator {
        let states = vec![NodeState::Pending; graph.len()];
        let access_outcomes = vec![None; bindings.len()];
        Coordinator {
            provisioner,
            graph,
            states,
            bindings,
            access_outcomes,
            applied: AppliedOutputs::new(),
            in_flight: HashMap::new(),
            summary: RunSummary::default(),
            cancelled: None,
            fatal: None,
        }
    }

    fn concurrency_limit(&self) -> usize {
        self.provisioner.config.concurrency_limit.max(1)
    }

    fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.concurrency_limit()
    }

    async fn run(
        mut self,
        mut signal: watch::Receiver<RunSignal>,
        output_templates: &BTreeMap<String, Value>,
    ) -> Result<RunSummary, ProvisionError> {
        let (sender, mut receiver) = mpsc::channel(self.concurrency_limit());
        let mut signal_open = true;

        loop {
            if self.cancelled.is_none() {
                let current = *signal.borrow();
                if let RunSignal::Cancel(mode) = current {
                    self.cancel(mode, &mut receiver);
                }
            }
            if self.cancelled.is_none() && self.fatal.is_none() {
                self.schedule(&sender);
            }
            if self.in_flight.is_empty() {
                break;
            }

            let wakeup = tokio::select! {
                message = receiver.recv() => Wakeup::Message(message),
                changed = signal.changed(), if signal_open => Wakeup::Signal { closed: changed.is_err() },
            };
            match wakeup {
                Wakeup::Message(Some(message)) => self.handle_message(message),
                Wakeup::Message(None) => break,
                Wakeup::Signal { closed: true } => {
                    log::debug!("Run handle was dropped, the run can no longer be cancelled");
                    signal_open = false;
                }
                Wakeup::Signal { closed: false } => {}
            }
        }

        self.finish(output_templates)
    }

    /// Starts every resource whose dependencies are all applied, and every access binding whose
    /// cluster is applied, as long as the concurrency limit allows
    fn schedule(&mut self, sender: &mpsc::Sender<WorkerMessage>) {
        let order = self.graph.order_indices().to_vec();
        for index in order {
            if !self.has_capacity() {
                return;
            }
            if self.states[index] != NodeState::Pending || !self.dependencies_applied(index) {
                continue;
            }
            let descriptor = self.graph.descriptor_at(index);
            match self.applied.resolve(descriptor) {
                Ok(spec) => {
                    let task = ApplyTask {
                        index,
                        timeout: self.provisioner.config.timeout_for(spec.kind),
                        poll_backoff: self.provisioner.config.poll_backoff.clone(),
                        spec,
                    };
                    self.start_apply(task, sender);
                }
                Err(err) => {
                    log::error!("Stopping run, since resource '{}' cannot be applied: {}", descriptor.name, err);
                    self.fatal = Some(err);
                    return;
                }
            }
        }

        for index in 0..self.bindings.len() {
            if self.access_outcomes[index].is_some() || self.in_flight.contains_key(&Work::Access(index)) {
                continue;
            }
            let cluster = self.bindings[index].cluster.as_str();
            let cluster_state = self.graph.index_of(cluster).map(|i| self.states[i]);
            match cluster_state {
                Some(NodeState::Applied) => {
                    if !self.has_capacity() {
                        return;
                    }
                    self.start_bind(index, sender);
                }
                Some(NodeState::Pending) | Some(NodeState::InFlight) => {}
                _ => {
                    log::warn!(
                        "Skipping access binding for principal: '{}', since cluster: '{}' was not applied",
                        self.bindings[index].principal,
                        cluster
                    );
                    self.access_outcomes[index] = Some(AccessOutcome::Skipped);
                }
            }
        }
    }

    fn dependencies_applied(&self, index: usize) -> bool {
        self.graph
            .dependency_indices(index)
            .iter()
            .all(|dep| self.states[*dep] == NodeState::Applied)
    }

    fn start_apply(&mut self, task: ApplyTask, sender: &mpsc::Sender<WorkerMessage>) {
        let index = task.index;
        log::info!(
            "Applying resource '{}' of kind: {} with timeout: {}ms",
            task.spec.name,
            task.spec.kind,
            duration_to_millis(task.timeout)
        );
        let control_plane = self.provisioner.control_plane.clone();
        let metrics = self.provisioner.metrics.clone();
        let sender = sender.clone();
        metrics.apply_started();
        let handle = tokio::spawn(async move {
            let result = apply::apply_resource(control_plane, metrics, task).await;
            let _ = sender.send(WorkerMessage::Resource { index, result }).await;
        });
        self.states[index] = NodeState::InFlight;
        self.in_flight.insert(Work::Resource(index), handle);
    }

    fn start_bind(&mut self, index: usize, sender: &mpsc::Sender<WorkerMessage>) {
        let binding = self.bindings[index].clone();
        let cluster_id = match self.applied.remote_id(&binding.cluster) {
            Some(id) => id.clone(),
            None => {
                self.access_outcomes[index] = Some(AccessOutcome::Skipped);
                return;
            }
        };
        log::debug!(
            "Binding principal: '{}' in cluster: '{}'",
            binding.principal,
            cluster_id
        );
        let binder = AccessBinder::new(self.provisioner.control_plane.clone());
        let sender = sender.clone();
        let handle = tokio::spawn(async move {
            let result = binder
                .bind(&cluster_id, &binding)
                .await
                .map_err(|err| format!("{:#}", err));
            let _ = sender.send(WorkerMessage::Access { index, result }).await;
        });
        self.in_flight.insert(Work::Access(index), handle);
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Resource { index, result } => {
                if self.in_flight.remove(&Work::Resource(index)).is_none() {
                    log::debug!("Ignoring result for abandoned resource at index: {}", index);
                    return;
                }
                self.provisioner.metrics.apply_finished();
                match result {
                    Ok(applied) => self.resource_applied(index, applied),
                    Err(reason) => self.resource_failed(index, reason),
                }
            }
            WorkerMessage::Access { index, result } => {
                if self.in_flight.remove(&Work::Access(index)).is_none() {
                    return;
                }
                let metrics = &self.provisioner.metrics;
                let outcome = match result {
                    Ok(outcome) => {
                        metrics.access_bound(outcome);
                        AccessOutcome::Bound { result: outcome }
                    }
                    Err(message) => {
                        metrics.access_failed();
                        log::error!(
                            "Failed to bind principal: '{}': {}",
                            self.bindings[index].principal,
                            message
                        );
                        AccessOutcome::Failed { message }
                    }
                };
                self.access_outcomes[index] = Some(outcome);
            }
        }
    }

    fn resource_applied(&mut self, index: usize, applied: AppliedResource) {
        let descriptor = self.graph.descriptor_at(index);
        let name = descriptor.name.clone();
        let kind = descriptor.kind;

        let record = ApplyRecord {
            resource: name.clone(),
            kind,
            action: applied.action,
            previous_state: applied.previous_state,
            new_state: applied.status,
            duration_ms: duration_to_millis(applied.duration),
        };
        match serde_json::to_string(&record) {
            Ok(json) => log::info!(target: "kubestack::apply", "{}", json),
            Err(err) => log::warn!("Failed to serialize apply record for '{}': {}", name, err),
        }
        self.provisioner
            .metrics
            .resource_applied(kind, applied.action, applied.duration);

        self.applied.record(name.clone(), applied.id, applied.outputs);
        self.states[index] = NodeState::Applied;
        self.summary.applied.push(name);
        self.summary.records.push(record);
    }

    fn resource_failed(&mut self, index: usize, reason: FailureReason) {
        let descriptor = self.graph.descriptor_at(index);
        let name = descriptor.name.clone();
        log::error!("Resource '{}' failed: {}", name, reason);
        self.provisioner.metrics.resource_failed(descriptor.kind);

        let mut skipped = 0;
        for dependent in self.graph.descendant_indices(index) {
            if self.states[dependent] == NodeState::Pending {
                self.states[dependent] = NodeState::Skipped;
                skipped += 1;
            }
        }
        if skipped > 0 {
            log::warn!("Skipping {} resources that depend on failed resource '{}'", skipped, name);
        }

        self.states[index] = NodeState::Failed;
        self.summary.failed.push(FailedResource { name, reason });
    }

    fn cancel(&mut self, mode: CancelMode, receiver: &mut mpsc::Receiver<WorkerMessage>) {
        log::warn!(
            "Provisioning run was cancelled with {} applies in flight, mode: {:?}",
            self.in_flight.len(),
            mode
        );
        self.cancelled = Some(mode);
        if mode == CancelMode::Drain {
            return;
        }

        // results that already arrived are still reported
        while let Ok(message) = receiver.try_recv() {
            self.handle_message(message);
        }
        for (work, handle) in self.in_flight.drain() {
            handle.abort();
            match work {
                Work::Resource(index) => {
                    self.provisioner.metrics.apply_finished();
                    self.states[index] = NodeState::Abandoned;
                }
                Work::Access(index) => {
                    self.access_outcomes[index] = Some(AccessOutcome::Abandoned);
                }
            }
        }
    }

    fn finish(mut self, output_templates: &BTreeMap<String, Value>) -> Result<RunSummary, ProvisionError> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }

        for &index in self.graph.order_indices() {
            let name = &self.graph.descriptor_at(index).name;
            match self.states[index] {
                NodeState::Pending | NodeState::Skipped => self.summary.skipped.push(name.clone()),
                NodeState::Abandoned => self.summary.abandoned.push(name.clone()),
                NodeState::InFlight => {
                    log::error!("Resource '{}' was still in flight at the end of the run", name);
                    self.summary.abandoned.push(name.clone());
                }
                NodeState::Applied | NodeState::Failed => {}
            }
        }
        self.provisioner
            .metrics
            .resources_skipped(self.summary.skipped.len());

        for (binding, outcome) in self.bindings.iter().zip(self.access_outcomes.into_iter()) {
            self.summary.access.push(AccessResult {
                principal: binding.principal.clone(),
                outcome: outcome.unwrap_or(AccessOutcome::Skipped),
            });
        }

        self.summary.outputs = self.applied.resolve_outputs(output_templates);
        Ok(self.summary)
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
