//! An in-memory `ControlPlane` for testing provisioning runs without a real remote system.
//! Behavior is scripted per resource name before the run starts, and everything that happened
//! can be inspected afterwards.
//!
//! ```rust
//! use kubestack::prelude::*;
//! use kubestack::runner::testkit::{self, InMemoryControlPlane};
//!
//! let control_plane = InMemoryControlPlane::new()
//!     .ready_after("cluster", 2)
//!     .reject_ensure("workload", "quota exceeded");
//! let provisioner = Provisioner::new(testkit::fast_config(), control_plane.clone());
//! # let _ = provisioner;
//! ```
use crate::config::{BackoffConfig, ProvisionConfig};
use crate::error::RemoteError;
use crate::remote::{
    ApplyAction, ControlPlane, ObservedResource, RemoteId, ResourceSpec, ResourceStatus,
    ResourceState, StatusReport,
};
use crate::resource::ResourceKind;
use crate::runner::compare::compare_values;

use async_trait::async_trait;
use serde_json::{json, Value};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A `ProvisionConfig` with short poll intervals and timeouts, suitable for tests
pub fn fast_config() -> ProvisionConfig {
    ProvisionConfig::new()
        .with_concurrency_limit(4)
        .with_uniform_timeout(Duration::from_secs(5))
        .with_poll_backoff(BackoffConfig::fixed_interval(Duration::from_millis(5)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Ensured { name: String, action: ApplyAction },
    Ready { name: String },
    Failed { name: String },
    Bound { principal: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Behavior {
    ReadyAfter(u32),
    FailOnStatus(String),
    NeverReady,
}

#[derive(Debug, Clone)]
struct FakeResource {
    id: RemoteId,
    kind: ResourceKind,
    config: Value,
    manifest: Option<Value>,
    status: ResourceStatus,
    polls_remaining: u32,
    outputs: Value,
}

#[derive(Debug, Default)]
struct FakeState {
    resources: HashMap<String, FakeResource>,
    names_by_id: HashMap<RemoteId, String>,
    behaviors: HashMap<String, Behavior>,
    rejections: HashMap<String, String>,
    unavailable_polls: HashMap<String, u32>,
    withheld_outputs: HashMap<String, Vec<String>>,
    describe_unavailable: HashSet<String>,
    default_polls: u32,
    latency: Option<Duration>,
    next_id: u32,
    creations: usize,
    updates: usize,
    ensure_calls: usize,
    in_flight: HashSet<String>,
    max_in_flight: usize,
    events: Vec<RemoteEvent>,
    bindings: HashMap<(RemoteId, String), BTreeSet<String>>,
    binding_writes: usize,
}

impl FakeState {
    fn behavior(&self, name: &str) -> Behavior {
        self.behaviors
            .get(name)
            .cloned()
            .unwrap_or(Behavior::ReadyAfter(self.default_polls))
    }

    fn visible_outputs(&self, name: &str, outputs: &Value) -> Value {
        let mut outputs = outputs.clone();
        if let (Some(withheld), Some(map)) = (self.withheld_outputs.get(name), outputs.as_object_mut()) {
            for key in withheld {
                map.remove(key);
            }
        }
        outputs
    }

    fn mark_terminal(&mut self, name: &str, status: ResourceStatus) {
        if let Some(resource) = self.resources.get_mut(name) {
            resource.status = status;
        }
        self.in_flight.remove(name);
        let event = match status {
            ResourceStatus::Ready => RemoteEvent::Ready {
                name: name.to_owned(),
            },
            _ => RemoteEvent::Failed {
                name: name.to_owned(),
            },
        };
        self.events.push(event);
    }

    fn mark_in_flight(&mut self, name: &str) {
        self.in_flight.insert(name.to_owned());
        self.max_in_flight = self.max_in_flight.max(self.in_flight.len());
    }

    fn allocate_id(&mut self, kind: ResourceKind) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("{}-{}", kind, self.next_id))
    }
}

fn str_field<'a>(config: &'a Value, field: &str, default: &'a str) -> &'a str {
    config.get(field).and_then(Value::as_str).unwrap_or(default)
}

/// The outputs that a real control plane would report for each kind of resource
fn generate_outputs(kind: ResourceKind, name: &str, id: &RemoteId, config: &Value) -> Value {
    let n = id.as_str().rsplit('-').next().unwrap_or("0");
    match kind {
        ResourceKind::Cluster => {
            let cluster_name = str_field(config, "clusterName", name);
            json!({
                "id": id,
                "name": cluster_name,
                "endpoint": format!("https://{}.eks.local", cluster_name),
                "vpcId": format!("vpc-{}", n),
                "securityGroupId": format!("sg-cluster-{}", n),
                "privateSubnetIds": [format!("subnet-{}a", n), format!("subnet-{}b", n)],
            })
        }
        ResourceKind::NodePool => json!({
            "id": id,
            "name": str_field(config, "nodegroupName", name),
        }),
        ResourceKind::Workload => json!({ "id": id, "name": name }),
        ResourceKind::Service => json!({
            "id": id,
            "hostname": format!("{}.elb.local", name),
        }),
        ResourceKind::CacheSubnetGroup | ResourceKind::CacheSecurityGroup => json!({ "id": id }),
        ResourceKind::Cache => json!({
            "id": id,
            "address": format!("{}.cache.local", str_field(config, "clusterId", name)),
            "port": config.get("port").cloned().unwrap_or_else(|| json!(6379)),
        }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryControlPlane(Arc<Mutex<FakeState>>);

impl InMemoryControlPlane {
    /// Every resource becomes ready on the first status poll, unless scripted otherwise
    pub fn new() -> InMemoryControlPlane {
        InMemoryControlPlane::default().with_default_polls(1)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The number of status polls after which a resource without a scripted behavior is ready.
    /// With 0, `ensure` reports the resource as ready immediately.
    pub fn with_default_polls(self, polls: u32) -> Self {
        self.state().default_polls = polls;
        self
    }

    /// Delays every `ensure` call
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    pub fn ready_after(self, name: &str, polls: u32) -> Self {
        self.state()
            .behaviors
            .insert(name.to_owned(), Behavior::ReadyAfter(polls));
        self
    }

    /// The resource is accepted, but its status will report `Failed`
    pub fn fail_on_status(self, name: &str, message: &str) -> Self {
        self.state()
            .behaviors
            .insert(name.to_owned(), Behavior::FailOnStatus(message.to_owned()));
        self
    }

    pub fn never_ready(self, name: &str) -> Self {
        self.state()
            .behaviors
            .insert(name.to_owned(), Behavior::NeverReady);
        self
    }

    /// `ensure` returns an error for the resource
    pub fn reject_ensure(self, name: &str, message: &str) -> Self {
        self.state()
            .rejections
            .insert(name.to_owned(), message.to_owned());
        self
    }

    /// The next `count` status polls of the resource return an error
    pub fn status_unavailable(self, name: &str, count: u32) -> Self {
        self.state()
            .unavailable_polls
            .insert(name.to_owned(), count);
        self
    }

    /// The given output is never reported for the resource
    pub fn withhold_output(self, name: &str, output: &str) -> Self {
        self.state()
            .withheld_outputs
            .entry(name.to_owned())
            .or_insert_with(Vec::new)
            .push(output.to_owned());
        self
    }

    pub fn describe_unavailable(self, name: &str) -> Self {
        self.state().describe_unavailable.insert(name.to_owned());
        self
    }

    /// Adds a resource that already exists before the run
    pub fn seed(self, kind: ResourceKind, name: &str, config: Value, status: ResourceStatus) -> Self {
        {
            let mut state = self.state();
            let id = state.allocate_id(kind);
            let outputs = generate_outputs(kind, name, &id, &config);
            state.names_by_id.insert(id.clone(), name.to_owned());
            state.resources.insert(
                name.to_owned(),
                FakeResource {
                    id,
                    kind,
                    config,
                    manifest: None,
                    status,
                    polls_remaining: 0,
                    outputs,
                },
            );
        }
        self
    }

    pub fn creations(&self) -> usize {
        self.state().creations
    }

    pub fn updates(&self) -> usize {
        self.state().updates
    }

    pub fn ensure_calls(&self) -> usize {
        self.state().ensure_calls
    }

    pub fn events(&self) -> Vec<RemoteEvent> {
        self.state().events.clone()
    }

    /// The most resources that were ever pending at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn config_of(&self, name: &str) -> Option<Value> {
        self.state().resources.get(name).map(|r| r.config.clone())
    }

    /// The manifest that was last ensured for a workload or service
    pub fn manifest_of(&self, name: &str) -> Option<Value> {
        self.state().resources.get(name).and_then(|r| r.manifest.clone())
    }

    pub fn status_of(&self, name: &str) -> Option<ResourceStatus> {
        self.state().resources.get(name).map(|r| r.status)
    }

    pub fn outputs_of(&self, name: &str) -> Option<Value> {
        let state = self.state();
        state
            .resources
            .get(name)
            .map(|r| state.visible_outputs(name, &r.outputs))
    }

    pub fn binding(&self, cluster_id: &RemoteId, principal: &str) -> Option<BTreeSet<String>> {
        self.state()
            .bindings
            .get(&(cluster_id.clone(), principal.to_owned()))
            .cloned()
    }

    pub fn binding_writes(&self) -> usize {
        self.state().binding_writes
    }

    fn ensure_now(&self, spec: &ResourceSpec) -> Result<ResourceState, RemoteError> {
        let mut state = self.state();
        if let Some(message) = state.rejections.get(&spec.name) {
            anyhow::bail!("ensure of '{}' was rejected: {}", spec.name, message);
        }
        let runs_in_cluster = spec.kind == ResourceKind::Workload || spec.kind == ResourceKind::Service;
        if runs_in_cluster && spec.manifest.is_none() {
            anyhow::bail!("{} '{}' has no manifest", spec.kind, spec.name);
        }
        let behavior = state.behavior(&spec.name);
        let polls = match behavior {
            Behavior::ReadyAfter(polls) => polls,
            _ => 1,
        };

        let existing = state.resources.get(&spec.name).cloned();
        let (id, action) = match existing {
            Some(ref resource) => {
                let unchanged = compare_values(&resource.config, &spec.config).is_empty();
                let action = if unchanged {
                    ApplyAction::Unchanged
                } else {
                    ApplyAction::Updated
                };
                (resource.id.clone(), action)
            }
            None => (state.allocate_id(spec.kind), ApplyAction::Created),
        };

        match action {
            ApplyAction::Created => state.creations += 1,
            ApplyAction::Updated => state.updates += 1,
            ApplyAction::Unchanged => {}
        }
        state.events.push(RemoteEvent::Ensured {
            name: spec.name.clone(),
            action,
        });

        let needs_rollout =
            action != ApplyAction::Unchanged || existing.map(|r| r.status) != Some(ResourceStatus::Ready);
        let status = if !needs_rollout {
            ResourceStatus::Ready
        } else if polls == 0 {
            ResourceStatus::Ready
        } else {
            ResourceStatus::Pending
        };

        let outputs = generate_outputs(spec.kind, &spec.name, &id, &spec.config);
        state.names_by_id.insert(id.clone(), spec.name.clone());
        state.resources.insert(
            spec.name.clone(),
            FakeResource {
                id: id.clone(),
                kind: spec.kind,
                config: spec.config.clone(),
                manifest: spec.manifest.clone(),
                status,
                polls_remaining: polls,
                outputs: outputs.clone(),
            },
        );
        if status == ResourceStatus::Pending {
            state.mark_in_flight(&spec.name);
        } else if needs_rollout {
            state.mark_in_flight(&spec.name);
            state.mark_terminal(&spec.name, status);
        }

        Ok(ResourceState {
            id,
            action,
            status,
            message: None,
            outputs: state.visible_outputs(&spec.name, &outputs),
        })
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn describe(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ObservedResource>, RemoteError> {
        let state = self.state();
        if state.describe_unavailable.contains(name) {
            anyhow::bail!("describe of '{}' is unavailable", name);
        }
        let resource = state.resources.get(name).filter(|r| r.kind == kind);
        Ok(resource.map(|r| ObservedResource {
            id: r.id.clone(),
            config: r.config.clone(),
            status: r.status,
            outputs: state.visible_outputs(name, &r.outputs),
        }))
    }

    async fn ensure(&self, spec: &ResourceSpec) -> Result<ResourceState, RemoteError> {
        let latency = {
            let mut state = self.state();
            state.ensure_calls += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.ensure_now(spec)
    }

    async fn get_status(&self, id: &RemoteId) -> Result<StatusReport, RemoteError> {
        let mut state = self.state();
        let name = match state.names_by_id.get(id) {
            Some(name) => name.clone(),
            None => anyhow::bail!("no resource with id: '{}'", id),
        };
        if let Some(remaining) = state.unavailable_polls.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("status of '{}' is temporarily unavailable", name);
            }
        }

        let behavior = state.behavior(&name);
        let (status, polls_remaining) = match state.resources.get(&name) {
            Some(resource) => (resource.status, resource.polls_remaining),
            None => anyhow::bail!("resource '{}' no longer exists", name),
        };
        let mut message = None;
        if status == ResourceStatus::Pending {
            match behavior {
                Behavior::NeverReady => {}
                Behavior::FailOnStatus(ref msg) => {
                    message = Some(msg.clone());
                    state.mark_terminal(&name, ResourceStatus::Failed);
                }
                Behavior::ReadyAfter(_) => {
                    let remaining = polls_remaining.saturating_sub(1);
                    if let Some(resource) = state.resources.get_mut(&name) {
                        resource.polls_remaining = remaining;
                    }
                    if remaining == 0 {
                        state.mark_terminal(&name, ResourceStatus::Ready);
                    }
                }
            }
        }

        let resource = match state.resources.get(&name) {
            Some(r) => r,
            None => anyhow::bail!("resource '{}' no longer exists", name),
        };
        Ok(StatusReport {
            status: resource.status,
            message,
            outputs: state.visible_outputs(&name, &resource.outputs),
        })
    }

    async fn get_access_binding(
        &self,
        cluster_id: &RemoteId,
        principal: &str,
    ) -> Result<Option<BTreeSet<String>>, RemoteError> {
        Ok(self.binding(cluster_id, principal))
    }

    async fn put_access_binding(
        &self,
        cluster_id: &RemoteId,
        principal: &str,
        groups: &BTreeSet<String>,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        state
            .bindings
            .insert((cluster_id.clone(), principal.to_owned()), groups.clone());
        state.binding_writes += 1;
        state.events.push(RemoteEvent::Bound {
            principal: principal.to_owned(),
        });
        Ok(())
    }
}
