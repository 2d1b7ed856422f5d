//! The contract between the orchestrator and the remote control plane. Only this trait is needed
//! by the core. Transport, authentication and retrying of transient network errors are all the
//! responsibility of the implementation. The `testkit` feature provides an in-memory
//! implementation that is useful for tests.
use crate::error::RemoteError;
use crate::resource::ResourceKind;

use async_trait::async_trait;
use serde_json::Value;

use std::collections::BTreeSet;
use std::fmt::{self, Display};

/// Identifier that the remote control plane assigned to a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> RemoteId {
        RemoteId(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    Pending,
    Ready,
    Failed,
}

impl Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What an `ensure` call did to the remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

impl ApplyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Created => "created",
            ApplyAction::Updated => "updated",
            ApplyAction::Unchanged => "unchanged",
        }
    }
}

impl Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved resource configuration, ready to be sent to the control plane. Unlike a
/// `ResourceDescriptor`, the config never contains any placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub config: Value,
    /// The rendered `Deployment` or `Service` document for workloads and services, which is what
    /// the control plane hands to the cluster. It is derived from `config`, so it is never
    /// compared on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
}

/// The remote view of a resource that already exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub id: RemoteId,
    pub config: Value,
    pub status: ResourceStatus,
    pub outputs: Value,
}

/// Returned from `ControlPlane::ensure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: RemoteId,
    pub action: ApplyAction,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub outputs: Value,
}

/// Returned from `ControlPlane::get_status`. The outputs may be incomplete until the resource
/// is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub outputs: Value,
}

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Returns the current remote view of the resource, or `None` if it does not exist
    async fn describe(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ObservedResource>, RemoteError>;

    /// Idempotently creates the resource, or updates it in place to match the given config
    async fn ensure(&self, spec: &ResourceSpec) -> Result<ResourceState, RemoteError>;

    async fn get_status(&self, id: &RemoteId) -> Result<StatusReport, RemoteError>;

    /// Returns the groups that the principal is currently bound to within the given cluster
    async fn get_access_binding(
        &self,
        cluster_id: &RemoteId,
        principal: &str,
    ) -> Result<Option<BTreeSet<String>>, RemoteError>;

    /// Overwrites any existing binding for the principal
    async fn put_access_binding(
        &self,
        cluster_id: &RemoteId,
        principal: &str,
        groups: &BTreeSet<String>,
    ) -> Result<(), RemoteError>;
}
