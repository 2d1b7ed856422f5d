use crate::access::BindOutcome;
use crate::error::FailureReason;
use crate::remote::{ApplyAction, ResourceStatus};
use crate::resource::ResourceKind;

use serde_json::Value;

use std::collections::BTreeMap;

/// What the remote control plane knew about a resource before it was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "status", rename_all = "camelCase")]
pub enum PreviousState {
    Absent,
    Existing(ResourceStatus),
    /// The resource could not be described before applying it
    Unknown,
}

/// Structured record that is emitted for every successfully applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRecord {
    pub resource: String,
    pub kind: ResourceKind,
    pub action: ApplyAction,
    pub previous_state: PreviousState,
    pub new_state: ResourceStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedResource {
    pub name: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum AccessOutcome {
    Bound { result: BindOutcome },
    Failed { message: String },
    /// The cluster that the binding targets was never applied
    Skipped,
    /// The run was cancelled while the binding was in flight
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessResult {
    pub principal: String,
    #[serde(flatten)]
    pub outcome: AccessOutcome,
}

/// The result of a provisioning run. Every declared resource appears in exactly one of the
/// `applied`, `skipped`, `failed` or `abandoned` lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// In the order they became ready
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedResource>,
    /// Resources that were in flight when the run was cancelled with `CancelMode::Abandon`
    pub abandoned: Vec<String>,
    pub records: Vec<ApplyRecord>,
    pub outputs: BTreeMap<String, Value>,
    pub access: Vec<AccessResult>,
}

impl RunSummary {
    /// True if every resource was applied and every access binding bound
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty()
            && self.failed.is_empty()
            && self.abandoned.is_empty()
            && self.access.iter().all(|a| match a.outcome {
                AccessOutcome::Bound { .. } => true,
                _ => false,
            })
    }

    pub fn failure(&self, name: &str) -> Option<&FailureReason> {
        self.failed.iter().find(|f| f.name == name).map(|f| &f.reason)
    }

    pub fn record(&self, name: &str) -> Option<&ApplyRecord> {
        self.records.iter().find(|r| r.resource == name)
    }

    pub fn access_outcome(&self, principal: &str) -> Option<&AccessOutcome> {
        self.access
            .iter()
            .find(|a| a.principal == principal)
            .map(|a| &a.outcome)
    }

    /// Number of resources that were newly created during the run
    pub fn created_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.action == ApplyAction::Created)
            .count()
    }
}
