//! Maps external principals to in-cluster privilege groups. Bindings are independent of resource
//! creation. They never mutate cluster or workload state, and may be applied concurrently with
//! unrelated branches of the graph as soon as the cluster they target exists.
use crate::error::{RemoteError, ValidationError};
use crate::remote::{ControlPlane, RemoteId};

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::sync::Arc;

pub const DEFAULT_ADMIN_GROUP: &str = "system:masters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessBinding {
    pub principal: String,
    /// Name of the cluster resource that the binding applies to
    pub cluster: String,
    pub groups: BTreeSet<String>,
}

impl AccessBinding {
    pub fn new<I, S>(principal: impl Into<String>, cluster: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessBinding {
            principal: principal.into(),
            cluster: cluster.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Binds the principal to the cluster admin group
    pub fn admin(principal: impl Into<String>, cluster: impl Into<String>) -> Self {
        AccessBinding::new(principal, cluster, vec![DEFAULT_ADMIN_GROUP])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindOutcome {
    Created,
    Updated,
    Unchanged,
}

impl BindOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindOutcome::Created => "created",
            BindOutcome::Updated => "updated",
            BindOutcome::Unchanged => "unchanged",
        }
    }
}

impl Display for BindOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapses identical bindings of the same principal so each is applied once per run. A
/// principal that is bound more than once with a different cluster or group set is an error.
pub fn unique_bindings(bindings: &[AccessBinding]) -> Result<Vec<AccessBinding>, Vec<ValidationError>> {
    let mut seen: HashMap<&str, &AccessBinding> = HashMap::with_capacity(bindings.len());
    let mut unique = Vec::with_capacity(bindings.len());
    let mut errors = Vec::new();

    for binding in bindings {
        match seen.get(binding.principal.as_str()) {
            Some(previous) if *previous == binding => {
                log::debug!("Ignoring duplicate access binding for principal: '{}'", binding.principal);
            }
            Some(_) => {
                let already_reported = errors.iter().any(|e: &ValidationError| e.subject() == binding.principal);
                if !already_reported {
                    errors.push(ValidationError::ConflictingAccessBinding {
                        principal: binding.principal.clone(),
                    });
                }
            }
            None => {
                seen.insert(binding.principal.as_str(), binding);
                unique.push(binding.clone());
            }
        }
    }

    if errors.is_empty() {
        Ok(unique)
    } else {
        Err(errors)
    }
}

/// Applies access bindings through the control plane
#[derive(Clone)]
pub struct AccessBinder {
    control_plane: Arc<dyn ControlPlane>,
}

impl fmt::Debug for AccessBinder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AccessBinder")
    }
}

impl AccessBinder {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> AccessBinder {
        AccessBinder { control_plane }
    }

    /// Binding an identical group set again is a no-op. A changed group set overwrites the
    /// existing binding.
    pub async fn bind(
        &self,
        cluster_id: &RemoteId,
        binding: &AccessBinding,
    ) -> Result<BindOutcome, RemoteError> {
        let existing = self
            .control_plane
            .get_access_binding(cluster_id, &binding.principal)
            .await?;
        let outcome = match existing {
            Some(ref groups) if *groups == binding.groups => {
                log::debug!(
                    "Access binding for principal: '{}' in cluster: '{}' is already up to date",
                    binding.principal,
                    cluster_id
                );
                return Ok(BindOutcome::Unchanged);
            }
            Some(_) => BindOutcome::Updated,
            None => BindOutcome::Created,
        };
        self.control_plane
            .put_access_binding(cluster_id, &binding.principal, &binding.groups)
            .await?;
        log::info!(
            "Access binding for principal: '{}' in cluster: '{}' {} with groups: {:?}",
            binding.principal,
            cluster_id,
            outcome,
            binding.groups
        );
        Ok(outcome)
    }
}
