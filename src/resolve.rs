//! Resolves the placeholders in a descriptor's config using the outputs of resources that have
//! already been applied. The graph builder already guarantees that every placeholder names a
//! dependency, so a failure here means either that ordering was violated or that the remote
//! control plane did not report an expected output.
use crate::error::{ProvisionError, ReferenceFailure};
use crate::remote::{RemoteId, ResourceSpec};
use crate::resource::json_ext::OutputJson;
use crate::resource::reference::{substitute, OutputRef};
use crate::resource::ResourceDescriptor;

use serde_json::Value;

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
struct Applied {
    id: RemoteId,
    outputs: Value,
}

/// The outputs of every resource applied so far in a run. This is owned by the coordinator, and
/// is only ever mutated from there.
#[derive(Debug, Clone, Default)]
pub struct AppliedOutputs {
    applied: HashMap<String, Applied>,
}

impl AppliedOutputs {
    pub fn new() -> AppliedOutputs {
        AppliedOutputs::default()
    }

    /// Records the outputs of an applied resource. The remote id is always available as the `id`
    /// output, even if the control plane did not report it explicitly.
    pub fn record(&mut self, name: impl Into<String>, id: RemoteId, outputs: Value) {
        let outputs = match outputs {
            Value::Object(mut map) => {
                if !map.contains_key("id") {
                    map.insert("id".to_owned(), Value::String(id.to_string()));
                }
                Value::Object(map)
            }
            Value::Null => serde_json::json!({ "id": id.as_str() }),
            other => other,
        };
        self.applied.insert(name.into(), Applied { id, outputs });
    }

    pub fn remote_id(&self, name: &str) -> Option<&RemoteId> {
        self.applied.get(name).map(|a| &a.id)
    }

    pub fn outputs(&self, name: &str) -> Option<&Value> {
        self.applied.get(name).map(|a| &a.outputs)
    }

    /// Looks up a single output value
    pub fn get(&self, reference: &OutputRef) -> Result<&Value, ReferenceFailure> {
        let applied = self
            .applied
            .get(&reference.resource)
            .ok_or(ReferenceFailure::NotApplied)?;
        applied
            .outputs
            .get_path(&reference.output)
            .filter(|v| !v.is_null())
            .ok_or(ReferenceFailure::MissingOutput)
    }

    /// Returns a copy of `value` with every placeholder replaced by its concrete value.
    /// `resource` is only used for error reporting.
    pub fn resolve_value(&self, resource: &str, value: &Value) -> Result<Value, ProvisionError> {
        let mut lookup = |reference: &OutputRef| {
            self.get(reference)
                .map(Clone::clone)
                .map_err(|reason| ProvisionError::UnresolvedReference {
                    resource: resource.to_owned(),
                    reference: reference.clone(),
                    reason,
                })
        };
        substitute(value, &mut lookup)
    }

    /// Produces the fully resolved spec that gets sent to the control plane, including the
    /// resolved manifest for workloads and services
    pub fn resolve(&self, descriptor: &ResourceDescriptor) -> Result<ResourceSpec, ProvisionError> {
        let config = self.resolve_value(&descriptor.name, &descriptor.config_value())?;
        let manifest = descriptor
            .manifest()
            .map_err(|err| ProvisionError::Validation(vec![err]))?
            .map(|manifest| self.resolve_value(&descriptor.name, &manifest))
            .transpose()?;
        Ok(ResourceSpec {
            kind: descriptor.kind,
            name: descriptor.name.clone(),
            config,
            manifest,
        })
    }

    /// Resolves the declared output templates of a plan. Outputs that cannot be resolved, for
    /// example because the resource they refer to failed, are left out.
    pub fn resolve_outputs(&self, templates: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut resolved = BTreeMap::new();
        for (name, template) in templates {
            match self.resolve_value(name, template) {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(err) => {
                    log::warn!("Declared output: '{}' is unavailable: {}", name, err);
                }
            }
        }
        resolved
    }
}
