use crate::access::AccessBinding;
use crate::resource::ResourceDescriptor;

use serde_json::Value;

use std::collections::BTreeMap;

/// Everything that a single provisioning run applies: the resource descriptors in declaration
/// order, the access bindings, and the named outputs exposed once the run completes. Output
/// values are templates that may contain placeholders, and are resolved against the outputs of
/// the applied resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackPlan {
    pub descriptors: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub access_bindings: Vec<AccessBinding>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl StackPlan {
    pub fn new() -> StackPlan {
        StackPlan::default()
    }

    pub fn with_resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn with_access_binding(mut self, binding: AccessBinding) -> Self {
        self.access_bindings.push(binding);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, template: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), template.into());
        self
    }

    pub fn descriptor(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }
}
