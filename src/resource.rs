pub mod json_ext;
pub mod reference;
pub mod spec;

use crate::error::ValidationError;
use crate::resource::reference::{collect_references, OutputRef};
use crate::resource::spec::{ServiceSpec, WorkloadSpec};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use std::fmt::{self, Display};

pub type JsonObject = serde_json::Map<String, Value>;

/// The fixed set of resource kinds that can be provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Cluster,
    NodePool,
    Workload,
    Service,
    CacheSubnetGroup,
    CacheSecurityGroup,
    Cache,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "nodePool",
            ResourceKind::Workload => "workload",
            ResourceKind::Service => "service",
            ResourceKind::CacheSubnetGroup => "cacheSubnetGroup",
            ResourceKind::CacheSecurityGroup => "cacheSecurityGroup",
            ResourceKind::Cache => "cache",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of the desired configuration of a single resource. Descriptors are
/// planning artifacts that only live for the duration of a run. The `config` may contain
/// placeholders that refer to the outputs of other resources (see the `reference` module), which
/// are resolved right before the resource is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub config: JsonObject,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> ResourceDescriptor {
        ResourceDescriptor {
            kind,
            name: name.into(),
            config: JsonObject::new(),
            depends_on: Vec::new(),
        }
    }

    /// Serializes the given typed spec and uses it as the config. Returns an `InvalidConfig`
    /// error if the value does not serialize to a json object.
    pub fn with_config<S: Serialize>(mut self, spec: &S) -> Result<Self, ValidationError> {
        let value = serde_json::to_value(spec).map_err(|err| ValidationError::InvalidConfig {
            resource: self.name.clone(),
            message: err.to_string(),
        })?;
        match value {
            Value::Object(map) => {
                self.config = map;
                Ok(self)
            }
            other => Err(ValidationError::InvalidConfig {
                resource: self.name.clone(),
                message: format!("config must be an object, got: {}", other),
            }),
        }
    }

    pub fn with_raw_config(mut self, config: JsonObject) -> Self {
        self.config = config;
        self
    }

    /// Adds a dependency edge. Adding the same dependency twice has no effect.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    pub fn with_dependencies<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, |desc, name| desc.depends_on(name))
    }

    pub fn deserialize_config<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.config_value()).map_err(|err| ValidationError::InvalidConfig {
            resource: self.name.clone(),
            message: err.to_string(),
        })
    }

    pub fn config_value(&self) -> Value {
        Value::Object(self.config.clone())
    }

    /// Renders the Kubernetes document for kinds that run inside the cluster. Placeholders are
    /// carried over into the manifest unresolved. Returns `None` for every other kind.
    pub fn manifest(&self) -> Result<Option<Value>, ValidationError> {
        match self.kind {
            ResourceKind::Workload => self
                .deserialize_config::<WorkloadSpec>()
                .map(|spec| Some(spec.manifest(&self.name))),
            ResourceKind::Service => self
                .deserialize_config::<ServiceSpec>()
                .map(|spec| Some(spec.manifest(&self.name))),
            _ => Ok(None),
        }
    }

    /// Every placeholder in the config, in document order
    pub fn references(&self) -> Vec<OutputRef> {
        let mut refs = Vec::new();
        for value in self.config.values() {
            refs.extend(collect_references(value));
        }
        refs
    }
}

impl Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}
