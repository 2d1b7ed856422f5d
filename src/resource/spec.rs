//! Typed configuration for each `ResourceKind`. These are what gets serialized into the `config`
//! of a `ResourceDescriptor`, and what validation deserializes it back into. Fields that hold a
//! cross-reference are typed as `Value` so that they can hold either a placeholder or the
//! resolved value.
use crate::capacity::NodePoolCapacity;

use serde_json::{json, Value};

use std::collections::BTreeMap;
use std::fmt::{self, Display};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_AMI_TYPE: &str = "AL2_X86_64";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

fn default_ami_type() -> String {
    DEFAULT_AMI_TYPE.to_owned()
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub version: String,
    /// Number of nodes created alongside the control plane. Node pools are declared separately,
    /// so this is normally 0.
    #[serde(default)]
    pub default_capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masters_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub nodegroup_name: String,
    /// Usually a placeholder on the cluster's `name` output
    pub cluster_name: Value,
    #[serde(default = "default_ami_type")]
    pub ami_type: String,
    #[serde(flatten)]
    pub capacity: NodePoolCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    /// serialized even when empty
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, container_port: u16) -> Self {
        ContainerSpec {
            name: name.into(),
            image: image.into(),
            container_port,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
}

impl WorkloadSpec {
    pub fn container_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.containers.iter().map(|c| c.container_port)
    }

    /// Renders the `apps/v1 Deployment` that runs this workload
    pub fn manifest(&self, name: &str) -> Value {
        let containers = self
            .containers
            .iter()
            .map(|c| {
                let mut container = json!({
                    "name": c.name,
                    "image": c.image,
                    "ports": [{ "containerPort": c.container_port }],
                });
                if !c.env.is_empty() {
                    container["env"] = json!(c.env);
                }
                container
            })
            .collect::<Vec<_>>();
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "namespace": self.namespace,
                "name": name,
            },
            "spec": {
                "replicas": self.replicas,
                "selector": { "matchLabels": self.labels },
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": { "containers": containers },
                },
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    LoadBalancer,
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
}

impl Default for ServiceType {
    fn default() -> ServiceType {
        ServiceType::LoadBalancer
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ClusterIp => "ClusterIP",
            ServiceType::NodePort => "NodePort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub port: u16,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    pub ports: Vec<ServicePort>,
    pub selector: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn target_ports(&self) -> Vec<u16> {
        let mut ports = self.ports.iter().map(|p| p.target_port).collect::<Vec<_>>();
        ports.sort();
        ports.dedup();
        ports
    }

    /// Renders the `v1 Service` document
    pub fn manifest(&self, name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "namespace": self.namespace,
                "name": name,
            },
            "spec": {
                "type": self.service_type.to_string(),
                "ports": self.ports,
                "selector": self.selector,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSubnetGroupSpec {
    pub group_name: String,
    pub description: String,
    /// Usually a placeholder on the cluster's `privateSubnetIds` output
    pub subnet_ids: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
    pub source_security_group: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSecurityGroupSpec {
    pub group_name: String,
    pub description: String,
    pub vpc_id: Value,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    pub cluster_id: String,
    pub engine: String,
    pub node_type: String,
    pub node_count: u32,
    pub port: u16,
    pub subnet_group_ref: Value,
    pub security_group_refs: Vec<Value>,
}
