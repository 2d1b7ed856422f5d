use crate::access::DEFAULT_ADMIN_GROUP;
use crate::resource::spec::{ServiceType, DEFAULT_AMI_TYPE};
use crate::stack::StackVariant;

/// Environment specific settings that the stack definition is built from. Nothing in here has a
/// default that refers to a particular account, region or image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    /// Used as a prefix for the names of the remote resources
    pub name: String,
    #[serde(default)]
    pub variant: StackVariant,
    pub account_id: String,
    pub region: String,
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    /// Container registry hostname. Defaults to the account's private registry in the region.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub masters_role: Option<String>,
    pub containers: Vec<ContainerConfig>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub node_pool: NodePoolConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admins: Vec<AdminConfig>,
}

impl StackConfig {
    pub fn registry(&self) -> String {
        match self.registry {
            Some(ref registry) => registry.clone(),
            None => format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region),
        }
    }

    pub fn image_for(&self, container: &ContainerConfig) -> String {
        format!("{}/{}:{}", self.registry(), container.repository(), container.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub name: String,
    /// Repository within the registry. Defaults to the container name.
    #[serde(default)]
    pub repository: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub port: u16,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, port: u16) -> ContainerConfig {
        let name = name.into();
        ContainerConfig {
            repository: name.clone(),
            name,
            tag: default_tag(),
            port,
        }
    }

    pub fn repository(&self) -> &str {
        if self.repository.is_empty() {
            self.name.as_str()
        } else {
            self.repository.as_str()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePoolConfig {
    pub desired_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub disk_size: u32,
    pub ami_type: String,
    /// Overrides the instance shape that the variant would otherwise pick
    pub instance_shape: Option<String>,
}

impl Default for NodePoolConfig {
    fn default() -> NodePoolConfig {
        NodePoolConfig {
            desired_size: 2,
            min_size: 1,
            max_size: 4,
            disk_size: 20,
            ami_type: DEFAULT_AMI_TYPE.to_owned(),
            instance_shape: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            service_type: ServiceType::LoadBalancer,
            port: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub engine: String,
    pub node_type: String,
    pub node_count: u32,
    pub port: u16,
    /// Adds a `CACHE_ENDPOINT` variable to every container, which makes the workload wait for
    /// the cache to become available
    pub inject_endpoint: bool,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            engine: "redis".to_owned(),
            node_type: "cache.t3.micro".to_owned(),
            node_count: 1,
            port: 6379,
            inject_endpoint: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    pub principal: String,
    #[serde(default = "default_admin_groups")]
    pub groups: Vec<String>,
}

fn default_kubernetes_version() -> String {
    "1.24".to_owned()
}

fn default_replicas() -> u32 {
    2
}

fn default_tag() -> String {
    "latest".to_owned()
}

fn default_admin_groups() -> Vec<String> {
    vec![DEFAULT_ADMIN_GROUP.to_owned()]
}
