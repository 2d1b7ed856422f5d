//! The stack definition: a managed cluster with a node pool, an application workload exposed by
//! a service per container port, and optionally a cache that the workload can connect to. The
//! successive revisions of the stack are modeled as a `StackVariant` instead of separate
//! definitions, and every environment specific value comes from the injected `StackConfig`.
use crate::access::AccessBinding;
use crate::capacity::NodePoolCapacity;
use crate::config::StackConfig;
use crate::error::{ProvisionError, ValidationError};
use crate::plan::StackPlan;
use crate::resource::reference::OutputRef;
use crate::resource::spec::{
    CacheSecurityGroupSpec, CacheSpec, CacheSubnetGroupSpec, ClusterSpec, ContainerSpec,
    IngressRule, NodePoolSpec, ServicePort, ServiceSpec, WorkloadSpec,
};
use crate::resource::{ResourceDescriptor, ResourceKind};

use serde_json::Value;

use std::collections::BTreeMap;

pub const CLUSTER: &str = "cluster";
pub const NODE_POOL: &str = "nodePool";
pub const WORKLOAD: &str = "workload";
pub const SERVICE: &str = "service";
pub const CACHE_SUBNET_GROUP: &str = "cacheSubnetGroup";
pub const CACHE_SECURITY_GROUP: &str = "cacheSecurityGroup";
pub const CACHE: &str = "cache";

pub const CACHE_ENDPOINT_ENV_VAR: &str = "CACHE_ENDPOINT";
const APP_LABEL: &str = "app";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StackVariant {
    /// A single container on small nodes
    Initial,
    /// Every configured container, on slightly larger nodes
    MultiContainer,
    /// Every configured container plus a cache
    WithCache,
}

impl Default for StackVariant {
    fn default() -> StackVariant {
        StackVariant::Initial
    }
}

impl StackVariant {
    pub fn instance_shape(&self) -> &'static str {
        match self {
            StackVariant::Initial => "t2.micro",
            StackVariant::MultiContainer => "t3.small",
            StackVariant::WithCache => "t3.medium",
        }
    }

    pub fn includes_cache(&self) -> bool {
        *self == StackVariant::WithCache
    }

    pub fn all_containers(&self) -> bool {
        *self != StackVariant::Initial
    }
}

fn placeholder(resource: &str, output: &str) -> Value {
    Value::String(OutputRef::new(resource, output).placeholder())
}

fn service_name(index: usize, container: &str) -> String {
    if index == 0 {
        SERVICE.to_owned()
    } else {
        format!("{}-{}", SERVICE, container)
    }
}

/// Builds the plan for the configured variant. Descriptors are declared in the order cluster,
/// node pool, workload, services, then the cache branch.
pub fn build_stack(config: &StackConfig) -> Result<StackPlan, ProvisionError> {
    let variant = config.variant;
    log::debug!("Building stack: '{}' with variant: {:?}", config.name, variant);

    let containers = if variant.all_containers() {
        config.containers.as_slice()
    } else {
        &config.containers[..config.containers.len().min(1)]
    };
    if containers.is_empty() {
        return Err(ValidationError::NoContainers {
            resource: WORKLOAD.to_owned(),
        }
        .into());
    }
    let inject_endpoint = variant.includes_cache() && config.cache.inject_endpoint;

    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_owned(), config.name.clone());

    let cluster = ResourceDescriptor::new(ResourceKind::Cluster, CLUSTER).with_config(&ClusterSpec {
        cluster_name: format!("{}-cluster", config.name),
        version: config.kubernetes_version.clone(),
        default_capacity: 0,
        masters_role: config.masters_role.clone(),
    })?;

    let node_pool_config = &config.node_pool;
    let instance_shape = node_pool_config
        .instance_shape
        .clone()
        .unwrap_or_else(|| variant.instance_shape().to_owned());
    let node_pool = ResourceDescriptor::new(ResourceKind::NodePool, NODE_POOL)
        .depends_on(CLUSTER)
        .with_config(&NodePoolSpec {
            nodegroup_name: format!("{}-node-group", config.name),
            cluster_name: placeholder(CLUSTER, "name"),
            ami_type: node_pool_config.ami_type.clone(),
            capacity: NodePoolCapacity::new(
                node_pool_config.min_size,
                node_pool_config.desired_size,
                node_pool_config.max_size,
                instance_shape,
                node_pool_config.disk_size,
            ),
        })?;

    let cache_endpoint = format!(
        "{}:{}",
        OutputRef::new(CACHE, "address").placeholder(),
        OutputRef::new(CACHE, "port").placeholder()
    );
    let container_specs = containers
        .iter()
        .map(|c| {
            let spec = ContainerSpec::new(c.name.as_str(), config.image_for(c), c.port);
            if inject_endpoint {
                spec.with_env(CACHE_ENDPOINT_ENV_VAR, cache_endpoint.as_str())
            } else {
                spec
            }
        })
        .collect::<Vec<_>>();
    let mut workload = ResourceDescriptor::new(ResourceKind::Workload, WORKLOAD)
        .depends_on(CLUSTER)
        .with_config(&WorkloadSpec {
            namespace: "default".to_owned(),
            replicas: config.replicas,
            labels: labels.clone(),
            containers: container_specs,
        })?;
    if inject_endpoint {
        workload = workload.depends_on(CACHE);
    }

    let mut plan = StackPlan::new()
        .with_resource(cluster)
        .with_resource(node_pool)
        .with_resource(workload);

    for (i, container) in containers.iter().enumerate() {
        let service = ResourceDescriptor::new(ResourceKind::Service, service_name(i, &container.name))
            .depends_on(WORKLOAD)
            .with_config(&ServiceSpec {
                namespace: "default".to_owned(),
                service_type: config.service.service_type,
                ports: vec![ServicePort {
                    port: config.service.port,
                    target_port: container.port,
                }],
                selector: labels.clone(),
            })?;
        plan = plan.with_resource(service);
    }

    if variant.includes_cache() {
        plan = with_cache_branch(plan, config)?;
        plan = plan.with_output("cacheEndpoint", Value::String(cache_endpoint));
    }

    plan = plan
        .with_output("clusterEndpoint", placeholder(CLUSTER, "endpoint"))
        .with_output("serviceHostname", placeholder(SERVICE, "hostname"));

    for admin in config.admins.iter() {
        plan = plan.with_access_binding(AccessBinding::new(
            admin.principal.as_str(),
            CLUSTER,
            admin.groups.iter().cloned(),
        ));
    }
    Ok(plan)
}

fn with_cache_branch(plan: StackPlan, config: &StackConfig) -> Result<StackPlan, ValidationError> {
    let cache_config = &config.cache;
    let subnet_group = ResourceDescriptor::new(ResourceKind::CacheSubnetGroup, CACHE_SUBNET_GROUP)
        .depends_on(CLUSTER)
        .with_config(&CacheSubnetGroupSpec {
            group_name: format!("{}-cache-subnets", config.name),
            description: format!("Private subnets of the {} cluster", config.name),
            subnet_ids: placeholder(CLUSTER, "privateSubnetIds"),
        })?;
    let security_group = ResourceDescriptor::new(ResourceKind::CacheSecurityGroup, CACHE_SECURITY_GROUP)
        .depends_on(CLUSTER)
        .with_config(&CacheSecurityGroupSpec {
            group_name: format!("{}-cache", config.name),
            description: format!("Allows the {} cluster to reach the cache", config.name),
            vpc_id: placeholder(CLUSTER, "vpcId"),
            ingress: vec![IngressRule {
                protocol: "tcp".to_owned(),
                port: cache_config.port,
                source_security_group: placeholder(CLUSTER, "securityGroupId"),
            }],
        })?;
    let cache = ResourceDescriptor::new(ResourceKind::Cache, CACHE)
        .depends_on(CACHE_SUBNET_GROUP)
        .depends_on(CACHE_SECURITY_GROUP)
        .with_config(&CacheSpec {
            cluster_id: format!("{}-cache", config.name),
            engine: cache_config.engine.clone(),
            node_type: cache_config.node_type.clone(),
            node_count: cache_config.node_count,
            port: cache_config.port,
            subnet_group_ref: placeholder(CACHE_SUBNET_GROUP, "id"),
            security_group_refs: vec![placeholder(CACHE_SECURITY_GROUP, "id")],
        })?;
    Ok(plan
        .with_resource(subnet_group)
        .with_resource(security_group)
        .with_resource(cache))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{AdminConfig, ContainerConfig};
    use crate::graph::DependencyGraph;
    use crate::validate::validate_plan;
    use serde_json::json;

    fn config(variant: StackVariant) -> StackConfig {
        StackConfig {
            name: "nn-kube".to_owned(),
            variant,
            account_id: "123456789012".to_owned(),
            region: "us-west-1".to_owned(),
            kubernetes_version: "1.24".to_owned(),
            registry: None,
            masters_role: None,
            containers: vec![
                ContainerConfig::new("noticeninja-auth", 3001),
                ContainerConfig::new("noticeninja-api", 3002),
            ],
            replicas: 2,
            node_pool: Default::default(),
            service: Default::default(),
            cache: Default::default(),
            admins: vec![AdminConfig {
                principal: "KubeAdmin".to_owned(),
                groups: vec!["system:masters".to_owned()],
            }],
        }
    }

    fn names(plan: &StackPlan) -> Vec<&str> {
        plan.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    fn instance_shape(plan: &StackPlan) -> Value {
        plan.descriptor(NODE_POOL).unwrap().config["instanceShape"].clone()
    }

    #[test]
    fn initial_variant_has_one_container_and_no_cache() {
        let plan = build_stack(&config(StackVariant::Initial)).expect("failed to build stack");
        assert_eq!(vec!["cluster", "nodePool", "workload", "service"], names(&plan));
        assert_eq!(json!("t2.micro"), instance_shape(&plan));
        let workload = plan.descriptor(WORKLOAD).unwrap();
        assert_eq!(
            json!("123456789012.dkr.ecr.us-west-1.amazonaws.com/noticeninja-auth:latest"),
            workload.config["containers"][0]["image"]
        );
        assert_eq!(1, workload.config["containers"].as_array().unwrap().len());
        assert!(!plan.outputs.contains_key("cacheEndpoint"));
        assert_eq!(Ok(()), validate_plan(&plan));
    }

    #[test]
    fn multi_container_variant_declares_one_service_per_container_port() {
        let plan = build_stack(&config(StackVariant::MultiContainer)).expect("failed to build stack");
        assert_eq!(
            vec!["cluster", "nodePool", "workload", "service", "service-noticeninja-api"],
            names(&plan)
        );
        assert_eq!(json!("t3.small"), instance_shape(&plan));
        let api_service = plan.descriptor("service-noticeninja-api").unwrap();
        assert_eq!(json!(3002), api_service.config["ports"][0]["targetPort"]);
        assert_eq!(Ok(()), validate_plan(&plan));
    }

    #[test]
    fn cache_variant_wires_the_cache_branch_through_placeholders() {
        let plan = build_stack(&config(StackVariant::WithCache)).expect("failed to build stack");
        assert_eq!(
            vec![
                "cluster",
                "nodePool",
                "workload",
                "service",
                "service-noticeninja-api",
                "cacheSubnetGroup",
                "cacheSecurityGroup",
                "cache"
            ],
            names(&plan)
        );
        assert_eq!(json!("t3.medium"), instance_shape(&plan));
        let cache = plan.descriptor(CACHE).unwrap();
        assert_eq!(json!("${cacheSubnetGroup.id}"), cache.config["subnetGroupRef"]);
        assert_eq!(json!(["${cacheSecurityGroup.id}"]), cache.config["securityGroupRefs"]);
        assert_eq!(
            Some(&json!("${cache.address}:${cache.port}")),
            plan.outputs.get("cacheEndpoint")
        );
        assert_eq!(Ok(()), validate_plan(&plan));

        let graph = DependencyGraph::build(plan.descriptors.clone()).expect("failed to build graph");
        let order = graph.names_in_order();
        assert_eq!("cluster", order[0]);
        assert_eq!("cache", order[order.len() - 1]);
    }

    #[test]
    fn injected_cache_endpoint_makes_the_workload_wait_for_the_cache() {
        let mut config = config(StackVariant::WithCache);
        config.cache.inject_endpoint = true;
        let plan = build_stack(&config).expect("failed to build stack");
        let workload = plan.descriptor(WORKLOAD).unwrap();
        assert_eq!(vec!["cluster".to_owned(), "cache".to_owned()], workload.depends_on);
        assert_eq!(
            json!([{ "name": "CACHE_ENDPOINT", "value": "${cache.address}:${cache.port}" }]),
            workload.config["containers"][1]["env"]
        );

        let graph = DependencyGraph::build(plan.descriptors.clone()).expect("failed to build graph");
        let order = graph.names_in_order();
        let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(position("cache") < position("workload"));
        assert!(position("workload") < position("service"));
    }

    #[test]
    fn admins_become_access_bindings_on_the_cluster() {
        let plan = build_stack(&config(StackVariant::Initial)).expect("failed to build stack");
        assert_eq!(
            vec![AccessBinding::admin("KubeAdmin", "cluster")],
            plan.access_bindings
        );
    }

    #[test]
    fn instance_shape_can_be_overridden() {
        let mut config = config(StackVariant::Initial);
        config.node_pool.instance_shape = Some("m5.large".to_owned());
        let plan = build_stack(&config).expect("failed to build stack");
        assert_eq!(json!("m5.large"), instance_shape(&plan));
    }
}
