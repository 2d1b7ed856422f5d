//! Checks a `StackPlan` before anything is sent to the remote control plane. Every problem that
//! can be found is collected, rather than stopping at the first one. Graph consistency (cycles,
//! undeclared dependencies and references) is checked separately by the `graph` module.
use crate::access::unique_bindings;
use crate::capacity::validate_capacity;
use crate::error::{ProvisionError, ValidationError};
use crate::plan::StackPlan;
use crate::resource::reference::collect_references;
use crate::resource::spec::{
    CacheSecurityGroupSpec, CacheSpec, CacheSubnetGroupSpec, ClusterSpec, NodePoolSpec,
    ServiceSpec, WorkloadSpec,
};
use crate::resource::{ResourceDescriptor, ResourceKind};

use lazy_static::lazy_static;
use regex::Regex;

use std::collections::HashSet;

lazy_static! {
    static ref NAME_REGEX: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap();
}

pub fn is_valid_name(name: &str) -> bool {
    NAME_REGEX.is_match(name)
}

/// Returns `ProvisionError::Validation` with every problem found in the plan
pub fn validate_plan(plan: &StackPlan) -> Result<(), ProvisionError> {
    let mut errors = Vec::new();

    for desc in plan.descriptors.iter() {
        if !is_valid_name(&desc.name) {
            errors.push(ValidationError::InvalidName {
                name: desc.name.clone(),
            });
        }
        validate_descriptor(plan, desc, &mut errors);
    }

    validate_access_bindings(plan, &mut errors);
    validate_outputs(plan, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        log::warn!("Plan failed validation with {} error(s)", errors.len());
        Err(ProvisionError::Validation(errors))
    }
}

fn validate_descriptor(plan: &StackPlan, desc: &ResourceDescriptor, errors: &mut Vec<ValidationError>) {
    let result = match desc.kind {
        ResourceKind::Cluster => desc.deserialize_config::<ClusterSpec>().map(|_| ()),
        ResourceKind::NodePool => desc.deserialize_config::<NodePoolSpec>().map(|spec| {
            if let Err(error) = validate_capacity(&spec.capacity) {
                errors.push(ValidationError::Capacity {
                    resource: desc.name.clone(),
                    error,
                });
            }
        }),
        ResourceKind::Workload => desc
            .deserialize_config::<WorkloadSpec>()
            .map(|spec| validate_workload(&desc.name, &spec, errors)),
        ResourceKind::Service => desc
            .deserialize_config::<ServiceSpec>()
            .map(|spec| validate_service(plan, desc, &spec, errors)),
        ResourceKind::CacheSubnetGroup => desc.deserialize_config::<CacheSubnetGroupSpec>().map(|_| ()),
        ResourceKind::CacheSecurityGroup => {
            desc.deserialize_config::<CacheSecurityGroupSpec>().map(|_| ())
        }
        ResourceKind::Cache => desc.deserialize_config::<CacheSpec>().map(|spec| {
            if spec.node_count == 0 {
                errors.push(ValidationError::InvalidCacheNodeCount {
                    resource: desc.name.clone(),
                });
            }
            if spec.security_group_refs.is_empty() {
                errors.push(ValidationError::MissingSecurityGroups {
                    resource: desc.name.clone(),
                });
            }
        }),
    };
    if let Err(err) = result {
        errors.push(err);
    }
}

fn validate_workload(name: &str, spec: &WorkloadSpec, errors: &mut Vec<ValidationError>) {
    if spec.replicas == 0 {
        errors.push(ValidationError::InvalidReplicas {
            resource: name.to_owned(),
            replicas: spec.replicas,
        });
    }
    if spec.labels.is_empty() {
        errors.push(ValidationError::MissingLabels {
            resource: name.to_owned(),
        });
    }
    if spec.containers.is_empty() {
        errors.push(ValidationError::NoContainers {
            resource: name.to_owned(),
        });
    }
    let mut seen = HashSet::with_capacity(spec.containers.len());
    for container in spec.containers.iter() {
        if !seen.insert(container.name.as_str()) {
            errors.push(ValidationError::DuplicateContainer {
                resource: name.to_owned(),
                container: container.name.clone(),
            });
        }
    }
}

/// A service must depend directly on exactly one workload, select exactly that workload's pod
/// labels, and target one port that one of its containers actually exposes.
fn validate_service(
    plan: &StackPlan,
    desc: &ResourceDescriptor,
    spec: &ServiceSpec,
    errors: &mut Vec<ValidationError>,
) {
    let service = desc.name.as_str();
    if spec.ports.is_empty() {
        errors.push(ValidationError::NoServicePorts {
            service: service.to_owned(),
        });
    }

    let target_ports = spec.target_ports();
    if target_ports.len() > 1 {
        errors.push(ValidationError::MultipleTargetPorts {
            service: service.to_owned(),
            target_ports: target_ports.clone(),
        });
    }

    let workloads = desc
        .depends_on
        .iter()
        .filter_map(|dep| plan.descriptor(dep))
        .filter(|dep| dep.kind == ResourceKind::Workload)
        .collect::<Vec<_>>();
    let workload = match workloads.as_slice() {
        [] => {
            errors.push(ValidationError::MissingWorkload {
                service: service.to_owned(),
            });
            return;
        }
        [workload] => *workload,
        many => {
            errors.push(ValidationError::AmbiguousWorkload {
                service: service.to_owned(),
                workloads: many.iter().map(|w| w.name.clone()).collect(),
            });
            return;
        }
    };

    // an invalid workload config has already been reported against the workload itself
    let workload_spec = match workload.deserialize_config::<WorkloadSpec>() {
        Ok(spec) => spec,
        Err(_) => return,
    };

    if spec.selector != workload_spec.labels {
        errors.push(ValidationError::SelectorMismatch {
            service: service.to_owned(),
            workload: workload.name.clone(),
        });
    }
    for target_port in target_ports {
        if !workload_spec.container_ports().any(|p| p == target_port) {
            errors.push(ValidationError::StaleTargetPort {
                service: service.to_owned(),
                workload: workload.name.clone(),
                target_port,
            });
        }
    }
}

fn validate_access_bindings(plan: &StackPlan, errors: &mut Vec<ValidationError>) {
    for binding in plan.access_bindings.iter() {
        if binding.groups.is_empty() {
            errors.push(ValidationError::EmptyGroups {
                principal: binding.principal.clone(),
            });
        }
        let is_cluster = plan
            .descriptor(&binding.cluster)
            .map(|d| d.kind == ResourceKind::Cluster)
            .unwrap_or(false);
        if !is_cluster {
            errors.push(ValidationError::UnknownCluster {
                principal: binding.principal.clone(),
                cluster: binding.cluster.clone(),
            });
        }
    }
    if let Err(conflicts) = unique_bindings(&plan.access_bindings) {
        errors.extend(conflicts);
    }
}

/// Declared outputs are resolved after the run, so they may refer to any declared resource
fn validate_outputs(plan: &StackPlan, errors: &mut Vec<ValidationError>) {
    for (output, template) in plan.outputs.iter() {
        for reference in collect_references(template) {
            if plan.descriptor(&reference.resource).is_none() {
                errors.push(ValidationError::UnknownOutputReference {
                    output: output.clone(),
                    reference,
                });
            }
        }
    }
}
