use crate::capacity::CapacityError;
use crate::resource::reference::OutputRef;

use std::fmt::{self, Display};

/// Errors returned by a `ControlPlane` implementation. Transport, auth and retries of transient
/// network failures are the business of the implementation, so this is left opaque.
pub type RemoteError = anyhow::Error;

/// A problem with a single descriptor or access binding, detected before anything is sent to the
/// remote control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    InvalidName {
        name: String,
    },
    DuplicateName {
        name: String,
    },
    InvalidConfig {
        resource: String,
        message: String,
    },
    Capacity {
        resource: String,
        error: CapacityError,
    },
    InvalidReplicas {
        resource: String,
        replicas: u32,
    },
    MissingLabels {
        resource: String,
    },
    NoContainers {
        resource: String,
    },
    DuplicateContainer {
        resource: String,
        container: String,
    },
    MissingWorkload {
        service: String,
    },
    AmbiguousWorkload {
        service: String,
        workloads: Vec<String>,
    },
    SelectorMismatch {
        service: String,
        workload: String,
    },
    NoServicePorts {
        service: String,
    },
    StaleTargetPort {
        service: String,
        workload: String,
        target_port: u16,
    },
    MultipleTargetPorts {
        service: String,
        target_ports: Vec<u16>,
    },
    InvalidCacheNodeCount {
        resource: String,
    },
    MissingSecurityGroups {
        resource: String,
    },
    EmptyGroups {
        principal: String,
    },
    ConflictingAccessBinding {
        principal: String,
    },
    UnknownCluster {
        principal: String,
        cluster: String,
    },
    UnknownOutputReference {
        output: String,
        reference: OutputRef,
    },
}

impl ValidationError {
    /// The name of the resource (or principal, or declared output) that the error is about
    pub fn subject(&self) -> &str {
        match self {
            ValidationError::InvalidName { name } | ValidationError::DuplicateName { name } => name,
            ValidationError::InvalidConfig { resource, .. }
            | ValidationError::Capacity { resource, .. }
            | ValidationError::InvalidReplicas { resource, .. }
            | ValidationError::MissingLabels { resource }
            | ValidationError::NoContainers { resource }
            | ValidationError::DuplicateContainer { resource, .. }
            | ValidationError::InvalidCacheNodeCount { resource }
            | ValidationError::MissingSecurityGroups { resource } => resource,
            ValidationError::MissingWorkload { service }
            | ValidationError::AmbiguousWorkload { service, .. }
            | ValidationError::SelectorMismatch { service, .. }
            | ValidationError::NoServicePorts { service }
            | ValidationError::StaleTargetPort { service, .. }
            | ValidationError::MultipleTargetPorts { service, .. } => service,
            ValidationError::EmptyGroups { principal }
            | ValidationError::ConflictingAccessBinding { principal }
            | ValidationError::UnknownCluster { principal, .. } => principal,
            ValidationError::UnknownOutputReference { output, .. } => output,
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::InvalidName { name } => write!(
                f,
                "Invalid resource name: '{}', names must start with a letter and contain only letters, digits, '-' or '_'",
                name
            ),
            ValidationError::DuplicateName { name } => {
                write!(f, "Resource name '{}' is declared more than once", name)
            }
            ValidationError::InvalidConfig { resource, message } => {
                write!(f, "Invalid config for resource '{}': {}", resource, message)
            }
            ValidationError::Capacity { resource, error } => {
                write!(f, "Invalid capacity for node pool '{}': {}", resource, error)
            }
            ValidationError::InvalidReplicas { resource, replicas } => write!(
                f,
                "Workload '{}' must have at least 1 replica, got: {}",
                resource, replicas
            ),
            ValidationError::MissingLabels { resource } => {
                write!(f, "Workload '{}' does not declare any pod labels", resource)
            }
            ValidationError::NoContainers { resource } => {
                write!(f, "Workload '{}' does not declare any containers", resource)
            }
            ValidationError::DuplicateContainer { resource, container } => write!(
                f,
                "Workload '{}' declares container '{}' more than once",
                resource, container
            ),
            ValidationError::MissingWorkload { service } => write!(
                f,
                "Service '{}' must depend directly on the workload it exposes",
                service
            ),
            ValidationError::AmbiguousWorkload { service, workloads } => write!(
                f,
                "Service '{}' depends on more than one workload: {:?}",
                service, workloads
            ),
            ValidationError::SelectorMismatch { service, workload } => write!(
                f,
                "Selector of service '{}' does not match the pod labels of workload '{}'",
                service, workload
            ),
            ValidationError::NoServicePorts { service } => {
                write!(f, "Service '{}' does not expose any ports", service)
            }
            ValidationError::StaleTargetPort {
                service,
                workload,
                target_port,
            } => write!(
                f,
                "Service '{}' targets port {}, but no container in workload '{}' exposes it",
                service, target_port, workload
            ),
            ValidationError::MultipleTargetPorts {
                service,
                target_ports,
            } => write!(
                f,
                "Service '{}' targets multiple container ports {:?}, declare one service per exposed container port",
                service, target_ports
            ),
            ValidationError::InvalidCacheNodeCount { resource } => {
                write!(f, "Cache '{}' must have at least 1 node", resource)
            }
            ValidationError::MissingSecurityGroups { resource } => write!(
                f,
                "Cache '{}' must reference at least one security group",
                resource
            ),
            ValidationError::EmptyGroups { principal } => write!(
                f,
                "Access binding for principal '{}' has no groups",
                principal
            ),
            ValidationError::ConflictingAccessBinding { principal } => write!(
                f,
                "Principal '{}' is bound more than once with different groups",
                principal
            ),
            ValidationError::UnknownCluster { principal, cluster } => write!(
                f,
                "Access binding for principal '{}' targets '{}', which is not a declared cluster",
                principal, cluster
            ),
            ValidationError::UnknownOutputReference { output, reference } => write!(
                f,
                "Declared output '{}' references {}, but no such resource is declared",
                output, reference
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Why a cross-reference could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceFailure {
    /// The referenced resource is not declared in the run
    UnknownResource,
    /// The referenced resource is declared, but is not a (transitive) dependency of the referrer
    NotADependency,
    /// The referenced resource has not been applied yet
    NotApplied,
    /// The referenced resource was applied, but did not produce the named output
    MissingOutput,
}

impl Display for ReferenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ReferenceFailure::UnknownResource => "resource is not declared",
            ReferenceFailure::NotADependency => "resource is not a dependency",
            ReferenceFailure::NotApplied => "resource has not been applied",
            ReferenceFailure::MissingOutput => "output does not exist",
        };
        f.write_str(msg)
    }
}

/// Errors that are fatal to a whole provisioning run. Validation and graph consistency errors are
/// always returned before any remote call is made.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionError {
    Validation(Vec<ValidationError>),
    CycleDetected {
        cycle: Vec<String>,
    },
    UnresolvedDependency {
        resource: String,
        dependency: String,
    },
    UnresolvedReference {
        resource: String,
        reference: OutputRef,
        reason: ReferenceFailure,
    },
}

impl ProvisionError {
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            ProvisionError::Validation(errors) => errors.as_slice(),
            _ => &[],
        }
    }

    pub fn is_validation(&self) -> bool {
        match self {
            ProvisionError::Validation(_) => true,
            _ => false,
        }
    }
}

impl Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisionError::Validation(errors) => {
                write!(f, "{} validation error(s): ", errors.len())?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    Display::fmt(err, f)?;
                }
                Ok(())
            }
            ProvisionError::CycleDetected { cycle } => {
                write!(f, "Dependency cycle detected: {}", cycle.join(" -> "))
            }
            ProvisionError::UnresolvedDependency {
                resource,
                dependency,
            } => write!(
                f,
                "Resource '{}' depends on '{}', which is not declared",
                resource, dependency
            ),
            ProvisionError::UnresolvedReference {
                resource,
                reference,
                reason,
            } => write!(
                f,
                "Resource '{}' references {}, but the {}",
                resource, reference, reason
            ),
        }
    }
}

impl std::error::Error for ProvisionError {}

impl From<ValidationError> for ProvisionError {
    fn from(err: ValidationError) -> ProvisionError {
        ProvisionError::Validation(vec![err])
    }
}

impl From<Vec<ValidationError>> for ProvisionError {
    fn from(errors: Vec<ValidationError>) -> ProvisionError {
        ProvisionError::Validation(errors)
    }
}

/// Why a single resource failed during a run. Failures are contained to the downstream subtree of
/// the resource and are reported in the `RunSummary`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FailureReason {
    #[serde(rename_all = "camelCase")]
    RemoteApplyFailure { message: String },
    #[serde(rename_all = "camelCase")]
    Timeout { after_ms: u64 },
}

impl FailureReason {
    pub fn remote(message: impl Into<String>) -> FailureReason {
        FailureReason::RemoteApplyFailure {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            FailureReason::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureReason::RemoteApplyFailure { message } => {
                write!(f, "remote apply failed: {}", message)
            }
            FailureReason::Timeout { after_ms } => {
                write!(f, "resource did not become ready within {}ms", after_ms)
            }
        }
    }
}
