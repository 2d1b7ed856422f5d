//! Kubestack declaratively provisions a managed Kubernetes cluster, a node pool, an application
//! workload with its services and, optionally, a cache that the workload connects to.
//!
//! Every resource is described by a `ResourceDescriptor`, which names the resources it depends on
//! and may refer to the outputs of those resources using placeholders of the form
//! `${resource.output}`. A `Provisioner` orders the descriptors into a dependency graph, applies
//! them against a remote `ControlPlane` (independent branches concurrently) and resolves every
//! placeholder once the resource it refers to is ready.
//!
//! ```no_run
//! use kubestack::prelude::*;
//! use kubestack::config::load_default_stack_config;
//!
//! async fn provision_stack(control_plane: impl ControlPlane) -> Result<(), Box<dyn std::error::Error>> {
//!     // reads `$KUBESTACK_CONFIG`, or `kubestack/stack.yaml` in the user's config directory
//!     let stack_config = load_default_stack_config()?;
//!     let plan = build_stack(&stack_config)?;
//!
//!     let provisioner = Provisioner::new(ProvisionConfig::new(), control_plane);
//!     let summary = provisioner.provision(plan).await?;
//!     for failure in summary.failed.iter() {
//!         eprintln!("{} failed: {}", failure.name, failure.reason);
//!     }
//!     println!("outputs: {}", kubestack::serde_json::to_string_pretty(&summary.outputs)?);
//!     Ok(())
//! }
//! ```
//!
//! A run never returns an error because a single resource failed. Instead, the dependents of the
//! failed resource are skipped, and everything is reported in the `RunSummary`. Errors are only
//! returned for problems with the plan itself, which are always detected before the first remote
//! call.

#[macro_use]
extern crate serde_derive;

pub mod access;
pub mod capacity;
pub mod config;
pub mod error;
pub mod graph;
pub mod plan;
pub mod remote;
pub mod resolve;
pub mod resource;
pub mod runner;
pub mod stack;
pub mod validate;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::access::AccessBinding;
    pub use crate::config::{ProvisionConfig, StackConfig};
    pub use crate::error::{FailureReason, ProvisionError};
    pub use crate::plan::StackPlan;
    pub use crate::remote::ControlPlane;
    pub use crate::resource::{ResourceDescriptor, ResourceKind};
    pub use crate::runner::{CancelMode, Provisioner, RunHandle, RunSummary};
    pub use crate::stack::{build_stack, StackVariant};
    pub use serde::{Deserialize, Serialize};
}
