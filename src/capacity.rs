//! Sizing policy for node pools. This is a pure function so that it can run before any remote
//! call is made, which means an invalid request never results in a partially applied run.
use std::fmt::{self, Display};

/// The requested capacity of a node pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolCapacity {
    pub desired_size: u32,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    pub max_size: u32,
    pub instance_shape: String,
    /// Disk size of each node, in GiB
    pub disk_size: u32,
}

fn default_min_size() -> u32 {
    1
}

impl NodePoolCapacity {
    pub fn new(
        min_size: u32,
        desired_size: u32,
        max_size: u32,
        instance_shape: impl Into<String>,
        disk_size: u32,
    ) -> NodePoolCapacity {
        NodePoolCapacity {
            desired_size,
            min_size,
            max_size,
            instance_shape: instance_shape.into(),
            disk_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    InvalidCapacityRange { min: u32, desired: u32, max: u32 },
    InvalidDiskSize { disk_size: u32 },
}

impl Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CapacityError::InvalidCapacityRange { min, desired, max } => write!(
                f,
                "InvalidCapacityRange: expected min <= desired <= max, got min: {}, desired: {}, max: {}",
                min, desired, max
            ),
            CapacityError::InvalidDiskSize { disk_size } => write!(
                f,
                "InvalidDiskSize: disk size must be greater than 0, got: {}",
                disk_size
            ),
        }
    }
}

impl std::error::Error for CapacityError {}

/// Checks that `min_size <= desired_size <= max_size` and that `disk_size > 0`
pub fn validate_capacity(capacity: &NodePoolCapacity) -> Result<(), CapacityError> {
    let NodePoolCapacity {
        desired_size,
        min_size,
        max_size,
        disk_size,
        ..
    } = *capacity;

    if min_size > desired_size || desired_size > max_size {
        return Err(CapacityError::InvalidCapacityRange {
            min: min_size,
            desired: desired_size,
            max: max_size,
        });
    }
    if disk_size == 0 {
        return Err(CapacityError::InvalidDiskSize { disk_size });
    }
    Ok(())
}
