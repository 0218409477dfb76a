//! Mount configuration
//!
//! Everything between the caller's raw bind parameters and the configuration
//! handed to the volume driver:
//!
//! - [`params`]: decoding and narrowing of caller parameters
//! - [`policy`]: the operator's allow-list and defaults
//! - [`merge`]: the merge engine itself
//! - [`identity`]: stable volume identifiers derived from merged configs

pub mod identity;
pub mod merge;
pub mod params;
pub mod policy;

pub use identity::{identify, volume_id};
pub use merge::{
    merge_mount_options, validate_share, EffectiveMountConfig, MergedMount, MountMode,
    DEFAULT_CONTAINER_BASE,
};
pub use params::{parse_parameters, BindParameters, ParamValue};
pub use policy::MergePolicy;
