//! Volume identity
//!
//! Derives a stable identifier from an effective mount configuration, so two
//! bindings with identical mount settings on the same instance share a volume.

use super::merge::EffectiveMountConfig;
use crate::error::Result;
use xxhash_rust::xxh64::xxh64;

const IDENTITY_SEED: u64 = 0;

/// Digest of a mount configuration as 16 lowercase hex digits
///
/// The configuration is an ordered map, so its JSON encoding is canonical and
/// the digest does not depend on the order keys were inserted.
pub fn identify(config: &EffectiveMountConfig) -> Result<String> {
    let encoded = serde_json::to_vec(config)?;
    Ok(format!("{:016x}", xxh64(&encoded, IDENTITY_SEED)))
}

/// Volume identifier handed to the driver: `<instance_id>-<digest>`
pub fn volume_id(instance_id: &str, config: &EffectiveMountConfig) -> Result<String> {
    Ok(format!("{}-{}", instance_id, identify(config)?))
}
