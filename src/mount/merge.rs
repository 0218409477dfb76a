//! Mount-Option Merge Engine
//!
//! Reconciles the operator's [`MergePolicy`] with the parameters a caller
//! supplies at bind time, producing the effective mount configuration handed
//! to the volume driver.
//!
//! A handful of meta-parameters are always recognized, whatever the policy
//! says:
//!
//! - `share`: the share address to mount instead of the instance fingerprint
//! - `mount`: the container path the volume appears at
//! - `readonly`: boolean, mounts the volume read-only
//!
//! Meta-parameters are never copied into the configuration under their raw
//! names.

use super::params::{BindParameters, ParamValue};
use super::policy::MergePolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fully resolved mount parameters
pub type EffectiveMountConfig = BTreeMap<String, String>;

pub const SHARE_KEY: &str = "share";
pub const MOUNT_KEY: &str = "mount";
pub const READONLY_KEY: &str = "readonly";
pub const SOURCE_KEY: &str = "source";

/// Kerberos credentials are accepted on bind but never reach the mount config
pub const CREDENTIAL_KEYS: [&str; 2] = ["kerberosPrincipal", "kerberosKeytab"];

/// Scheme prefixed to every source locator
pub const SOURCE_SCHEME: &str = "nfs://";

/// Base directory for container paths when the caller gives none
pub const DEFAULT_CONTAINER_BASE: &str = "/var/vcap/data";

// =============================================================================
// Mount Mode
// =============================================================================

/// Access mode visible to the consuming application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "r")]
    ReadOnly,
}

impl std::fmt::Display for MountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountMode::ReadWrite => write!(f, "rw"),
            MountMode::ReadOnly => write!(f, "r"),
        }
    }
}

// =============================================================================
// Meta Parameters
// =============================================================================

/// Typed view of the always-recognized parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MetaParameters {
    share: Option<String>,
    mount: Option<String>,
    readonly: bool,
}

impl MetaParameters {
    fn parse(parameters: &BindParameters) -> Result<Self> {
        let share = match parameters.get(SHARE_KEY) {
            Some(value) => Some(expect_text(SHARE_KEY, value)?.to_string()),
            None => None,
        };

        // An empty mount path falls back to the synthesized one
        let mount = match parameters.get(MOUNT_KEY) {
            Some(value) => Some(expect_text(MOUNT_KEY, value)?)
                .filter(|path| !path.is_empty())
                .map(str::to_string),
            None => None,
        };

        let readonly = match parameters.get(READONLY_KEY) {
            Some(value) => value
                .as_bool()
                .ok_or_else(|| Error::invalid(READONLY_KEY, "must be a boolean"))?,
            None => false,
        };

        Ok(Self {
            share,
            mount,
            readonly,
        })
    }
}

fn expect_text<'a>(key: &str, value: &'a ParamValue) -> Result<&'a str> {
    value
        .as_text()
        .ok_or_else(|| Error::invalid(key, "must be a string"))
}

fn is_meta_key(key: &str) -> bool {
    matches!(key, SHARE_KEY | MOUNT_KEY | READONLY_KEY) || CREDENTIAL_KEYS.contains(&key)
}

// =============================================================================
// Merge Result
// =============================================================================

/// Output of a successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedMount {
    /// Configuration handed to the volume driver
    pub config: EffectiveMountConfig,
    /// Mode reported to the consuming application
    pub mode: MountMode,
    /// Caller-requested container path, if any
    pub mount_path: Option<String>,
}

impl MergedMount {
    /// Container path for this mount, synthesized from `base` when the caller
    /// did not ask for one
    pub fn container_dir(&self, base: &str, instance_id: &str) -> String {
        match &self.mount_path {
            Some(path) => path.clone(),
            None => format!("{}/{}", base.trim_end_matches('/'), instance_id),
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Merge caller parameters into the policy defaults
///
/// `fingerprint` is the instance's backend locator, used as the source when
/// the caller does not supply a `share`.
pub fn merge_mount_options(
    policy: &MergePolicy,
    parameters: &BindParameters,
    fingerprint: &str,
) -> Result<MergedMount> {
    let meta = MetaParameters::parse(parameters)?;
    let mut config = policy.default_entries().clone();

    for (key, value) in parameters {
        if is_meta_key(key) {
            continue;
        }
        if policy.allows(key) {
            config.insert(key.clone(), value.to_mount_value());
        } else if policy.is_permissive() {
            debug!("Dropping mount parameter not in allow-list: {}", key);
        } else {
            return Err(Error::invalid(key.as_str(), "not an allowed mount parameter"));
        }
    }

    let source = match &meta.share {
        Some(share) => {
            let share = share.strip_prefix(SOURCE_SCHEME).unwrap_or(share);
            validate_share(share)?;
            format!("{}{}", SOURCE_SCHEME, share)
        }
        None => format!("{}{}", SOURCE_SCHEME, fingerprint),
    };
    config.insert(SOURCE_KEY.to_string(), source);

    let mode = if meta.readonly {
        config.insert(READONLY_KEY.to_string(), "true".to_string());
        MountMode::ReadOnly
    } else {
        MountMode::ReadWrite
    };

    Ok(MergedMount {
        config,
        mode,
        mount_path: meta.mount,
    })
}

/// Validate a caller-supplied share address of the form `host[/path]`
///
/// The host segment ends at the first `/`. A colon inside it would be a
/// second `host:/path` separator and is rejected; colons further along the
/// path are fine.
pub fn validate_share(share: &str) -> Result<()> {
    if share.is_empty() {
        return Err(Error::invalid(SHARE_KEY, "must not be empty"));
    }

    let host = share.split('/').next().unwrap_or(share);
    if host.is_empty() {
        return Err(Error::invalid(SHARE_KEY, "syntax error for share: missing server"));
    }
    if host.contains(':') {
        return Err(Error::invalid(
            SHARE_KEY,
            "syntax error for share: no colon allowed after server",
        ));
    }

    Ok(())
}
