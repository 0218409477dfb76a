//! Merge Policy
//!
//! Operator-supplied description of which mount parameters a caller may set
//! and which defaults apply when the caller leaves them out.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default entry that also switches the policy into permissive mode
pub const SLOPPY_MOUNT_KEY: &str = "sloppy_mount";

// =============================================================================
// Merge Policy
// =============================================================================

/// Allow-list and defaults governing bind-time mount parameters
///
/// Immutable once built. Share it behind an `Arc`; merging never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Parameter names a caller may override
    allowed_keys: BTreeSet<String>,
    /// Values applied when the caller omits a key
    default_entries: BTreeMap<String, String>,
    /// Drop unknown keys instead of rejecting them
    permissive: bool,
}

impl MergePolicy {
    /// Build a policy from already-split parts
    pub fn new<K, D, V>(allowed_keys: K, default_entries: D, permissive: bool) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        D: IntoIterator<Item = (V, V)>,
        V: Into<String>,
    {
        Self {
            allowed_keys: allowed_keys.into_iter().map(Into::into).collect(),
            default_entries: default_entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            permissive,
        }
    }

    /// Parse operator configuration
    ///
    /// `allowed` is a comma-separated key list; `defaults` is a comma-separated
    /// list of `key:value` pairs. A `sloppy_mount:true` default also turns on
    /// permissive mode.
    pub fn from_conf(allowed: &str, defaults: &str, permissive: bool) -> Result<Self> {
        let allowed_keys: BTreeSet<String> = split_list(allowed).map(str::to_string).collect();

        let mut default_entries = BTreeMap::new();
        for pair in split_list(defaults) {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                Error::Configuration(format!(
                    "default option '{}' is not a key:value pair",
                    pair
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Configuration(format!(
                    "default option '{}' has an empty key",
                    pair
                )));
            }
            default_entries.insert(key.to_string(), value.trim().to_string());
        }

        let sloppy = default_entries
            .get(SLOPPY_MOUNT_KEY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            allowed_keys,
            default_entries,
            permissive: permissive || sloppy,
        })
    }

    /// Check whether a caller may set `key`
    #[inline]
    pub fn allows(&self, key: &str) -> bool {
        self.allowed_keys.contains(key)
    }

    pub fn allowed_keys(&self) -> &BTreeSet<String> {
        &self.allowed_keys
    }

    pub fn default_entries(&self) -> &BTreeMap<String, String> {
        &self.default_entries
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_from_conf() {
        let policy = MergePolicy::from_conf(
            "allow_other, allow_root,uid,gid",
            "uid:1000,gid:1000",
            false,
        )
        .unwrap();

        assert!(policy.allows("allow_root"));
        assert!(policy.allows("gid"));
        assert!(!policy.allows("sloppy_mount"));
        assert_eq!(policy.default_entries()["uid"], "1000");
        assert!(!policy.is_permissive());
    }

    #[test]
    fn test_empty_conf() {
        let policy = MergePolicy::from_conf("", "", false).unwrap();
        assert!(policy.allowed_keys().is_empty());
        assert!(policy.default_entries().is_empty());
    }

    #[test]
    fn test_sloppy_mount_default_is_permissive() {
        let policy = MergePolicy::from_conf("", "sloppy_mount:true", false).unwrap();
        assert!(policy.is_permissive());
        assert_eq!(policy.default_entries()[SLOPPY_MOUNT_KEY], "true");

        let policy = MergePolicy::from_conf("", "sloppy_mount:false", false).unwrap();
        assert!(!policy.is_permissive());
    }

    #[test]
    fn test_default_value_may_contain_colons() {
        let policy = MergePolicy::from_conf("", "domain:ad:example.com", false).unwrap();
        assert_eq!(policy.default_entries()["domain"], "ad:example.com");
    }

    #[test]
    fn test_malformed_defaults() {
        assert_matches!(
            MergePolicy::from_conf("", "uid", false),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            MergePolicy::from_conf("", ":1000", false),
            Err(Error::Configuration(_))
        );
    }
}
