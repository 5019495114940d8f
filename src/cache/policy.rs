//! Cache Policies
//!
//! Flags controlling what a request transfers, and the record-level policy that
//! carries per-value overrides.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::value::ValueId;

bitflags! {
    /// Per-request transfer flags. The empty set is the default policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CachePolicy: u32 {
        /// Never materialize record metadata on fetch
        const SKIP_META = 1 << 0;
        /// Never materialize value payloads on fetch
        const SKIP_DATA = 1 << 1;
        /// Succeed with whatever values could be loaded
        const PARTIAL_RECORD = 1 << 2;
        /// Do not consult the upstream tier on fetch
        const QUERY_LOCAL_ONLY = 1 << 3;
        /// Do not push to the upstream tier on store
        const STORE_LOCAL_ONLY = 1 << 4;

        const LOCAL_ONLY = Self::QUERY_LOCAL_ONLY.bits() | Self::STORE_LOCAL_ONLY.bits();
    }
}

impl CachePolicy {
    /// Everything transferred, every tier consulted
    pub const DEFAULT: CachePolicy = CachePolicy::empty();

    /// Parse the comma separated form used in URLs and the CLI
    /// (`meta`, `data`, `partial`, `query-local`, `store-local`).
    pub fn from_query(text: &str) -> Self {
        text.split(',')
            .map(str::trim)
            .fold(Self::DEFAULT, |policy, flag| match flag {
                "meta" => policy | Self::SKIP_META,
                "data" => policy | Self::SKIP_DATA,
                "partial" => policy | Self::PARTIAL_RECORD,
                "query-local" => policy | Self::QUERY_LOCAL_ONLY,
                "store-local" => policy | Self::STORE_LOCAL_ONLY,
                _ => policy,
            })
    }

    /// Inverse of [`CachePolicy::from_query`]
    pub fn to_query(&self) -> String {
        let mut flags = Vec::new();
        if self.contains(Self::SKIP_META) {
            flags.push("meta");
        }
        if self.contains(Self::SKIP_DATA) {
            flags.push("data");
        }
        if self.contains(Self::PARTIAL_RECORD) {
            flags.push("partial");
        }
        if self.contains(Self::QUERY_LOCAL_ONLY) {
            flags.push("query-local");
        }
        if self.contains(Self::STORE_LOCAL_ONLY) {
            flags.push("store-local");
        }
        flags.join(",")
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("default")
        } else {
            f.write_str(&self.to_query())
        }
    }
}

/// Record-wide policy with per-value overrides.
///
/// Metadata always follows the record policy; each value resolves to its
/// override, falling back to the record policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecordPolicy {
    record_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    value_policies: BTreeMap<ValueId, CachePolicy>,
}

impl CacheRecordPolicy {
    /// Policy applied uniformly to the whole record
    pub fn new(record_policy: CachePolicy) -> Self {
        Self {
            record_policy,
            value_policies: BTreeMap::new(),
        }
    }

    /// Start a policy with overrides
    pub fn builder(record_policy: CachePolicy) -> CacheRecordPolicyBuilder {
        CacheRecordPolicyBuilder {
            policy: Self::new(record_policy),
        }
    }

    /// Record default
    #[inline]
    pub fn record_policy(&self) -> CachePolicy {
        self.record_policy
    }

    /// Effective policy for one value
    pub fn value_policy(&self, id: ValueId) -> CachePolicy {
        self.value_policies
            .get(&id)
            .copied()
            .unwrap_or(self.record_policy)
    }

    /// Whether any value overrides the record default
    pub fn has_overrides(&self) -> bool {
        !self.value_policies.is_empty()
    }

    /// Whether metadata should be returned
    pub fn wants_meta(&self) -> bool {
        !self.record_policy.contains(CachePolicy::SKIP_META)
    }

    /// Whether the payload of `id` should be returned
    pub fn wants_data(&self, id: ValueId) -> bool {
        !self.value_policy(id).contains(CachePolicy::SKIP_DATA)
    }

    /// Union of all flags set anywhere in this policy
    pub fn combined(&self) -> CachePolicy {
        self.value_policies
            .values()
            .fold(self.record_policy, |acc, p| acc | *p)
    }

    /// Per-value overrides
    pub fn overrides(&self) -> impl Iterator<Item = (&ValueId, &CachePolicy)> {
        self.value_policies.iter()
    }

    /// Same policy with `flags` cleared on the record and on every override
    pub fn without(&self, flags: CachePolicy) -> Self {
        Self {
            record_policy: self.record_policy - flags,
            value_policies: self
                .value_policies
                .iter()
                .map(|(id, policy)| (*id, *policy - flags))
                .collect(),
        }
    }
}

impl From<CachePolicy> for CacheRecordPolicy {
    fn from(policy: CachePolicy) -> Self {
        Self::new(policy)
    }
}

/// Builder for [`CacheRecordPolicy`]
#[derive(Debug, Clone)]
pub struct CacheRecordPolicyBuilder {
    policy: CacheRecordPolicy,
}

impl CacheRecordPolicyBuilder {
    /// Override the policy of one value
    pub fn value(mut self, id: ValueId, policy: CachePolicy) -> Self {
        self.policy.value_policies.insert(id, policy);
        self
    }

    /// Finish
    pub fn build(self) -> CacheRecordPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(CachePolicy::DEFAULT.is_empty());
        assert_eq!(CachePolicy::default(), CachePolicy::DEFAULT);
        assert_eq!(CachePolicy::DEFAULT.to_string(), "default");
    }

    #[test]
    fn test_query_form() {
        let policy = CachePolicy::from_query("meta, data,unknown");
        assert_eq!(policy, CachePolicy::SKIP_META | CachePolicy::SKIP_DATA);
        assert_eq!(CachePolicy::from_query(&policy.to_query()), policy);
        assert_eq!(CachePolicy::from_query(""), CachePolicy::DEFAULT);
        assert_eq!(
            CachePolicy::from_query("query-local,store-local"),
            CachePolicy::LOCAL_ONLY
        );
    }

    #[test]
    fn test_value_override_resolution() {
        let big = ValueId::from_name("Big");
        let small = ValueId::from_name("Small");
        let policy = CacheRecordPolicy::builder(CachePolicy::DEFAULT)
            .value(big, CachePolicy::SKIP_DATA)
            .build();

        assert!(policy.has_overrides());
        assert!(!policy.wants_data(big));
        assert!(policy.wants_data(small));
        assert!(policy.wants_meta());
        assert_eq!(policy.combined(), CachePolicy::SKIP_DATA);
    }

    #[test]
    fn test_without_clears_overrides() {
        let id = ValueId::from_name("Partial");
        let policy = CacheRecordPolicy::builder(CachePolicy::SKIP_META | CachePolicy::PARTIAL_RECORD)
            .value(id, CachePolicy::SKIP_DATA | CachePolicy::PARTIAL_RECORD)
            .build();

        let stripped = policy.without(CachePolicy::SKIP_META | CachePolicy::SKIP_DATA);
        assert_eq!(stripped.record_policy(), CachePolicy::PARTIAL_RECORD);
        assert_eq!(stripped.value_policy(id), CachePolicy::PARTIAL_RECORD);
        assert!(stripped.has_overrides());
    }

    #[test]
    fn test_skip_meta_follows_record_policy() {
        let id = ValueId::from_name("V");
        let policy = CacheRecordPolicy::builder(CachePolicy::SKIP_META)
            .value(id, CachePolicy::DEFAULT)
            .build();
        assert!(!policy.wants_meta());
        assert!(policy.wants_data(id));
    }

    #[test]
    fn test_from_flags() {
        let policy: CacheRecordPolicy = CachePolicy::SKIP_DATA.into();
        assert!(!policy.has_overrides());
        assert!(!policy.wants_data(ValueId::from_name("Any")));
    }
}
