//! # Optimizer Configurations
//!
//! A configuration is the set of optimizers and rules that are *disabled* for one
//! execution of a query. The empty configuration is the baseline: every optimizer
//! and rule stays enabled.
//!
//! ## Identity
//!
//! Configurations are compared as sets. Their canonical form is the sorted,
//! comma-joined list of names (e.g. `"AddExchanges,ReorderJoins"`), which is the
//! key used by storage and by the session properties sent to Presto. The baseline
//! has no key at all (`None`), which keeps it distinct from any named configuration.
//!
//! ## Ordering
//!
//! `Configuration` wraps a `BTreeSet`, so the derived `Ord` compares the sorted name
//! lists lexicographically. The DP search relies on this to emit every stage in a
//! deterministic order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Separator used by the canonical key and by Presto's disabled-list properties.
pub const KEY_SEPARATOR: char = ',';

/// A de-duplicated, sorted set of optimizer/rule names to disable.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    disabled: BTreeSet<String>,
}

impl Configuration {
    /// The baseline configuration: nothing disabled.
    pub fn baseline() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a canonical key. Empty segments are dropped, so `""` yields the baseline.
    pub fn from_key(key: &str) -> Self {
        Self::from_names(
            key.split(KEY_SEPARATOR)
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )
    }

    pub fn is_baseline(&self) -> bool {
        self.disabled.is_empty()
    }

    pub fn len(&self) -> usize {
        self.disabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disabled.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.disabled.iter().map(String::as_str)
    }

    pub fn is_subset(&self, other: &Configuration) -> bool {
        self.disabled.is_subset(&other.disabled)
    }

    /// Set union of two configurations.
    pub fn union(&self, other: &Configuration) -> Configuration {
        Configuration {
            disabled: self.disabled.union(&other.disabled).cloned().collect(),
        }
    }

    /// Canonical identity key, `None` for the baseline.
    pub fn key(&self) -> Option<String> {
        if self.is_baseline() {
            None
        } else {
            Some(self.joined())
        }
    }

    /// Comma-joined names, empty for the baseline.
    pub fn joined(&self) -> String {
        let mut out = String::new();
        for (i, name) in self.disabled.iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEPARATOR);
            }
            out.push_str(name);
        }
        out
    }

    /// Names of this configuration that also appear in `allowed`, in sorted order.
    pub fn restricted_to(&self, allowed: &[String]) -> Vec<String> {
        self.disabled
            .iter()
            .filter(|name| allowed.iter().any(|a| a == *name))
            .cloned()
            .collect()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "[{}]", key),
            None => write!(f, "[baseline]"),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for Configuration {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::from_names(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_is_sorted_and_deduplicated() {
        let config = Configuration::from_names(["ReorderJoins", "AddExchanges", "ReorderJoins"]);
        assert_eq!(config.len(), 2);
        assert_eq!(config.key().as_deref(), Some("AddExchanges,ReorderJoins"));
    }

    #[test]
    fn test_baseline_has_no_key() {
        let baseline = Configuration::baseline();
        assert!(baseline.is_baseline());
        assert_eq!(baseline.key(), None);
        assert_eq!(baseline.joined(), "");
        assert_eq!(baseline.to_string(), "[baseline]");
    }

    #[test]
    fn test_from_key_round_trips_canonical_form() {
        let config = Configuration::from_key("b, a,,c");
        assert_eq!(config.key().as_deref(), Some("a,b,c"));
        assert!(Configuration::from_key("").is_baseline());
    }

    #[test]
    fn test_subset_and_union() {
        let a = Configuration::from_names(["A"]);
        let ab = Configuration::from_names(["A", "B"]);
        assert!(a.is_subset(&ab));
        assert!(!ab.is_subset(&a));
        assert_eq!(a.union(&Configuration::from_names(["B"])), ab);
    }

    #[test]
    fn test_ordering_is_lexicographic_over_sorted_names() {
        let mut configs = vec![
            Configuration::from_names(["b", "c"]),
            Configuration::from_names(["a", "d"]),
            Configuration::from_names(["a", "c"]),
        ];
        configs.sort();
        let keys: Vec<_> = configs.iter().map(|c| c.joined()).collect();
        assert_eq!(keys, vec!["a,c", "a,d", "b,c"]);
    }

    #[test]
    fn test_restricted_to_filters_names() {
        let config = Configuration::from_names(["opt1", "rule1", "rule2"]);
        let rules = vec!["rule1".to_string(), "rule2".to_string()];
        assert_eq!(config.restricted_to(&rules), rules);
    }
}
