//! Slot naming contract.
//!
//! Slot `index` (zero-based) is named `{prefix}-{index + 1}`. The numeric
//! part is a plain positive decimal: no sign, no leading zeros, so every
//! index has exactly one spelling and [`SlotNamer::index_of`] is the exact
//! inverse of [`SlotNamer::name_for`].

use crate::NameError;

/// Prefix used when none is configured.
pub const DEFAULT_SLOT_PREFIX: &str = "slot";

/// Maps slot indices to names and back. Pure; holds only the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNamer {
    prefix: String,
}

impl SlotNamer {
    /// Create a namer for the given prefix.
    ///
    /// The prefix must be usable inside a DNS label (Kubernetes namespace
    /// names are the strictest consumer): lowercase ASCII letters, digits
    /// and `-`, starting with a letter and not ending with `-`.
    pub fn new(prefix: impl Into<String>) -> Result<Self, NameError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of the slot at `index`.
    pub fn name_for(&self, index: u32) -> String {
        format!("{}-{}", self.prefix, u64::from(index) + 1)
    }

    /// Index encoded in `name`, if it matches the pool pattern exactly.
    pub fn index_of(&self, name: &str) -> Option<u32> {
        let digits = name.strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if digits.starts_with('0') {
            return None;
        }

        let ordinal: u64 = digits.parse().ok()?;
        u32::try_from(ordinal - 1).ok()
    }

    /// Whether `name` follows the pool naming pattern.
    pub fn is_pool_name(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Index of `name` if it is a pool name within `capacity`.
    pub fn index_in(&self, name: &str, capacity: u32) -> Option<u32> {
        self.index_of(name).filter(|index| *index < capacity)
    }

    /// All slot names of a pool with `capacity`, ascending by index.
    pub fn names(&self, capacity: u32) -> impl Iterator<Item = String> + '_ {
        (0..capacity).map(move |index| self.name_for(index))
    }
}

impl Default for SlotNamer {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_SLOT_PREFIX.to_string(),
        }
    }
}

fn validate_prefix(prefix: &str) -> Result<(), NameError> {
    let invalid = |reason| NameError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason,
    };

    let Some(first) = prefix.chars().next() else {
        return Err(NameError::Empty);
    };
    if !first.is_ascii_lowercase() {
        return Err(invalid("must start with a lowercase letter"));
    }
    if prefix.ends_with('-') {
        return Err(invalid("must not end with '-'"));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    // Leaves room for "-" plus the widest u32 ordinal inside a 63 char label.
    if prefix.len() > 52 {
        return Err(invalid("too long"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_names_are_one_based() {
        let namer = SlotNamer::default();
        assert_eq!(namer.name_for(0), "slot-1");
        assert_eq!(namer.name_for(9), "slot-10");
        assert_eq!(namer.index_of("slot-10"), Some(9));
    }

    #[test]
    fn test_names_ascending() {
        let namer = SlotNamer::new("ns").unwrap();
        let names: Vec<_> = namer.names(3).collect();
        assert_eq!(names, vec!["ns-1", "ns-2", "ns-3"]);
    }

    #[rstest]
    #[case("slot-0")]
    #[case("slot-01")]
    #[case("slot-")]
    #[case("slot")]
    #[case("slot-+1")]
    #[case("slot--1")]
    #[case("slot-1a")]
    #[case("slot-1 ")]
    #[case("xslot-1")]
    #[case("Slot-1")]
    #[case("slots-1")]
    #[case("slot-4294967297")]
    #[case("")]
    fn test_rejects_foreign_names(#[case] name: &str) {
        let namer = SlotNamer::default();
        assert!(!namer.is_pool_name(name), "{name:?} should be rejected");
    }

    #[test]
    fn test_largest_index() {
        let namer = SlotNamer::default();
        let name = namer.name_for(u32::MAX);
        assert_eq!(name, "slot-4294967296");
        assert_eq!(namer.index_of(&name), Some(u32::MAX));
    }

    #[test]
    fn test_index_in_respects_capacity() {
        let namer = SlotNamer::default();
        assert_eq!(namer.index_in("slot-3", 3), Some(2));
        assert_eq!(namer.index_in("slot-4", 3), None);
        assert!(namer.is_pool_name("slot-4"));
    }

    #[rstest]
    #[case("1slot")]
    #[case("slot-")]
    #[case("SLOT")]
    #[case("my_pool")]
    fn test_prefix_rejected(#[case] prefix: &str) {
        assert!(SlotNamer::new(prefix).unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_prefix_accepted() {
        assert_eq!(SlotNamer::new("ci-ns").unwrap().name_for(0), "ci-ns-1");
        assert_eq!(SlotNamer::new("").unwrap_err(), NameError::Empty);
    }

    proptest! {
        #[test]
        fn prop_name_index_inverse(capacity in 1u32..5000, seed in any::<u32>()) {
            let namer = SlotNamer::default();
            let index = seed % capacity;
            let name = namer.name_for(index);
            prop_assert!(namer.is_pool_name(&name));
            prop_assert_eq!(namer.index_in(&name, capacity), Some(index));
        }

        #[test]
        fn prop_names_unique(capacity in 1u32..300) {
            let namer = SlotNamer::default();
            let names: std::collections::HashSet<_> = namer.names(capacity).collect();
            prop_assert_eq!(names.len(), capacity as usize);
        }

        #[test]
        fn prop_arbitrary_names_roundtrip_or_reject(name in "[a-z0-9+-]{0,12}") {
            let namer = SlotNamer::default();
            if let Some(index) = namer.index_of(&name) {
                prop_assert_eq!(namer.name_for(index), name);
            }
        }
    }
}
