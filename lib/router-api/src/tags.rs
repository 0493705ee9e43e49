use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Sorted, deduplicated set of service tags.
///
/// Tags are kept in a `BTreeSet` so that two sets built from the same tags in
/// a different order compare, hash and serialize identically. This is what
/// makes `(service, tags)` usable as a snapshot bucket key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        self.0.insert(tag.into())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// True when every tag of `other` is also present in `self`.
    /// Any set is a superset of the empty set.
    pub fn is_superset(&self, other: &TagSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// True when the two sets share at least one tag.
    pub fn intersects(&self, other: &TagSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Parse a comma separated list (`"svc,1"`), ignoring blank entries.
    pub fn parse_list(raw: &str) -> Self {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", tag)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent_equality() {
        let a: TagSet = ["svc", "1"].into_iter().collect();
        let b: TagSet = ["1", "svc", "1"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.to_string(), "{1,svc}");
    }

    #[test]
    fn test_superset() {
        let tags: TagSet = ["svc", "1"].into_iter().collect();
        assert!(tags.is_superset(&TagSet::new()));
        assert!(tags.is_superset(&["1"].into_iter().collect()));
        assert!(!tags.is_superset(&["1", "2"].into_iter().collect()));
    }

    #[test]
    fn test_parse_list() {
        let tags = TagSet::parse_list(" svc, 1,,");
        assert_eq!(tags, ["svc", "1"].into_iter().collect());
        assert!(TagSet::parse_list("").is_empty());
    }

    #[test]
    fn test_serde_as_array() {
        let tags: TagSet = ["b", "a"].into_iter().collect();
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: TagSet = serde_json::from_str(r#"["b","a","a"]"#).unwrap();
        assert_eq!(back, tags);
    }
}
