//! Tag visibility rules

use router_api::{TagFilterConfig, TagFilterMode, TagSet};

/// Visibility under the default policy: the instance must carry every
/// allowlisted tag. An empty allowlist admits everything.
pub fn is_visible(tags: &TagSet, allowlist: &TagSet) -> bool {
    allowlist.is_empty() || tags.is_superset(allowlist)
}

/// Visibility predicate bound to a configuration. Pure: the result depends
/// only on the instance tags and the configured allowlist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagFilter {
    config: TagFilterConfig,
}

impl TagFilter {
    pub fn new(config: TagFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TagFilterConfig {
        &self.config
    }

    pub fn is_visible(&self, tags: &TagSet) -> bool {
        match self.config.mode {
            TagFilterMode::All => is_visible(tags, &self.config.allowlist),
            TagFilterMode::Any => {
                self.config.allowlist.is_empty() || tags.intersects(&self.config.allowlist)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> TagSet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_empty_allowlist_admits_everything() {
        assert!(is_visible(&tags(&[]), &tags(&[])));
        assert!(is_visible(&tags(&["svc", "3"]), &tags(&[])));
    }

    #[test]
    fn test_superset_policy() {
        let allowlist = tags(&["1", "2"]);
        assert!(is_visible(&tags(&["svc", "1", "2"]), &allowlist));
        assert!(!is_visible(&tags(&["svc", "1"]), &allowlist));
        assert!(!is_visible(&tags(&["svc", "3"]), &allowlist));
    }

    #[test]
    fn test_matches_definition_exhaustively() {
        // every subset of a small universe against every other subset
        let universe = ["a", "b", "c"];
        let subsets: Vec<TagSet> = (0..8u8)
            .map(|mask| {
                universe
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, t)| *t)
                    .collect()
            })
            .collect();

        for t in &subsets {
            for a in &subsets {
                let expected = a.is_empty() || a.iter().all(|tag| t.contains(tag));
                assert_eq!(is_visible(t, a), expected, "tags={} allowlist={}", t, a);
            }
        }
    }

    #[test]
    fn test_any_mode() {
        let filter =
            TagFilter::new(TagFilterConfig::new(tags(&["1", "2"])).with_mode(TagFilterMode::Any));
        assert!(filter.is_visible(&tags(&["svc", "1"])));
        assert!(filter.is_visible(&tags(&["svc", "2"])));
        assert!(!filter.is_visible(&tags(&["svc", "3"])));
        assert!(!filter.is_visible(&tags(&[])));
    }

    #[test]
    fn test_all_mode_is_default() {
        let filter = TagFilter::new(TagFilterConfig::new(tags(&["1", "2"])));
        assert!(!filter.is_visible(&tags(&["svc", "1"])));
        assert!(filter.is_visible(&tags(&["1", "2", "svc"])));
    }
}
