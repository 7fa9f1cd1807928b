//! Candidate lookup along the ancestor chain of a request path.
//!
//! Resolution walks from the file-system root down to the exact request
//! path, so the returned groups are ordered least specific first. The
//! dispatcher consumes them in reverse: the most specific location wins,
//! while registry priority order is preserved within each location.

use std::sync::Arc;

use crate::mock::MockValue;
use crate::registry::MockRegistry;

/// The mocks registered at one location on the ancestor chain.
#[derive(Debug, Clone)]
pub struct CandidateGroup {
    /// The registry path these mocks were resolved at.
    pub location: String,
    /// Registry priority order.
    pub mocks: Vec<Arc<MockValue>>,
}

/// Collect candidate mocks for `path` and all of its ancestors.
///
/// Locations with no registered mocks are discarded. Recursion stops when
/// taking the parent of a path yields the same path again.
pub fn recurse_for_mocks(registry: &MockRegistry, path: &str) -> Vec<CandidateGroup> {
    let parent = parent_path(path);
    let mut groups = if parent == path {
        Vec::new()
    } else {
        recurse_for_mocks(registry, &parent)
    };

    let mocks = registry.get(path);
    if !mocks.is_empty() {
        groups.push(CandidateGroup {
            location: path.to_string(),
            mocks,
        });
    }
    groups
}

fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRank;
    use serde_json::json;

    fn registry_with(routes: &[(&str, &str)]) -> MockRegistry {
        let mut reg = MockRegistry::new();
        for (i, (source, route)) in routes.iter().enumerate() {
            reg.set(
                source,
                SourceRank::Root(0),
                route,
                MockValue::Literal(json!(i)),
            );
        }
        reg
    }

    #[test]
    fn parent_chain_terminates_at_root() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a/b/"), "/a");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn groups_are_ordered_root_to_leaf() {
        let reg = registry_with(&[
            ("/fs/a/b.txt", "/a/b.txt"),
            ("/fs/a", "/a"),
            ("/fs/root", "/"),
        ]);

        let groups = recurse_for_mocks(&reg, "/a/b.txt");
        let locations: Vec<_> = groups.iter().map(|g| g.location.as_str()).collect();
        assert_eq!(locations, vec!["/", "/a", "/a/b.txt"]);
    }

    #[test]
    fn empty_locations_are_discarded() {
        let reg = registry_with(&[("/fs/a/b", "/a/b")]);
        let groups = recurse_for_mocks(&reg, "/a/b");
        let locations: Vec<_> = groups.iter().map(|g| g.location.as_str()).collect();
        assert_eq!(locations, vec!["/a/b"]);
    }

    #[test]
    fn multiple_mocks_at_one_location_keep_registry_order() {
        let mut reg = MockRegistry::new();
        reg.set(
            "/fs/second/x.json",
            SourceRank::Root(1),
            "/x",
            MockValue::Literal(json!("low")),
        );
        reg.set(
            "/fs/first/x.yaml",
            SourceRank::Root(0),
            "/x",
            MockValue::Literal(json!("high")),
        );

        let groups = recurse_for_mocks(&reg, "/x");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].mocks.len(), 2);
        match groups[0].mocks[0].as_ref() {
            MockValue::Literal(v) => assert_eq!(v, &json!("high")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trailing_slash_lookup_walks_real_ancestors() {
        let reg = registry_with(&[("/fs/complex/index.json", "/complex/"), ("/fs/root", "/")]);
        let groups = recurse_for_mocks(&reg, "/complex/");
        let locations: Vec<_> = groups.iter().map(|g| g.location.as_str()).collect();
        assert_eq!(locations, vec!["/", "/complex/"]);
    }
}
