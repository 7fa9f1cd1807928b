//! The live routing table: URL path -> ordered mock entries.
//!
//! Entries are immutable once stored and replaced wholesale on reload. Within
//! a path's list, ties break by owning glob-root priority, then non-`.json`
//! before `.json` sources, then natural source-path order. The ordering is
//! recomputed on every mutation of that path's list.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::mock::MockValue;

/// Priority rank of a mock's origin.
///
/// Config-registered mocks outrank every file-system root; among roots,
/// earlier-declared globs outrank later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceRank {
    Inline,
    Root(usize),
}

/// One registered mock.
#[derive(Debug, Clone)]
pub struct MockEntry {
    /// Identifier of origin: an absolute file path, or a synthetic id for
    /// config- and API-registered mocks.
    pub source: String,
    pub rank: SourceRank,
    pub value: Arc<MockValue>,
}

/// Path-indexed mock storage.
#[derive(Debug, Default)]
pub struct MockRegistry {
    routes: HashMap<String, Vec<MockEntry>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a mock under `route` and its alias forms.
    ///
    /// Re-registering the same source replaces the previous entry; the
    /// route's ordering is recomputed.
    pub fn set(&mut self, source: &str, rank: SourceRank, route: &str, value: MockValue) {
        let value = Arc::new(value);
        for alias in route_aliases(route) {
            let entries = self.routes.entry(alias).or_default();
            entries.retain(|e| e.source != source);
            entries.push(MockEntry {
                source: source.to_string(),
                rank,
                value: Arc::clone(&value),
            });
            entries.sort_by(entry_order);
        }
    }

    /// Auto-wrap raw file bytes as a GET descriptor before storage.
    pub fn set_raw(&mut self, source: &str, rank: SourceRank, route: &str, bytes: Vec<u8>) {
        self.set(source, rank, route, MockValue::from_raw(route, bytes));
    }

    /// Remove every entry whose source matches, across all routes.
    pub fn remove(&mut self, source: &str) {
        for entries in self.routes.values_mut() {
            entries.retain(|e| e.source != source);
        }
        self.routes.retain(|_, entries| !entries.is_empty());
    }

    /// The ordered mock values registered at exactly this path.
    pub fn get(&self, route: &str) -> Vec<Arc<MockValue>> {
        self.routes
            .get(route)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.value)).collect())
            .unwrap_or_default()
    }

    /// Number of distinct routes with at least one entry.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    #[cfg(test)]
    fn sources_at(&self, route: &str) -> Vec<String> {
        self.routes
            .get(route)
            .map(|entries| entries.iter().map(|e| e.source.clone()).collect())
            .unwrap_or_default()
    }
}

/// The alias forms a route is addressable under.
///
/// Directory-like routes (no extension) are indexed with and without a
/// trailing slash; `.json` routes are additionally indexed at their
/// undecorated form, so `/foo.json`, `/foo` and `/foo/` stay in sync.
fn route_aliases(route: &str) -> Vec<String> {
    let mut aliases = vec![route.to_string()];
    if let Some(stem) = route.strip_suffix(".json") {
        if !stem.is_empty() && !stem.ends_with('/') {
            aliases.push(stem.to_string());
            aliases.push(format!("{stem}/"));
        }
    } else if route != "/" && route.ends_with('/') {
        aliases.push(route.trim_end_matches('/').to_string());
    } else if route != "/" && !has_extension(route) {
        aliases.push(format!("{route}/"));
    }
    aliases
}

fn has_extension(route: &str) -> bool {
    route
        .rsplit('/')
        .next()
        .map(|segment| segment.contains('.'))
        .unwrap_or(false)
}

fn entry_order(a: &MockEntry, b: &MockEntry) -> Ordering {
    a.rank
        .cmp(&b.rank)
        .then_with(|| is_json_source(&a.source).cmp(&is_json_source(&b.source)))
        .then_with(|| natural_compare(&a.source, &b.source))
}

fn is_json_source(source: &str) -> bool {
    source.ends_with(".json")
}

/// Natural source-path ordering: digit runs compare numerically, letters
/// compare case-insensitively, and a case difference alone puts upper-case
/// first.
pub(crate) fn natural_compare(a: &str, b: &str) -> Ordering {
    natural_primary(a, b).then_with(|| case_tiebreak(a, b))
}

fn natural_primary(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();
    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let run_a = take_digits(&mut ia);
                    let run_b = take_digits(&mut ib);
                    let trimmed_a = run_a.trim_start_matches('0');
                    let trimmed_b = run_b.trim_start_matches('0');
                    let ord = trimmed_a
                        .len()
                        .cmp(&trimmed_b.len())
                        .then_with(|| trimmed_a.cmp(trimmed_b));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                } else {
                    let ord = ca.to_lowercase().cmp(cb.to_lowercase());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ia.next();
                    ib.next();
                }
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(*c);
        chars.next();
    }
    run
}

fn case_tiebreak(a: &str, b: &str) -> Ordering {
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            return match (ca.is_uppercase(), cb.is_uppercase()) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => ca.cmp(&cb),
            };
        }
    }
    a.len().cmp(&b.len())
}
