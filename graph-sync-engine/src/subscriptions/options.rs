//! Include options: which relationship subtrees a subscription covers.
//!
//! A nested tree of link names, built from dotted include strings such as
//! `"tasks.assignee"`. Options only ever grow on a live subscription: a new
//! request triggers a refresh only when it covers links the applied options
//! do not.
use std::collections::BTreeMap;

/// A tree of link names selecting which relationships to follow when
/// subscribing to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeOptions {
    links: BTreeMap<String, IncludeOptions>,
}

impl IncludeOptions {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parses dotted include strings: `["tasks.assignee", "owner"]` becomes
    /// `{tasks: {assignee: {}}, owner: {}}`.
    pub fn from_includes<S: AsRef<str>>(includes: &[S]) -> Self {
        let mut options = IncludeOptions::none();
        for include in includes {
            let mut node = &mut options;
            for segment in include.as_ref().split('.').filter(|s| !s.is_empty()) {
                node = node.links.entry(segment.to_string()).or_default();
            }
        }
        options
    }

    /// Every listed link included one level deep.
    pub fn from_links<S: AsRef<str>>(links: &[S]) -> Self {
        IncludeOptions {
            links: links
                .iter()
                .map(|link| (link.as_ref().to_string(), IncludeOptions::none()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn includes_link(&self, link: &str) -> bool {
        self.links.contains_key(link)
    }

    /// Included link names at this level.
    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// The sub-options to apply when following `link`.
    pub fn for_link(&self, link: &str) -> IncludeOptions {
        self.links.get(link).cloned().unwrap_or_default()
    }

    /// These options plus `link` at the top level, preserving everything
    /// already present. Used when a hasMany subscribes its members with the
    /// inverse link included.
    pub fn with_link(&self, link: &str) -> IncludeOptions {
        let mut merged = self.clone();
        merged.links.entry(link.to_string()).or_default();
        merged
    }

    /// Deep union of two option trees.
    pub fn union(&self, other: &IncludeOptions) -> IncludeOptions {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    fn merge(&mut self, other: &IncludeOptions) {
        for (link, sub) in &other.links {
            self.links.entry(link.clone()).or_default().merge(sub);
        }
    }

    /// True when every link this tree covers is also covered by `other`, at
    /// every depth.
    pub fn is_subset_of(&self, other: &IncludeOptions) -> bool {
        self.links.iter().all(|(link, sub)| {
            other
                .links
                .get(link)
                .is_some_and(|other_sub| sub.is_subset_of(other_sub))
        })
    }

    /// True when `self` covers something `other` does not.
    pub fn exceeds(&self, other: &IncludeOptions) -> bool {
        !self.is_subset_of(other)
    }
}
