//! Graph paths.
//!
//! A path is an ordered list of segments locating a position in the graph:
//! `[type, id]` for a record, `[type, id, attr]` for an attribute,
//! `[type, id, "rel", link]` for a relationship container and
//! `[type, id, "rel", link, related_id]` for one hasMany member. Path shape
//! alone classifies an operation; no out-of-band tagging is carried.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker segment separating a record's identity from its relationship map.
pub const REL_MARKER: &str = "rel";

/// An ordered list of segments locating a record, attribute, relationship
/// container, or relationship member in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<String>);

/// Classification of a path by its segment shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathShape {
    /// `[type, id]`
    Record,
    /// `[type, id, attr]`
    Attribute,
    /// `[type, id, "rel", link]`
    Link,
    /// `[type, id, "rel", link, related_id]`
    LinkMember,
    /// Anything else; never produced by this workspace's own components.
    Malformed,
}

impl Path {
    /// Builds a record path `[type, id]`.
    pub fn record(model: impl Into<String>, id: impl Into<String>) -> Self {
        Path(vec![model.into(), id.into()])
    }

    /// Builds an attribute path `[type, id, attr]`.
    pub fn attribute(
        model: impl Into<String>,
        id: impl Into<String>,
        attr: impl Into<String>,
    ) -> Self {
        Path(vec![model.into(), id.into(), attr.into()])
    }

    /// Builds a relationship container path `[type, id, "rel", link]`.
    pub fn link(model: impl Into<String>, id: impl Into<String>, link: impl Into<String>) -> Self {
        Path(vec![
            model.into(),
            id.into(),
            REL_MARKER.to_string(),
            link.into(),
        ])
    }

    /// Builds a hasMany member path `[type, id, "rel", link, related_id]`.
    pub fn link_member(
        model: impl Into<String>,
        id: impl Into<String>,
        link: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Path(vec![
            model.into(),
            id.into(),
            REL_MARKER.to_string(),
            link.into(),
            member.into(),
        ])
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Path(segments)
    }

    /// Parses a `/`-joined canonical path string.
    pub fn parse(raw: &str) -> Self {
        Path(raw.split('/').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn shape(&self) -> PathShape {
        match self.0.len() {
            2 => PathShape::Record,
            3 if self.0[2] != REL_MARKER => PathShape::Attribute,
            4 if self.0[2] == REL_MARKER => PathShape::Link,
            5 if self.0[2] == REL_MARKER => PathShape::LinkMember,
            _ => PathShape::Malformed,
        }
    }

    /// The model name (first segment).
    pub fn model(&self) -> &str {
        &self.0[0]
    }

    /// The record id (second segment).
    pub fn id(&self) -> &str {
        &self.0[1]
    }

    /// The link name of a `Link` or `LinkMember` path.
    pub fn link_name(&self) -> &str {
        &self.0[3]
    }

    /// The related id of a `LinkMember` path.
    pub fn member_id(&self) -> &str {
        &self.0[4]
    }

    /// The attribute name of an `Attribute` path.
    pub fn attribute_name(&self) -> &str {
        &self.0[2]
    }

    /// The `[type, id]` prefix of this path.
    pub fn record_path(&self) -> Path {
        Path(self.0[..2].to_vec())
    }

    /// The `[type, id, "rel", link]` prefix of a `LinkMember` path.
    pub fn container_path(&self) -> Path {
        Path(self.0[..4].to_vec())
    }

    /// Extends this path with one extra segment.
    pub fn join(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// Canonical `/`-joined string form, used as a map key throughout the
    /// engine.
    pub fn canonical(&self) -> String {
        self.0.join("/")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
