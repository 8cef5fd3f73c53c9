//! Declared property paths and their bootstrap-resolved form.

use super::{extract_values, ContainerExtractor, ReindexOnUpdate};
use crate::model::PropertyValue;
use std::fmt;

/// A dotted path as declared by a binding (`author.name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Value,
    Embedded { target: String },
    Association { target: String },
}

/// One hop of a resolved path.
///
/// Everything the runtime needs is copied in here at bootstrap so that
/// resolution and derivation never consult the mapping model again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Type declaring `property`.
    pub owner: String,
    pub property: String,
    pub kind: SegmentKind,
    pub extractors: Vec<ContainerExtractor>,
    pub policy: ReindexOnUpdate,
}

impl PathSegment {
    /// Values of this segment's property on `properties`, after extraction.
    pub fn read(&self, properties: &crate::model::Properties) -> Vec<PropertyValue> {
        properties
            .get(&self.property)
            .map(|v| extract_values(&self.extractors, v))
            .unwrap_or_default()
    }

    pub fn association_target(&self) -> Option<&str> {
        match &self.kind {
            SegmentKind::Association { target } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyPath {
    segments: Vec<PathSegment>,
}

impl DependencyPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// `self` followed by `rest`.
    #[must_use]
    pub fn join(&self, rest: &DependencyPath) -> DependencyPath {
        let mut segments = self.segments.clone();
        segments.extend(rest.segments.iter().cloned());
        Self { segments }
    }

    #[must_use]
    pub fn child(&self, segment: PathSegment) -> DependencyPath {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl fmt::Display for DependencyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("<root>");
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&seg.property)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        let p = PropertyPath::parse("author.address.city");
        assert_eq!(p.names(), &["author", "address", "city"]);
        assert_eq!(p.to_string(), "author.address.city");
        assert!(PropertyPath::parse("").is_root());
        assert_eq!(PropertyPath::parse(" a. .b ").names(), &["a", "b"]);
    }

    #[test]
    fn test_dependency_path_display() {
        let seg = |name: &str| PathSegment {
            owner: "Book".into(),
            property: name.into(),
            kind: SegmentKind::Value,
            extractors: vec![],
            policy: ReindexOnUpdate::Default,
        };
        let path = DependencyPath::new(vec![seg("author")]).child(seg("name"));
        assert_eq!(path.to_string(), "author.name");
        assert_eq!(DependencyPath::default().to_string(), "<root>");
    }
}
