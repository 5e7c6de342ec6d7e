//! Hierarchical path identifiers for groups and apps.
//!
//! A `PathId` names a node in the group tree. Paths are ordered sequences
//! of non-empty segments plus an absolute flag; the empty absolute path is
//! the root and renders as `/`. Relative paths exist only transiently in
//! user input and are resolved against an absolute base before use.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::PathError;

/// A hierarchical identifier such as `/prod/api/web`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId {
    segments: Vec<String>,
    absolute: bool,
}

impl PathId {
    /// The absolute empty path.
    #[must_use]
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            absolute: true,
        }
    }

    /// Builds an absolute path from pre-validated segments.
    pub fn from_segments<I>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self {
            segments,
            absolute: true,
        })
    }

    /// Parses a path from its `/`-joined form.
    ///
    /// A leading `/` marks the path absolute; `""` parses as the relative
    /// empty path and `"/"` as the root. A trailing `/` is tolerated.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let absolute = s.starts_with('/');
        let trimmed = s.trim_matches('/');

        let segments = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed
                .split('/')
                .map(|segment| {
                    validate_segment(segment)?;
                    Ok(segment.to_string())
                })
                .collect::<Result<Vec<_>, PathError>>()?
        };

        Ok(Self { segments, absolute })
    }

    /// True for the absolute empty path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    /// True if the path carries a leading `/`.
    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Path segments in order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path. The root is its own parent.
    #[must_use]
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            segments,
            absolute: self.absolute,
        }
    }

    /// Resolves this path against an absolute base.
    ///
    /// An absolute receiver is returned unchanged; a relative one has its
    /// segments appended to `base`.
    #[must_use]
    pub fn canonical_path(&self, base: &PathId) -> Self {
        if self.absolute {
            return self.clone();
        }
        let mut segments = base.segments.clone();
        segments.extend(self.segments.iter().cloned());
        Self {
            segments,
            absolute: true,
        }
    }

    /// True if `other` lives in the subtree rooted at `self` (inclusive).
    #[must_use]
    pub fn contains(&self, other: &PathId) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// True if `self` is a direct child of `parent`.
    #[must_use]
    pub fn is_child_of(&self, parent: &PathId) -> bool {
        !self.segments.is_empty() && self.parent().segments == parent.segments
    }

    /// Returns the path extended by one segment.
    pub fn append(&self, segment: &str) -> Result<Self, PathError> {
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self {
            segments,
            absolute: self.absolute,
        })
    }

    /// All ancestor paths from the root down to (and excluding) `self`.
    ///
    /// Only meaningful for absolute paths; the root has no ancestors.
    #[must_use]
    pub fn ancestors(&self) -> Vec<PathId> {
        (0..self.segments.len())
            .map(|n| Self {
                segments: self.segments[..n].to_vec(),
                absolute: self.absolute,
            })
            .collect()
    }
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    let valid = segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_'));
    if !valid || segment == "." || segment == ".." {
        return Err(PathError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "/")?;
        }
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
