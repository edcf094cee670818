//! Hierarchical store paths.

use std::fmt;

/// A location in the hierarchical store.
///
/// A path is an ordered sequence of non-empty segment strings and is always
/// held normalized: parsing drops empty segments, so `"/a/b/"`, `"a/b"` and
/// `"/a//b"` all denote the same path. The root path has no segments.
///
/// Paths form a tree: ancestors and descendants are determined by
/// segment-sequence prefixing, never by string prefixing (`/ab` is not a
/// descendant of `/a`).
///
/// The derived ordering compares segment sequences lexicographically, which
/// places every descendant of a path directly after it in a sorted
/// collection. The path index relies on this for range scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Returns the root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a path from its string form.
    ///
    /// Leading, trailing, and repeated separators are tolerated and
    /// normalized away. `"/"` and `""` both parse to the root path.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self {
            segments: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Builds a path from segments, dropping empty ones.
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Returns the path's segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns the last segment, if any.
    #[must_use]
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the path with `segment` appended.
    ///
    /// An empty segment yields the same path.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        if !segment.is_empty() {
            segments.push(segment.to_string());
        }
        Self { segments }
    }

    /// Returns the path with all of `other`'s segments appended.
    #[must_use]
    pub fn join(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns the parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns true if this path equals `prefix` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Returns true if `other` lies strictly beneath this path.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.depth() > self.depth() && other.starts_with(self)
    }

    /// Returns this path's segments relative to `ancestor`.
    ///
    /// Returns `None` if this path does not start with `ancestor`. A path
    /// relative to itself is the root path.
    #[must_use]
    pub fn relative_to(&self, ancestor: &Path) -> Option<Self> {
        if !self.starts_with(ancestor) {
            return None;
        }
        Some(Self {
            segments: self.segments[ancestor.segments.len()..].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}
