//! Structured, immutable repository paths.
//!
//! A [`Path`] is a sequence of [`PathElement`]s. Absolute paths start with
//! [`PathElement::Root`]. Named elements carry a 1-based same-name-sibling
//! index; index 1 is the default and is omitted when displayed.
//!
//! ```
//! use cairn_types::Path;
//!
//! let path: Path = "/content/page[2]/jcr:content".parse().unwrap();
//! assert!(path.is_absolute());
//! assert_eq!(path.depth(), 3);
//! assert_eq!(path.parent().unwrap().to_string(), "/content/page[2]");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::name::Name;

/// Default same-name-sibling index.
pub const DEFAULT_INDEX: u32 = 1;

/// One element of a [`Path`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathElement {
    /// The root node. Only valid as the first element.
    Root,
    /// `.`
    Current,
    /// `..`
    Parent,
    /// A named element with its same-name-sibling index.
    Named { name: Name, index: u32 },
}

impl PathElement {
    pub fn named(name: Name) -> Self {
        Self::Named {
            name,
            index: DEFAULT_INDEX,
        }
    }

    pub fn indexed(name: Name, index: u32) -> Self {
        Self::Named { name, index }
    }

    pub fn name(&self) -> Option<&Name> {
        match self {
            Self::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            Self::Named { index, .. } => *index,
            _ => DEFAULT_INDEX,
        }
    }

    fn is_named(&self) -> bool {
        matches!(self, Self::Named { .. })
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => Ok(()),
            Self::Current => write!(f, "."),
            Self::Parent => write!(f, ".."),
            Self::Named { name, index } if *index == DEFAULT_INDEX => write!(f, "{name}"),
            Self::Named { name, index } => write!(f, "{name}[{index}]"),
        }
    }
}

impl fmt::Debug for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "Root"),
            other => write!(f, "{other}"),
        }
    }
}

/// An immutable repository path.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    elements: Vec<PathElement>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self {
            elements: vec![PathElement::Root],
        }
    }

    /// Build a path from elements.
    ///
    /// The element list must be non-empty and `Root` may only appear first.
    pub fn from_elements(elements: Vec<PathElement>) -> Result<Self, TypeError> {
        if elements.is_empty() {
            return Err(invalid("", "a path needs at least one element"));
        }
        if elements.iter().skip(1).any(|e| *e == PathElement::Root) {
            return Err(invalid("", "root may only be the first element"));
        }
        if let Some(PathElement::Named { index, name }) =
            elements.iter().find(|e| e.index() == 0)
        {
            return Err(invalid(
                &format!("{name}[{index}]"),
                "same-name-sibling indices start at 1",
            ));
        }
        Ok(Self { elements })
    }

    /// A relative path of a single named element.
    pub fn relative(name: Name) -> Self {
        Self {
            elements: vec![PathElement::named(name)],
        }
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn is_absolute(&self) -> bool {
        self.elements[0] == PathElement::Root
    }

    pub fn is_root(&self) -> bool {
        self.elements.len() == 1 && self.is_absolute()
    }

    /// A path is normalized if it has no `.` elements and `..` only appears
    /// as a leading run in a relative path.
    pub fn is_normalized(&self) -> bool {
        let mut seen_named = false;
        for element in &self.elements {
            match element {
                PathElement::Current => return self.elements.len() == 1,
                PathElement::Parent if seen_named || self.is_absolute() => return false,
                PathElement::Named { .. } => seen_named = true,
                _ => {}
            }
        }
        true
    }

    /// Collapse `.` and `..` elements.
    ///
    /// Fails if `..` would climb above the root of an absolute path.
    pub fn normalize(&self) -> Result<Path, TypeError> {
        let mut out: Vec<PathElement> = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            match element {
                PathElement::Current => {}
                PathElement::Parent => match out.last() {
                    Some(PathElement::Named { .. }) => {
                        out.pop();
                    }
                    Some(PathElement::Root) => {
                        return Err(invalid(&self.to_string(), "'..' escapes the root"));
                    }
                    _ => out.push(PathElement::Parent),
                },
                other => out.push(other.clone()),
            }
        }
        if out.is_empty() {
            out.push(PathElement::Current);
        }
        Ok(Self { elements: out })
    }

    /// Append a named element with the default index.
    pub fn child(&self, name: Name) -> Path {
        self.child_indexed(name, DEFAULT_INDEX)
    }

    /// Append a named element with an explicit index.
    pub fn child_indexed(&self, name: Name, index: u32) -> Path {
        let mut elements = self.elements.clone();
        if elements == [PathElement::Current] {
            elements.clear();
        }
        elements.push(PathElement::indexed(name, index.max(DEFAULT_INDEX)));
        Self { elements }
    }

    /// The last element.
    pub fn name_element(&self) -> &PathElement {
        self.elements
            .last()
            .expect("paths always hold at least one element")
    }

    /// The name of the last element, if it is named.
    pub fn name(&self) -> Option<&Name> {
        self.name_element().name()
    }

    /// The index of the last element.
    pub fn index(&self) -> u32 {
        self.name_element().index()
    }

    /// Number of named levels below the root (absolute) or the start
    /// (relative) of a normalized path.
    pub fn depth(&self) -> usize {
        self.elements
            .iter()
            .map(|e| match e {
                PathElement::Named { .. } => 1isize,
                PathElement::Parent => -1,
                _ => 0,
            })
            .sum::<isize>()
            .max(0) as usize
    }

    /// Number of ancestors of an absolute path. The root has none.
    pub fn ancestor_count(&self) -> usize {
        if self.is_absolute() {
            self.depth()
        } else {
            0
        }
    }

    /// The ancestor `degree` levels up. Degree 0 is the path itself.
    pub fn ancestor(&self, degree: usize) -> Result<Path, TypeError> {
        let normalized = self.normalize()?;
        if degree == 0 {
            return Ok(normalized);
        }
        let named = normalized.elements.iter().filter(|e| e.is_named()).count();
        if degree > named {
            return Err(invalid(
                &self.to_string(),
                &format!("no ancestor of degree {degree}"),
            ));
        }
        let keep = normalized.elements.len() - degree;
        let mut elements = normalized.elements[..keep].to_vec();
        if elements.is_empty() {
            elements.push(PathElement::Current);
        }
        Ok(Self { elements })
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        self.ancestor(1).ok()
    }

    /// Returns `true` if `self` is a strict ancestor of `other`.
    ///
    /// Both paths must be absolute; relative paths are never compared.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        if !self.is_absolute() || !other.is_absolute() {
            return false;
        }
        let (Ok(a), Ok(b)) = (self.normalize(), other.normalize()) else {
            return false;
        };
        a.elements.len() < b.elements.len() && b.elements[..a.elements.len()] == a.elements[..]
    }

    /// Returns `true` if `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &Path) -> bool {
        other.is_ancestor_of(self)
    }

    /// Compute the relative path that leads from `ancestor` to `self`.
    ///
    /// Returns `.` when the paths are equal.
    pub fn relative_to(&self, ancestor: &Path) -> Result<Path, TypeError> {
        let this = self.normalize()?;
        let base = ancestor.normalize()?;
        if this == base {
            return Ok(Self {
                elements: vec![PathElement::Current],
            });
        }
        if !base.is_ancestor_of(&this) {
            return Err(invalid(
                &self.to_string(),
                &format!("not a descendant of {ancestor}"),
            ));
        }
        Ok(Self {
            elements: this.elements[base.elements.len()..].to_vec(),
        })
    }

    /// Resolve a relative path against `self`. An absolute argument is
    /// returned as is (normalized).
    pub fn resolve(&self, relative: &Path) -> Result<Path, TypeError> {
        if relative.is_absolute() {
            return relative.normalize();
        }
        let mut elements = self.elements.clone();
        elements.extend(relative.elements.iter().cloned());
        Self { elements }.normalize()
    }
}

fn invalid(path: &str, reason: &str) -> TypeError {
    TypeError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_element(segment: &str, full: &str) -> Result<PathElement, TypeError> {
    match segment {
        "." => return Ok(PathElement::Current),
        ".." => return Ok(PathElement::Parent),
        _ => {}
    }
    let (name_part, index) = match segment.strip_suffix(']') {
        Some(rest) => {
            let (name_part, index_part) = rest
                .rsplit_once('[')
                .ok_or_else(|| invalid(full, "unbalanced index brackets"))?;
            let index: u32 = index_part
                .parse()
                .map_err(|_| invalid(full, &format!("invalid index {index_part:?}")))?;
            if index == 0 {
                return Err(invalid(full, "same-name-sibling indices start at 1"));
            }
            (name_part, index)
        }
        None => (segment, DEFAULT_INDEX),
    };
    let name: Name = name_part.parse()?;
    Ok(PathElement::indexed(name, index))
}

impl FromStr for Path {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(invalid(s, "empty path"));
        }
        let mut elements = Vec::new();
        let rest = match s.strip_prefix('/') {
            Some(rest) => {
                elements.push(PathElement::Root);
                rest
            }
            None => s,
        };
        if !rest.is_empty() {
            for segment in rest.split('/') {
                if segment.is_empty() {
                    return Err(invalid(s, "empty path segment"));
                }
                elements.push(parse_element(segment, s)?);
            }
        }
        Self::from_elements(elements)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        let mut first = true;
        for element in &self.elements {
            match element {
                PathElement::Root => {}
                other => {
                    if !first || self.is_absolute() {
                        write!(f, "/")?;
                    }
                    write!(f, "{other}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_absolute() {
        let path = p("/a/b[2]/jcr:content");
        assert!(path.is_absolute());
        assert_eq!(path.to_string(), "/a/b[2]/jcr:content");
        assert_eq!(path.depth(), 3);
        assert_eq!(path.index(), 1);
    }

    #[test]
    fn parse_and_display_relative() {
        let path = p("a/../b");
        assert!(!path.is_absolute());
        assert!(!path.is_normalized());
        assert_eq!(path.normalize().unwrap().to_string(), "b");
    }

    #[test]
    fn root_displays_as_slash() {
        assert_eq!(Path::root().to_string(), "/");
        assert!(p("/").is_root());
        assert_eq!(Path::root().ancestor_count(), 0);
    }

    #[test]
    fn explicit_default_index_is_dropped_on_display() {
        assert_eq!(p("/a[1]").to_string(), "/a");
        assert_eq!(p("/a[1]"), p("/a"));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!("".parse::<Path>().is_err());
        assert!("/a//b".parse::<Path>().is_err());
        assert!("/a[0]".parse::<Path>().is_err());
        assert!("/a[x]".parse::<Path>().is_err());
        assert!("/a]".parse::<Path>().is_err());
        assert!("/nope:a".parse::<Path>().is_err());
    }

    #[test]
    fn normalize_rejects_escaping_root() {
        assert!(p("/a/../..").normalize().is_err());
        assert_eq!(p("/a/./b/..").normalize().unwrap(), p("/a"));
    }

    #[test]
    fn relative_leading_parents_are_kept() {
        let path = p("../../a");
        assert!(path.is_normalized());
        assert_eq!(path.normalize().unwrap().to_string(), "../../a");
    }

    #[test]
    fn ancestors() {
        let path = p("/a/b/c");
        assert_eq!(path.ancestor(0).unwrap(), path);
        assert_eq!(path.ancestor(1).unwrap(), p("/a/b"));
        assert_eq!(path.ancestor(3).unwrap(), Path::root());
        assert!(path.ancestor(4).is_err());
        assert!(Path::root().parent().is_none());
    }

    #[test]
    fn ancestor_and_descendant() {
        let a = p("/a");
        let abc = p("/a/b/c");
        assert!(a.is_ancestor_of(&abc));
        assert!(abc.is_descendant_of(&a));
        assert!(!abc.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&a));
        assert!(Path::root().is_ancestor_of(&a));
        assert!(!p("/a[2]").is_ancestor_of(&abc));
    }

    #[test]
    fn relative_to_and_resolve() {
        let base = p("/a");
        let target = p("/a/b[2]/c");
        let rel = target.relative_to(&base).unwrap();
        assert_eq!(rel.to_string(), "b[2]/c");
        assert_eq!(base.resolve(&rel).unwrap(), target);
        assert_eq!(target.relative_to(&target).unwrap().to_string(), ".");
        assert!(base.relative_to(&target).is_err());
    }

    #[test]
    fn resolve_absolute_argument_wins() {
        assert_eq!(p("/a").resolve(&p("/x/y")).unwrap(), p("/x/y"));
    }

    #[test]
    fn child_of_current_drops_dot() {
        let current = p("/a").relative_to(&p("/a")).unwrap();
        let child = current.child("b".parse().unwrap());
        assert_eq!(child.to_string(), "b");
    }

    fn arb_segment() -> impl Strategy<Value = (String, u32)> {
        ("[a-z][a-z0-9]{0,6}", 1u32..4)
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(segments in prop::collection::vec(arb_segment(), 1..6)) {
            let mut path = Path::root();
            for (name, index) in &segments {
                path = path.child_indexed(Name::local(name.clone()).unwrap(), *index);
            }
            let parsed: Path = path.to_string().parse().unwrap();
            prop_assert_eq!(parsed, path);
        }

        #[test]
        fn relative_to_inverts_resolve(
            base in prop::collection::vec(arb_segment(), 0..4),
            tail in prop::collection::vec(arb_segment(), 1..4),
        ) {
            let mut ancestor = Path::root();
            for (name, index) in &base {
                ancestor = ancestor.child_indexed(Name::local(name.clone()).unwrap(), *index);
            }
            let mut target = ancestor.clone();
            for (name, index) in &tail {
                target = target.child_indexed(Name::local(name.clone()).unwrap(), *index);
            }
            let rel = target.relative_to(&ancestor).unwrap();
            prop_assert_eq!(rel.depth(), tail.len());
            prop_assert_eq!(ancestor.resolve(&rel).unwrap(), target.clone());
            prop_assert!(ancestor.is_ancestor_of(&target));
            prop_assert_eq!(target.ancestor(tail.len()).unwrap(), ancestor);
        }
    }
}
