//! Qualified names.
//!
//! A [`Name`] pairs a namespace URI with a local name. The built-in
//! namespaces have fixed prefixes (`jcr`, `nt`, `mix`, `rep`); names in the
//! empty namespace (version names such as `1.0`) have no prefix.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Namespace URIs and their fixed prefixes.
pub mod ns {
    pub const EMPTY: &str = "";
    pub const JCR: &str = "http://www.jcp.org/jcr/1.0";
    pub const NT: &str = "http://www.jcp.org/jcr/nt/1.0";
    pub const MIX: &str = "http://www.jcp.org/jcr/mix/1.0";
    pub const REP: &str = "internal";

    /// `(prefix, uri)` pairs for every built-in namespace.
    pub const PREFIXES: &[(&str, &str)] = &[
        ("", EMPTY),
        ("jcr", JCR),
        ("nt", NT),
        ("mix", MIX),
        ("rep", REP),
    ];

    pub fn uri_for_prefix(prefix: &str) -> Option<&'static str> {
        PREFIXES
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, uri)| *uri)
    }

    pub fn prefix_for_uri(uri: &str) -> Option<&'static str> {
        PREFIXES
            .iter()
            .find(|(_, u)| *u == uri)
            .map(|(p, _)| *p)
    }
}

/// Characters that may not appear in a local name.
const FORBIDDEN_CHARS: &[char] = &['/', ':', '[', ']', '|', '*', '\t', '\n', '\r'];

/// A namespace-qualified name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name {
    namespace: Cow<'static, str>,
    local: Cow<'static, str>,
}

impl Name {
    /// Build a name from static parts. Used for the well-known constants.
    pub const fn from_static(namespace: &'static str, local: &'static str) -> Self {
        Self {
            namespace: Cow::Borrowed(namespace),
            local: Cow::Borrowed(local),
        }
    }

    /// Create a validated name in the given namespace.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Result<Self, TypeError> {
        let local = local.into();
        validate_local_name(&local)?;
        Ok(Self {
            namespace: Cow::Owned(namespace.into()),
            local: Cow::Owned(local),
        })
    }

    /// Create a validated name in the empty namespace.
    pub fn local(local: impl Into<String>) -> Result<Self, TypeError> {
        Self::new(ns::EMPTY, local)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }
}

/// Validate a local name.
///
/// Local names must be non-empty, must not be `.` or `..`, and must not
/// contain path or index syntax characters.
pub fn validate_local_name(local: &str) -> Result<(), TypeError> {
    if local.is_empty() {
        return Err(TypeError::InvalidName {
            name: local.to_string(),
            reason: "local name must not be empty".into(),
        });
    }
    if local == "." || local == ".." {
        return Err(TypeError::InvalidName {
            name: local.to_string(),
            reason: "'.' and '..' are reserved".into(),
        });
    }
    if let Some(ch) = local.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(TypeError::InvalidName {
            name: local.to_string(),
            reason: format!("contains forbidden character: {ch:?}"),
        });
    }
    if local.trim() != local {
        return Err(TypeError::InvalidName {
            name: local.to_string(),
            reason: "must not start or end with whitespace".into(),
        });
    }
    Ok(())
}

impl FromStr for Name {
    type Err = TypeError;

    /// Parse `prefix:local` or a bare `local` (empty namespace).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((prefix, local)) => {
                let uri = ns::uri_for_prefix(prefix)
                    .ok_or_else(|| TypeError::UnknownPrefix(prefix.to_string()))?;
                Self::new(uri, local)
            }
            None => Self::local(s),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ns::prefix_for_uri(&self.namespace) {
            Some("") => write!(f, "{}", self.local),
            Some(prefix) => write!(f, "{prefix}:{}", self.local),
            None => write!(f, "{{{}}}{}", self.namespace, self.local),
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

/// Names the repository itself relies on.
pub mod well_known {
    use super::{ns, Name};

    /// Name of the root node.
    pub const ROOT: Name = Name::from_static(ns::EMPTY, "");

    // Item names.
    pub const JCR_PRIMARY_TYPE: Name = Name::from_static(ns::JCR, "primaryType");
    pub const JCR_MIXIN_TYPES: Name = Name::from_static(ns::JCR, "mixinTypes");
    pub const JCR_UUID: Name = Name::from_static(ns::JCR, "uuid");
    pub const JCR_CREATED: Name = Name::from_static(ns::JCR, "created");
    pub const JCR_SYSTEM: Name = Name::from_static(ns::JCR, "system");
    pub const JCR_VERSION_STORAGE: Name = Name::from_static(ns::JCR, "versionStorage");
    pub const JCR_ACTIVITIES: Name = Name::from_static(ns::JCR, "activities");
    pub const JCR_ROOT_VERSION: Name = Name::from_static(ns::JCR, "rootVersion");
    pub const JCR_VERSION_LABELS: Name = Name::from_static(ns::JCR, "versionLabels");
    pub const JCR_PREDECESSORS: Name = Name::from_static(ns::JCR, "predecessors");
    pub const JCR_SUCCESSORS: Name = Name::from_static(ns::JCR, "successors");
    pub const JCR_FROZEN_NODE: Name = Name::from_static(ns::JCR, "frozenNode");
    pub const JCR_FROZEN_PRIMARY_TYPE: Name = Name::from_static(ns::JCR, "frozenPrimaryType");
    pub const JCR_FROZEN_MIXIN_TYPES: Name = Name::from_static(ns::JCR, "frozenMixinTypes");
    pub const JCR_FROZEN_UUID: Name = Name::from_static(ns::JCR, "frozenUuid");
    pub const JCR_VERSIONABLE_UUID: Name = Name::from_static(ns::JCR, "versionableUuid");
    pub const JCR_VERSION_HISTORY: Name = Name::from_static(ns::JCR, "versionHistory");
    pub const JCR_BASE_VERSION: Name = Name::from_static(ns::JCR, "baseVersion");
    pub const JCR_IS_CHECKED_OUT: Name = Name::from_static(ns::JCR, "isCheckedOut");
    pub const JCR_ACTIVITY: Name = Name::from_static(ns::JCR, "activity");
    pub const JCR_ACTIVITY_TITLE: Name = Name::from_static(ns::JCR, "activityTitle");
    pub const JCR_CHILD_VERSION_HISTORY: Name = Name::from_static(ns::JCR, "childVersionHistory");
    pub const JCR_COPIED_FROM: Name = Name::from_static(ns::JCR, "copiedFrom");
    pub const JCR_CONFIGURATION: Name = Name::from_static(ns::JCR, "configuration");
    pub const JCR_ROOT: Name = Name::from_static(ns::JCR, "root");

    // Node types.
    pub const NT_BASE: Name = Name::from_static(ns::NT, "base");
    pub const NT_UNSTRUCTURED: Name = Name::from_static(ns::NT, "unstructured");
    pub const NT_VERSION: Name = Name::from_static(ns::NT, "version");
    pub const NT_VERSION_HISTORY: Name = Name::from_static(ns::NT, "versionHistory");
    pub const NT_VERSION_LABELS: Name = Name::from_static(ns::NT, "versionLabels");
    pub const NT_FROZEN_NODE: Name = Name::from_static(ns::NT, "frozenNode");
    pub const NT_VERSIONED_CHILD: Name = Name::from_static(ns::NT, "versionedChild");
    pub const NT_ACTIVITY: Name = Name::from_static(ns::NT, "activity");
    pub const NT_CONFIGURATION: Name = Name::from_static(ns::NT, "configuration");

    // Mixins.
    pub const MIX_REFERENCEABLE: Name = Name::from_static(ns::MIX, "referenceable");
    pub const MIX_SIMPLE_VERSIONABLE: Name = Name::from_static(ns::MIX, "simpleVersionable");
    pub const MIX_VERSIONABLE: Name = Name::from_static(ns::MIX, "versionable");

    // Repository-internal types and items.
    pub const REP_ROOT: Name = Name::from_static(ns::REP, "root");
    pub const REP_SYSTEM: Name = Name::from_static(ns::REP, "system");
    pub const REP_WORKSPACE: Name = Name::from_static(ns::REP, "workspace");
    pub const REP_VERSION_STORAGE: Name = Name::from_static(ns::REP, "versionStorage");
    pub const REP_ACTIVITIES: Name = Name::from_static(ns::REP, "Activities");
    pub const REP_VERSIONS: Name = Name::from_static(ns::REP, "versions");
    pub const REP_BASE_VERSIONS: Name = Name::from_static(ns::REP, "baseVersions");
    pub const REP_FANOUT_DEPTH: Name = Name::from_static(ns::REP, "fanoutDepth");
    pub const REP_FANOUT_WIDTH: Name = Name::from_static(ns::REP, "fanoutWidth");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefixed_name() {
        let name: Name = "jcr:created".parse().unwrap();
        assert_eq!(name, well_known::JCR_CREATED);
        assert_eq!(name.namespace(), ns::JCR);
        assert_eq!(name.local_name(), "created");
    }

    #[test]
    fn parse_bare_name_is_empty_namespace() {
        let name: Name = "1.0".parse().unwrap();
        assert_eq!(name.namespace(), "");
        assert_eq!(name.to_string(), "1.0");
    }

    #[test]
    fn display_uses_prefix() {
        assert_eq!(well_known::NT_VERSION_HISTORY.to_string(), "nt:versionHistory");
        assert_eq!(well_known::REP_ACTIVITIES.to_string(), "rep:Activities");
    }

    #[test]
    fn unknown_namespace_displays_expanded() {
        let name = Name::new("urn:example", "thing").unwrap();
        assert_eq!(name.to_string(), "{urn:example}thing");
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert_eq!(
            "foo:bar".parse::<Name>(),
            Err(TypeError::UnknownPrefix("foo".into()))
        );
    }

    #[test]
    fn invalid_local_names_are_rejected() {
        assert!(Name::local("").is_err());
        assert!(Name::local(".").is_err());
        assert!(Name::local("..").is_err());
        assert!(Name::local("a/b").is_err());
        assert!(Name::local("a[1]").is_err());
        assert!(Name::local(" padded").is_err());
    }

    #[test]
    fn static_and_owned_names_compare_equal() {
        let owned = Name::new(ns::JCR, "rootVersion").unwrap();
        assert_eq!(owned, well_known::JCR_ROOT_VERSION);
        let mut set = std::collections::HashSet::new();
        set.insert(owned);
        assert!(set.contains(&well_known::JCR_ROOT_VERSION));
    }

    #[test]
    fn serde_roundtrip() {
        let json = serde_json::to_string(&well_known::MIX_VERSIONABLE).unwrap();
        let parsed: Name = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, well_known::MIX_VERSIONABLE);
    }
}
