use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::name::Name;

/// Globally unique identifier of a node (UUID v7 for time ordering).
///
/// Identifiers are never reused within a repository instance, including
/// after the node they named has been removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(uuid::Uuid);

impl NodeId {
    /// Id of the repository root node. Never produced by [`NodeId::new`].
    pub const ROOT: NodeId = NodeId(uuid::Uuid::nil());

    /// Generate a new time-ordered node id.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short representation (first 8 characters) for log output.
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for NodeId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TypeError::InvalidId(format!("{s}: {e}")))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short_id())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a property: its parent node plus its name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId {
    parent: NodeId,
    name: Name,
}

impl PropertyId {
    pub fn new(parent: NodeId, name: Name) -> Self {
        Self { parent, name }
    }

    pub fn parent(&self) -> &NodeId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

impl fmt::Debug for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyId({}/{})", self.parent.short_id(), self.name)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Identifier of any repository item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node(_))
    }

    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            Self::Node(id) => Some(id),
            Self::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyId> {
        match self {
            Self::Node(_) => None,
            Self::Property(id) => Some(id),
        }
    }

    /// The node this item belongs to: the node itself, or a property's parent.
    pub fn owning_node(&self) -> &NodeId {
        match self {
            Self::Node(id) => id,
            Self::Property(id) => id.parent(),
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        Self::Property(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Property(id) => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::well_known;

    #[test]
    fn new_ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
        assert_ne!(a, NodeId::ROOT);
    }

    #[test]
    fn v7_ids_are_time_ordered() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(a < b);
    }

    #[test]
    fn parse_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<NodeId>().is_err());
    }

    #[test]
    fn short_id_is_8_chars() {
        assert_eq!(NodeId::new().short_id().len(), 8);
    }

    #[test]
    fn property_id_owning_node() {
        let parent = NodeId::new();
        let item = ItemId::from(PropertyId::new(parent, well_known::JCR_CREATED.clone()));
        assert_eq!(item.owning_node(), &parent);
        assert!(!item.is_node());
        assert!(item.as_property().is_some());
    }

    #[test]
    fn serde_roundtrip() {
        let id = ItemId::Node(NodeId::new());
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ItemId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
