//! Node type definitions and effective node type resolution.
//!
//! Only the parts of node typing that versioning needs are modelled: the
//! supertype closure and per-item on-parent-version actions.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_types::{well_known, Name};

use crate::error::{StateError, StateResult};

/// What happens to a child item when its parent is checked in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnParentVersion {
    /// Copy the item into the frozen node.
    #[default]
    Copy,
    /// Versionable child nodes are recorded by their version history;
    /// anything else is copied.
    Version,
    Initialize,
    Compute,
    Ignore,
    /// The parent cannot be checked in while this item exists.
    Abort,
}

/// One node type definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTypeDef {
    pub name: Name,
    pub is_mixin: bool,
    pub supertypes: Vec<Name>,
    /// Per-item actions, keyed by property or child node name.
    pub on_parent_version: HashMap<Name, OnParentVersion>,
}

impl NodeTypeDef {
    pub fn primary(name: Name) -> Self {
        Self {
            name,
            is_mixin: false,
            supertypes: Vec::new(),
            on_parent_version: HashMap::new(),
        }
    }

    pub fn mixin(name: Name) -> Self {
        Self {
            is_mixin: true,
            ..Self::primary(name)
        }
    }

    pub fn with_supertype(mut self, name: Name) -> Self {
        self.supertypes.push(name);
        self
    }

    pub fn with_item(mut self, item: Name, action: OnParentVersion) -> Self {
        self.on_parent_version.insert(item, action);
        self
    }
}

/// The merged view of a node's primary type and mixins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveNodeType {
    primary: Name,
    mixins: BTreeSet<Name>,
    all: BTreeSet<Name>,
    on_parent_version: HashMap<Name, OnParentVersion>,
}

impl EffectiveNodeType {
    pub fn primary(&self) -> &Name {
        &self.primary
    }

    pub fn mixins(&self) -> &BTreeSet<Name> {
        &self.mixins
    }

    /// `true` if the primary type, a mixin, or any of their supertypes is
    /// `node_type`.
    pub fn includes(&self, node_type: &Name) -> bool {
        self.all.contains(node_type)
    }

    /// All included node types.
    pub fn all(&self) -> impl Iterator<Item = &Name> {
        self.all.iter()
    }

    /// The action for a child item; unknown items are copied.
    pub fn on_parent_version(&self, item: &Name) -> OnParentVersion {
        self.on_parent_version.get(item).copied().unwrap_or_default()
    }
}

/// Resolves node type names into effective node types.
pub trait NodeTypeRegistry: Send + Sync {
    fn effective_node_type(
        &self,
        primary: &Name,
        mixins: &BTreeSet<Name>,
    ) -> StateResult<EffectiveNodeType>;
}

/// Registry backed by a map of definitions, preloaded with the built-in
/// system and versioning types.
pub struct InMemoryNodeTypeRegistry {
    types: RwLock<HashMap<Name, NodeTypeDef>>,
}

impl InMemoryNodeTypeRegistry {
    pub fn new() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
        };
        for def in builtin_types() {
            registry
                .types
                .write()
                .expect("lock poisoned")
                .insert(def.name.clone(), def);
        }
        registry
    }

    /// Register a definition. Every supertype must already be known.
    pub fn register(&self, def: NodeTypeDef) -> StateResult<()> {
        let mut types = self.types.write().expect("lock poisoned");
        if let Some(missing) = def.supertypes.iter().find(|s| !types.contains_key(*s)) {
            return Err(StateError::NoSuchNodeType(missing.clone()));
        }
        debug!(node_type = %def.name, mixin = def.is_mixin, "registered node type");
        types.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn is_registered(&self, name: &Name) -> bool {
        self.types.read().expect("lock poisoned").contains_key(name)
    }
}

impl Default for InMemoryNodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeRegistry for InMemoryNodeTypeRegistry {
    fn effective_node_type(
        &self,
        primary: &Name,
        mixins: &BTreeSet<Name>,
    ) -> StateResult<EffectiveNodeType> {
        let types = self.types.read().expect("lock poisoned");
        let mut all = BTreeSet::new();
        let mut on_parent_version = HashMap::new();
        let mut pending: Vec<&Name> = std::iter::once(primary).chain(mixins.iter()).collect();
        while let Some(name) = pending.pop() {
            if !all.insert(name.clone()) {
                continue;
            }
            let def = types
                .get(name)
                .ok_or_else(|| StateError::NoSuchNodeType(name.clone()))?;
            for (item, action) in &def.on_parent_version {
                on_parent_version.entry(item.clone()).or_insert(*action);
            }
            pending.extend(def.supertypes.iter());
        }
        all.insert(well_known::NT_BASE);
        Ok(EffectiveNodeType {
            primary: primary.clone(),
            mixins: mixins.clone(),
            all,
            on_parent_version,
        })
    }
}

impl std::fmt::Debug for InMemoryNodeTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.types.read().expect("lock poisoned").len();
        f.debug_struct("InMemoryNodeTypeRegistry")
            .field("type_count", &count)
            .finish()
    }
}

fn builtin_types() -> Vec<NodeTypeDef> {
    use well_known::*;
    use OnParentVersion as Opv;

    let primary = |name: Name| NodeTypeDef::primary(name).with_supertype(NT_BASE);
    vec![
        NodeTypeDef::primary(NT_BASE)
            .with_item(JCR_PRIMARY_TYPE, Opv::Compute)
            .with_item(JCR_MIXIN_TYPES, Opv::Compute),
        primary(NT_UNSTRUCTURED),
        NodeTypeDef::mixin(MIX_REFERENCEABLE).with_item(JCR_UUID, Opv::Initialize),
        NodeTypeDef::mixin(MIX_SIMPLE_VERSIONABLE).with_item(JCR_IS_CHECKED_OUT, Opv::Ignore),
        NodeTypeDef::mixin(MIX_VERSIONABLE)
            .with_supertype(MIX_SIMPLE_VERSIONABLE)
            .with_supertype(MIX_REFERENCEABLE)
            .with_item(JCR_VERSION_HISTORY, Opv::Copy)
            .with_item(JCR_BASE_VERSION, Opv::Ignore)
            .with_item(JCR_PREDECESSORS, Opv::Copy)
            .with_item(JCR_ACTIVITY, Opv::Copy)
            .with_item(JCR_CONFIGURATION, Opv::Copy),
        primary(NT_VERSION_HISTORY).with_supertype(MIX_REFERENCEABLE),
        primary(NT_VERSION_LABELS),
        primary(NT_VERSION).with_supertype(MIX_REFERENCEABLE),
        primary(NT_FROZEN_NODE).with_supertype(MIX_REFERENCEABLE),
        primary(NT_VERSIONED_CHILD),
        primary(NT_ACTIVITY).with_supertype(MIX_REFERENCEABLE),
        primary(NT_CONFIGURATION)
            .with_supertype(MIX_VERSIONABLE)
            .with_item(JCR_ROOT, Opv::Copy),
        primary(REP_ROOT),
        primary(REP_SYSTEM),
        primary(REP_VERSION_STORAGE),
        primary(REP_ACTIVITIES),
        primary(REP_WORKSPACE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use well_known::*;

    #[test]
    fn versionable_closure() {
        let registry = InMemoryNodeTypeRegistry::new();
        let ent = registry
            .effective_node_type(&NT_UNSTRUCTURED, &BTreeSet::from([MIX_VERSIONABLE]))
            .unwrap();
        assert!(ent.includes(&MIX_VERSIONABLE));
        assert!(ent.includes(&MIX_SIMPLE_VERSIONABLE));
        assert!(ent.includes(&MIX_REFERENCEABLE));
        assert!(ent.includes(&NT_BASE));
        assert!(!ent.includes(&NT_CONFIGURATION));
        assert_eq!(ent.on_parent_version(&JCR_BASE_VERSION), OnParentVersion::Ignore);
        assert_eq!(
            ent.on_parent_version(&Name::local("title").unwrap()),
            OnParentVersion::Copy
        );
    }

    #[test]
    fn configuration_is_versionable() {
        let registry = InMemoryNodeTypeRegistry::new();
        let ent = registry
            .effective_node_type(&NT_CONFIGURATION, &BTreeSet::new())
            .unwrap();
        assert!(ent.includes(&MIX_VERSIONABLE));
    }

    #[test]
    fn unknown_types_are_errors() {
        let registry = InMemoryNodeTypeRegistry::new();
        let bogus = Name::local("bogus").unwrap();
        assert!(matches!(
            registry.effective_node_type(&bogus, &BTreeSet::new()),
            Err(StateError::NoSuchNodeType(_))
        ));
        assert!(matches!(
            registry.register(NodeTypeDef::primary(Name::local("x").unwrap()).with_supertype(bogus)),
            Err(StateError::NoSuchNodeType(_))
        ));
    }

    #[test]
    fn registered_types_contribute_actions() {
        let registry = InMemoryNodeTypeRegistry::new();
        let doc = Name::local("document").unwrap();
        let draft = Name::local("draft").unwrap();
        registry
            .register(
                NodeTypeDef::primary(doc.clone())
                    .with_supertype(NT_UNSTRUCTURED)
                    .with_item(draft.clone(), OnParentVersion::Ignore),
            )
            .unwrap();
        let ent = registry.effective_node_type(&doc, &BTreeSet::new()).unwrap();
        assert!(ent.includes(&NT_UNSTRUCTURED));
        assert_eq!(ent.on_parent_version(&draft), OnParentVersion::Ignore);
    }
}
