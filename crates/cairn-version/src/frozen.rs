//! Capturing a node's state into a frozen node.
//!
//! The node's type, mixins and id are recorded explicitly. Every other
//! property and child node is handled according to the on-parent-version
//! action the node's effective type assigns to it. Strong references are
//! stored as weak ones, so a frozen copy never keeps its targets alive.

use cairn_state::{ItemStateManager, LocalStateManager, OnParentVersion, PropertyData};
use cairn_types::{well_known, Name, NodeId, Value, ValueType};

use crate::entity::{load_node, load_property, load_values, node_ids};
use crate::error::{VersionError, VersionResult};
use crate::layout::StorageLayout;

/// Properties the frozen node records in its own terms.
const RECORDED: [Name; 3] = [
    well_known::JCR_PRIMARY_TYPE,
    well_known::JCR_MIXIN_TYPES,
    well_known::JCR_UUID,
];

fn weaken(value: Value) -> Value {
    match value {
        Value::Reference(id) => Value::WeakReference(id),
        other => other,
    }
}

fn copy_property(
    lsm: &mut LocalStateManager,
    frozen: &NodeId,
    name: Name,
    data: PropertyData,
) -> VersionResult<()> {
    let value_type = match data.value_type {
        ValueType::Reference => ValueType::WeakReference,
        other => other,
    };
    let values: Vec<Value> = data.values.into_iter().map(weaken).collect();
    if data.multi_valued {
        lsm.set_property_values(frozen, name, value_type, values)?;
    } else if let Some(value) = values.into_iter().next() {
        lsm.set_property(frozen, name, value)?;
    }
    Ok(())
}

/// Record the type and identity of `source` on a frozen node.
pub(crate) fn record_identity(
    lsm: &mut LocalStateManager,
    frozen: &NodeId,
    source: &NodeId,
) -> VersionResult<()> {
    let data = load_node(lsm, source)?;
    let ent = lsm.effective_node_type(source)?;
    lsm.set_property(
        frozen,
        well_known::JCR_FROZEN_PRIMARY_TYPE,
        Value::Name(data.primary_type.clone()),
    )?;
    if !data.mixins.is_empty() {
        lsm.set_property_values(
            frozen,
            well_known::JCR_FROZEN_MIXIN_TYPES,
            ValueType::Name,
            data.mixins.iter().cloned().map(Value::Name).collect(),
        )?;
    }
    if ent.includes(&well_known::MIX_REFERENCEABLE) {
        lsm.set_property(
            frozen,
            well_known::JCR_FROZEN_UUID,
            Value::String(source.to_string()),
        )?;
    }
    Ok(())
}

/// Copy `source` into a new frozen node `name` below `parent`.
pub(crate) fn freeze(
    lsm: &mut LocalStateManager,
    layout: &StorageLayout,
    parent: &NodeId,
    name: Name,
    source: &NodeId,
) -> VersionResult<NodeId> {
    let data = load_node(lsm, source)?;
    let ent = lsm.effective_node_type(source)?;
    let frozen = lsm.add_node(parent, name, well_known::NT_FROZEN_NODE, None)?;
    record_identity(lsm, &frozen, source)?;

    for prop in &data.property_names {
        if RECORDED.contains(prop) {
            continue;
        }
        match ent.on_parent_version(prop) {
            OnParentVersion::Copy | OnParentVersion::Version => {
                if let Some(value) = load_property(lsm, source, &data, prop)? {
                    copy_property(lsm, &frozen, prop.clone(), value)?;
                }
            }
            OnParentVersion::Abort => {
                return Err(VersionError::CheckinAborted {
                    node: *source,
                    item: prop.clone(),
                })
            }
            OnParentVersion::Initialize | OnParentVersion::Compute | OnParentVersion::Ignore => {}
        }
    }

    for child in data.children.iter() {
        match ent.on_parent_version(&child.name) {
            OnParentVersion::Copy => {
                freeze(lsm, layout, &frozen, child.name, &child.id)?;
            }
            OnParentVersion::Version => {
                let child_ent = lsm.effective_node_type(&child.id)?;
                if child_ent.includes(&well_known::MIX_SIMPLE_VERSIONABLE) {
                    let history = layout.history_of(lsm, &child.id)?.ok_or_else(|| {
                        VersionError::inconsistent(format!(
                            "versionable child {} has no version history",
                            child.id
                        ))
                    })?;
                    let record =
                        lsm.add_node(&frozen, child.name, well_known::NT_VERSIONED_CHILD, None)?;
                    lsm.set_property(
                        &record,
                        well_known::JCR_CHILD_VERSION_HISTORY,
                        Value::WeakReference(history),
                    )?;
                } else {
                    freeze(lsm, layout, &frozen, child.name, &child.id)?;
                }
            }
            OnParentVersion::Abort => {
                return Err(VersionError::CheckinAborted {
                    node: *source,
                    item: child.name,
                })
            }
            OnParentVersion::Initialize | OnParentVersion::Compute | OnParentVersion::Ignore => {}
        }
    }
    Ok(frozen)
}

/// Base versions of every versionable node in the subtree at `root`,
/// in document order.
pub(crate) fn collect_base_versions<S>(states: &S, root: &NodeId) -> VersionResult<Vec<NodeId>>
where
    S: ItemStateManager + ?Sized,
{
    let mut found = Vec::new();
    let mut pending = vec![*root];
    while let Some(id) = pending.pop() {
        let data = load_node(states, &id)?;
        found.extend(node_ids(&load_values(
            states,
            &id,
            &data,
            &well_known::JCR_BASE_VERSION,
        )?));
        let mut children = data.children.ids();
        children.reverse();
        pending.extend(children);
    }
    Ok(found)
}
