use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use cairn_types::{NodeId, PropertyId};

/// The strong references pointing at one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReferences {
    target: NodeId,
    referrers: BTreeSet<PropertyId>,
}

impl NodeReferences {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            referrers: BTreeSet::new(),
        }
    }

    pub fn with_referrers(target: NodeId, referrers: impl IntoIterator<Item = PropertyId>) -> Self {
        Self {
            target,
            referrers: referrers.into_iter().collect(),
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn has_references(&self) -> bool {
        !self.referrers.is_empty()
    }

    pub fn referrers(&self) -> impl Iterator<Item = &PropertyId> {
        self.referrers.iter()
    }

    pub fn len(&self) -> usize {
        self.referrers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }

    pub fn add(&mut self, referrer: PropertyId) {
        self.referrers.insert(referrer);
    }

    pub fn remove(&mut self, referrer: &PropertyId) -> bool {
        self.referrers.remove(referrer)
    }
}
