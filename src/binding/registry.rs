//! Back-references from relocatable resources to the binding points using them.

use std::collections::HashMap;

use crate::ids::{BindingTableId, ResourceKey};

/// One binding point in one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRef {
    pub table: BindingTableId,
    pub binding: u32,
}

/// Relation `resource -> [(table, binding)]`. Owns neither side.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    refs: HashMap<ResourceKey, Vec<BindingRef>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `binding` of `table` refers to `resource`. Idempotent.
    pub fn add(&mut self, resource: ResourceKey, table: BindingTableId, binding: u32) {
        let entry = BindingRef { table, binding };
        let refs = self.refs.entry(resource).or_default();
        if !refs.contains(&entry) {
            refs.push(entry);
        }
    }

    pub fn remove(&mut self, resource: ResourceKey, table: BindingTableId, binding: u32) {
        if let Some(refs) = self.refs.get_mut(&resource) {
            refs.retain(|r| !(r.table == table && r.binding == binding));
            if refs.is_empty() {
                self.refs.remove(&resource);
            }
        }
    }

    /// Drop every row that points at `table`.
    pub fn remove_table(&mut self, table: BindingTableId) {
        self.refs.retain(|_, refs| {
            refs.retain(|r| r.table != table);
            !refs.is_empty()
        });
    }

    /// Drop every row for `resource`.
    pub fn remove_resource(&mut self, resource: ResourceKey) -> Vec<BindingRef> {
        self.refs.remove(&resource).unwrap_or_default()
    }

    pub fn refs(&self, resource: ResourceKey) -> &[BindingRef] {
        self.refs.get(&resource).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
