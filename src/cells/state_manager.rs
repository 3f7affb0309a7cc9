//! State Manager (C2): the in-memory identity graph of this cell, its
//! parents, and its children.
//!
//! Grounded on the teacher's `AgentRegistryImpl` (`message_router/
//! implementations/agent_registry.rs`): a `DashMap`-backed registry gives
//! lock-free O(1) lookup by name, with readers never blocking writers for
//! longer than a single map access. Capability/capacity merge semantics
//! follow spec.md §9's resolution: set-union for multi-valued capability
//! keys, last-writer-wins per `(cell, key)` for capacities.

use dashmap::DashMap;

use crate::cells::domain_types::{CellRecord, CellRole, Capabilities, Capacities};
use crate::domain_types::CellName;

/// Errors raised by [`StateManager`] lookups.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StateManagerError {
    /// No cell record exists under that name in the requested role.
    #[error("unknown cell: {0}")]
    UnknownCell(CellName),
}

/// Owns this cell's own record plus its immediate parents and children.
/// Readers snapshot a record by cloning it out of the map under a brief
/// critical section, matching the "brief critical section" concurrency note
/// in spec.md §5.
pub struct StateManager {
    records: DashMap<CellName, CellRecord>,
    my_name: CellName,
}

impl StateManager {
    /// Builds a state manager seeded with the local cell's own record.
    #[must_use]
    pub fn new(my_record: CellRecord) -> Self {
        let my_name = my_record.name.clone();
        let records = DashMap::new();
        records.insert(my_name.clone(), my_record);
        Self { records, my_name }
    }

    /// Registers or replaces a parent or child cell record.
    pub fn upsert_cell(&self, record: CellRecord) {
        self.records.insert(record.name.clone(), record);
    }

    /// This cell's own record.
    ///
    /// # Panics
    ///
    /// Panics if the local cell's own record was removed after
    /// construction, which [`StateManager`] never does internally.
    #[must_use]
    pub fn get_my_info(&self) -> CellRecord {
        self.records.get(&self.my_name).expect("own record always present").value().clone()
    }

    /// All cells with `role == Parent`.
    #[must_use]
    pub fn get_parent_cells(&self) -> Vec<CellRecord> {
        self.records.iter().filter(|r| r.role == CellRole::Parent).map(|r| r.value().clone()).collect()
    }

    /// All cells with `role == Child`.
    #[must_use]
    pub fn get_child_cells(&self) -> Vec<CellRecord> {
        self.records.iter().filter(|r| r.role == CellRole::Child).map(|r| r.value().clone()).collect()
    }

    /// A specific child cell by name.
    ///
    /// # Errors
    ///
    /// Returns [`StateManagerError::UnknownCell`] if no such child exists.
    pub fn get_child_cell(&self, name: &CellName) -> Result<CellRecord, StateManagerError> {
        self.records
            .get(name)
            .filter(|r| r.role == CellRole::Child)
            .map(|r| r.value().clone())
            .ok_or_else(|| StateManagerError::UnknownCell(name.clone()))
    }

    /// A specific parent cell by name.
    ///
    /// # Errors
    ///
    /// Returns [`StateManagerError::UnknownCell`] if no such parent exists.
    pub fn get_parent_cell(&self, name: &CellName) -> Result<CellRecord, StateManagerError> {
        self.records
            .get(name)
            .filter(|r| r.role == CellRole::Parent)
            .map(|r| r.value().clone())
            .ok_or_else(|| StateManagerError::UnknownCell(name.clone()))
    }

    /// This cell's own info as shared with sibling cells during capability
    /// announce exchanges (credentials are never included in an
    /// announcement payload).
    #[must_use]
    pub fn get_cell_info_for_siblings(&self) -> CellRecord {
        let mut info = self.get_my_info();
        info.credentials = None;
        info
    }

    /// Merges a capability update for `cell` into the stored record:
    /// set-union per key.
    pub fn update_cell_capabilities(&self, cell: &CellName, update: Capabilities) {
        if let Some(mut record) = self.records.get_mut(cell) {
            merge_capabilities(&mut record.capabilities, update);
        }
    }

    /// Merges a capacity update for `cell` into the stored record:
    /// last-writer-wins per key.
    pub fn update_cell_capacities(&self, cell: &CellName, update: Capacities) {
        if let Some(mut record) = self.records.get_mut(cell) {
            record.capacities.extend(update);
        }
    }

    /// A merged snapshot of capabilities across every known descendant,
    /// used by the scheduler's `CapabilityFilter`.
    #[must_use]
    pub fn aggregate_capabilities(&self) -> Capabilities {
        let mut merged = Capabilities::new();
        for record in &self.records {
            merge_capabilities(&mut merged, record.capabilities.clone());
        }
        merged
    }

    /// A merged snapshot of capacities across every known descendant,
    /// last-writer-wins in iteration order, used by the scheduler's
    /// `CapacityFilter` and `RamByInstanceTypeWeigher`.
    #[must_use]
    pub fn aggregate_capacities(&self) -> Capacities {
        let mut merged = Capacities::new();
        for record in &self.records {
            merged.extend(record.capacities.clone());
        }
        merged
    }
}

fn merge_capabilities(into: &mut Capabilities, update: Capabilities) {
    for (key, values) in update {
        into.entry(key).or_default().extend(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::domain_types::TransportCredentials;
    use std::collections::{HashMap, HashSet};

    fn name(s: &str) -> CellName {
        CellName::try_new(s.to_string()).unwrap()
    }

    fn child_record(n: &str) -> CellRecord {
        CellRecord {
            name: name(n),
            role: CellRole::Child,
            credentials: Some(TransportCredentials {
                host: "localhost".to_string(),
                port: 5672,
                user: "guest".to_string(),
                password: "guest".to_string(),
                virtual_host: "/".to_string(),
            }),
            capabilities: HashMap::new(),
            capacities: HashMap::new(),
        }
    }

    fn my_record() -> CellRecord {
        CellRecord {
            name: name("api-cell"),
            role: CellRole::Me,
            credentials: None,
            capabilities: HashMap::new(),
            capacities: HashMap::new(),
        }
    }

    #[test]
    fn get_my_info_returns_seeded_record() {
        let manager = StateManager::new(my_record());
        assert!(manager.get_my_info().is_me());
    }

    #[test]
    fn child_cells_are_distinguished_from_parent_cells() {
        let manager = StateManager::new(my_record());
        manager.upsert_cell(child_record("child-cell2"));
        assert_eq!(manager.get_child_cells().len(), 1);
        assert!(manager.get_parent_cells().is_empty());
    }

    #[test]
    fn unknown_child_lookup_errors() {
        let manager = StateManager::new(my_record());
        assert!(manager.get_child_cell(&name("nope")).is_err());
    }

    #[test]
    fn capability_updates_union_multi_valued_keys() {
        let manager = StateManager::new(my_record());
        manager.upsert_cell(child_record("child-cell2"));
        let mut first = Capabilities::new();
        first.insert("os".to_string(), HashSet::from(["linux".to_string()]));
        manager.update_cell_capabilities(&name("child-cell2"), first);
        let mut second = Capabilities::new();
        second.insert("os".to_string(), HashSet::from(["windows".to_string()]));
        manager.update_cell_capabilities(&name("child-cell2"), second);
        let record = manager.get_child_cell(&name("child-cell2")).unwrap();
        assert_eq!(
            record.capabilities.get("os").unwrap(),
            &HashSet::from(["linux".to_string(), "windows".to_string()])
        );
    }

    #[test]
    fn capacity_updates_are_last_writer_wins_per_key() {
        let manager = StateManager::new(my_record());
        manager.upsert_cell(child_record("child-cell2"));
        let mut first = Capacities::new();
        first.insert("free_ram_mb".to_string(), 1000);
        manager.update_cell_capacities(&name("child-cell2"), first);
        let mut second = Capacities::new();
        second.insert("free_ram_mb".to_string(), 500);
        manager.update_cell_capacities(&name("child-cell2"), second);
        let record = manager.get_child_cell(&name("child-cell2")).unwrap();
        assert_eq!(record.capacities.get("free_ram_mb"), Some(&500));
    }

    #[test]
    fn sibling_info_never_leaks_transport_credentials() {
        let mut me = my_record();
        me.credentials = Some(TransportCredentials {
            host: "h".to_string(),
            port: 1,
            user: "u".to_string(),
            password: "p".to_string(),
            virtual_host: "/".to_string(),
        });
        let manager = StateManager::new(me);
        assert!(manager.get_cell_info_for_siblings().credentials.is_none());
    }
}
