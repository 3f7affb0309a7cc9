//! Built-in cell filters (spec.md §4.5.1)
//!
//! Grounded on `nova/cells/filters/{target_cell,capacity,capability}.py`:
//! each filter inspects the candidate set and either drops cells that fail
//! a hard requirement or short-circuits straight to a caller-forced target.

use crate::cells::domain_types::CellRecord;
use crate::scheduler::domain_types::{CellFilter, FilterOutcome, FilterProperties, RequestSpec};

/// Short-circuits to `filter_properties.target_cell` when the caller named
/// one explicitly, bypassing the rest of the pipeline entirely.
pub struct TargetCellFilter;

impl CellFilter for TargetCellFilter {
    fn name(&self) -> &'static str {
        "target_cell"
    }

    fn filter_cells(&self, _candidates: &[CellRecord], _request: &RequestSpec, properties: &FilterProperties) -> FilterOutcome {
        match &properties.target_cell {
            Some(target) => FilterOutcome::DirectRoute(target.clone()),
            None => FilterOutcome::Continue,
        }
    }
}

/// Drops candidates whose advertised free RAM/disk capacity is known and
/// insufficient for the requested flavor. A cell with no capacity
/// information on file for a given key is never dropped on that key's
/// account — absence means "unknown," not "zero."
pub struct CapacityFilter;

impl CellFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn filter_cells(&self, candidates: &[CellRecord], request: &RequestSpec, _properties: &FilterProperties) -> FilterOutcome {
        let dropped: Vec<_> = candidates
            .iter()
            .filter(|cell| {
                let ram_short = cell
                    .capacities
                    .get("free_ram_mb")
                    .is_some_and(|&free| free < request.instance_type.memory_mb);
                let disk_short = cell
                    .capacities
                    .get("free_disk_gb")
                    .is_some_and(|&free| free < request.instance_type.disk_gb);
                ram_short || disk_short
            })
            .map(|cell| cell.name.clone())
            .collect();
        FilterOutcome::Drop(dropped)
    }
}

/// Drops candidates missing any of the request's required capability keys.
/// A capability key being present is all that's required; the specific
/// advertised values are not matched against anything here.
pub struct CapabilityFilter;

impl CellFilter for CapabilityFilter {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn filter_cells(&self, candidates: &[CellRecord], _request: &RequestSpec, properties: &FilterProperties) -> FilterOutcome {
        if properties.required_capabilities.is_empty() {
            return FilterOutcome::Continue;
        }
        let dropped: Vec<_> = candidates
            .iter()
            .filter(|cell| {
                !properties.required_capabilities.iter().all(|key| cell.capabilities.contains_key(key))
            })
            .map(|cell| cell.name.clone())
            .collect();
        FilterOutcome::Drop(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::domain_types::CellRole;
    use crate::domain_types::CellName;
    use crate::scheduler::domain_types::InstanceTypeSpec;
    use std::collections::{HashMap, HashSet};

    fn name(s: &str) -> CellName {
        CellName::try_new(s.to_string()).unwrap()
    }

    fn cell(n: &str) -> CellRecord {
        CellRecord { name: name(n), role: CellRole::Child, credentials: None, capabilities: HashMap::new(), capacities: HashMap::new() }
    }

    fn request() -> RequestSpec {
        RequestSpec {
            instance_uuids: vec![],
            instance_type: InstanceTypeSpec { name: "m1.small".to_string(), memory_mb: 2048, disk_gb: 20 },
            image: String::new(),
            security_group: vec![],
        }
    }

    #[test]
    fn capacity_filter_drops_insufficient_ram() {
        let mut low_ram = cell("child-cell2");
        low_ram.capacities.insert("free_ram_mb".to_string(), 512);
        let plenty = cell("child-cell3");
        let outcome = CapacityFilter.filter_cells(&[low_ram, plenty], &request(), &FilterProperties::default());
        match outcome {
            FilterOutcome::Drop(dropped) => assert_eq!(dropped, vec![name("child-cell2")]),
            _ => panic!("expected a drop outcome"),
        }
    }

    #[test]
    fn capacity_filter_does_not_drop_on_unknown_capacity() {
        let unknown = cell("child-cell2");
        let outcome = CapacityFilter.filter_cells(&[unknown], &request(), &FilterProperties::default());
        match outcome {
            FilterOutcome::Drop(dropped) => assert!(dropped.is_empty()),
            _ => panic!("expected a drop outcome"),
        }
    }

    #[test]
    fn capability_filter_drops_cells_missing_a_required_key() {
        let mut has_gpu = cell("child-cell2");
        has_gpu.capabilities.insert("gpu".to_string(), HashSet::from(["nvidia".to_string()]));
        let no_gpu = cell("child-cell3");
        let properties = FilterProperties { required_capabilities: vec!["gpu".to_string()], target_cell: None };
        let outcome = CapabilityFilter.filter_cells(&[has_gpu, no_gpu], &request(), &properties);
        match outcome {
            FilterOutcome::Drop(dropped) => assert_eq!(dropped, vec![name("child-cell3")]),
            _ => panic!("expected a drop outcome"),
        }
    }

    #[test]
    fn target_cell_filter_short_circuits_when_a_target_is_forced() {
        let properties = FilterProperties {
            required_capabilities: vec![],
            target_cell: Some(crate::domain_types::CellPath::parse("api-cell!child-cell2").unwrap()),
        };
        let outcome = TargetCellFilter.filter_cells(&[], &request(), &properties);
        assert!(matches!(outcome, FilterOutcome::DirectRoute(_)));
    }
}
