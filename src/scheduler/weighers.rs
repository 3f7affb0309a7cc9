//! Built-in cell weighers (spec.md §4.5.1)
//!
//! Grounded on `nova/cells/weights/{ram_by_instance_type,mute_child}.py`:
//! each weigher scores one candidate independently; the scheduler sums
//! scores across every configured weigher before its stable sort.

use crate::cells::domain_types::CellRecord;
use crate::scheduler::domain_types::{CellWeigher, RequestSpec};

/// Favors cells with more free RAM relative to the requested flavor's
/// memory. A cell with no known capacity scores zero rather than being
/// penalized, so an unknown-capacity candidate can still win on other
/// weighers.
pub struct RamByInstanceTypeWeigher;

impl CellWeigher for RamByInstanceTypeWeigher {
    fn name(&self) -> &'static str {
        "ram_by_instance_type"
    }

    fn weigh(&self, cell: &CellRecord, request: &RequestSpec) -> f64 {
        match cell.capacities.get("free_ram_mb") {
            Some(&free_ram_mb) => (free_ram_mb - request.instance_type.memory_mb) as f64,
            None => 0.0,
        }
    }
}

/// A small flat tie-breaker favoring cells that report any capacity
/// information at all over ones the state manager knows nothing about,
/// without otherwise affecting ordering among cells with real capacity
/// numbers (`RamByInstanceTypeWeigher` dominates; this just keeps an
/// all-unknown candidate set from being a complete coin flip).
pub struct ChildCellWeigher;

impl CellWeigher for ChildCellWeigher {
    fn name(&self) -> &'static str {
        "child_cell"
    }

    fn weigh(&self, cell: &CellRecord, _request: &RequestSpec) -> f64 {
        if cell.has_capacities() {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::domain_types::CellRole;
    use crate::domain_types::CellName;
    use crate::scheduler::domain_types::InstanceTypeSpec;
    use std::collections::HashMap;

    fn request() -> RequestSpec {
        RequestSpec {
            instance_uuids: vec![],
            instance_type: InstanceTypeSpec { name: "m1.small".to_string(), memory_mb: 2048, disk_gb: 20 },
            image: String::new(),
            security_group: vec![],
        }
    }

    fn cell(free_ram_mb: Option<i64>) -> CellRecord {
        let mut capacities = HashMap::new();
        if let Some(ram) = free_ram_mb {
            capacities.insert("free_ram_mb".to_string(), ram);
        }
        CellRecord {
            name: CellName::try_new("child-cell2".to_string()).unwrap(),
            role: CellRole::Child,
            credentials: None,
            capabilities: HashMap::new(),
            capacities,
        }
    }

    #[test]
    fn ram_weigher_favors_more_headroom() {
        let roomy = RamByInstanceTypeWeigher.weigh(&cell(Some(8192)), &request());
        let tight = RamByInstanceTypeWeigher.weigh(&cell(Some(2048)), &request());
        assert!(roomy > tight);
    }

    #[test]
    fn ram_weigher_scores_unknown_capacity_as_neutral() {
        assert_eq!(RamByInstanceTypeWeigher.weigh(&cell(None), &request()), 0.0);
    }

    #[test]
    fn child_cell_weigher_prefers_cells_with_known_capacity() {
        assert!(ChildCellWeigher.weigh(&cell(Some(1)), &request()) > ChildCellWeigher.weigh(&cell(None), &request()));
    }
}
