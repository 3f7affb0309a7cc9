//! Scheduler (C5) request/candidate value types
//!
//! Grounded on spec.md §4.5's filter/weigh pipeline, modeled as narrow
//! traits in the teacher's style (`message_router/traits.rs`'s `Transport`)
//! so the filter and weigher implementations in [`crate::scheduler::filters`]
//! / [`crate::scheduler::weighers`] stay independently testable.

use serde::{Deserialize, Serialize};

use crate::cells::domain_types::CellRecord;
use crate::domain_types::{CellName, CellPath, InstanceUuid};

/// The instance type (flavor) being scheduled, the subset of attributes the
/// built-in filters/weighers reason about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeSpec {
    /// Flavor name, e.g. `m1.small`.
    pub name: String,
    /// Requested memory, in MB.
    pub memory_mb: i64,
    /// Requested root disk, in GB.
    pub disk_gb: i64,
}

/// A new-instance request, the cells equivalent of Nova's `request_spec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Uuids pre-allocated for the instance(s) being scheduled.
    pub instance_uuids: Vec<InstanceUuid>,
    /// The requested flavor.
    pub instance_type: InstanceTypeSpec,
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// Requested security groups.
    #[serde(default)]
    pub security_group: Vec<String>,
}

/// Scheduling hints carried alongside a [`RequestSpec`]: required
/// capabilities and an optional forced target cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterProperties {
    /// Capability keys every candidate cell must advertise.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// A caller-forced target cell path, short-circuiting filtering and
    /// weighing entirely (spec.md §4.5 step 2).
    #[serde(default)]
    pub target_cell: Option<CellPath>,
}

/// The result of running one filter over the current candidate set.
pub enum FilterOutcome {
    /// No effect: every current candidate remains.
    Continue,
    /// Short-circuit straight to `target`, skipping weighing and the
    /// remaining candidates entirely.
    DirectRoute(CellPath),
    /// Remove these cells (by name) from the candidate set.
    Drop(Vec<CellName>),
}

/// A single filtering stage of the scheduler pipeline.
pub trait CellFilter: Send + Sync {
    /// A stable name, used in [`super::scheduler::SchedulerConfig`]'s
    /// filter-list resolution.
    fn name(&self) -> &'static str;

    /// Evaluates this filter against the current candidates.
    fn filter_cells(&self, candidates: &[CellRecord], request: &RequestSpec, properties: &FilterProperties) -> FilterOutcome;
}

/// A single weighing stage of the scheduler pipeline. Weights from every
/// configured weigher are summed per candidate before the stable sort.
pub trait CellWeigher: Send + Sync {
    /// A stable name, used in [`super::scheduler::SchedulerConfig`]'s
    /// weigher-list resolution.
    fn name(&self) -> &'static str;

    /// Scores one candidate; higher is preferred.
    fn weigh(&self, cell: &CellRecord, request: &RequestSpec) -> f64;
}

/// A candidate cell paired with its final summed weight.
#[derive(Debug, Clone)]
pub struct WeighedCell {
    /// The candidate.
    pub cell: CellRecord,
    /// Its total weight across every configured weigher.
    pub weight: f64,
}
