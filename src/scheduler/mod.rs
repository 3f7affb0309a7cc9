//! Scheduler (C5): the filter/weigh/retry pipeline that places a new
//! instance request onto a cell.

pub mod domain_types;
pub mod filters;
pub mod scheduler;
pub mod weighers;

pub use domain_types::{CellFilter, CellWeigher, FilterOutcome, FilterProperties, InstanceTypeSpec, RequestSpec, WeighedCell};
pub use scheduler::{HostScheduler, InstanceCreator, Scheduler, SchedulerConfig};
