//! State Manager (C2): this cell's view of its own identity, its parents,
//! and its children, including their last-known capabilities/capacities.

pub mod domain_types;
pub mod state_manager;

pub use domain_types::{CellRecord, CellRole, Capabilities, Capacities, TransportCredentials};
pub use state_manager::{StateManager, StateManagerError};
