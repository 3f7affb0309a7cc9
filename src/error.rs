//! Crate-wide error taxonomy
//!
//! Each component has its own focused error enum (`db::DbError`,
//! `router::RouterError`, `scheduler::SchedulerError`); this module defines
//! the errors that are genuinely cross-cutting — they can originate in more
//! than one component and are the ones a handler or the scheduler retry loop
//! needs to pattern-match on directly.

use thiserror::Error;

use crate::domain_types::{CellPath, InstanceUuid, InvalidUuidError};

/// Errors raised while routing or handling a cell message, independent of
/// which component ultimately produced them.
#[derive(Debug, Error)]
pub enum CellsError {
    /// A targeted message's next hop could not be resolved from its
    /// `target_path` against the local cell's routing path.
    #[error("cell routing inconsistency: no next hop for target {target_path} from {routing_path}")]
    CellRoutingInconsistency {
        /// The message's declared target path.
        target_path: CellPath,
        /// The routing path accumulated so far.
        routing_path: CellPath,
    },

    /// A targeted message exceeded its configured maximum hop count.
    #[error("max hop count reached: hop {hop_count} > max {max_hop_count}")]
    CellMaxHopCountReached {
        /// The hop count at which the message was bounced.
        hop_count: u32,
        /// The configured maximum.
        max_hop_count: u32,
    },

    /// No candidate cell could be found to place a new instance on.
    #[error("no cells available to schedule onto")]
    NoCellsAvailable,

    /// No handler is registered for a `(kind, method_name)` pair.
    #[error("no handler registered for method {0:?}")]
    MethodNotFound(String),

    /// A requested instance does not exist in the authoritative store.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceUuid),

    /// A string that should have parsed as a UUID did not.
    #[error(transparent)]
    InvalidUuid(#[from] InvalidUuidError),

    /// A new instance's hostname collided with an existing one.
    #[error("instance already exists with hostname {hostname}")]
    InstanceExists {
        /// The colliding hostname.
        hostname: String,
    },

    /// An optimistic task-state compare-and-swap did not match.
    #[error("unexpected task state for {uuid}: expected {expected:?}, found {actual:?}")]
    UnexpectedTaskState {
        /// The instance whose state mismatched.
        uuid: InstanceUuid,
        /// The state the caller expected.
        expected: String,
        /// The state actually stored.
        actual: String,
    },

    /// An optimistic vm-state compare-and-swap did not match.
    #[error("unexpected vm state for {uuid}: expected {expected:?}, found {actual:?}")]
    UnexpectedVmState {
        /// The instance whose state mismatched.
        uuid: InstanceUuid,
        /// The state the caller expected.
        expected: String,
        /// The state actually stored.
        actual: String,
    },

    /// A wrapped database error that survived the retry policy.
    #[error(transparent)]
    Db(#[from] crate::db::DbError),

    /// The transport reported a failure delivering an envelope.
    #[error("transport error reaching {0}")]
    Transport(String),

    /// A response-expecting call exceeded its overall timeout.
    #[error("call timed out waiting for a response")]
    CallTimedOut,

    /// A scheduler request's `request_spec`/`filter_properties` kwargs did
    /// not parse into the expected shape.
    #[error("invalid scheduler request: {0}")]
    InvalidRequestSpec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_routing_inconsistency_displays_both_paths() {
        use crate::domain_types::CellName;
        let target = CellPath::single(CellName::try_new("api-cell".to_string()).unwrap());
        let routing = target.clone();
        let err = CellsError::CellRoutingInconsistency {
            target_path: target,
            routing_path: routing,
        };
        assert!(err.to_string().contains("api-cell"));
    }
}
