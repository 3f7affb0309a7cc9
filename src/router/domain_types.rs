//! Message envelope and request-context value types
//!
//! Grounded on the teacher's `FipaMessage`/`MessageParticipants`
//! "illegal states unrepresentable" pattern (`message_router/
//! domain_types.rs`): the envelope's kind-specific fields (`target_path`,
//! `fanout`, `run_locally`, `response_uuid`) are modeled as an enum so a
//! broadcast envelope simply cannot carry a `target_path`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::ReadDeleted;
use crate::domain_types::{CellName, CellPath, HopCount, MaxHopCount};

/// `direction` ∈ {up, down}: which way along the tree a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Toward the root (children → parents).
    Up,
    /// Away from the root (parents → children).
    Down,
}

impl Direction {
    /// The direction a response travels relative to its originating
    /// request: always the opposite way.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Opaque request context: user/project identity, an admin override flag,
/// and the soft-delete read policy. Derived values are produced by copying,
/// per the REDESIGN note in spec.md §9 — nothing here is ever mutated
/// in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctxt {
    /// Acting user id.
    pub user_id: String,
    /// Acting project id.
    pub project_id: String,
    /// Whether this context carries admin privileges.
    pub is_admin: bool,
    /// Soft-delete read policy in effect for DB reads made under this
    /// context.
    pub read_deleted: ReadDeleted,
}

impl Ctxt {
    /// Builds an ordinary, non-admin, non-deleted-reading context.
    #[must_use]
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            is_admin: false,
            read_deleted: ReadDeleted::No,
        }
    }

    /// An admin context, suitable for system-internal calls like the heal
    /// loop's instance queries.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            user_id: "admin".to_string(),
            project_id: "admin".to_string(),
            is_admin: true,
            read_deleted: ReadDeleted::No,
        }
    }

    /// Derives a copy of this context elevated to admin with the given
    /// soft-delete read policy, the way the heal loop elevates its context
    /// to `read_deleted='yes'` without mutating the caller's original
    /// context.
    #[must_use]
    pub fn elevated(&self, read_deleted: ReadDeleted) -> Self {
        Self { is_admin: true, read_deleted, ..self.clone() }
    }
}

/// Kind-specific fields of a [`Message`], modeled so illegal combinations
/// (a broadcast with a `target_path`, a response with `fanout`) cannot be
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageKind {
    /// Delivered to exactly one cell along `target_path`.
    Targeted {
        /// Absolute path of the cell this message must reach.
        target_path: CellPath,
        /// Whether responses use the fanout request queue rather than a
        /// direct per-host queue (targeted messages default to `false`;
        /// broadcasts always use fanout for the request leg).
        fanout: bool,
    },
    /// Delivered to every cell reachable in `direction` from the sender.
    Broadcast {
        /// Whether the sending cell also dispatches the message to itself
        /// before fanning out.
        run_locally: bool,
    },
    /// A reply to a single hop's request. Delivered directly to the
    /// requester's per-host queue (`reply_to`) rather than relayed through
    /// the fanout topic, per spec.md §4.3's response routing; correlation
    /// uses the enclosing [`Message`]'s `response_uuid`, echoed back
    /// unchanged from the request it answers. A broadcast forward's
    /// response aggregates its whole subtree into one JSON array carried
    /// in [`Response::outcome`], which the caller flattens one level per
    /// hop as it bubbles back toward the origin.
    Response {
        /// The responding cell's full routing path and outcome; unchanged
        /// as the envelope relays backward.
        payload: Box<Response>,
    },
}

/// The message envelope passed between cells (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Request context.
    pub ctxt: Ctxt,
    /// Named handler to invoke at the terminus.
    pub method_name: String,
    /// Arguments for the handler.
    pub method_kwargs: BTreeMap<String, Value>,
    /// Direction of travel.
    pub direction: Direction,
    /// Cells already traversed, leftmost = origin.
    pub routing_path: CellPath,
    /// Hops taken so far.
    pub hop_count: HopCount,
    /// Hop budget for this message.
    pub max_hop_count: MaxHopCount,
    /// Kind-specific fields.
    pub kind: MessageKind,
    /// Whether the caller is waiting on a correlated response.
    pub need_response: bool,
    /// Correlates one hop's response-expecting send with the single
    /// [`MessageKind::Response`] envelope it produces. Minted fresh by the
    /// sending cell for each outbound hop (a single-hop RPC correlation,
    /// not a tree-wide identifier) and echoed back unchanged on the reply.
    /// `None` for fire-and-forget messages.
    pub response_uuid: Option<Uuid>,
    /// The immediate sender's name for this hop, so a response can be
    /// delivered directly to the sender's per-host queue without a
    /// multi-hop relay (spec.md §4.3's fanout/direct partitioning).
    /// `None` for fire-and-forget messages.
    pub reply_to: Option<CellName>,
}

impl Message {
    /// The originating cell: the first segment of `routing_path`.
    #[must_use]
    pub fn origin(&self) -> &crate::domain_types::CellName {
        self.routing_path.first()
    }
}

/// A response to a single cell's handling of a message. Exactly one of
/// `value`/`failure` is ever set — modeled as an enum rather than two
/// `Option` fields so that invariant is structural.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseOutcome {
    /// The handler ran successfully, producing this value.
    Value(Value),
    /// The handler (or routing) failed; carries a reconstructable remote
    /// failure description.
    Failure(RemoteFailure),
}

/// A serializable description of a remote failure, carrying enough to
/// reconstruct a typed error on the receiving side. Unknown `kind` values
/// deserialize successfully but are treated as a generic remote error by
/// `value_or_raise`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// A stable identifier for the failure's originating error type.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteFailure {
    /// Builds a remote failure from any crate error via its `Display` and
    /// a best-effort `kind` derived from its enum variant name.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }
}

/// The per-cell response to a broadcast, or the single response to a
/// targeted call: `{cell_name, value, failure}` with `value_or_raise`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The routing path of the cell that produced this response.
    pub cell_name: CellPath,
    /// The outcome: success value or failure description.
    pub outcome: ResponseOutcome,
}

impl Response {
    /// Builds a successful response.
    #[must_use]
    pub fn success(cell_name: CellPath, value: Value) -> Self {
        Self { cell_name, outcome: ResponseOutcome::Value(value) }
    }

    /// Builds a failed response.
    #[must_use]
    pub fn failure(cell_name: CellPath, failure: RemoteFailure) -> Self {
        Self { cell_name, outcome: ResponseOutcome::Failure(failure) }
    }

    /// Returns the success value, or reconstructs and returns the stored
    /// failure as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns the stored [`RemoteFailure`] if this response carries one.
    pub fn value_or_raise(self) -> Result<Value, RemoteFailure> {
        match self.outcome {
            ResponseOutcome::Value(value) => Ok(value),
            ResponseOutcome::Failure(failure) => Err(failure),
        }
    }

    /// Whether this response carries a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Failure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_or_raise_returns_value_on_success() {
        let response = Response::success(
            CellPath::parse("api-cell").unwrap(),
            Value::String("ok".to_string()),
        );
        assert_eq!(response.value_or_raise().unwrap(), Value::String("ok".to_string()));
    }

    #[test]
    fn value_or_raise_returns_failure_on_failure() {
        let response = Response::failure(
            CellPath::parse("api-cell").unwrap(),
            RemoteFailure::new("CellMaxHopCountReached", "too many hops"),
        );
        assert_eq!(
            response.value_or_raise().unwrap_err(),
            RemoteFailure::new("CellMaxHopCountReached", "too many hops")
        );
    }

    #[test]
    fn elevated_context_does_not_mutate_original() {
        let ctxt = Ctxt::new("alice", "proj-1");
        let elevated = ctxt.elevated(ReadDeleted::Yes);
        assert!(!ctxt.is_admin);
        assert!(elevated.is_admin);
        assert_eq!(elevated.read_deleted, ReadDeleted::Yes);
    }

    #[test]
    fn direction_reversed_is_an_involution() {
        assert_eq!(Direction::Up.reversed().reversed(), Direction::Up);
    }
}
