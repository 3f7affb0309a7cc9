//! Cell record types owned by the [`crate::cells::StateManager`]

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain_types::CellName;

/// Where a cell sits relative to this one, per spec.md §3's invariant that
/// exactly one record has role=self and parents/children are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellRole {
    /// The local cell itself.
    Me,
    /// A cell one hop up the tree.
    Parent,
    /// A cell one hop down the tree.
    Child,
}

/// Transport credentials for reaching a parent or child cell. Absent for
/// the local cell's own record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCredentials {
    /// Transport host.
    pub host: String,
    /// Transport port.
    pub port: u16,
    /// Transport user.
    pub user: String,
    /// Transport password.
    pub password: String,
    /// Transport virtual host (e.g. an AMQP vhost).
    pub virtual_host: String,
}

/// Opaque qualitative capability advertisement: a multi-valued
/// string-to-string-set map, merged across descendants per spec.md §9's
/// open-question resolution (set-union for multi-valued keys).
pub type Capabilities = HashMap<String, HashSet<String>>;

/// Opaque quantitative capacity advertisement, e.g. free RAM/disk.
pub type Capacities = HashMap<String, i64>;

/// One entry in the State Manager's identity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Short local name.
    pub name: CellName,
    /// Position relative to the local cell.
    pub role: CellRole,
    /// Transport credentials; `None` only for `role == Me`.
    pub credentials: Option<TransportCredentials>,
    /// Last-known capabilities advertised by (or merged beneath) this cell.
    pub capabilities: Capabilities,
    /// Last-known capacities advertised by (or merged beneath) this cell.
    pub capacities: Capacities,
}

impl CellRecord {
    /// Whether this record is the local cell's own entry.
    #[must_use]
    pub fn is_me(&self) -> bool {
        matches!(self.role, CellRole::Me)
    }

    /// Whether this record has any capacity information recorded.
    #[must_use]
    pub fn has_capacities(&self) -> bool {
        !self.capacities.is_empty()
    }
}
