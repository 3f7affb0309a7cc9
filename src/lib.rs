//! # cellrouter
//!
//! A hierarchical control-plane router for a cell-partitioned compute
//! fleet: every deployment cell runs the same binary, forming a tree of
//! API-facing and compute-facing cells that route requests down toward
//! capacity and fan status updates back up toward the root.
//!
//! ## Components
//!
//! - [`db`] — DB Gateway (C1): pooled connections, retry-on-transient-error,
//!   and a schema-versioned model registry.
//! - [`cells`] — State Manager (C2): this cell's view of its own identity,
//!   its parents, and its children.
//! - [`router`] — Message Router (C3) and Handler Registry (C4): envelope
//!   construction, targeted/broadcast dispatch, and the named RPC surface.
//! - [`scheduler`] — Scheduler (C5): the filter/weigh/retry pipeline that
//!   places a new instance.
//! - [`periodic`] — Periodic Loops (C6): capability/capacity announce and
//!   instance heal.

pub mod cells;
pub mod db;
pub mod domain_types;
pub mod error;
pub mod periodic;
pub mod router;
pub mod scheduler;
pub mod time_provider;

pub use error::CellsError;
