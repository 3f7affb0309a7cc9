//! The Transport boundary (spec.md §6.1)
//!
//! Grounded on the teacher's `DeliveryEngine` trait
//! (`message_router/traits.rs`): the router depends on a narrow async trait
//! rather than a concrete pub/sub client, so it can be exercised and tested
//! without a real message bus.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain_types::{CellName, CellPath};
use crate::router::domain_types::{Ctxt, Direction, Message, Response};
use crate::router::handlers::KwArgs;

/// Errors a [`Transport`] implementation can report back to the router.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No queue is registered for the given topic.
    #[error("no queue registered for topic {0:?}")]
    UnknownTopic(String),
    /// No direct queue is registered for the given host.
    #[error("no direct queue registered for host {0:?}")]
    UnknownHost(String),
    /// The receiving end of the channel has been dropped.
    #[error("receiver for {0:?} has disconnected")]
    Disconnected(String),
    /// The channel's buffer is full and the send could not be queued.
    #[error("channel for {0:?} is full")]
    ChannelFull(String),
}

/// The narrow interface the Message Router needs from the underlying
/// pub/sub bus: fanout delivery to a named topic, and direct delivery to a
/// specific host's response queue (spec.md §6's `cells.intercell` topic
/// contract).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes `message` to the fanout topic for `next_hop` (a request
    /// leg: targeted or broadcast).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if `next_hop` has no registered queue or
    /// delivery otherwise fails.
    async fn send(&self, next_hop: &CellName, message: Message) -> Result<(), TransportError>;

    /// Publishes `message` directly to the per-host response queue for
    /// `host`, bypassing the fanout topic to avoid the response-path
    /// deadlock described in spec.md §4.3.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if `host` has no registered direct queue
    /// or delivery otherwise fails.
    async fn send_direct(&self, host: &CellName, message: Message) -> Result<(), TransportError>;
}

/// Narrow interface onto the Message Router, implemented by
/// [`crate::router::router::Router`] and used by the Scheduler (C5) to
/// forward a scheduling decision one hop without depending on the router's
/// response-correlation internals.
#[async_trait]
pub trait RouterForwarding: Send + Sync {
    /// Sends a single-hop targeted call toward `target` and awaits its
    /// response.
    async fn forward_targeted(
        &self,
        ctxt: Ctxt,
        method: &str,
        kwargs: KwArgs,
        target: CellPath,
        direction: Direction,
    ) -> Response;
}
