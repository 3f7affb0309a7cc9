//! An in-process [`Transport`] backed by `tokio::mpsc` channels
//!
//! Grounded on the teacher's `DeliveryEngineImpl`
//! (`message_router/implementations/delivery_engine.rs`): a `DashMap`
//! keyed by destination holding one `mpsc::Sender` per queue, with
//! `try_send` used so a saturated queue surfaces as a transport error
//! rather than blocking the sender. Suitable for tests and single-process
//! deployments; a real pub/sub client is out of core (spec.md §6.1).

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::domain_types::CellName;
use crate::router::domain_types::Message;
use crate::router::traits::{Transport, TransportError};

/// Default bounded capacity for a registered queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// An in-process transport: fanout ("request") queues keyed by cell name,
/// and direct ("response") queues keyed by host name, per spec.md §4.3's
/// fanout/direct partitioning.
#[derive(Default)]
pub struct InProcessTransport {
    fanout_queues: DashMap<CellName, mpsc::Sender<Message>>,
    direct_queues: DashMap<CellName, mpsc::Sender<Message>>,
}

impl InProcessTransport {
    /// Builds an empty transport; cells must [`InProcessTransport::register_fanout_queue`]
    /// / [`InProcessTransport::register_direct_queue`] before messages can reach them.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fanout (request) queue for `cell`, returning the
    /// receiving half for that cell's message-processing loop to drain.
    pub fn register_fanout_queue(&self, cell: CellName) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        self.fanout_queues.insert(cell, tx);
        rx
    }

    /// Registers a direct (response) queue for `host`, returning the
    /// receiving half.
    pub fn register_direct_queue(&self, host: CellName) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        self.direct_queues.insert(host, tx);
        rx
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, next_hop: &CellName, message: Message) -> Result<(), TransportError> {
        let sender = self
            .fanout_queues
            .get(next_hop)
            .ok_or_else(|| TransportError::UnknownTopic(next_hop.to_string()))?
            .clone();
        sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull(next_hop.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::Disconnected(next_hop.to_string())
            }
        })
    }

    async fn send_direct(&self, host: &CellName, message: Message) -> Result<(), TransportError> {
        let sender = self
            .direct_queues
            .get(host)
            .ok_or_else(|| TransportError::UnknownHost(host.to_string()))?
            .clone();
        sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull(host.to_string()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Disconnected(host.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{CellPath, HopCount, MaxHopCount};
    use crate::router::domain_types::{Ctxt, Direction, MessageKind};
    use std::collections::BTreeMap;

    fn name(s: &str) -> CellName {
        CellName::try_new(s.to_string()).unwrap()
    }

    fn sample_message() -> Message {
        Message {
            ctxt: Ctxt::admin(),
            method_name: "echo".to_string(),
            method_kwargs: BTreeMap::new(),
            direction: Direction::Down,
            routing_path: CellPath::parse("api-cell").unwrap(),
            hop_count: HopCount::first(),
            max_hop_count: MaxHopCount::try_new(99).unwrap(),
            kind: MessageKind::Broadcast { run_locally: true },
            need_response: false,
            response_uuid: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn send_to_unregistered_topic_errors() {
        let transport = InProcessTransport::new();
        let result = transport.send(&name("nowhere"), sample_message()).await;
        assert!(matches!(result, Err(TransportError::UnknownTopic(_))));
    }

    #[tokio::test]
    async fn send_delivers_to_registered_receiver() {
        let transport = InProcessTransport::new();
        let mut rx = transport.register_fanout_queue(name("child-cell2"));
        transport.send(&name("child-cell2"), sample_message()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_direct_uses_the_host_queue_not_the_fanout_queue() {
        let transport = InProcessTransport::new();
        let mut fanout_rx = transport.register_fanout_queue(name("api-cell"));
        let mut direct_rx = transport.register_direct_queue(name("api-cell"));
        transport.send_direct(&name("api-cell"), sample_message()).await.unwrap();
        assert!(direct_rx.try_recv().is_ok());
        assert!(fanout_rx.try_recv().is_err());
    }
}
