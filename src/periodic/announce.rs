//! Capability/capacity announce loop (spec.md §4.6)
//!
//! Grounded on the teacher's periodic-task pattern in
//! `runtime/scheduler.rs`: a `TimeProvider`-driven loop that sleeps between
//! ticks and can be driven instantly in tests via `MockTimeProvider`'s
//! `skip_delays`.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::cells::StateManager;
use crate::domain_types::{CellName, CellPath, HopCount, MaxHopCount};
use crate::router::domain_types::{Ctxt, Direction, Message, MessageKind};
use crate::router::handlers::KwArgs;
use crate::router::traits::Transport;
use crate::time_provider::SharedTimeProvider;

/// Sends a single-hop targeted capability/capacity update to every known
/// parent, fire-and-forget. Deliberately independent of
/// [`crate::router::router::Router`] so the Handler Registry can hold one
/// without a circular `Router` -> `HandlerContext` -> `Router` dependency.
pub struct AnnounceForwarder {
    my_name: CellName,
    max_hop_count: MaxHopCount,
    state: Arc<StateManager>,
    transport: Arc<dyn Transport>,
}

impl AnnounceForwarder {
    /// Builds a forwarder for `my_name`, using `state` to discover parents.
    #[must_use]
    pub fn new(
        my_name: CellName,
        max_hop_count: MaxHopCount,
        state: Arc<StateManager>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self { my_name, max_hop_count, state, transport })
    }

    /// Sends `method` with a single `payload_key: payload` kwarg to every
    /// parent cell, one hop, fire-and-forget.
    pub async fn propagate(&self, ctxt: &Ctxt, method: &str, payload_key: &str, payload: Value) {
        for parent in self.state.get_parent_cells() {
            let target_path = CellPath::new(vec![self.my_name.clone(), parent.name.clone()])
                .expect("two distinct cell names form a valid path");
            let mut kwargs = KwArgs::new();
            kwargs.insert(payload_key.to_string(), payload.clone());
            let message = Message {
                ctxt: ctxt.clone(),
                method_name: method.to_string(),
                method_kwargs: kwargs,
                direction: Direction::Up,
                routing_path: CellPath::single(self.my_name.clone()),
                hop_count: HopCount::first(),
                max_hop_count: self.max_hop_count,
                kind: MessageKind::Targeted { target_path, fanout: false },
                need_response: false,
                response_uuid: None,
                reply_to: None,
            };
            if let Err(err) = self.transport.send(&parent.name, message).await {
                warn!(parent = %parent.name, error = %err, "failed to propagate capability/capacity update");
            }
        }
    }

    /// Fires a genuine upward broadcast (`direction=up`, `run_locally=true`)
    /// to every known parent, one hop, fire-and-forget. Unlike
    /// [`AnnounceForwarder::propagate`]'s single targeted hop, each parent's
    /// own `Router::process_broadcast` continues the fan-out to its own
    /// parents, so the broadcast reaches every ancestor including the top
    /// cell without this cell needing a `Router` handle of its own. Used by
    /// `run_compute_api_method` to raise `instance_destroy_at_top` when the
    /// looked-up instance no longer exists locally (spec.md §4.4).
    pub async fn broadcast_up_fire_and_forget(&self, ctxt: &Ctxt, method: &str, kwargs: KwArgs) {
        for parent in self.state.get_parent_cells() {
            let routing_path = CellPath::new(vec![self.my_name.clone(), parent.name.clone()])
                .expect("two distinct cell names form a valid path");
            let message = Message {
                ctxt: ctxt.clone(),
                method_name: method.to_string(),
                method_kwargs: kwargs.clone(),
                direction: Direction::Up,
                routing_path,
                hop_count: HopCount::first().incremented(),
                max_hop_count: self.max_hop_count,
                kind: MessageKind::Broadcast { run_locally: true },
                need_response: false,
                response_uuid: None,
                reply_to: None,
            };
            if let Err(err) = self.transport.send(&parent.name, message).await {
                warn!(parent = %parent.name, error = %err, "failed to broadcast upward");
            }
        }
    }
}

/// Drives [`AnnounceForwarder::propagate`] on an interval, but only while
/// this cell is a leaf (has no children): an intermediate cell's upward
/// propagation happens reactively, from its `update_capabilities`/
/// `update_capacities` handlers, not from this loop.
pub struct AnnounceLoop {
    state: Arc<StateManager>,
    forwarder: Arc<AnnounceForwarder>,
    time: SharedTimeProvider,
    interval: std::time::Duration,
}

impl AnnounceLoop {
    /// Builds an announce loop that ticks every `interval`.
    #[must_use]
    pub fn new(
        state: Arc<StateManager>,
        forwarder: Arc<AnnounceForwarder>,
        time: SharedTimeProvider,
        interval: std::time::Duration,
    ) -> Self {
        Self { state, forwarder, time, interval }
    }

    /// Runs one tick: no-ops unless this cell is currently a leaf.
    pub async fn tick(&self, ctxt: &Ctxt) {
        if !self.state.get_child_cells().is_empty() {
            return;
        }
        let info = self.state.get_my_info();
        let capabilities = serde_json::to_value(&info.capabilities).unwrap_or(Value::Null);
        self.forwarder.propagate(ctxt, "announce_capabilities", "capabilities", capabilities).await;
        let capacities = serde_json::to_value(&info.capacities).unwrap_or(Value::Null);
        self.forwarder.propagate(ctxt, "announce_capacities", "capacities", capacities).await;
    }

    /// Runs forever: an immediate tick at startup, then one every
    /// `interval`, per spec.md §4.6.
    pub async fn run(self: Arc<Self>) {
        let ctxt = Ctxt::admin();
        self.tick(&ctxt).await;
        loop {
            self.time.sleep(self.interval).await;
            self.tick(&ctxt).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::domain_types::{CellRecord, CellRole, TransportCredentials};
    use crate::router::transport::InProcessTransport;
    use crate::time_provider::test_time_provider;
    use std::collections::HashMap;

    fn name(s: &str) -> CellName {
        CellName::try_new(s.to_string()).unwrap()
    }

    fn my_record(n: &str) -> CellRecord {
        CellRecord {
            name: name(n),
            role: CellRole::Me,
            credentials: None,
            capabilities: HashMap::new(),
            capacities: HashMap::new(),
        }
    }

    fn parent_record(n: &str) -> CellRecord {
        CellRecord {
            name: name(n),
            role: CellRole::Parent,
            credentials: Some(TransportCredentials {
                host: "localhost".to_string(),
                port: 5672,
                user: "guest".to_string(),
                password: "guest".to_string(),
                virtual_host: "/".to_string(),
            }),
            capabilities: HashMap::new(),
            capacities: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn leaf_cell_announces_to_its_parent() {
        let state = Arc::new(StateManager::new(my_record("child-cell2")));
        state.upsert_cell(parent_record("api-cell"));
        let transport = Arc::new(InProcessTransport::new());
        let mut parent_rx = transport.register_fanout_queue(name("api-cell"));
        let forwarder =
            AnnounceForwarder::new(name("child-cell2"), MaxHopCount::try_new(99).unwrap(), Arc::clone(&state), transport);
        let announce = AnnounceLoop::new(state, forwarder, test_time_provider(), std::time::Duration::from_secs(60));

        announce.tick(&Ctxt::admin()).await;

        let first = parent_rx.try_recv().unwrap();
        assert_eq!(first.method_name, "announce_capabilities");
        let second = parent_rx.try_recv().unwrap();
        assert_eq!(second.method_name, "announce_capacities");
    }

    #[tokio::test]
    async fn non_leaf_cell_does_not_announce() {
        let state = Arc::new(StateManager::new(my_record("api-cell")));
        state.upsert_cell(parent_record("root-cell"));
        state.upsert_cell(CellRecord {
            name: name("child-cell2"),
            role: CellRole::Child,
            credentials: None,
            capabilities: HashMap::new(),
            capacities: HashMap::new(),
        });
        let transport = Arc::new(InProcessTransport::new());
        let mut parent_rx = transport.register_fanout_queue(name("root-cell"));
        let forwarder =
            AnnounceForwarder::new(name("api-cell"), MaxHopCount::try_new(99).unwrap(), Arc::clone(&state), transport);
        let announce = AnnounceLoop::new(state, forwarder, test_time_provider(), std::time::Duration::from_secs(60));

        announce.tick(&Ctxt::admin()).await;

        assert!(parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_up_reaches_parent_as_a_genuine_broadcast() {
        let state = Arc::new(StateManager::new(my_record("child-cell2")));
        state.upsert_cell(parent_record("api-cell"));
        let transport = Arc::new(InProcessTransport::new());
        let mut parent_rx = transport.register_fanout_queue(name("api-cell"));
        let forwarder =
            AnnounceForwarder::new(name("child-cell2"), MaxHopCount::try_new(99).unwrap(), state, transport);

        let mut kwargs = KwArgs::new();
        kwargs.insert("instance_uuid".to_string(), Value::String("deadbeef".to_string()));
        forwarder.broadcast_up_fire_and_forget(&Ctxt::admin(), "instance_destroy_at_top", kwargs).await;

        let received = parent_rx.try_recv().unwrap();
        assert_eq!(received.method_name, "instance_destroy_at_top");
        assert!(matches!(received.kind, MessageKind::Broadcast { run_locally: true }));
        assert_eq!(received.routing_path.to_string(), "child-cell2!api-cell");
    }
}
