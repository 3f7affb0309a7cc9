//! Handler Registry (C4): dispatch of received messages to named handlers
//!
//! Grounded on `nova/cells/manager.py`'s `targeted_methods`/`broadcast_methods`
//! dictionaries, replaced per the REDESIGN note in spec.md §9 with an
//! explicit registry keyed by string rather than dynamic attribute lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::cells::StateManager;
use crate::db::gateway::{task_state_column, vm_state_column, DbGateway, InstanceUpdateValues};
use crate::db::ReadDeleted;
use crate::domain_types::{CellName, InstanceUuid, TaskState, VmState};
use crate::error::CellsError;
use crate::periodic::AnnounceForwarder;
use crate::router::domain_types::{Ctxt, Message};

/// Arguments passed to a handler, the JSON-valued counterpart of the
/// original's `**kwargs`.
pub type KwArgs = BTreeMap<String, Value>;

/// Narrow interface onto the end-user compute API, out of core per
/// spec.md §1: the router invokes it by name but does not redefine its
/// semantics. A production deployment supplies a real implementation that
/// talks to the compute service; tests supply a stub.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Invokes a named compute-API operation against an instance already
    /// resolved locally, backing `run_compute_api_method`.
    async fn invoke(
        &self,
        ctxt: &Ctxt,
        method: &str,
        uuid: InstanceUuid,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError>;
}

/// Narrow interface onto the cells scheduler, implemented by
/// [`crate::scheduler::Scheduler`]. Kept as a trait so the Handler Registry
/// does not depend on the scheduler's internals, only its entry point.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Runs the filter/weigh/retry pipeline for a new-instance request.
    async fn run_instance(&self, ctxt: Ctxt, kwargs: KwArgs) -> Result<(), CellsError>;
}

/// Shared services every handler may need: the router itself (to forward
/// sub-messages), the DB Gateway, the State Manager, the scheduler, and the
/// compute API stub. Passed by reference at dispatch time rather than
/// captured into the registry, so handlers stay free functions/structs with
/// no circular ownership of the router.
pub struct HandlerContext {
    /// This cell's own name.
    pub my_name: CellName,
    /// DB Gateway for local reads/writes.
    pub db: Arc<DbGateway>,
    /// This cell's identity graph.
    pub state: Arc<StateManager>,
    /// Scheduler entry point.
    pub scheduler: Arc<dyn SchedulerApi>,
    /// Compute API stub.
    pub compute: Arc<dyn ComputeApi>,
    /// Single-hop upward forwarder for capability/capacity propagation.
    pub announcer: Arc<AnnounceForwarder>,
}

/// A single named handler, targeted or broadcast.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Executes the handler, returning the value to carry in a success
    /// [`crate::router::domain_types::Response`].
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError>;
}

/// Two disjoint maps — `targeted_methods` and `broadcast_methods` — keyed by
/// method name, per spec.md §4.4.
#[derive(Default)]
pub struct HandlerRegistry {
    targeted: BTreeMap<String, Arc<dyn Handler>>,
    broadcast: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// An empty registry; use [`HandlerRegistry::with_defaults`] to populate
    /// it with the handlers spec.md §4.4 requires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a targeted-method handler.
    pub fn register_targeted(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.targeted.insert(method.into(), handler);
    }

    /// Registers a broadcast-method handler.
    pub fn register_broadcast(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.broadcast.insert(method.into(), handler);
    }

    /// Looks up a targeted handler by name.
    ///
    /// # Errors
    ///
    /// Returns [`CellsError::MethodNotFound`] if no targeted handler is
    /// registered under `method`.
    pub fn targeted(&self, method: &str) -> Result<&Arc<dyn Handler>, CellsError> {
        self.targeted.get(method).ok_or_else(|| CellsError::MethodNotFound(method.to_string()))
    }

    /// Looks up a broadcast handler by name.
    ///
    /// # Errors
    ///
    /// Returns [`CellsError::MethodNotFound`] if no broadcast handler is
    /// registered under `method`.
    pub fn broadcast(&self, method: &str) -> Result<&Arc<dyn Handler>, CellsError> {
        self.broadcast.get(method).ok_or_else(|| CellsError::MethodNotFound(method.to_string()))
    }

    /// Builds a registry with every handler spec.md §4.4 requires.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_targeted("schedule_run_instance", Arc::new(ScheduleRunInstance));
        registry.register_targeted("run_compute_api_method", Arc::new(RunComputeApiMethod));
        registry.register_targeted("instance_update", Arc::new(InstanceUpdate));
        registry.register_targeted("update_capabilities", Arc::new(UpdateCapabilities));
        registry.register_targeted("update_capacities", Arc::new(UpdateCapacities));
        registry.register_targeted("announce_capabilities", Arc::new(UpdateCapabilities));
        registry.register_targeted("announce_capacities", Arc::new(UpdateCapacities));
        registry.register_broadcast("instance_update_at_top", Arc::new(InstanceUpdateAtTop));
        registry.register_broadcast("instance_destroy_at_top", Arc::new(InstanceDestroyAtTop));
        registry.register_broadcast("instance_delete_everywhere", Arc::new(InstanceDeleteEverywhere));
        registry.register_broadcast("instance_fault_create_at_top", Arc::new(InstanceFaultCreateAtTop));
        registry.register_broadcast("bw_usage_update_at_top", Arc::new(BwUsageUpdateAtTop));
        registry.register_broadcast("sync_instances", Arc::new(SyncInstances));
        registry
    }
}

fn string_kwarg<'a>(kwargs: &'a KwArgs, key: &str) -> Option<&'a str> {
    kwargs.get(key).and_then(Value::as_str)
}

fn uuid_kwarg(kwargs: &KwArgs, key: &str) -> Result<InstanceUuid, CellsError> {
    let raw = string_kwarg(kwargs, key).ok_or_else(|| CellsError::MethodNotFound(key.to_string()))?;
    InstanceUuid::parse(raw).map_err(CellsError::from)
}

/// Re-broadcasts every instance updated since `updated_since` (all
/// instances, if omitted) upward as `instance_update_at_top`/
/// `instance_destroy_at_top`. This is the on-demand counterpart of
/// [`crate::periodic::heal::HealLoop::announce_one`]'s per-instance
/// logic — same per-row method selection, just driven by an incoming
/// `sync_instances` request instead of a timer (spec.md §4.4, §2 flow;
/// grounded on `nova/cells/manager.py`'s `sync_instances`, which re-heals
/// on demand rather than waiting for the next heal-loop tick).
struct SyncInstances;

#[async_trait]
impl Handler for SyncInstances {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let updated_since = string_kwarg(kwargs, "updated_since")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let read_deleted =
            if kwargs.get("deleted").and_then(Value::as_bool).unwrap_or(false) { ReadDeleted::Yes } else { ReadDeleted::No };

        let rows = ctx.db.instance_get_all(read_deleted, updated_since).await?;
        for row in rows {
            let mut announce_kwargs = KwArgs::new();
            announce_kwargs.insert("instance_uuid".to_string(), Value::String(row.uuid.to_string()));
            let method = if row.deleted {
                "instance_destroy_at_top"
            } else {
                announce_kwargs.insert("vm_state".to_string(), Value::String(vm_state_column(row.vm_state.0).to_string()));
                announce_kwargs
                    .insert("task_state".to_string(), Value::String(task_state_column(row.task_state.0).to_string()));
                if let Some(hostname) = row.hostname {
                    announce_kwargs.insert("hostname".to_string(), Value::String(hostname));
                }
                "instance_update_at_top"
            };
            ctx.announcer.broadcast_up_fire_and_forget(&message.ctxt, method, announce_kwargs).await;
        }
        Ok(Value::Null)
    }
}

/// Writes `vm_state`/`task_state`/`hostname` for `instance_uuid` directly
/// via the DB Gateway. The targeted counterpart of
/// [`InstanceUpdateAtTop`]'s broadcast write, used where a caller needs to
/// update one specific cell's view of an instance by a single hop rather
/// than fan the write out to an entire subtree — currently the
/// [`crate::scheduler::scheduler::Scheduler`]'s upward error-marking path
/// (spec.md §4.5: "mark the instance `ERROR` ... via an upward RPC").
struct InstanceUpdate;

#[async_trait]
impl Handler for InstanceUpdate {
    async fn call(
        &self,
        ctx: &HandlerContext,
        _message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        let values = InstanceUpdateValues {
            vm_state: string_kwarg(kwargs, "vm_state").and_then(parse_vm_state),
            task_state: string_kwarg(kwargs, "task_state").and_then(parse_task_state),
            hostname: string_kwarg(kwargs, "hostname").map(str::to_string),
        };
        ctx.db.instance_update(uuid, &values, false).await?;
        Ok(Value::Null)
    }
}

/// Merges an `update_capabilities` advertisement from the sending cell into
/// the State Manager, then — if this cell itself has a parent — forwards its
/// own newly-merged aggregate upward, one hop. `announce_capabilities` is
/// registered against the same handler: both names describe the identical
/// wire operation (a leaf's periodic tick uses the latter, an intermediate
/// cell's reactive repropagation uses the former), so there is no reason to
/// duplicate the merge logic between them.
struct UpdateCapabilities;

#[async_trait]
impl Handler for UpdateCapabilities {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let sender = message.origin().clone();
        let update = kwargs
            .get("capabilities")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        ctx.state.update_cell_capabilities(&sender, update);

        if !ctx.state.get_parent_cells().is_empty() {
            let aggregate = ctx.state.aggregate_capabilities();
            let payload = serde_json::to_value(&aggregate).unwrap_or(Value::Null);
            ctx.announcer.propagate(&message.ctxt, "update_capabilities", "capabilities", payload).await;
        }
        Ok(Value::Null)
    }
}

/// The capacities counterpart of [`UpdateCapabilities`].
struct UpdateCapacities;

#[async_trait]
impl Handler for UpdateCapacities {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let sender = message.origin().clone();
        let update = kwargs
            .get("capacities")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        ctx.state.update_cell_capacities(&sender, update);

        if !ctx.state.get_parent_cells().is_empty() {
            let aggregate = ctx.state.aggregate_capacities();
            let payload = serde_json::to_value(&aggregate).unwrap_or(Value::Null);
            ctx.announcer.propagate(&message.ctxt, "update_capacities", "capacities", payload).await;
        }
        Ok(Value::Null)
    }
}

struct ScheduleRunInstance;

#[async_trait]
impl Handler for ScheduleRunInstance {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        ctx.scheduler.run_instance(message.ctxt.clone(), kwargs.clone()).await?;
        Ok(Value::Null)
    }
}

struct RunComputeApiMethod;

#[async_trait]
impl Handler for RunComputeApiMethod {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        let method = string_kwarg(kwargs, "method")
            .ok_or_else(|| CellsError::MethodNotFound("method".to_string()))?;
        match ctx.db.instance_get_by_uuid(uuid, ReadDeleted::No).await {
            Ok(_) => ctx.compute.invoke(&message.ctxt, method, uuid, kwargs).await,
            Err(crate::db::DbError::Fatal(sqlx::Error::RowNotFound)) => {
                let mut destroy_kwargs = KwArgs::new();
                destroy_kwargs
                    .insert("instance_uuid".to_string(), Value::String(uuid.to_string()));
                ctx.announcer
                    .broadcast_up_fire_and_forget(&message.ctxt, "instance_destroy_at_top", destroy_kwargs)
                    .await;
                Err(CellsError::InstanceNotFound(uuid))
            }
            Err(err) => Err(CellsError::from(err)),
        }
    }
}

struct InstanceUpdateAtTop;

#[async_trait]
impl Handler for InstanceUpdateAtTop {
    async fn call(
        &self,
        ctx: &HandlerContext,
        _message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        if let Ok(current) = ctx.db.instance_get_by_uuid(uuid, ReadDeleted::Yes).await {
            if current.deleted {
                return Ok(Value::Null);
            }
        }
        let values = InstanceUpdateValues {
            vm_state: string_kwarg(kwargs, "vm_state").and_then(parse_vm_state),
            task_state: string_kwarg(kwargs, "task_state").and_then(parse_task_state),
            hostname: string_kwarg(kwargs, "hostname").map(str::to_string),
        };
        ctx.db.instance_update(uuid, &values, false).await?;
        if let Some(info_cache) = string_kwarg(kwargs, "info_cache") {
            ctx.db.instance_info_cache_update(uuid, info_cache).await?;
        }
        Ok(Value::Null)
    }
}

struct InstanceDestroyAtTop;

#[async_trait]
impl Handler for InstanceDestroyAtTop {
    async fn call(
        &self,
        ctx: &HandlerContext,
        _message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        ctx.db.instance_destroy(uuid).await?;
        Ok(Value::Null)
    }
}

/// The "everywhere" counterpart of [`InstanceDestroyAtTop`]: a `direction=
/// down` broadcast, so the Router's own fan-out already delivers this to
/// every cell in the subtree (not just the top). At each cell reached, this
/// actually tears the instance down via the compute API — grounded on
/// `nova/cells/manager.py:235`'s `instance_delete_everywhere`, which does a
/// real per-cell delete rather than marking only the top record deleted —
/// before soft-deleting this cell's own DB row. A cell holding no local copy
/// of the instance just sees `InstanceNotFound` from the compute API and
/// falls through to the (idempotent) DB soft-delete.
struct InstanceDeleteEverywhere;

#[async_trait]
impl Handler for InstanceDeleteEverywhere {
    async fn call(
        &self,
        ctx: &HandlerContext,
        message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        match ctx.compute.invoke(&message.ctxt, "delete", uuid, kwargs).await {
            Ok(_) | Err(CellsError::InstanceNotFound(_)) => {}
            Err(err) => warn!(%uuid, error = %err, "compute API delete failed during instance_delete_everywhere"),
        }
        ctx.db.instance_destroy(uuid).await?;
        Ok(Value::Null)
    }
}

struct InstanceFaultCreateAtTop;

#[async_trait]
impl Handler for InstanceFaultCreateAtTop {
    async fn call(
        &self,
        ctx: &HandlerContext,
        _message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        let code = kwargs.get("code").and_then(Value::as_i64).unwrap_or(500) as i32;
        let message = string_kwarg(kwargs, "message").unwrap_or_default();
        let details = string_kwarg(kwargs, "details").unwrap_or_default();
        ctx.db.instance_fault_create(uuid, code, message, details).await?;
        Ok(Value::Null)
    }
}

struct BwUsageUpdateAtTop;

#[async_trait]
impl Handler for BwUsageUpdateAtTop {
    async fn call(
        &self,
        ctx: &HandlerContext,
        _message: &Message,
        kwargs: &KwArgs,
    ) -> Result<Value, CellsError> {
        let uuid = uuid_kwarg(kwargs, "instance_uuid")?;
        let mac = string_kwarg(kwargs, "mac").unwrap_or_default();
        let start_period = kwargs
            .get("start_period")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let as_i64 = |key: &str| kwargs.get(key).and_then(Value::as_i64).unwrap_or(0);
        ctx.db
            .bw_usage_update(
                uuid,
                mac,
                start_period,
                as_i64("bw_in"),
                as_i64("bw_out"),
                as_i64("last_ctr_in"),
                as_i64("last_ctr_out"),
            )
            .await?;
        Ok(Value::Null)
    }
}

fn parse_vm_state(s: &str) -> Option<VmState> {
    match s {
        "building" => Some(VmState::Building),
        "active" => Some(VmState::Active),
        "stopped" => Some(VmState::Stopped),
        "error" => Some(VmState::Error),
        "deleted" => Some(VmState::Deleted),
        _ => None,
    }
}

fn parse_task_state(s: &str) -> Option<TaskState> {
    match s {
        "none" => Some(TaskState::None),
        "scheduling" => Some(TaskState::Scheduling),
        "spawning" => Some(TaskState::Spawning),
        "deleting" => Some(TaskState::Deleting),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_targeted_method_is_not_found() {
        let registry = HandlerRegistry::with_defaults();
        assert!(matches!(registry.targeted("nope"), Err(CellsError::MethodNotFound(_))));
    }

    #[test]
    fn required_handlers_are_all_registered() {
        let registry = HandlerRegistry::with_defaults();
        for method in [
            "schedule_run_instance",
            "run_compute_api_method",
            "instance_update",
            "update_capabilities",
            "update_capacities",
            "announce_capabilities",
            "announce_capacities",
        ] {
            assert!(registry.targeted(method).is_ok(), "missing targeted handler {method}");
        }
        for method in [
            "instance_update_at_top",
            "instance_destroy_at_top",
            "instance_delete_everywhere",
            "instance_fault_create_at_top",
            "bw_usage_update_at_top",
            "sync_instances",
        ] {
            assert!(registry.broadcast(method).is_ok(), "missing broadcast handler {method}");
        }
    }

    #[test]
    fn vm_state_parses_known_values_only() {
        assert_eq!(parse_vm_state("active"), Some(VmState::Active));
        assert_eq!(parse_vm_state("bogus"), None);
    }
}
