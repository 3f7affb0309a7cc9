//! The DB Gateway: the narrow set of operations the router/scheduler/heal
//! loop need, each wrapped in the retry policy from [`crate::db::retry`].
//!
//! Grounded on `nova/db/mysqldb/{instance,instance_metadata,
//! instance_info_cache,bandwidth_usage_cache}.py`. Anything not covered
//! here is explicitly out of core (spec.md §4.1) and falls through to a
//! legacy back-end this crate does not implement.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{instrument, trace};

use crate::db::pool::ConnectionPool;
use crate::db::retry::{with_retry, DbError};
use crate::domain_types::{InstanceUuid, TaskState, VmState};

/// Read/write policy applied to soft-deleted rows, mirroring the source's
/// `read_deleted` context field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadDeleted {
    /// Only non-deleted rows.
    No,
    /// Both deleted and non-deleted rows.
    Yes,
    /// Only deleted rows.
    Only,
}

/// The cross-cell sync view of an instance (spec.md §3): the subset of
/// attributes that participate in upward/downward propagation.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InstanceSyncView {
    /// Stable instance identity.
    #[sqlx(try_from = "String")]
    pub uuid: InstanceUuid,
    /// Coarse lifecycle state.
    #[sqlx(try_from = "String")]
    pub vm_state: VmStateColumn,
    /// In-progress task, if any.
    #[sqlx(try_from = "String")]
    pub task_state: TaskStateColumn,
    /// Whether the instance has been soft-deleted.
    pub deleted: bool,
    /// Host currently running the instance, if scheduled.
    pub hostname: Option<String>,
    /// Last update timestamp, used by the heal loop's "updated since" query.
    pub updated_at: DateTime<Utc>,
}

/// Newtype wrapper so [`VmState`] can round-trip through a `TEXT` column via
/// `TryFrom<String>`, as `sqlx::FromRow`'s `try_from` attribute requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStateColumn(pub VmState);

impl TryFrom<String> for VmStateColumn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "building" => Ok(Self(VmState::Building)),
            "active" => Ok(Self(VmState::Active)),
            "stopped" => Ok(Self(VmState::Stopped)),
            "error" => Ok(Self(VmState::Error)),
            "deleted" => Ok(Self(VmState::Deleted)),
            other => Err(format!("unknown vm_state column value: {other}")),
        }
    }
}

/// Newtype wrapper so [`TaskState`] can round-trip through a `TEXT` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStateColumn(pub TaskState);

impl TryFrom<String> for TaskStateColumn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "none" | "" => Ok(Self(TaskState::None)),
            "scheduling" => Ok(Self(TaskState::Scheduling)),
            "spawning" => Ok(Self(TaskState::Spawning)),
            "deleting" => Ok(Self(TaskState::Deleting)),
            other => Err(format!("unknown task_state column value: {other}")),
        }
    }
}

/// One `{id, key, value}` metadata row as stored today, used by
/// [`DbGateway::metadata_replace`] to diff against the desired map.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MetadataRow {
    /// Row id, used for targeted soft-delete of duplicate keys.
    pub id: i64,
    /// Metadata key.
    pub key: String,
    /// Metadata value.
    pub value: String,
}

/// Narrow interface onto the two read-only instance operations the
/// periodic heal loop and `sync_instances` handler need, in the same
/// narrow-trait style as [`crate::router::handlers::ComputeApi`]/
/// [`crate::scheduler::scheduler::InstanceCreator`]: tests can drive the
/// heal loop against a fake implementation instead of a live database
/// connection, the way those collaborators are already stubbed.
#[async_trait]
pub trait InstanceSyncSource: Send + Sync {
    /// See [`DbGateway::instance_get_all`].
    async fn instance_get_all(
        &self,
        read_deleted: ReadDeleted,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstanceSyncView>, DbError>;

    /// See [`DbGateway::instance_get_by_uuid`].
    async fn instance_get_by_uuid(&self, uuid: InstanceUuid, read_deleted: ReadDeleted) -> Result<InstanceSyncView, DbError>;
}

/// The DB Gateway: all operations take an explicit [`ReadDeleted`] policy
/// rather than mutating shared request context, per the REDESIGN note in
/// spec.md §9.
pub struct DbGateway {
    pool: Arc<ConnectionPool>,
}

#[async_trait]
impl InstanceSyncSource for DbGateway {
    async fn instance_get_all(
        &self,
        read_deleted: ReadDeleted,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstanceSyncView>, DbError> {
        DbGateway::instance_get_all(self, read_deleted, updated_since).await
    }

    async fn instance_get_by_uuid(&self, uuid: InstanceUuid, read_deleted: ReadDeleted) -> Result<InstanceSyncView, DbError> {
        DbGateway::instance_get_by_uuid(self, uuid, read_deleted).await
    }
}

impl DbGateway {
    /// Wraps a connection pool as a gateway.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    async fn close_on_retry(&self) {
        trace!("closing connection before retrying transient db error");
    }

    /// Fetches one instance by uuid, honoring `read_deleted` and optional
    /// project scoping.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure, or a wrapped
    /// `RowNotFound` if no such instance exists.
    #[instrument(skip(self))]
    pub async fn instance_get_by_uuid(
        &self,
        uuid: InstanceUuid,
        read_deleted: ReadDeleted,
    ) -> Result<InstanceSyncView, DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let clause = deleted_clause(read_deleted);
                let sql = format!(
                    "SELECT uuid, vm_state, task_state, deleted, hostname, updated_at \
                     FROM instances WHERE uuid = ? {clause}"
                );
                let row = sqlx::query_as::<_, InstanceSyncView>(&sql)
                    .bind(uuid.to_string())
                    .fetch_one(pooled.as_mut())
                    .await;
                // RowNotFound means the connection itself is fine, just the
                // row is absent; only a real driver error warrants closing it.
                if matches!(row, Err(sqlx::Error::RowNotFound)) || row.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                row
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Fetches all instances matching `read_deleted`, ordered by
    /// `deleted ASC` so active instances sort first (matching
    /// `get_instances_to_sync`'s "active then deleted" contract).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self))]
    pub async fn instance_get_all(
        &self,
        read_deleted: ReadDeleted,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstanceSyncView>, DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let clause = deleted_clause(read_deleted);
                let sql = match updated_since {
                    Some(_) => format!(
                        "SELECT uuid, vm_state, task_state, deleted, hostname, updated_at \
                         FROM instances WHERE updated_at >= ? {clause} ORDER BY deleted ASC"
                    ),
                    None => format!(
                        "SELECT uuid, vm_state, task_state, deleted, hostname, updated_at \
                         FROM instances WHERE 1=1 {clause} ORDER BY deleted ASC"
                    ),
                };
                let query = sqlx::query_as::<_, InstanceSyncView>(&sql);
                let query = match updated_since {
                    Some(since) => query.bind(since),
                    None => query,
                };
                let rows = query.fetch_all(pooled.as_mut()).await;
                if rows.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                rows
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Updates the whitelisted sync columns for `uuid`. When
    /// `update_and_get_original` is set, the row as it existed before the
    /// update is returned alongside the new values, for callers that need
    /// to detect a state transition (e.g. destroy-is-terminal checks).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self, values))]
    pub async fn instance_update(
        &self,
        uuid: InstanceUuid,
        values: &InstanceUpdateValues,
        update_and_get_original: bool,
    ) -> Result<Option<InstanceSyncView>, DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<Option<InstanceSyncView>, sqlx::Error> = async {
                    let original = if update_and_get_original {
                        sqlx::query_as::<_, InstanceSyncView>(
                            "SELECT uuid, vm_state, task_state, deleted, hostname, updated_at \
                             FROM instances WHERE uuid = ?",
                        )
                        .bind(uuid.to_string())
                        .fetch_optional(pooled.as_mut())
                        .await?
                    } else {
                        None
                    };

                    let mut set_values = BTreeMap::new();
                    if let Some(vm_state) = values.vm_state {
                        set_values.insert("vm_state".to_string(), serde_json::Value::String(vm_state_column(vm_state).to_string()));
                    }
                    if let Some(task_state) = values.task_state {
                        set_values.insert(
                            "task_state".to_string(),
                            serde_json::Value::String(task_state_column(task_state).to_string()),
                        );
                    }
                    if let Some(hostname) = &values.hostname {
                        set_values.insert("hostname".to_string(), serde_json::Value::String(hostname.clone()));
                    }
                    let (sql, binds) = crate::db::query::UpdateQuery::new("instances", set_values)
                        .raw_values([("updated_at".to_string(), "NOW()".to_string())].into())
                        .where_clause("uuid = ?", [("uuid".to_string(), serde_json::Value::String(uuid.to_string()))].into())
                        .render();
                    bind_values(sqlx::query(&sql), &binds).execute(pooled.as_mut()).await?;

                    Ok(original)
                }
                .await;

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Soft-deletes an instance and cascades the soft delete to its
    /// metadata, info-cache, and security-group association rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self))]
    pub async fn instance_destroy(&self, uuid: InstanceUuid) -> Result<u64, DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<u64, sqlx::Error> = async {
                    let conn = pooled.as_mut();
                    let (sql, binds) = crate::db::query::UpdateQuery::new("instances", BTreeMap::new())
                        .raw_values(
                            [("deleted".to_string(), "id".to_string()), ("deleted_at".to_string(), "NOW()".to_string())]
                                .into_iter()
                                .collect(),
                        )
                        .where_clause("uuid = ?", [("uuid".to_string(), serde_json::Value::String(uuid.to_string()))].into())
                        .where_clause("deleted = 0", BTreeMap::new())
                        .render();
                    let result = bind_values(sqlx::query(&sql), &binds).execute(&mut *conn).await?;
                    let affected = result.rows_affected();
                    if affected > 0 {
                        for table in [
                            "instance_metadata",
                            "instance_system_metadata",
                            "instance_info_cache",
                        ] {
                            let (sql, binds) = crate::db::query::UpdateQuery::new(table, BTreeMap::new())
                                .raw_values(
                                    [
                                        ("deleted".to_string(), "id".to_string()),
                                        ("deleted_at".to_string(), "NOW()".to_string()),
                                    ]
                                    .into_iter()
                                    .collect(),
                                )
                                .where_clause(
                                    "instance_uuid = ?",
                                    [("instance_uuid".to_string(), serde_json::Value::String(uuid.to_string()))].into(),
                                )
                                .where_clause("deleted = 0", BTreeMap::new())
                                .render();
                            bind_values(sqlx::query(&sql), &binds).execute(&mut *conn).await?;
                        }
                    }
                    Ok(affected)
                }
                .await;

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Replaces an instance's `info_cache` blob.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self, info_cache))]
    pub async fn instance_info_cache_update(
        &self,
        uuid: InstanceUuid,
        info_cache: &str,
    ) -> Result<(), DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<(), sqlx::Error> = sqlx::query(
                    "UPDATE instance_info_cache SET network_info = ?, updated_at = NOW() \
                     WHERE instance_uuid = ?",
                )
                .bind(info_cache)
                .bind(uuid.to_string())
                .execute(pooled.as_mut())
                .await
                .map(|_| ());

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Upserts a bandwidth usage sample, grounded on
    /// `bandwidth_usage_cache.py`'s update-then-insert-on-miss pattern: an
    /// `UPDATE` is attempted first (cheap, no-op if absent); only on zero
    /// rows affected is a fresh row inserted, in a separate statement, to
    /// avoid mixing `UPDATE` and `INSERT` in one transaction (the teacher's
    /// source notes this avoids a deadlock).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self))]
    #[allow(clippy::too_many_arguments)]
    pub async fn bw_usage_update(
        &self,
        uuid: InstanceUuid,
        mac: &str,
        start_period: DateTime<Utc>,
        bw_in: i64,
        bw_out: i64,
        last_ctr_in: i64,
        last_ctr_out: i64,
    ) -> Result<(), DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<(), sqlx::Error> = async {
                    let updated = sqlx::query(
                        "UPDATE bw_usage_cache SET bw_in = ?, bw_out = ?, last_ctr_in = ?, \
                         last_ctr_out = ?, last_refreshed = NOW(), updated_at = NOW() \
                         WHERE start_period = ? AND uuid = ? AND mac = ?",
                    )
                    .bind(bw_in)
                    .bind(bw_out)
                    .bind(last_ctr_in)
                    .bind(last_ctr_out)
                    .bind(start_period)
                    .bind(uuid.to_string())
                    .bind(mac)
                    .execute(pooled.as_mut())
                    .await?;

                    if updated.rows_affected() == 0 {
                        sqlx::query(
                            "INSERT INTO bw_usage_cache \
                             (uuid, mac, start_period, bw_in, bw_out, last_ctr_in, last_ctr_out, \
                              last_refreshed, created_at) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, NOW(), NOW())",
                        )
                        .bind(uuid.to_string())
                        .bind(mac)
                        .bind(start_period)
                        .bind(bw_in)
                        .bind(bw_out)
                        .bind(last_ctr_in)
                        .bind(last_ctr_out)
                        .execute(pooled.as_mut())
                        .await?;
                    }
                    Ok(())
                }
                .await;

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Reconciles an instance's metadata rows (`instance_metadata` or
    /// `instance_system_metadata`, selected by `table`) against a desired
    /// `{key: value}` map: existing keys present in the map are updated if
    /// changed, existing keys absent from the map are soft-deleted, and
    /// remaining desired entries are inserted. Duplicate rows for the same
    /// key are tolerated and soft-deleted by row id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self, desired))]
    pub async fn metadata_replace(
        &self,
        table: &str,
        uuid: InstanceUuid,
        desired: &BTreeMap<String, String>,
    ) -> Result<(), DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<(), sqlx::Error> = async {
                    let conn = pooled.as_mut();
                    let existing = sqlx::query_as::<_, MetadataRow>(&format!(
                        "SELECT id, `key`, value FROM {table} \
                         WHERE instance_uuid = ? AND deleted = 0"
                    ))
                    .bind(uuid.to_string())
                    .fetch_all(&mut *conn)
                    .await?;

                    let mut remaining = desired.clone();
                    let mut seen_keys = std::collections::HashSet::new();
                    for row in existing {
                        if let Some(value) = remaining.get(&row.key) {
                            if seen_keys.insert(row.key.clone()) {
                                if *value != row.value {
                                    sqlx::query(&format!(
                                        "UPDATE {table} SET value = ?, updated_at = NOW() \
                                         WHERE id = ?"
                                    ))
                                    .bind(value)
                                    .bind(row.id)
                                    .execute(&mut *conn)
                                    .await?;
                                }
                                remaining.remove(&row.key);
                            } else {
                                soft_delete_metadata_row(&mut *conn, table, row.id).await?;
                            }
                        } else {
                            soft_delete_metadata_row(&mut *conn, table, row.id).await?;
                        }
                    }

                    for (key, value) in remaining {
                        sqlx::query(&format!(
                            "INSERT INTO {table} \
                             (instance_uuid, `key`, value, deleted, created_at) \
                             VALUES (?, ?, ?, 0, NOW())"
                        ))
                        .bind(uuid.to_string())
                        .bind(key)
                        .bind(value)
                        .execute(&mut *conn)
                        .await?;
                    }

                    Ok(())
                }
                .await;

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }

    /// Inserts an instance fault record (code, message, details), backing
    /// the `instance_fault_create_at_top` broadcast handler.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on any non-retryable failure.
    #[instrument(skip(self, message, details))]
    pub async fn instance_fault_create(
        &self,
        uuid: InstanceUuid,
        code: i32,
        message: &str,
        details: &str,
    ) -> Result<(), DbError> {
        with_retry(
            || async {
                let mut pooled = self.pool.acquire().await.map_err(acquire_to_sqlx)?;
                let outcome: Result<(), sqlx::Error> = sqlx::query(
                    "INSERT INTO instance_faults \
                     (instance_uuid, code, message, details, created_at) \
                     VALUES (?, ?, ?, ?, NOW())",
                )
                .bind(uuid.to_string())
                .bind(code)
                .bind(message)
                .bind(details)
                .execute(pooled.as_mut())
                .await
                .map(|_| ());

                if outcome.is_ok() {
                    pooled.release().await;
                } else {
                    pooled.release_after_error().await;
                }
                outcome
            },
            || self.close_on_retry(),
        )
        .await
    }
}

async fn soft_delete_metadata_row(
    conn: &mut sqlx::MySqlConnection,
    table: &str,
    id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("UPDATE {table} SET deleted_at = NOW(), deleted = id WHERE id = ?"))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// New values for [`DbGateway::instance_update`]; only whitelisted sync
/// columns are settable, matching spec.md §4.4's "core sync attributes"
/// constraint on `instance_update_at_top`.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdateValues {
    /// New vm_state, if changing.
    pub vm_state: Option<VmState>,
    /// New task_state, if changing.
    pub task_state: Option<TaskState>,
    /// New hostname, if changing.
    pub hostname: Option<String>,
}

/// `VmState` -> its `instances.vm_state` column spelling. `pub(crate)` so
/// the heal loop and the `sync_instances` handler can render the same
/// wire-kwarg string a targeted `instance_update_at_top` write would use,
/// without a second hand-maintained mapping drifting out of sync with this
/// one.
pub(crate) fn vm_state_column(state: VmState) -> &'static str {
    match state {
        VmState::Building => "building",
        VmState::Active => "active",
        VmState::Stopped => "stopped",
        VmState::Error => "error",
        VmState::Deleted => "deleted",
    }
}

/// `TaskState` counterpart of [`vm_state_column`].
pub(crate) fn task_state_column(state: TaskState) -> &'static str {
    match state {
        TaskState::None => "none",
        TaskState::Scheduling => "scheduling",
        TaskState::Spawning => "spawning",
        TaskState::Deleting => "deleting",
    }
}

fn deleted_clause(read_deleted: ReadDeleted) -> &'static str {
    match read_deleted {
        ReadDeleted::No => "AND deleted = 0",
        ReadDeleted::Only => "AND deleted > 0",
        ReadDeleted::Yes => "",
    }
}

fn acquire_to_sqlx(err: DbError) -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::other(err.to_string()))
}

/// Binds a [`crate::db::query`] builder's rendered values onto a raw `sqlx`
/// query, in the order `render()` returned them.
fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    values: &'q [serde_json::Value],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    for value in values {
        query = match value {
            serde_json::Value::String(s) => query.bind(s.as_str()),
            serde_json::Value::Bool(b) => query.bind(*b),
            serde_json::Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            serde_json::Value::Number(n) => query.bind(n.as_f64()),
            serde_json::Value::Null => query.bind(None::<String>),
            other => query.bind(other.to_string()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_clause_matches_read_deleted_policy() {
        assert_eq!(deleted_clause(ReadDeleted::No), "AND deleted = 0");
        assert_eq!(deleted_clause(ReadDeleted::Only), "AND deleted > 0");
        assert_eq!(deleted_clause(ReadDeleted::Yes), "");
    }

    #[test]
    fn vm_state_round_trips_through_column_repr() {
        for state in [VmState::Building, VmState::Active, VmState::Stopped, VmState::Error, VmState::Deleted] {
            let column = vm_state_column(state);
            let parsed = VmStateColumn::try_from(column.to_string()).unwrap();
            assert_eq!(parsed.0, state);
        }
    }

    #[test]
    fn task_state_round_trips_through_column_repr() {
        for state in [TaskState::None, TaskState::Scheduling, TaskState::Spawning, TaskState::Deleting] {
            let column = task_state_column(state);
            let parsed = TaskStateColumn::try_from(column.to_string()).unwrap();
            assert_eq!(parsed.0, state);
        }
    }
}
