//! Immutable, copy-on-modify query builders
//!
//! Grounded on `nova/db/mysqldb/sql.py`'s `SelectQuery`/`InsertQuery`/
//! `UpdateQuery`, but following the REDESIGN note in spec.md §9: no shared
//! mutable state between builder values — every `.where()`/`.values()`
//! call returns a new, independent value.

use std::collections::BTreeMap;

use serde_json::Value;

/// One bound `WHERE` clause fragment, e.g. `self.uuid = ?` with its bind
/// value kept alongside for later parameter substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    /// Raw SQL fragment, written with named placeholders (`%(name)s` in the
    /// original; this port uses `?` positional placeholders internally).
    pub clause: String,
    /// Named bind values referenced by the clause.
    pub binds: BTreeMap<String, Value>,
}

/// A join reference by name, to be resolved against the current
/// [`crate::db::model::ModelDescriptor`] at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRef(pub String);

/// An immutable, composable `SELECT` query against one base table.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    table: String,
    wheres: Vec<WhereClause>,
    joins: Vec<JoinRef>,
}

impl SelectQuery {
    /// Starts a fresh select against `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), wheres: Vec::new(), joins: Vec::new() }
    }

    /// Returns a new query with an additional `WHERE` clause ANDed in.
    #[must_use]
    pub fn where_clause(mut self, clause: impl Into<String>, binds: BTreeMap<String, Value>) -> Self {
        self.wheres.push(WhereClause { clause: clause.into(), binds });
        self
    }

    /// Returns a new query with the named joins appended, in order.
    #[must_use]
    pub fn join(mut self, names: &[&str]) -> Self {
        self.joins.extend(names.iter().map(|n| JoinRef((*n).to_string())));
        self
    }

    /// The base table this query selects from.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The accumulated `WHERE` clauses, to be ANDed together.
    #[must_use]
    pub fn wheres(&self) -> &[WhereClause] {
        &self.wheres
    }

    /// The joins requested, in declaration order (prerequisite joins are
    /// resolved and reordered by the executor against the model descriptor).
    #[must_use]
    pub fn joins(&self) -> &[JoinRef] {
        &self.joins
    }
}

/// An immutable, composable `INSERT` query against one table.
#[derive(Debug, Clone, Default)]
pub struct InsertQuery {
    table: String,
    values: BTreeMap<String, Value>,
    raw_values: BTreeMap<String, String>,
}

impl InsertQuery {
    /// Starts a fresh insert against `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), values: BTreeMap::new(), raw_values: BTreeMap::new() }
    }

    /// Returns a new query with `values` merged in (later calls win on
    /// key collision).
    #[must_use]
    pub fn values(mut self, values: BTreeMap<String, Value>) -> Self {
        self.values.extend(values);
        self
    }

    /// Returns a new query with a column set to a raw SQL expression
    /// instead of a bound value, e.g. `deleted = id`.
    #[must_use]
    pub fn raw_values(mut self, raw: BTreeMap<String, String>) -> Self {
        self.raw_values.extend(raw);
        self
    }

    /// The table this query inserts into.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bound column values.
    #[must_use]
    pub fn bound_values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Raw (unbound, server-evaluated) column expressions.
    #[must_use]
    pub fn raw_column_values(&self) -> &BTreeMap<String, String> {
        &self.raw_values
    }
}

/// An immutable, composable `UPDATE` query against one table.
#[derive(Debug, Clone, Default)]
pub struct UpdateQuery {
    table: String,
    values: BTreeMap<String, Value>,
    raw_values: BTreeMap<String, String>,
    wheres: Vec<WhereClause>,
}

impl UpdateQuery {
    /// Starts a fresh update against `table` with the given column values.
    #[must_use]
    pub fn new(table: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self { table: table.into(), values, raw_values: BTreeMap::new(), wheres: Vec::new() }
    }

    /// Returns a new query with an additional `WHERE` clause ANDed in.
    #[must_use]
    pub fn where_clause(mut self, clause: impl Into<String>, binds: BTreeMap<String, Value>) -> Self {
        self.wheres.push(WhereClause { clause: clause.into(), binds });
        self
    }

    /// Returns a new query with a column set to a raw SQL expression
    /// instead of a bound value, e.g. `deleted = id` or `updated_at = NOW()`.
    #[must_use]
    pub fn raw_values(mut self, raw: BTreeMap<String, String>) -> Self {
        self.raw_values.extend(raw);
        self
    }

    /// The table this query updates.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bound column values to set.
    #[must_use]
    pub fn bound_values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Raw (unbound, server-evaluated) column expressions to set.
    #[must_use]
    pub fn raw_column_values(&self) -> &BTreeMap<String, String> {
        &self.raw_values
    }

    /// The accumulated `WHERE` clauses.
    #[must_use]
    pub fn wheres(&self) -> &[WhereClause] {
        &self.wheres
    }

    /// Renders this query to positional-placeholder SQL text plus the bind
    /// values in the exact order the placeholders appear: bound `SET`
    /// columns in key order, then each `WHERE` clause's own binds in key
    /// order, clauses in the order they were added. Raw values and raw
    /// `WHERE` text carry no placeholders and are spliced in verbatim.
    #[must_use]
    pub fn render(&self) -> (String, Vec<Value>) {
        let mut sql = format!("UPDATE {} SET ", self.table);
        let mut assignments = Vec::new();
        let mut binds = Vec::new();
        for (column, value) in &self.values {
            assignments.push(format!("{column} = ?"));
            binds.push(value.clone());
        }
        for (column, expr) in &self.raw_values {
            assignments.push(format!("{column} = {expr}"));
        }
        sql.push_str(&assignments.join(", "));

        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            let mut clauses = Vec::with_capacity(self.wheres.len());
            for clause in &self.wheres {
                clauses.push(clause.clause.clone());
                binds.extend(clause.binds.values().cloned());
            }
            sql.push_str(&clauses.join(" AND "));
        }
        (sql, binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binds(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn where_clause_is_additive_and_immutable() {
        let base = SelectQuery::new("instances");
        let filtered = base.clone().where_clause("self.deleted = 0", BTreeMap::new());
        assert!(base.wheres().is_empty());
        assert_eq!(filtered.wheres().len(), 1);
    }

    #[test]
    fn chained_where_clauses_accumulate_in_order() {
        let query = SelectQuery::new("instances")
            .where_clause("self.deleted = 0", BTreeMap::new())
            .where_clause(
                "self.project_id = %(project_id)s",
                binds(&[("project_id", Value::String("demo".into()))]),
            );
        assert_eq!(query.wheres().len(), 2);
        assert_eq!(query.wheres()[1].clause, "self.project_id = %(project_id)s");
    }

    #[test]
    fn join_accumulates_without_mutating_original() {
        let base = SelectQuery::new("instances");
        let joined = base.clone().join(&["metadata"]);
        assert!(base.joins().is_empty());
        assert_eq!(joined.joins(), &[JoinRef("metadata".to_string())]);
    }

    #[test]
    fn insert_values_merge_with_later_calls_winning() {
        let query = InsertQuery::new("instance_metadata")
            .values(binds(&[("key", Value::String("a".into()))]))
            .values(binds(&[("key", Value::String("b".into()))]));
        assert_eq!(query.bound_values().get("key"), Some(&Value::String("b".into())));
    }

    #[test]
    fn update_query_carries_table_values_and_wheres() {
        let query = UpdateQuery::new("instances", binds(&[("vm_state", Value::String("error".into()))]))
            .where_clause("uuid = %(uuid)s", binds(&[("uuid", Value::String("abc".into()))]));
        assert_eq!(query.table(), "instances");
        assert_eq!(query.wheres().len(), 1);
    }

    #[test]
    fn update_query_renders_raw_values_without_a_placeholder() {
        let query = UpdateQuery::new("instances", BTreeMap::new())
            .raw_values(binds_raw(&[("deleted", "id"), ("deleted_at", "NOW()")]))
            .where_clause("uuid = ?", binds(&[("uuid", Value::String("abc".into()))]))
            .where_clause("deleted = 0", BTreeMap::new());
        let (sql, values) = query.render();
        assert_eq!(sql, "UPDATE instances SET deleted = id, deleted_at = NOW() WHERE uuid = ? AND deleted = 0");
        assert_eq!(values, vec![Value::String("abc".into())]);
    }

    #[test]
    fn update_query_renders_bound_columns_before_where_binds() {
        let query = UpdateQuery::new("instances", binds(&[("vm_state", Value::String("error".into()))]))
            .where_clause("uuid = ?", binds(&[("uuid", Value::String("abc".into()))]));
        let (sql, values) = query.render();
        assert_eq!(sql, "UPDATE instances SET vm_state = ? WHERE uuid = ?");
        assert_eq!(values, vec![Value::String("error".into()), Value::String("abc".into())]);
    }

    fn binds_raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }
}
