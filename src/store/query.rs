// src/store/query.rs

//! Predicate queries with latest-version projection
//!
//! Queries project the live head per key through a window-function CTE
//! and apply the caller's predicate to the heads, so a filter matching
//! only stale versions of a chain never resurfaces them. Operations
//! taking longer than one second are logged as slow.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::command::SqlCommand;
use crate::entity::{Entity, OpContext};
use crate::error::{Error, Result};
use crate::filter::{Filter, OrderBy};
use crate::query::{SqlFragment, translate_order_by, translate_where};
use crate::schema::{COL_ID, COL_IS_DELETED, COL_VERSION};
use crate::value::Value;

use super::EntityStore;

/// Operations slower than this are logged
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);

/// One page of query results
#[derive(Debug, Clone)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_count: i64,
}

impl<T: Entity> EntityStore<'_, T> {
    /// Query live heads matching a predicate
    ///
    /// No default ordering is applied. Results collapse to one row per
    /// key, keeping the highest version.
    pub fn query(
        &self,
        filter: Option<&Filter>,
        order: &[OrderBy],
        skip: Option<u32>,
        take: Option<u32>,
        ctx: &OpContext,
    ) -> Result<Vec<T>> {
        ctx.cancel.check()?;
        let started = Instant::now();

        let fragment = self.predicate_fragment(filter)?;
        let mut sql = self.head_select_sql(&fragment, self.column_list());
        if !order.is_empty() {
            sql.push_str(&format!(
                " ORDER BY {}",
                translate_order_by(self.schema, order)?
            ));
        }
        match (take, skip) {
            (Some(take), Some(skip)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", take, skip)),
            (Some(take), None) => sql.push_str(&format!(" LIMIT {}", take)),
            (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip)),
            (None, None) => {}
        }

        let command = SqlCommand {
            sql,
            params: fragment.params,
        };
        let rows = self.store().config().retry.run("query", || {
            let conn = self.store().connection()?;
            command.query_entities::<T>(&conn)
        })?;

        self.note_slow("query", started);
        Ok(dedupe_latest(rows))
    }

    /// Query one page of live heads with a total count
    ///
    /// Page ordering always ends on `Version DESC` so pagination stays
    /// stable across rows that tie on the order key.
    pub fn query_paged(
        &self,
        filter: Option<&Filter>,
        page_size: u32,
        page_number: u32,
        order_by: Option<&OrderBy>,
        ctx: &OpContext,
    ) -> Result<PagedResult<T>> {
        ctx.cancel.check()?;
        if page_size == 0 {
            return Err(Error::ValidationFailed(
                "Page size must be positive".to_string(),
            ));
        }
        if page_number == 0 {
            return Err(Error::ValidationFailed(
                "Page number must be positive".to_string(),
            ));
        }
        let started = Instant::now();

        let total_count = self.count(filter, ctx)?;

        let fragment = self.predicate_fragment(filter)?;
        let order_sql = match order_by {
            Some(key) => format!(
                "{}, \"{}\" DESC",
                translate_order_by(self.schema, std::slice::from_ref(key))?,
                COL_VERSION
            ),
            None => format!("\"{}\" DESC", COL_VERSION),
        };

        let mut sql = self.head_select_sql(&fragment, self.column_list());
        sql.push_str(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            order_sql,
            page_size,
            (page_number as i64 - 1) * page_size as i64
        ));

        let command = SqlCommand {
            sql,
            params: fragment.params,
        };
        let items = self.store().config().retry.run("query_paged", || {
            let conn = self.store().connection()?;
            command.query_entities::<T>(&conn)
        })?;

        self.note_slow("query_paged", started);
        Ok(PagedResult {
            items,
            page_number,
            page_size,
            total_count,
        })
    }

    /// Count keys whose live head matches the predicate
    ///
    /// Soft-delete aware: only latest versions count. Never audits.
    pub fn count(&self, filter: Option<&Filter>, ctx: &OpContext) -> Result<i64> {
        ctx.cancel.check()?;
        let started = Instant::now();

        let fragment = self.predicate_fragment(filter)?;
        let sql = format!(
            "SELECT COUNT(*) FROM ({})",
            self.head_select_sql(&fragment, format!("\"{}\"", COL_ID))
        );

        let command = SqlCommand {
            sql,
            params: fragment.params,
        };
        let count = self.store().config().retry.run("count", || {
            let conn = self.store().connection()?;
            match command.query_scalar(&conn)? {
                Some(Value::I64(count)) => Ok(count),
                _ => Ok(0),
            }
        })?;

        self.note_slow("count", started);
        Ok(count)
    }

    /// Whether any live head matches the predicate
    pub fn exists(&self, filter: &Filter, ctx: &OpContext) -> Result<bool> {
        ctx.cancel.check()?;
        let fragment = self.predicate_fragment(Some(filter))?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM ({}) LIMIT 1)",
            self.head_select_sql(&fragment, format!("\"{}\"", COL_ID))
        );
        let command = SqlCommand {
            sql,
            params: fragment.params,
        };
        self.store().config().retry.run("exists", || {
            let conn = self.store().connection()?;
            match command.query_scalar(&conn)? {
                Some(Value::I64(v)) => Ok(v != 0),
                _ => Ok(false),
            }
        })
    }

    /// SELECT over live heads with the predicate applied to the head row
    ///
    /// Under soft-delete the head is picked by a window CTE over the whole
    /// chain and the predicate filters the picked row; otherwise a plain
    /// filtered select suffices.
    fn head_select_sql(&self, fragment: &SqlFragment, projection: String) -> String {
        if self.schema.flags.soft_delete {
            let mut sql = format!(
                "WITH LatestVersions AS (
    SELECT *, ROW_NUMBER() OVER (PARTITION BY \"{id}\" ORDER BY \"{version}\" DESC) AS rn
    FROM {table}
)
SELECT {projection} FROM LatestVersions WHERE rn = 1 AND \"{deleted}\" = 0",
                id = COL_ID,
                version = COL_VERSION,
                table = self.schema.qualified_table(),
                projection = projection,
                deleted = COL_IS_DELETED,
            );
            if !fragment.sql.is_empty() {
                sql.push_str(&format!(" AND {}", fragment.sql));
            }
            sql
        } else {
            let mut sql = format!(
                "SELECT {} FROM {}",
                projection,
                self.schema.qualified_table()
            );
            if !fragment.sql.is_empty() {
                sql.push_str(&format!(" WHERE {}", fragment.sql));
            }
            sql
        }
    }

    fn predicate_fragment(&self, filter: Option<&Filter>) -> Result<SqlFragment> {
        match filter {
            Some(filter) => translate_where(self.schema, filter),
            None => Ok(SqlFragment::default()),
        }
    }

    fn column_list(&self) -> String {
        self.schema
            .select_columns()
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn note_slow(&self, operation: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > SLOW_QUERY_THRESHOLD {
            warn!(
                entity = T::entity_type(),
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow query"
            );
        }
    }
}

/// Keep one row per key, preferring the highest version
fn dedupe_latest<T: Entity>(rows: Vec<T>) -> Vec<T> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Option<T>> = Vec::with_capacity(rows.len());
    for row in rows {
        match by_key.get(&row.key()) {
            Some(&slot) => {
                let existing = kept[slot]
                    .as_ref()
                    .map(|e| e.version())
                    .unwrap_or(i64::MIN);
                if row.version() > existing {
                    kept[slot] = Some(row);
                }
            }
            None => {
                by_key.insert(row.key(), kept.len());
                kept.push(Some(row));
            }
        }
    }
    kept.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{asc, col};
    use crate::store::testutil::{Order, Product, test_store};
    use std::collections::HashSet;

    fn seed(handle: &EntityStore<'_, Order>, n: usize, status: &str) -> Vec<Order> {
        let ctx = OpContext::new();
        (0..n)
            .map(|i| {
                handle
                    .create(
                        &Order::new(
                            &format!("{status}-{i:02}"),
                            &format!("ORD-{i}"),
                            status,
                            i as f64,
                        ),
                        &ctx,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_query_filters_and_orders() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        seed(&handle, 3, "New");
        seed(&handle, 2, "Done");

        let rows = handle
            .query(
                Some(&col("Status").eq("New")),
                &[asc("Id")],
                None,
                None,
                &OpContext::new(),
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id <= w[1].id));
    }

    #[test]
    fn test_query_returns_only_heads() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        let created = seed(&handle, 1, "New");

        let mut changed = created[0].clone();
        changed.total_amount = 99.0;
        let updated = handle.update(&changed, &ctx).unwrap();

        let rows = handle
            .query(Some(&col("Status").eq("New")), &[], None, None, &ctx)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, updated.version);
    }

    #[test]
    fn test_query_does_not_resurface_stale_versions() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        let created = seed(&handle, 1, "New");

        // The head no longer matches the predicate; the old version that
        // does must not come back
        let mut changed = created[0].clone();
        changed.status = "Done".to_string();
        handle.update(&changed, &ctx).unwrap();

        let rows = handle
            .query(Some(&col("Status").eq("New")), &[], None, None, &ctx)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_query_excludes_soft_deleted() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        seed(&handle, 2, "New");
        handle.delete("New-00", &ctx).unwrap();

        let rows = handle.query(None, &[], None, None, &ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "New-01");
    }

    #[test]
    fn test_query_skip_take() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        seed(&handle, 5, "New");

        let rows = handle
            .query(None, &[asc("Id")], Some(1), Some(2), &OpContext::new())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "New-01");
    }

    #[test]
    fn test_query_plain_entity() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Product>().unwrap();
        let ctx = OpContext::new();
        for i in 0..3 {
            handle
                .create(&Product::new(&format!("p{i}"), "widget", i as f64), &ctx)
                .unwrap();
        }

        let rows = handle
            .query(Some(&col("Price").gte(1.0)), &[asc("Id")], None, None, &ctx)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_paged_query_no_overlap_between_pages() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        seed(&handle, 25, "New");

        let page1 = handle
            .query_paged(Some(&col("Status").eq("New")), 10, 1, Some(&asc("Id")), &ctx)
            .unwrap();
        let page2 = handle
            .query_paged(Some(&col("Status").eq("New")), 10, 2, Some(&asc("Id")), &ctx)
            .unwrap();

        assert_eq!(page1.total_count, 25);
        assert_eq!(page2.total_count, 25);
        assert_eq!(page1.items.len(), 10);
        assert_eq!(page2.items.len(), 10);
        assert_eq!(page2.page_number, 2);

        let ids1: HashSet<&str> = page1.items.iter().map(|o| o.id.as_str()).collect();
        let ids2: HashSet<&str> = page2.items.iter().map(|o| o.id.as_str()).collect();
        assert!(ids1.is_disjoint(&ids2));
    }

    #[test]
    fn test_paged_query_validates_inputs() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        assert!(handle.query_paged(None, 0, 1, None, &ctx).is_err());
        assert!(handle.query_paged(None, 10, 0, None, &ctx).is_err());
    }

    #[test]
    fn test_count_matches_query_len() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        seed(&handle, 4, "New");
        seed(&handle, 3, "Done");
        handle.delete("New-00", &ctx).unwrap();

        let filter = col("Status").eq("New");
        let count = handle.count(Some(&filter), &ctx).unwrap();
        let rows = handle.query(Some(&filter), &[], None, None, &ctx).unwrap();
        assert_eq!(count as usize, rows.len());
        assert_eq!(count, 3);
    }

    #[test]
    fn test_count_sees_heads_not_chains() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        let created = seed(&handle, 1, "New");

        let mut changed = created[0].clone();
        changed.status = "Done".to_string();
        handle.update(&changed, &ctx).unwrap();

        assert_eq!(
            handle.count(Some(&col("Status").eq("New")), &ctx).unwrap(),
            0
        );
        assert_eq!(
            handle.count(Some(&col("Status").eq("Done")), &ctx).unwrap(),
            1
        );
    }

    #[test]
    fn test_exists() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();
        seed(&handle, 1, "New");

        assert!(handle.exists(&col("Status").eq("New"), &ctx).unwrap());
        assert!(!handle.exists(&col("Status").eq("Ghost"), &ctx).unwrap());
    }
}
