// 🚚 Bulk Dedup Loader - thousands of values, a handful of SQL round trips
//
// 1. begin job             5. second resolve pass (everything must resolve now)
// 2. stage unsaved values  6. stream ids back in input order
// 3. resolve vs target     7. delete staging rows
// 4. insert novel values   8. end job
//
// Every step checks its row count. A mismatch is fatal: the unit of work rolls back
// and the caller's items are left untouched.

use crate::config::{LoaderConfig, MAX_BATCH_SIZE};
use crate::db::{begin_job, end_job, BulkJob};
use crate::entities::Persistable;
use crate::error::{DedupError, Result};
use crate::gateway::{column, unit_of_work, Id, SqlValue, StorageGateway};
use crate::hasher::{calculate_hash, CollectionSchema, HashedCollection};
use log::{debug, info};
use serde::Serialize;
use std::marker::PhantomData;

/// Staging rows written per INSERT statement.
pub const BATCH_SIZE: usize = 100;

/// Member rows written per INSERT statement (four parameters each).
const MEMBER_ROWS_PER_INSERT: usize = 250;

// ============================================================================
// STAGING ROW + ADAPTER
// ============================================================================

/// One staged value: `(job, order, payload, resolved_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub job: BulkJob,
    pub order: i64,
    /// Values for `BulkAdapter::staging_columns`, same order.
    pub payload: Vec<SqlValue>,
    /// Member ids of a staged collection, in stored order. Empty for plain values.
    pub members: Vec<Id>,
    pub resolved_id: Option<Id>,
}

impl StagingRow {
    pub fn new(job: BulkJob, order: i64, payload: Vec<SqlValue>) -> Self {
        StagingRow {
            job,
            order,
            payload,
            members: Vec::new(),
            resolved_id: None,
        }
    }

    pub fn with_members(mut self, members: Vec<Id>) -> Self {
        self.members = members;
        self
    }
}

/// Second pair of tables used when the loaded values are collections.
///
/// Staging: `(job, data_order, position, member_id)`.
/// Target: `(list_id, position, member_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberStaging {
    pub staging_table: &'static str,
    pub target_table: &'static str,
}

/// Per-type binding between a value, its staging table and its target table.
///
/// The staging table has `job`, `data_order`, `resolved_id` and one column per
/// `staging_columns` entry, named like the target column.
pub trait BulkAdapter {
    type Item: Persistable;

    fn staging_table_name(&self) -> &str;

    fn target_table_name(&self) -> &str {
        <Self::Item as Persistable>::TABLE
    }

    /// Columns that define logical equality.
    fn equality_columns(&self) -> &[&str];

    /// SQL condition that holds when row `staged` and row `stored` carry equal values.
    /// NULLs compare equal to each other.
    fn equality_predicate(&self, staged: &str, stored: &str) -> String {
        self.equality_columns()
            .iter()
            .map(|c| format!("{}.{} IS {}.{}", staged, c, stored, c))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Equality columns plus auxiliary columns copied into the target table.
    fn columns_to_transfer(&self) -> &[&str];

    /// Payload columns of the staging table.
    fn staging_columns(&self) -> &[&str] {
        self.columns_to_transfer()
    }

    /// Staging columns that are equal exactly when two staged values are equal.
    /// Used to insert each distinct value of a job once.
    fn grouping_columns(&self) -> &[&str] {
        self.equality_columns()
    }

    fn member_staging(&self) -> Option<MemberStaging> {
        None
    }

    fn project_to_staging(&self, value: &Self::Item, job: BulkJob, order: i64) -> Result<StagingRow>;
}

// ============================================================================
// HASHED COLLECTIONS
// ============================================================================

/// Bulk loading of `HashedCollection<S>`.
///
/// A staged collection equals a stored one when the hashes match and the member
/// multisets match. Within a job, equal collections share the same sorted-id signature.
pub struct CollectionBulkAdapter<S: CollectionSchema> {
    _schema: PhantomData<S>,
}

impl<S: CollectionSchema> CollectionBulkAdapter<S> {
    pub fn new() -> Self {
        CollectionBulkAdapter {
            _schema: PhantomData,
        }
    }

    /// Members of one staged collection, grouped and counted.
    fn staged_members(&self, staged: &str) -> String {
        format!(
            "SELECT m.member_id, COUNT(*) FROM temp_hashed_set_member AS m
             WHERE m.job = {staged}.job AND m.data_order = {staged}.data_order
             GROUP BY m.member_id",
            staged = staged
        )
    }

    fn stored_members(&self, stored: &str) -> String {
        format!(
            "SELECT sm.member_id, COUNT(*) FROM {table} AS sm
             WHERE sm.list_id = {stored}.id
             GROUP BY sm.member_id",
            table = S::MEMBER_TABLE,
            stored = stored
        )
    }
}

impl<S: CollectionSchema> Default for CollectionBulkAdapter<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CollectionSchema> BulkAdapter for CollectionBulkAdapter<S> {
    type Item = HashedCollection<S>;

    fn staging_table_name(&self) -> &str {
        "temp_hashed_set"
    }

    fn equality_columns(&self) -> &[&str] {
        &["hash"]
    }

    fn equality_predicate(&self, staged: &str, stored: &str) -> String {
        let staged_members = self.staged_members(staged);
        let stored_members = self.stored_members(stored);
        format!(
            "{staged}.hash = {stored}.hash
             AND NOT EXISTS ({staged_members} EXCEPT {stored_members})
             AND NOT EXISTS ({stored_members} EXCEPT {staged_members})",
            staged = staged,
            stored = stored,
            staged_members = staged_members,
            stored_members = stored_members
        )
    }

    fn columns_to_transfer(&self) -> &[&str] {
        &["hash"]
    }

    fn staging_columns(&self) -> &[&str] {
        &["hash", "signature"]
    }

    fn grouping_columns(&self) -> &[&str] {
        &["signature"]
    }

    fn member_staging(&self) -> Option<MemberStaging> {
        Some(MemberStaging {
            staging_table: "temp_hashed_set_member",
            target_table: S::MEMBER_TABLE,
        })
    }

    fn project_to_staging(
        &self,
        value: &HashedCollection<S>,
        job: BulkJob,
        order: i64,
    ) -> Result<StagingRow> {
        let members = value
            .stored_member_ids()
            .into_iter()
            .map(|id| {
                id.ok_or_else(|| {
                    DedupError::not_persisted(format!("{} member without an id", S::TABLE))
                })
            })
            .collect::<Result<Vec<Id>>>()?;
        let hash = calculate_hash(members.iter().map(|id| Some(*id)))?;

        let mut sorted = members.clone();
        sorted.sort_unstable();
        let signature = sorted
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        Ok(StagingRow::new(
            job,
            order,
            vec![SqlValue::Integer(hash), SqlValue::Text(signature)],
        )
        .with_members(members))
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub job: BulkJob,
    /// Unsaved values written to the staging table
    pub staged: usize,
    /// Staged values that matched an already stored row
    pub resolved_existing: usize,
    /// New rows created in the target table
    pub inserted: usize,
    /// Values that already had an id on input
    pub passed_through: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    /// Id of every input item, in input order.
    pub ids: Vec<Id>,
    pub stats: LoadStats,
}

// ============================================================================
// LOADER
// ============================================================================

pub struct BulkLoader<'g, G: StorageGateway + ?Sized, A: BulkAdapter> {
    gateway: &'g G,
    adapter: A,
    batch_size: usize,
}

impl<'g, G: StorageGateway + ?Sized, A: BulkAdapter> BulkLoader<'g, G, A> {
    pub fn new(gateway: &'g G, adapter: A) -> Self {
        BulkLoader {
            gateway,
            adapter,
            batch_size: BATCH_SIZE,
        }
    }

    pub fn with_config(gateway: &'g G, adapter: A, config: &LoaderConfig) -> Self {
        Self::new(gateway, adapter).with_batch_size(config.batch_size)
    }

    /// Clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Give every item an id, reusing stored rows and creating one row per distinct new value.
    ///
    /// Runs as one unit of work. Ids are written into `items` only after it committed.
    pub fn load(&self, items: &mut [A::Item]) -> Result<LoadOutcome> {
        let (stats, resolved) = unit_of_work(self.gateway, || self.run_job(items))?;

        let mut ids = Vec::with_capacity(items.len());
        for (item, resolved) in items.iter_mut().zip(resolved) {
            if let Some(id) = resolved {
                item.set_id(Some(id));
            }
            match item.id() {
                Some(id) => ids.push(id),
                None => return Err(DedupError::not_persisted("bulk loaded item left without id")),
            }
        }

        info!(
            "Bulk job #{} on {}: {} staged, {} reused, {} inserted, {} passed through",
            stats.job.id,
            self.adapter.target_table_name(),
            stats.staged,
            stats.resolved_existing,
            stats.inserted,
            stats.passed_through
        );
        Ok(LoadOutcome { ids, stats })
    }

    fn run_job(&self, items: &[A::Item]) -> Result<(LoadStats, Vec<Option<Id>>)> {
        let job = begin_job(self.gateway)?;
        debug!("Bulk job #{} started for {} items", job.id, items.len());

        let mut stats = LoadStats {
            job,
            staged: 0,
            resolved_existing: 0,
            inserted: 0,
            passed_through: items.iter().filter(|i| i.id().is_some()).count(),
        };
        let mut resolved = vec![None; items.len()];

        let (staged, staged_members) = self.stage(items, job)?;
        stats.staged = staged;

        if staged > 0 {
            let first_pass = self.resolve(job)?;
            if first_pass > staged {
                return Err(DedupError::consistency(
                    "first resolve pass",
                    staged as i64,
                    first_pass as i64,
                ));
            }
            stats.resolved_existing = first_pass;
            let pending = staged - first_pass;

            if pending > 0 {
                let distinct = self.count_distinct_pending(job)?;
                let inserted = self.insert_missing(job)?;
                if inserted != distinct || distinct > pending {
                    return Err(DedupError::consistency(
                        "insert novel rows",
                        distinct as i64,
                        inserted as i64,
                    ));
                }
                stats.inserted = inserted;

                if inserted > 0 {
                    let second_pass = self.resolve(job)?;
                    if second_pass != pending {
                        return Err(DedupError::consistency(
                            "second resolve pass",
                            pending as i64,
                            second_pass as i64,
                        ));
                    }
                }
            }

            self.collect_ids(items, job, staged, &mut resolved)?;

            if let Some(members) = self.adapter.member_staging() {
                let deleted = self.delete_staged_in(members.staging_table, job)?;
                if deleted != staged_members {
                    return Err(DedupError::consistency(
                        "member staging cleanup",
                        staged_members as i64,
                        deleted as i64,
                    ));
                }
            }
            let deleted = self.delete_staged_in(self.adapter.staging_table_name(), job)?;
            if deleted != staged {
                return Err(DedupError::consistency(
                    "staging cleanup",
                    staged as i64,
                    deleted as i64,
                ));
            }
        }

        end_job(self.gateway, job)?;
        Ok((stats, resolved))
    }

    // ------------------------------------------------------------------------
    // Step 2: staging
    // ------------------------------------------------------------------------

    /// Returns the number of staged values and of staged member rows.
    fn stage(&self, items: &[A::Item], job: BulkJob) -> Result<(usize, usize)> {
        let mut staged = 0;
        let mut members = 0;
        let mut batch: Vec<StagingRow> = Vec::with_capacity(self.batch_size);

        for (index, item) in items.iter().enumerate() {
            if item.id().is_some() {
                continue;
            }
            batch.push(self.adapter.project_to_staging(item, job, index as i64)?);
            if batch.len() == self.batch_size {
                staged += self.flush(&batch)?;
                members += self.flush_members(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            staged += self.flush(&batch)?;
            members += self.flush_members(&batch)?;
        }

        debug!("Job #{}: staged {} rows, {} member rows", job.id, staged, members);
        Ok((staged, members))
    }

    /// Write one batch with a single multi-row INSERT.
    fn flush(&self, batch: &[StagingRow]) -> Result<usize> {
        let columns = self.adapter.staging_columns();
        let width = columns.len() + 2;

        let mut params = Vec::with_capacity(batch.len() * width);
        let mut tuples = Vec::with_capacity(batch.len());
        for row in batch {
            if row.payload.len() != columns.len() {
                return Err(DedupError::consistency(
                    "staging projection",
                    columns.len() as i64,
                    row.payload.len() as i64,
                ));
            }
            tuples.push(placeholders(params.len() + 1, width));
            params.push(SqlValue::Integer(row.job.id));
            params.push(SqlValue::Integer(row.order));
            params.extend(row.payload.iter().cloned());
        }

        let sql = format!(
            "INSERT INTO {} (job, data_order, {}) VALUES {}",
            self.adapter.staging_table_name(),
            columns.join(", "),
            tuples.join(", ")
        );
        let written = self.gateway.execute_update(&sql, &params)?;
        if written != batch.len() {
            return Err(DedupError::consistency(
                "stage batch",
                batch.len() as i64,
                written as i64,
            ));
        }
        Ok(written)
    }

    fn flush_members(&self, batch: &[StagingRow]) -> Result<usize> {
        let members = match self.adapter.member_staging() {
            Some(members) => members,
            None => return Ok(0),
        };

        let rows: Vec<[SqlValue; 4]> = batch
            .iter()
            .flat_map(|row| {
                row.members.iter().enumerate().map(move |(position, member_id)| {
                    [
                        SqlValue::Integer(row.job.id),
                        SqlValue::Integer(row.order),
                        SqlValue::Integer(position as i64),
                        SqlValue::Integer(*member_id),
                    ]
                })
            })
            .collect();

        let mut written = 0;
        for chunk in rows.chunks(MEMBER_ROWS_PER_INSERT) {
            let tuples: Vec<String> = (0..chunk.len()).map(|i| placeholders(i * 4 + 1, 4)).collect();
            let params: Vec<SqlValue> = chunk.iter().flat_map(|row| row.iter().cloned()).collect();
            let sql = format!(
                "INSERT INTO {} (job, data_order, position, member_id) VALUES {}",
                members.staging_table,
                tuples.join(", ")
            );
            written += self.gateway.execute_update(&sql, &params)?;
        }

        if written != rows.len() {
            return Err(DedupError::consistency(
                "stage members",
                rows.len() as i64,
                written as i64,
            ));
        }
        Ok(written)
    }

    // ------------------------------------------------------------------------
    // Steps 3 + 5: resolve against the target table
    // ------------------------------------------------------------------------

    fn resolve(&self, job: BulkJob) -> Result<usize> {
        let staging = self.adapter.staging_table_name();
        let target = self.adapter.target_table_name();
        let matches = self.adapter.equality_predicate(staging, "s");

        let sql = format!(
            "UPDATE {staging} SET resolved_id = (
                SELECT s.id FROM {target} AS s WHERE {matches} ORDER BY s.id LIMIT 1
             )
             WHERE job = ?1 AND resolved_id IS NULL
               AND EXISTS (SELECT 1 FROM {target} AS s WHERE {matches})",
            staging = staging,
            target = target,
            matches = matches
        );
        let updated = self
            .gateway
            .execute_update(&sql, &[SqlValue::Integer(job.id)])?;
        debug!("Job #{}: resolved {} rows against {}", job.id, updated, target);
        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Step 4: insert what is still unresolved, once per distinct value
    // ------------------------------------------------------------------------

    /// `data_order` of the first unresolved occurrence of every distinct value in the job.
    fn first_pending_orders(&self) -> String {
        format!(
            "SELECT MIN(data_order) FROM {} WHERE job = ?1 AND resolved_id IS NULL GROUP BY {}",
            self.adapter.staging_table_name(),
            self.adapter.grouping_columns().join(", ")
        )
    }

    fn count_distinct_pending_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} AS t WHERE t.job = ?1 AND t.data_order IN ({})",
            self.adapter.staging_table_name(),
            self.first_pending_orders()
        )
    }

    fn count_distinct_pending(&self, job: BulkJob) -> Result<usize> {
        let count = self
            .gateway
            .query_i64(&self.count_distinct_pending_sql(), &[SqlValue::Integer(job.id)])?
            .unwrap_or(0);
        Ok(count as usize)
    }

    fn insert_missing(&self, job: BulkJob) -> Result<usize> {
        if let Some(members) = self.adapter.member_staging() {
            return self.insert_missing_collections(job, members);
        }

        let columns = self.adapter.columns_to_transfer();
        let sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS t
             WHERE t.job = ?1 AND t.data_order IN ({}) ORDER BY t.data_order",
            self.adapter.target_table_name(),
            columns.join(", "),
            qualified(columns),
            self.adapter.staging_table_name(),
            self.first_pending_orders()
        );
        let inserted = self
            .gateway
            .execute_update(&sql, &[SqlValue::Integer(job.id)])?;
        debug!(
            "Job #{}: inserted {} new rows into {}",
            job.id,
            inserted,
            self.adapter.target_table_name()
        );
        Ok(inserted)
    }

    /// Collections get ids `base + data_order + 1` so their members can be copied
    /// without a round trip per collection. The job holds the write lock, `base` stays valid.
    fn insert_missing_collections(&self, job: BulkJob, members: MemberStaging) -> Result<usize> {
        let target = self.adapter.target_table_name();
        let columns = self.adapter.columns_to_transfer();
        let first = self.first_pending_orders();

        let base = self
            .gateway
            .query_i64(&format!("SELECT COALESCE(MAX(id), 0) FROM {}", target), &[])?
            .unwrap_or(0);
        let params = [SqlValue::Integer(job.id), SqlValue::Integer(base)];

        let inserted = self.gateway.execute_update(
            &format!(
                "INSERT INTO {} (id, {}) SELECT ?2 + t.data_order + 1, {} FROM {} AS t
                 WHERE t.job = ?1 AND t.data_order IN ({}) ORDER BY t.data_order",
                target,
                columns.join(", "),
                qualified(columns),
                self.adapter.staging_table_name(),
                first
            ),
            &params,
        )?;

        let member_filter = format!("m.job = ?1 AND m.data_order IN ({})", first);
        let expected = self
            .gateway
            .query_i64(
                &format!(
                    "SELECT COUNT(*) FROM {} AS m WHERE {}",
                    members.staging_table, member_filter
                ),
                &[SqlValue::Integer(job.id)],
            )?
            .unwrap_or(0);
        let copied = self.gateway.execute_update(
            &format!(
                "INSERT INTO {} (list_id, position, member_id)
                 SELECT ?2 + m.data_order + 1, m.position, m.member_id FROM {} AS m
                 WHERE {}",
                members.target_table, members.staging_table, member_filter
            ),
            &params,
        )?;
        if copied as i64 != expected {
            return Err(DedupError::consistency(
                "insert collection members",
                expected,
                copied as i64,
            ));
        }

        debug!(
            "Job #{}: inserted {} new collections into {} with {} members",
            job.id, inserted, target, copied
        );
        Ok(inserted)
    }

    // ------------------------------------------------------------------------
    // Step 6: stream ids back
    // ------------------------------------------------------------------------

    fn collect_ids(
        &self,
        items: &[A::Item],
        job: BulkJob,
        staged: usize,
        resolved: &mut [Option<Id>],
    ) -> Result<()> {
        let sql = format!(
            "SELECT data_order, resolved_id FROM {} WHERE job = ?1 ORDER BY data_order",
            self.adapter.staging_table_name()
        );

        // Walk the input in lockstep with the cursor, skipping items that were never staged
        let mut unsaved = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.id().is_none())
            .map(|(index, _)| index);
        let mut seen = 0usize;

        self.gateway
            .execute_query(&sql, &[SqlValue::Integer(job.id)], &mut |row| {
                let order: i64 = column(row, 0)?;
                let resolved_id: Option<Id> = column(row, 1)?;

                let index = unsaved.next().ok_or_else(|| {
                    DedupError::consistency("collect ids", staged as i64, seen as i64 + 1)
                })?;
                if index as i64 != order {
                    return Err(DedupError::consistency("collect ids order", index as i64, order));
                }
                let id = resolved_id.ok_or_else(|| {
                    DedupError::consistency("collect ids: unresolved row", staged as i64, seen as i64)
                })?;

                resolved[index] = Some(id);
                seen += 1;
                Ok(())
            })?;

        if seen != staged || unsaved.next().is_some() {
            return Err(DedupError::consistency("collect ids", staged as i64, seen as i64));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Step 7: cleanup
    // ------------------------------------------------------------------------

    fn delete_staged_in(&self, table: &str, job: BulkJob) -> Result<usize> {
        self.gateway.execute_update(
            &format!("DELETE FROM {} WHERE job = ?1", table),
            &[SqlValue::Integer(job.id)],
        )
    }
}

/// `(?first, ?first+1, ...)` with `width` parameters.
fn placeholders(first: usize, width: usize) -> String {
    format!(
        "({})",
        (first..first + width)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

fn qualified(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| format!("t.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}
