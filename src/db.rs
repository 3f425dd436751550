use crate::error::{DedupError, Result};
use crate::gateway::{column, Id, SqlValue, StorageGateway};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Audit record for a change (reason + timestamp).
/// Append-only: persisted before anything references it, never updated.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Change {
    pub id: Option<Id>,
    pub reason: String,
    pub date: DateTime<Utc>,
}

impl Change {
    pub fn new(reason: &str) -> Self {
        Self {
            id: None,
            reason: reason.to_string(),
            date: Utc::now(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Scope of one bulk load. Created at the start, deleted at the end, never reused.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BulkJob {
    pub id: Id,
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Change audit + bulk load bookkeeping
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reason TEXT NOT NULL,
            change_date TEXT NOT NULL
        )",
        [],
    )?;

    // AUTOINCREMENT keeps job ids from ever being handed out twice
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulk_load_job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Value tables (one row per distinct value)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_sequence (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence TEXT NOT NULL,
            mass REAL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_accnum (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            accnum TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_description (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Hashed collections of sequences
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_sequence_list (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_sequence_list_member (
            list_id INTEGER NOT NULL REFERENCES protein_sequence_list(id),
            position INTEGER NOT NULL,
            member_id INTEGER NOT NULL,
            PRIMARY KEY (list_id, position)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_accnum_set (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS protein_accnum_set_member (
            list_id INTEGER NOT NULL REFERENCES protein_accnum_set(id),
            position INTEGER NOT NULL,
            member_id INTEGER NOT NULL,
            PRIMARY KEY (list_id, position)
        )",
        [],
    )?;

    // ==========================================================================
    // Evolvable entities (soft delete through change_audit)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS curation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            short_name TEXT NOT NULL,
            title TEXT NOT NULL,
            notes TEXT,
            creation INTEGER REFERENCES change_audit(id),
            deletion INTEGER REFERENCES change_audit(id)
        )",
        [],
    )?;

    // ==========================================================================
    // Staging tables (job scoped, rows live for one bulk load only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_protein_sequence (
            job INTEGER NOT NULL,
            data_order INTEGER NOT NULL,
            sequence TEXT NOT NULL,
            mass REAL,
            resolved_id INTEGER,
            PRIMARY KEY (job, data_order)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_protein_accnum (
            job INTEGER NOT NULL,
            data_order INTEGER NOT NULL,
            accnum TEXT NOT NULL,
            resolved_id INTEGER,
            PRIMARY KEY (job, data_order)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_protein_description (
            job INTEGER NOT NULL,
            data_order INTEGER NOT NULL,
            description TEXT NOT NULL,
            resolved_id INTEGER,
            PRIMARY KEY (job, data_order)
        )",
        [],
    )?;

    // Shared by every hashed collection type. Signature is the sorted member id list,
    // equal exactly when two staged collections are equal.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_hashed_set (
            job INTEGER NOT NULL,
            data_order INTEGER NOT NULL,
            hash INTEGER NOT NULL,
            signature TEXT NOT NULL,
            resolved_id INTEGER,
            PRIMARY KEY (job, data_order)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS temp_hashed_set_member (
            job INTEGER NOT NULL,
            data_order INTEGER NOT NULL,
            position INTEGER NOT NULL,
            member_id INTEGER NOT NULL,
            PRIMARY KEY (job, data_order, position)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // The unique indexes make the equality predicate a database constraint,
    // a concurrent writer sneaking in a duplicate fails loudly instead of forking ids.
    // ==========================================================================
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_protein_sequence_eq ON protein_sequence(sequence)",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_protein_accnum_eq ON protein_accnum(accnum)",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_protein_description_eq ON protein_description(description)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_protein_sequence_list_hash ON protein_sequence_list(hash)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_protein_accnum_set_hash ON protein_accnum_set(hash)",
        [],
    )?;

    // Staging rows are grouped per job by value to find the first occurrence of each
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_protein_sequence_group
         ON temp_protein_sequence(job, sequence)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_protein_accnum_group
         ON temp_protein_accnum(job, accnum)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_protein_description_group
         ON temp_protein_description(job, description)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_temp_hashed_set_group ON temp_hashed_set(job, signature)",
        [],
    )?;

    // Only one live curation per equality key, deleted versions may repeat
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_curation_live_eq
         ON curation(short_name, title) WHERE deletion IS NULL",
        [],
    )?;

    Ok(())
}

// ============================================================================
// CHANGE AUDIT
// ============================================================================

/// Persist the change unless it already has an id.
pub fn save_change<G: StorageGateway + ?Sized>(gateway: &G, change: &mut Change) -> Result<Id> {
    if let Some(id) = change.id {
        return Ok(id);
    }

    let id = gateway.insert(
        "change_audit",
        &["reason", "change_date"],
        &[
            SqlValue::Text(change.reason.clone()),
            SqlValue::Text(change.date.to_rfc3339()),
        ],
    )?;
    change.id = Some(id);
    Ok(id)
}

pub fn get_change<G: StorageGateway + ?Sized>(gateway: &G, id: Id) -> Result<Option<Change>> {
    let row = match gateway.get("change_audit", &["reason", "change_date"], id)? {
        Some(row) => row,
        None => return Ok(None),
    };

    let date_str: String = column(&row, 1)?;
    let date = DateTime::parse_from_rfc3339(&date_str)
        .map_err(|e| DedupError::Decode {
            message: format!("change #{} has a bad date '{}': {}", id, date_str, e),
        })?
        .with_timezone(&Utc);

    Ok(Some(Change {
        id: Some(id),
        reason: column(&row, 0)?,
        date,
    }))
}

// ============================================================================
// BULK JOBS
// ============================================================================

pub fn begin_job<G: StorageGateway + ?Sized>(gateway: &G) -> Result<BulkJob> {
    let id = gateway.insert(
        "bulk_load_job",
        &["started"],
        &[SqlValue::Text(Utc::now().to_rfc3339())],
    )?;
    Ok(BulkJob { id })
}

pub fn end_job<G: StorageGateway + ?Sized>(gateway: &G, job: BulkJob) -> Result<()> {
    let deleted = gateway.execute_update(
        "DELETE FROM bulk_load_job WHERE id = ?1",
        &[SqlValue::Integer(job.id)],
    )?;
    if deleted != 1 {
        return Err(DedupError::consistency("end job", 1, deleted as i64));
    }
    Ok(())
}

/// Jobs that were started but never ended (their unit of work died without rolling back).
pub fn orphaned_jobs<G: StorageGateway + ?Sized>(gateway: &G) -> Result<Vec<BulkJob>> {
    let mut jobs = Vec::new();
    gateway.execute_query("SELECT id FROM bulk_load_job ORDER BY id", &[], &mut |row| {
        jobs.push(BulkJob { id: column(row, 0)? });
        Ok(())
    })?;
    Ok(jobs)
}

/// Delete whatever an aborted job left behind in the given staging tables, then the job itself.
/// Returns the number of staging rows removed.
pub fn reclaim_job<G: StorageGateway + ?Sized>(
    gateway: &G,
    job: BulkJob,
    staging_tables: &[&str],
) -> Result<usize> {
    let mut removed = 0;
    for table in staging_tables {
        removed += gateway.execute_update(
            &format!("DELETE FROM {} WHERE job = ?1", table),
            &[SqlValue::Integer(job.id)],
        )?;
    }
    gateway.execute_update(
        "DELETE FROM bulk_load_job WHERE id = ?1",
        &[SqlValue::Integer(job.id)],
    )?;

    if removed > 0 {
        warn!("Reclaimed {} orphaned staging rows of job #{}", removed, job.id);
    } else {
        info!("Reclaimed empty job #{}", job.id);
    }
    Ok(removed)
}

pub fn row_count<G: StorageGateway + ?Sized>(gateway: &G, table: &str) -> Result<i64> {
    let count = gateway.query_i64(&format!("SELECT COUNT(*) FROM {}", table), &[])?;
    Ok(count.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SqliteGateway;

    fn test_gateway() -> SqliteGateway {
        let gateway = SqliteGateway::open_in_memory().unwrap();
        setup_database(gateway.connection()).unwrap();
        gateway
    }

    #[test]
    fn test_setup_is_idempotent() {
        let gateway = test_gateway();
        setup_database(gateway.connection()).unwrap();

        assert_eq!(row_count(&gateway, "protein_sequence").unwrap(), 0);
        assert_eq!(row_count(&gateway, "bulk_load_job").unwrap(), 0);
    }

    #[test]
    fn test_change_saved_once() {
        let gateway = test_gateway();

        let mut change = Change::new("initial import");
        let id1 = save_change(&gateway, &mut change).unwrap();
        let id2 = save_change(&gateway, &mut change).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(row_count(&gateway, "change_audit").unwrap(), 1);

        let loaded = get_change(&gateway, id1).unwrap().unwrap();
        assert_eq!(loaded.reason, "initial import");
        assert_eq!(loaded.date.timestamp(), change.date.timestamp());
        assert!(get_change(&gateway, id1 + 1).unwrap().is_none());
    }

    #[test]
    fn test_job_ids_are_never_reused() {
        let gateway = test_gateway();

        let first = begin_job(&gateway).unwrap();
        end_job(&gateway, first).unwrap();
        let second = begin_job(&gateway).unwrap();

        assert!(second.id > first.id);
        assert_eq!(orphaned_jobs(&gateway).unwrap(), vec![second]);

        // Ending twice means somebody else already cleaned up
        end_job(&gateway, second).unwrap();
        assert!(matches!(
            end_job(&gateway, second),
            Err(DedupError::ConsistencyError { .. })
        ));
    }

    #[test]
    fn test_reclaim_orphaned_job() {
        let gateway = test_gateway();

        let job = begin_job(&gateway).unwrap();
        for order in 0..3 {
            gateway
                .insert(
                    "temp_protein_accnum",
                    &["job", "data_order", "accnum"],
                    &[
                        SqlValue::Integer(job.id),
                        SqlValue::Integer(order),
                        SqlValue::Text(format!("P{:05}", order)),
                    ],
                )
                .unwrap();
        }

        let removed =
            reclaim_job(&gateway, job, &["temp_protein_accnum", "temp_protein_sequence"]).unwrap();
        assert_eq!(removed, 3);
        assert!(orphaned_jobs(&gateway).unwrap().is_empty());
        assert_eq!(row_count(&gateway, "temp_protein_accnum").unwrap(), 0);
    }
}
