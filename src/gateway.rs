// 🔌 Storage Gateway - the only way the core talks to the database
//
// Parameterised SQL + forward-only cursors + explicit transaction boundaries.
// The gateway is passed explicitly to every operation, there is no "current session" global.

use crate::error::{DedupError, Result};
use log::debug;
use rusqlite::types::{FromSql, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::Path;

/// A single SQL value (parameter or result column).
pub type SqlValue = rusqlite::types::Value;

/// Database identifier of a stored row.
pub type Id = i64;

// ============================================================================
// GATEWAY TRAIT
// ============================================================================

pub trait StorageGateway {
    /// Run a statement that changes data, returns the number of affected rows.
    fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Stream the rows of a query through `visit`, one at a time, in cursor order.
    /// The cursor is forward-only and cannot be restarted.
    fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        visit: &mut dyn FnMut(&[SqlValue]) -> Result<()>,
    ) -> Result<()>;

    /// Insert one row and return its new id.
    fn insert(&self, table: &str, columns: &[&str], values: &[SqlValue]) -> Result<Id>;

    /// Fetch `columns` of the row with the given id.
    fn get(&self, table: &str, columns: &[&str], id: Id) -> Result<Option<Vec<SqlValue>>>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Collect a (small) result set.
    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let mut rows = Vec::new();
        self.execute_query(sql, params, &mut |row| {
            rows.push(row.to_vec());
            Ok(())
        })?;
        Ok(rows)
    }

    /// First column of the first row as an integer, `None` for no rows or NULL.
    fn query_i64(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>> {
        let mut result = None;
        let mut seen = false;
        self.execute_query(sql, params, &mut |row| {
            if !seen {
                seen = true;
                result = match row.first() {
                    Some(SqlValue::Null) | None => None,
                    Some(_) => Some(column::<i64>(row, 0)?),
                };
            }
            Ok(())
        })?;
        Ok(result)
    }
}

/// Decode column `index` of a row into a Rust value.
pub fn column<T: FromSql>(row: &[SqlValue], index: usize) -> Result<T> {
    let value = row.get(index).ok_or_else(|| DedupError::Decode {
        message: format!("row has {} columns, wanted column {}", row.len(), index),
    })?;
    T::column_result(ValueRef::from(value)).map_err(|e| DedupError::Decode {
        message: format!("column {}: {}", index, e),
    })
}

/// Run `work` as one unit of work.
///
/// Opens a transaction unless the caller already holds one (then the caller owns the boundary).
/// Commits on success and rolls back on every error path.
pub fn unit_of_work<G, T, F>(gateway: &G, work: F) -> Result<T>
where
    G: StorageGateway + ?Sized,
    F: FnOnce() -> Result<T>,
{
    if gateway.in_transaction() {
        return work();
    }

    gateway.begin()?;
    match work() {
        Ok(value) => {
            gateway.commit()?;
            Ok(value)
        }
        Err(e) => {
            // The original error is what the caller needs to see
            if let Err(rollback_error) = gateway.rollback() {
                log::error!("rollback failed after {}: {}", e, rollback_error);
            }
            Err(e)
        }
    }
}

// ============================================================================
// SQLITE IMPLEMENTATION
// ============================================================================

pub struct SqliteGateway {
    conn: Connection,
}

impl SqliteGateway {
    pub fn new(conn: Connection) -> Self {
        SqliteGateway { conn }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StorageGateway for SqliteGateway {
    fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        Ok(affected)
    }

    fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        visit: &mut dyn FnMut(&[SqlValue]) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut buffer: Vec<SqlValue> = Vec::with_capacity(width);
        while let Some(row) = rows.next()? {
            buffer.clear();
            for i in 0..width {
                buffer.push(row.get::<_, SqlValue>(i)?);
            }
            visit(&buffer)?;
        }
        Ok(())
    }

    fn insert(&self, table: &str, columns: &[&str], values: &[SqlValue]) -> Result<Id> {
        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );
        self.execute_update(&sql, values)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, table: &str, columns: &[&str], id: Id) -> Result<Option<Vec<SqlValue>>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?1", columns.join(", "), table);
        let rows = self.query_rows(&sql, &[SqlValue::Integer(id)])?;
        Ok(rows.into_iter().next())
    }

    fn begin(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(DedupError::TransactionStateError {
                message: "begin called while a transaction is already active".to_string(),
            });
        }
        // IMMEDIATE takes the write lock up front, so concurrent loaders queue here
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        debug!("transaction started");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(DedupError::TransactionStateError {
                message: "commit called without an active transaction".to_string(),
            });
        }
        self.conn.execute_batch("COMMIT")?;
        debug!("transaction committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(DedupError::TransactionStateError {
                message: "rollback called without an active transaction".to_string(),
            });
        }
        self.conn.execute_batch("ROLLBACK")?;
        debug!("transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}
