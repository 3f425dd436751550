// 🚨 Error taxonomy for the dedup core
// Every failure surfaces to the immediate caller, nothing is swallowed here.

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Caller demanded creation but an equal row already exists.
    #[error("{entity} already exists")]
    DuplicateValue { entity: String },

    /// Operation needs a durable id that is absent.
    #[error("not persisted: {what}")]
    NotPersisted { what: String },

    /// Lookup predicate matched a row that is not `==` to the item.
    /// The predicate is weaker than the type's equality, which is a caller bug.
    #[error("equality predicate for {entity} matched a row that is not equal to the item")]
    BrokenEquality { entity: String },

    /// Row-count mismatch between what an operation wrote and what it expected.
    /// Fatal, the unit of work is rolled back.
    #[error("consistency failure in {step}: expected {expected}, got {actual}")]
    ConsistencyError {
        step: &'static str,
        expected: i64,
        actual: i64,
    },

    /// Commit/rollback without a transaction, or nested begin.
    #[error("transaction state error: {message}")]
    TransactionStateError { message: String },

    /// Mutation attempted on an evolvable entity that was soft-deleted.
    #[error("{entity} #{id} is deleted and cannot be modified")]
    AlreadyDeleted { entity: String, id: i64 },

    /// Versioned entity handed to a plain save, which would skip its audit trail.
    #[error("{entity} is versioned and must be saved through save_evolvable")]
    VersionedEntity { entity: String },

    /// Stored row could not be mapped back into a value.
    #[error("cannot decode stored row: {message}")]
    Decode { message: String },

    /// Anything the backing store reports.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl DedupError {
    pub fn consistency(step: &'static str, expected: impl Into<i64>, actual: impl Into<i64>) -> Self {
        DedupError::ConsistencyError {
            step,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn not_persisted(what: impl Into<String>) -> Self {
        DedupError::NotPersisted { what: what.into() }
    }

    /// Fatal errors abort the whole unit of work and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DedupError::ConsistencyError { .. })
    }
}

/// Result type for every library operation.
pub type Result<T> = std::result::Result<T, DedupError>;
