// Entity Models
// Values are identified by their business fields, never by id.
//
// Each entity has:
// - An optional database id (unset until persisted)
// - PartialEq over business fields only
// - A row mapping (table + columns) used by the resolver and the bulk loader

pub mod accession;
pub mod curation;
pub mod sequence;

pub use accession::{
    AccnumBulkAdapter, DescriptionBulkAdapter, ProteinAccnum, ProteinAccnumSet, ProteinDescription,
};
pub use curation::Curation;
pub use sequence::{ProteinSequence, ProteinSequenceList, SequenceBulkAdapter};

use crate::db::Change;
use crate::error::{DedupError, Result};
use crate::gateway::{Id, SqlValue};
use serde::{Deserialize, Serialize};

/// A value stored in its own table, one row per distinct value.
pub trait Persistable: PartialEq + Sized {
    const TABLE: &'static str;

    /// Stored columns besides `id`, in `to_row` order.
    const COLUMNS: &'static [&'static str];

    /// Set by every `Evolvable` type. Versioned rows are only written through
    /// `EqualityResolver::save_evolvable`.
    const VERSIONED: bool = false;

    fn id(&self) -> Option<Id>;
    fn set_id(&mut self, id: Option<Id>);

    fn to_row(&self) -> Vec<SqlValue>;
    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self>;

    fn entity_name() -> &'static str {
        Self::TABLE
    }
}

// ============================================================================
// EVOLVABLE LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Saved, not deleted
    Active,

    /// Soft deleted. Terminal.
    Deleted,
}

/// A persistable value with an audit trail: created by one change, possibly deleted by another.
///
/// Stored tables carry `creation` and `deletion` columns referencing `change_audit`.
/// Once `deletion` is set it is never cleared.
pub trait Evolvable: Persistable {
    fn creation(&self) -> Option<&Change>;
    fn set_creation(&mut self, change: Option<Change>);

    fn deletion(&self) -> Option<&Change>;
    fn set_deletion(&mut self, change: Option<Change>);

    fn lifecycle(&self) -> Lifecycle {
        if self.deletion().is_some() {
            Lifecycle::Deleted
        } else {
            Lifecycle::Active
        }
    }

    /// Guard for every mutation outside the deletion itself.
    fn ensure_active(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Deleted => Err(DedupError::AlreadyDeleted {
                entity: Self::entity_name().to_string(),
                id: self.id().unwrap_or_default(),
            }),
        }
    }
}
