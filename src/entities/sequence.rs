// 🧬 Protein sequences - the bulk of what gets loaded
//
// Equality is the sequence string. Mass is auxiliary data that rides along.

use crate::bulk::{BulkAdapter, StagingRow};
use crate::db::BulkJob;
use crate::entities::Persistable;
use crate::error::Result;
use crate::gateway::{column, Id, SqlValue};
use crate::hasher::CollectionSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProteinSequence {
    pub id: Option<Id>,
    pub sequence: String,
    pub mass: Option<f64>,
}

impl ProteinSequence {
    pub fn new(sequence: &str) -> Self {
        ProteinSequence {
            id: None,
            sequence: sequence.to_uppercase(),
            mass: None,
        }
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }
}

impl PartialEq for ProteinSequence {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Persistable for ProteinSequence {
    const TABLE: &'static str = "protein_sequence";
    const COLUMNS: &'static [&'static str] = &["sequence", "mass"];

    fn id(&self) -> Option<Id> {
        self.id
    }

    fn set_id(&mut self, id: Option<Id>) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.sequence.clone()),
            self.mass.map_or(SqlValue::Null, SqlValue::Real),
        ]
    }

    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self> {
        Ok(ProteinSequence {
            id: Some(id),
            sequence: column(row, 0)?,
            mass: column(row, 1)?,
        })
    }
}

// ============================================================================
// BULK LOADING
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceBulkAdapter;

impl BulkAdapter for SequenceBulkAdapter {
    type Item = ProteinSequence;

    fn staging_table_name(&self) -> &str {
        "temp_protein_sequence"
    }

    fn equality_columns(&self) -> &[&str] {
        &["sequence"]
    }

    fn columns_to_transfer(&self) -> &[&str] {
        &["sequence", "mass"]
    }

    fn project_to_staging(
        &self,
        value: &ProteinSequence,
        job: BulkJob,
        order: i64,
    ) -> Result<StagingRow> {
        Ok(StagingRow::new(job, order, value.to_row()))
    }
}

// ============================================================================
// HASHED LISTS OF SEQUENCES
// ============================================================================

/// Order-independent list of sequences (e.g. all sequences of one protein group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProteinSequenceList;

impl CollectionSchema for ProteinSequenceList {
    type Member = ProteinSequence;
    const TABLE: &'static str = "protein_sequence_list";
    const MEMBER_TABLE: &'static str = "protein_sequence_list_member";
}
