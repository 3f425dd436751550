// 🏷️ Accession numbers and protein descriptions
// Plain string values, deduplicated by their text.

use crate::bulk::{BulkAdapter, StagingRow};
use crate::db::BulkJob;
use crate::entities::Persistable;
use crate::error::Result;
use crate::gateway::{column, Id, SqlValue};
use crate::hasher::CollectionSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// ACCESSION NUMBER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProteinAccnum {
    pub id: Option<Id>,
    pub accnum: String,
}

impl ProteinAccnum {
    pub fn new(accnum: &str) -> Self {
        ProteinAccnum {
            id: None,
            accnum: accnum.trim().to_string(),
        }
    }
}

impl PartialEq for ProteinAccnum {
    fn eq(&self, other: &Self) -> bool {
        self.accnum == other.accnum
    }
}

impl Persistable for ProteinAccnum {
    const TABLE: &'static str = "protein_accnum";
    const COLUMNS: &'static [&'static str] = &["accnum"];

    fn id(&self) -> Option<Id> {
        self.id
    }

    fn set_id(&mut self, id: Option<Id>) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![SqlValue::Text(self.accnum.clone())]
    }

    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self> {
        Ok(ProteinAccnum {
            id: Some(id),
            accnum: column(row, 0)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccnumBulkAdapter;

impl BulkAdapter for AccnumBulkAdapter {
    type Item = ProteinAccnum;

    fn staging_table_name(&self) -> &str {
        "temp_protein_accnum"
    }

    fn equality_columns(&self) -> &[&str] {
        &["accnum"]
    }

    fn columns_to_transfer(&self) -> &[&str] {
        &["accnum"]
    }

    fn project_to_staging(
        &self,
        value: &ProteinAccnum,
        job: BulkJob,
        order: i64,
    ) -> Result<StagingRow> {
        Ok(StagingRow::new(job, order, value.to_row()))
    }
}

/// Accession numbers of one protein entry. A set: listing an accession twice changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProteinAccnumSet;

impl CollectionSchema for ProteinAccnumSet {
    type Member = ProteinAccnum;
    const TABLE: &'static str = "protein_accnum_set";
    const MEMBER_TABLE: &'static str = "protein_accnum_set_member";
    const BAG: bool = false;
}

// ============================================================================
// DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProteinDescription {
    pub id: Option<Id>,
    pub description: String,
}

impl ProteinDescription {
    pub fn new(description: &str) -> Self {
        ProteinDescription {
            id: None,
            description: description.trim().to_string(),
        }
    }
}

impl PartialEq for ProteinDescription {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description
    }
}

impl Persistable for ProteinDescription {
    const TABLE: &'static str = "protein_description";
    const COLUMNS: &'static [&'static str] = &["description"];

    fn id(&self) -> Option<Id> {
        self.id
    }

    fn set_id(&mut self, id: Option<Id>) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![SqlValue::Text(self.description.clone())]
    }

    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self> {
        Ok(ProteinDescription {
            id: Some(id),
            description: column(row, 0)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptionBulkAdapter;

impl BulkAdapter for DescriptionBulkAdapter {
    type Item = ProteinDescription;

    fn staging_table_name(&self) -> &str {
        "temp_protein_description"
    }

    fn equality_columns(&self) -> &[&str] {
        &["description"]
    }

    fn columns_to_transfer(&self) -> &[&str] {
        &["description"]
    }

    fn project_to_staging(
        &self,
        value: &ProteinDescription,
        job: BulkJob,
        order: i64,
    ) -> Result<StagingRow> {
        Ok(StagingRow::new(job, order, value.to_row()))
    }
}
