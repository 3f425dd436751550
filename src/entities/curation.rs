// 📚 Curation - a versioned, soft-deletable database definition
//
// Identity: id. Equality: short name + title.
// Notes are auxiliary and may be edited while the curation is active.

use crate::db::Change;
use crate::entities::{Evolvable, Persistable};
use crate::error::Result;
use crate::gateway::{column, Id, SqlValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curation {
    pub id: Option<Id>,
    pub short_name: String,
    pub title: String,
    notes: Option<String>,
    creation: Option<Change>,
    deletion: Option<Change>,
}

impl Curation {
    pub fn new(short_name: &str, title: &str) -> Self {
        Curation {
            id: None,
            short_name: short_name.to_string(),
            title: title.to_string(),
            notes: None,
            creation: None,
            deletion: None,
        }
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// Edit the notes. Deleted curations are frozen.
    pub fn set_notes(&mut self, notes: Option<String>) -> Result<()> {
        self.ensure_active()?;
        self.notes = notes;
        Ok(())
    }
}

impl PartialEq for Curation {
    fn eq(&self, other: &Self) -> bool {
        self.short_name == other.short_name && self.title == other.title
    }
}

impl Persistable for Curation {
    const TABLE: &'static str = "curation";
    const COLUMNS: &'static [&'static str] = &["short_name", "title", "notes"];
    const VERSIONED: bool = true;

    fn id(&self) -> Option<Id> {
        self.id
    }

    fn set_id(&mut self, id: Option<Id>) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.short_name.clone()),
            SqlValue::Text(self.title.clone()),
            self.notes.clone().map_or(SqlValue::Null, SqlValue::Text),
        ]
    }

    /// Changes are attached by the resolver, the row only holds their ids.
    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self> {
        Ok(Curation {
            id: Some(id),
            short_name: column(row, 0)?,
            title: column(row, 1)?,
            notes: column(row, 2)?,
            creation: None,
            deletion: None,
        })
    }
}

impl Evolvable for Curation {
    fn creation(&self) -> Option<&Change> {
        self.creation.as_ref()
    }

    fn set_creation(&mut self, change: Option<Change>) {
        self.creation = change;
    }

    fn deletion(&self) -> Option<&Change> {
        self.deletion.as_ref()
    }

    fn set_deletion(&mut self, change: Option<Change>) {
        self.deletion = change;
    }
}
