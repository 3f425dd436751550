// 🎯 Equality criteria - which stored rows count as "the same" value
//
// Rendered to a parameterised WHERE fragment. All criteria are AND-ed.

use crate::entities::Persistable;
use crate::error::{DedupError, Result};
use crate::gateway::SqlValue;

#[derive(Debug, Clone, PartialEq)]
enum Criterion {
    Eq(String, SqlValue),
    IsNull(String),
    Between(String, f64, f64),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    criteria: Vec<Criterion>,
}

impl Criteria {
    pub fn new() -> Self {
        Criteria::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.criteria.push(Criterion::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.criteria.push(Criterion::IsNull(column.to_string()));
        self
    }

    /// `column = value`, or `column IS NULL` when there is no value.
    pub fn null_safe_eq<V: Into<SqlValue>>(self, column: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.eq(column, v),
            None => self.is_null(column),
        }
    }

    /// Value within `tolerance` of the stored one. NaN is stored as NULL.
    pub fn double_eq(mut self, column: &str, value: f64, tolerance: f64) -> Self {
        if value.is_nan() {
            return self.is_null(column);
        }
        self.criteria.push(Criterion::Between(
            column.to_string(),
            value - tolerance,
            value + tolerance,
        ));
        self
    }

    /// Column references the given entity (or is NULL when there is none).
    /// The associated entity has to be saved already.
    pub fn association_eq<T: Persistable>(self, column: &str, association: Option<&T>) -> Result<Self> {
        match association {
            None => Ok(self.is_null(column)),
            Some(entity) => match entity.id() {
                Some(id) => Ok(self.eq(column, id)),
                None => Err(DedupError::not_persisted(format!(
                    "association {} -> {}",
                    column,
                    T::TABLE
                ))),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Render as SQL. Placeholders are numbered from `first_param`.
    pub fn to_sql(&self, first_param: usize) -> (String, Vec<SqlValue>) {
        if self.criteria.is_empty() {
            return ("1 = 1".to_string(), Vec::new());
        }

        let mut clauses = Vec::with_capacity(self.criteria.len());
        let mut params = Vec::new();
        for criterion in &self.criteria {
            match criterion {
                Criterion::Eq(column, value) => {
                    params.push(value.clone());
                    clauses.push(format!("{} = ?{}", column, first_param + params.len() - 1));
                }
                Criterion::IsNull(column) => clauses.push(format!("{} IS NULL", column)),
                Criterion::Between(column, low, high) => {
                    params.push(SqlValue::Real(*low));
                    params.push(SqlValue::Real(*high));
                    let high_index = first_param + params.len() - 1;
                    clauses.push(format!(
                        "{} BETWEEN ?{} AND ?{}",
                        column,
                        high_index - 1,
                        high_index
                    ));
                }
            }
        }
        (clauses.join(" AND "), params)
    }
}
