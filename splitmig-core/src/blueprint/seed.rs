use crate::error::{BlueprintKind, MigrationResult, ValidationError};
use crate::sql::{Condition, SqlStatementBuilder};
use crate::value::Row;

use super::{DiffContext, SqlPair};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Rows to insert into a table, gated by an environment allowlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedBlueprint {
    table: String,
    rows: Vec<Row>,
    batch_size: usize,
    environments: Vec<String>,
}

impl SeedBlueprint {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            environments: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&mut self, row: Row) -> &mut Self {
        self.rows.push(row);
        self
    }

    pub fn extend_rows<I: IntoIterator<Item = Row>>(&mut self, rows: I) -> &mut Self {
        self.rows.extend(rows);
        self
    }

    /// Rows per INSERT statement.
    pub fn batch_size(&mut self, size: usize) -> &mut Self {
        self.batch_size = size;
        self
    }

    /// Restricts the seed to the given environments. No restriction means every environment.
    pub fn only_in<I, S>(&mut self, environments: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    pub fn allowed_in(&self, environment: &str) -> bool {
        self.environments.is_empty()
            || self
                .environments
                .iter()
                .any(|e| e.eq_ignore_ascii_case(environment))
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut fail = |message: String| {
            errors.push(ValidationError::new(BlueprintKind::Seed, &self.table, message));
        };
        if self.table.trim().is_empty() {
            fail("seed must target a table".to_owned());
        }
        if self.batch_size == 0 {
            fail("batch size must be at least 1".to_owned());
        }
        if self.rows.is_empty() {
            fail("seed has no rows".to_owned());
        }
        if let Some(first) = self.rows.first() {
            for (i, row) in self.rows.iter().enumerate().skip(1) {
                if !row.keys().eq(first.keys()) {
                    fail(format!("row {} does not have the same columns as row 0", i));
                }
            }
        }
        errors
    }

    /// Batched INSERTs up; one DELETE per row, newest first, down.
    pub fn obtain_sql(&self, ctx: &DiffContext) -> MigrationResult<SqlPair> {
        let mut up = SqlStatementBuilder::new(ctx.dialect);
        for batch in self.rows.chunks(self.batch_size.max(1)) {
            up.insert(&self.table, batch)?;
        }

        let mut down = SqlStatementBuilder::new(ctx.dialect);
        for row in self.rows.iter().rev() {
            let conditions: Vec<Condition> = row
                .iter()
                .map(|(column, value)| Condition::eq(column.as_str(), value.clone()))
                .collect();
            down.delete(&self.table).where_clause(&conditions);
        }

        Ok(SqlPair::new(up.output(true).sql, down.output(true).sql))
    }
}
