//! Declarative descriptions of desired schema state.
//!
//! A blueprint is diffed against live catalog metadata to produce an
//! up/down [`SqlPair`]. Column, index and foreign key blueprints that are not
//! attached to a table are diffed as a single-element table blueprint.

mod column;
mod foreign_key;
mod index;
mod procedure;
mod seed;
mod table;

use sqlx::AnyConnection;

pub use column::ColumnBlueprint;
pub use foreign_key::{ForeignKeyBlueprint, foreign_key_name};
pub use index::IndexBlueprint;
pub use procedure::ProcedureBlueprint;
pub use seed::{DEFAULT_BATCH_SIZE, SeedBlueprint};
pub use table::TableBlueprint;

use crate::dialect::Dialect;
use crate::error::{BlueprintKind, MigrationError, MigrationResult, ValidationError};
use crate::metadata::{Catalog, SchemaMetadataReader};

/// Forward and reverse SQL scripts for one blueprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlPair {
    pub up: String,
    pub down: String,
}

impl SqlPair {
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: down.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.up.trim().is_empty() && self.down.trim().is_empty()
    }

    /// Runs `other` after `self` going up, and before it going down.
    pub fn append(&mut self, other: SqlPair) {
        self.up = join_scripts(&self.up, &other.up);
        self.down = join_scripts(&other.down, &self.down);
    }
}

pub(crate) fn join_scripts(first: &str, second: &str) -> String {
    match (first.trim().is_empty(), second.trim().is_empty()) {
        (true, _) => second.to_owned(),
        (false, true) => first.to_owned(),
        (false, false) => {
            let first = first.trim_end();
            let separator = if first.ends_with(';') { "\n" } else { ";\n" };
            format!("{}{}{}", first, separator, second)
        }
    }
}

/// What a diff needs besides the blueprint and the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffContext {
    pub dialect: Dialect,
    /// Deployment environment, matched against seed allowlists.
    pub environment: String,
}

impl DiffContext {
    pub fn new(dialect: Dialect, environment: impl Into<String>) -> Self {
        Self {
            dialect,
            environment: environment.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Blueprint {
    Table(TableBlueprint),
    Column(ColumnBlueprint),
    Index(IndexBlueprint),
    ForeignKey(ForeignKeyBlueprint),
    Procedure(ProcedureBlueprint),
    Seed(SeedBlueprint),
}

impl Blueprint {
    pub fn kind(&self) -> BlueprintKind {
        match self {
            Self::Table(_) => BlueprintKind::Table,
            Self::Column(_) => BlueprintKind::Column,
            Self::Index(_) => BlueprintKind::Index,
            Self::ForeignKey(_) => BlueprintKind::ForeignKey,
            Self::Procedure(_) => BlueprintKind::Procedure,
            Self::Seed(_) => BlueprintKind::Seed,
        }
    }

    /// The table (or procedure) this blueprint acts on.
    pub fn target(&self) -> &str {
        match self {
            Self::Table(t) => t.name(),
            Self::Column(c) => c.table(),
            Self::Index(i) => i.table(),
            Self::ForeignKey(f) => f.table(),
            Self::Procedure(p) => p.name(),
            Self::Seed(s) => s.table(),
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        match self {
            Self::Procedure(p) => p.validate(),
            Self::Seed(s) => s.validate(),
            other => other.as_table().map(|t| t.validate()).unwrap_or_default(),
        }
    }

    fn as_table(&self) -> Option<TableBlueprint> {
        match self {
            Self::Table(t) => Some(t.clone()),
            Self::Column(c) => Some(TableBlueprint::from_column(c.clone())),
            Self::Index(i) => Some(TableBlueprint::from_index(i.clone())),
            Self::ForeignKey(f) => Some(TableBlueprint::from_foreign_key(f.clone())),
            Self::Procedure(_) | Self::Seed(_) => None,
        }
    }

    /// Reads fresh catalog state for the target and diffs against it.
    ///
    /// Returns `None` for a seed that is not allowed in `ctx.environment`.
    pub async fn obtain_sql<C: Catalog>(
        &self,
        reader: &mut SchemaMetadataReader<C>,
        conn: &mut AnyConnection,
        ctx: &DiffContext,
    ) -> MigrationResult<Option<SqlPair>> {
        match self {
            Self::Procedure(procedure) => {
                if ctx.dialect != Dialect::MySql {
                    return Err(MigrationError::Validation(vec![ValidationError::new(
                        BlueprintKind::Procedure,
                        procedure.name(),
                        "stored procedures are not supported on SQLite",
                    )]));
                }
                let current = reader.procedure_info(conn, procedure.name()).await?;
                Ok(Some(procedure.obtain_sql(current.as_ref(), ctx)))
            }
            Self::Seed(seed) => {
                if !seed.allowed_in(&ctx.environment) {
                    tracing::info!(
                        operation = "seed_skip",
                        table = %seed.table(),
                        environment = %ctx.environment,
                        "seed not allowed in this environment"
                    );
                    return Ok(None);
                }
                seed.obtain_sql(ctx).map(Some)
            }
            other => {
                let Some(table) = other.as_table() else {
                    return Ok(None);
                };
                let current = reader.table_info(conn, table.name(), true).await?;
                table.obtain_sql(current.as_ref(), ctx).map(Some)
            }
        }
    }
}

impl From<TableBlueprint> for Blueprint {
    fn from(value: TableBlueprint) -> Self {
        Self::Table(value)
    }
}

impl From<ProcedureBlueprint> for Blueprint {
    fn from(value: ProcedureBlueprint) -> Self {
        Self::Procedure(value)
    }
}

impl From<SeedBlueprint> for Blueprint {
    fn from(value: SeedBlueprint) -> Self {
        Self::Seed(value)
    }
}

impl From<ColumnBlueprint> for Blueprint {
    fn from(value: ColumnBlueprint) -> Self {
        Self::Column(value)
    }
}

impl From<IndexBlueprint> for Blueprint {
    fn from(value: IndexBlueprint) -> Self {
        Self::Index(value)
    }
}

impl From<ForeignKeyBlueprint> for Blueprint {
    fn from(value: ForeignKeyBlueprint) -> Self {
        Self::ForeignKey(value)
    }
}
