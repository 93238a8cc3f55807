//! Blueprint-driven schema migrations.
//!
//! A [`Migration`] fills a [`MigrationBuilder`] with table, procedure and seed
//! blueprints. The [`Migrator`] diffs each blueprint against the live catalog,
//! runs the resulting `up` SQL and records the `up`/`down` pair in an
//! append-only ledger so it can be rolled back later.

pub use sqlx;

pub mod blueprint;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod metadata;
pub mod migration;
pub mod migrator;
pub mod registry;
pub mod schema;
pub mod sql;
pub mod value;

#[cfg(feature = "sqlite")]
pub mod test_utils;

pub use blueprint::{
    Blueprint, ColumnBlueprint, DiffContext, ForeignKeyBlueprint, IndexBlueprint,
    ProcedureBlueprint, SeedBlueprint, SqlPair, TableBlueprint,
};
pub use config::Config;
pub use context::Context;
pub use dialect::Dialect;
pub use error::{BlueprintKind, MigrationError, MigrationResult, ValidationError};
pub use ledger::ArtifactKind;
pub use metadata::{Catalog, DatabaseCatalog, SchemaMetadataReader, StaticCatalog};
pub use migration::{FileMigration, Migration, MigrationBuilder, Step};
pub use migrator::{
    ApplyOptions, ApplyReport, EntryState, Migrator, RollbackOptions, RollbackReport,
    StatusItem, StatusReport,
};
pub use registry::{Registry, RegistryEntry};
pub use schema::{ColumnType, IndexKind, ReferentialAction, TableMetadata};
pub use value::{Row, Value};

pub mod prelude {
    pub use crate::{
        ApplyOptions, ColumnType, Config, Context, IndexKind, Migration, MigrationBuilder,
        MigrationResult, Migrator, ReferentialAction, Registry, RollbackOptions, TableBlueprint,
    };
}
