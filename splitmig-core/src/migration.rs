//! Migration definitions: the [`Migration`] trait, the [`MigrationBuilder`] it
//! fills, and declarative TOML files that drive the same builder.

use serde::Deserialize;

use crate::blueprint::{Blueprint, ProcedureBlueprint, SeedBlueprint, SqlPair, TableBlueprint};
use crate::error::{MigrationError, MigrationResult, ValidationError};
use crate::schema::{ColumnType, IndexKind, ReferentialAction};
use crate::value::{Row, Value};

/// A unit of schema change. Implementors describe the desired state; the
/// runner turns it into SQL against the live catalog.
pub trait Migration: Send + Sync {
    fn apply(&self, m: &mut MigrationBuilder) -> MigrationResult<()>;
}

impl<F> Migration for F
where
    F: Fn(&mut MigrationBuilder) -> MigrationResult<()> + Send + Sync,
{
    fn apply(&self, m: &mut MigrationBuilder) -> MigrationResult<()> {
        self(m)
    }
}

/// One executable step of a migration.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Blueprint(Blueprint),
    /// Hand-written SQL with its inverse.
    Raw(SqlPair),
}

/// Collects the steps of one migration in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MigrationBuilder {
    steps: Vec<Step>,
    pre_sql: Option<String>,
    post_sql: Option<String>,
    database: Option<String>,
}

impl MigrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(&mut TableBlueprint),
    {
        let mut table = TableBlueprint::new(name);
        f(&mut table);
        self.blueprint(table)
    }

    pub fn blueprint(&mut self, blueprint: impl Into<Blueprint>) -> &mut Self {
        self.steps.push(Step::Blueprint(blueprint.into()));
        self
    }

    pub fn procedure<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(&mut ProcedureBlueprint),
    {
        let mut procedure = ProcedureBlueprint::new(name);
        f(&mut procedure);
        self.blueprint(procedure)
    }

    pub fn drop_procedure(&mut self, name: impl Into<String>) -> &mut Self {
        self.blueprint(ProcedureBlueprint::dropped(name))
    }

    pub fn seed<F>(&mut self, table: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(&mut SeedBlueprint),
    {
        let mut seed = SeedBlueprint::new(table);
        f(&mut seed);
        self.blueprint(seed)
    }

    pub fn raw(&mut self, up: impl Into<String>, down: impl Into<String>) -> &mut Self {
        self.steps.push(Step::Raw(SqlPair::new(up, down)));
        self
    }

    /// SQL run before the first step's `up`.
    pub fn pre_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.pre_sql = Some(sql.into());
        self
    }

    /// SQL run after the last step's `up`.
    pub fn post_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.post_sql = Some(sql.into());
        self
    }

    /// Database created (if missing) before the migration runs.
    pub fn database(&mut self, name: impl Into<String>) -> &mut Self {
        self.database = Some(name.into());
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn pre_sql_fragment(&self) -> Option<&str> {
        self.pre_sql.as_deref()
    }

    pub fn post_sql_fragment(&self) -> Option<&str> {
        self.post_sql.as_deref()
    }

    pub fn target_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        self.steps
            .iter()
            .flat_map(|step| match step {
                Step::Blueprint(blueprint) => blueprint.validate(),
                Step::Raw(_) => Vec::new(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ColumnSpec {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    length: Option<u32>,
    scale: Option<u32>,
    #[serde(default)]
    unsigned: bool,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    auto_increment: bool,
    #[serde(default)]
    primary: bool,
    default: Option<Value>,
    #[serde(default)]
    default_current_timestamp: bool,
    charset: Option<String>,
    collation: Option<String>,
}

fn default_index_kind() -> IndexKind {
    IndexKind::Index
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexSpec {
    #[serde(default)]
    name: String,
    #[serde(default = "default_index_kind")]
    kind: IndexKind,
    columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForeignKeySpec {
    name: Option<String>,
    columns: Vec<String>,
    references: Vec<String>,
    at_table: String,
    #[serde(default)]
    on_update: ReferentialAction,
    #[serde(default)]
    on_delete: ReferentialAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedSpec {
    /// Required for top-level seeds; defaults to the enclosing table otherwise.
    table: Option<String>,
    batch_size: Option<usize>,
    #[serde(default)]
    environments: Vec<String>,
    #[serde(default)]
    rows: Vec<Row>,
}

impl SeedSpec {
    fn fill(&self, seed: &mut SeedBlueprint) {
        seed.extend_rows(self.rows.iter().cloned());
        if let Some(size) = self.batch_size {
            seed.batch_size(size);
        }
        if !self.environments.is_empty() {
            seed.only_in(self.environments.iter().cloned());
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableSpec {
    name: String,
    label: Option<String>,
    charset: Option<String>,
    collation: Option<String>,
    #[serde(default)]
    drop: bool,
    #[serde(default, rename = "column")]
    columns: Vec<ColumnSpec>,
    #[serde(default, rename = "index")]
    indexes: Vec<IndexSpec>,
    #[serde(default, rename = "foreign_key")]
    foreign_keys: Vec<ForeignKeySpec>,
    #[serde(default, rename = "seed")]
    seeds: Vec<SeedSpec>,
    #[serde(default)]
    drop_columns: Vec<String>,
    #[serde(default)]
    drop_indexes: Vec<String>,
    #[serde(default)]
    drop_foreign_keys: Vec<Vec<String>>,
}

impl TableSpec {
    fn fill(&self, t: &mut TableBlueprint) {
        if let Some(label) = &self.label {
            t.label(label.clone());
        }
        if let Some(charset) = &self.charset {
            t.charset(charset.clone());
        }
        if let Some(collation) = &self.collation {
            t.collation(collation.clone());
        }
        if self.drop {
            t.drop_table();
        }
        for spec in &self.columns {
            let c = t.column(spec.name.clone(), spec.column_type);
            if let Some(length) = spec.length {
                c.length(length);
            }
            if let Some(scale) = spec.scale {
                c.scale(scale);
            }
            if spec.unsigned {
                c.unsigned();
            }
            if spec.nullable {
                c.nullable();
            }
            if spec.auto_increment {
                c.auto_increment();
            }
            if spec.primary {
                c.primary();
            }
            if let Some(value) = &spec.default {
                c.default(value.clone());
            }
            if spec.default_current_timestamp {
                c.default_current_timestamp();
            }
            if let Some(charset) = &spec.charset {
                c.charset(charset.clone());
            }
            if let Some(collation) = &spec.collation {
                c.collation(collation.clone());
            }
        }
        for spec in &self.indexes {
            t.index(spec.name.clone(), spec.kind, spec.columns.iter().cloned());
        }
        for spec in &self.foreign_keys {
            let fk = t.foreign(spec.columns.iter().cloned());
            fk.references(spec.references.iter().cloned())
                .at_table(spec.at_table.clone())
                .on_update(spec.on_update)
                .on_delete(spec.on_delete);
            if let Some(name) = &spec.name {
                fk.named(name.clone());
            }
        }
        for spec in &self.seeds {
            spec.fill(t.seed());
        }
        for name in &self.drop_columns {
            t.drop_column(name.clone());
        }
        for name in &self.drop_indexes {
            t.drop_index(name.clone());
        }
        for columns in &self.drop_foreign_keys {
            t.drop_foreign(columns.iter().cloned());
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamSpec {
    name: String,
    #[serde(rename = "type")]
    sql_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcedureSpec {
    name: String,
    #[serde(default)]
    drop: bool,
    #[serde(default)]
    args: Vec<ParamSpec>,
    output: Option<ParamSpec>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpec {
    up: String,
    #[serde(default)]
    down: String,
}

/// A migration or seed declared in a TOML file.
///
/// ```toml
/// pre_sql = "SET FOREIGN_KEY_CHECKS = 0"
///
/// [[table]]
/// name = "users"
///
/// [[table.column]]
/// name = "id"
/// type = "bigint"
/// unsigned = true
/// auto_increment = true
/// primary = true
///
/// [[table.index]]
/// name = "uq_users_email"
/// kind = "unique"
/// columns = ["email"]
/// ```
///
/// Steps run in this order: tables, procedures, seeds, raw SQL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMigration {
    database: Option<String>,
    pre_sql: Option<String>,
    post_sql: Option<String>,
    #[serde(default, rename = "table")]
    tables: Vec<TableSpec>,
    #[serde(default, rename = "procedure")]
    procedures: Vec<ProcedureSpec>,
    #[serde(default, rename = "seed")]
    seeds: Vec<SeedSpec>,
    #[serde(default)]
    raw: Vec<RawSpec>,
}

impl FileMigration {
    /// Parses TOML text; `path` is only used in error messages.
    pub fn parse(path: &str, source: &str) -> MigrationResult<Self> {
        toml::from_str(source).map_err(|e| MigrationError::Parse {
            path: path.to_owned(),
            message: e.to_string(),
        })
    }
}

impl Migration for FileMigration {
    fn apply(&self, m: &mut MigrationBuilder) -> MigrationResult<()> {
        if let Some(database) = &self.database {
            m.database(database.clone());
        }
        if let Some(sql) = &self.pre_sql {
            m.pre_sql(sql.clone());
        }
        if let Some(sql) = &self.post_sql {
            m.post_sql(sql.clone());
        }
        for spec in &self.tables {
            m.table(spec.name.clone(), |t| spec.fill(t));
        }
        for spec in &self.procedures {
            if spec.drop {
                m.drop_procedure(spec.name.clone());
                continue;
            }
            m.procedure(spec.name.clone(), |p| {
                for arg in &spec.args {
                    p.arg(arg.name.clone(), arg.sql_type.clone());
                }
                if let Some(out) = &spec.output {
                    p.output(out.name.clone(), out.sql_type.clone());
                }
                p.body(spec.body.clone());
            });
        }
        for spec in &self.seeds {
            let Some(table) = &spec.table else {
                return Err(MigrationError::Message(
                    "a top-level [[seed]] needs a `table`".to_owned(),
                ));
            };
            m.seed(table.clone(), |s| spec.fill(s));
        }
        for spec in &self.raw {
            m.raw(spec.up.clone(), spec.down.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"
pre_sql = "SET FOREIGN_KEY_CHECKS = 0"
post_sql = "SET FOREIGN_KEY_CHECKS = 1"

[[table]]
name = "users"
drop_columns = ["legacy"]

[[table.column]]
name = "id"
type = "bigint"
unsigned = true
auto_increment = true
primary = true

[[table.column]]
name = "email"
type = "string"
length = 191

[[table.column]]
name = "active"
type = "boolean"
default = true

[[table.index]]
name = "uq_users_email"
kind = "unique"
columns = ["email"]

[[table.seed]]
environments = ["dev"]
rows = [{ id = 1, email = "admin@example.com", active = true }]

[[procedure]]
name = "purge_inactive"
body = "DELETE FROM users WHERE active = 0;"

[[raw]]
up = "UPDATE users SET active = 1"
down = "UPDATE users SET active = 0"
"#;

    #[test]
    fn file_migration_fills_builder_in_order() {
        let file = FileMigration::parse("users.toml", USERS).unwrap();
        let mut builder = MigrationBuilder::new();
        file.apply(&mut builder).unwrap();

        assert!(builder.validate().is_empty());
        assert_eq!(builder.pre_sql_fragment(), Some("SET FOREIGN_KEY_CHECKS = 0"));
        let kinds: Vec<&str> = builder
            .steps()
            .iter()
            .map(|s| match s {
                Step::Blueprint(Blueprint::Table(_)) => "table",
                Step::Blueprint(Blueprint::Procedure(_)) => "procedure",
                Step::Raw(_) => "raw",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["table", "procedure", "raw"]);

        let Step::Blueprint(Blueprint::Table(users)) = &builder.steps()[0] else {
            panic!("expected a table step");
        };
        assert_eq!(users.columns().len(), 4);
        assert_eq!(users.seeds().len(), 1);
        assert!(users.columns()[3].is_dropped());
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = FileMigration::parse("bad.toml", "[[table]]\nname = \"t\"\ncolour = 1\n").unwrap_err();
        assert!(matches!(err, MigrationError::Parse { ref path, .. } if path == "bad.toml"));
    }

    #[test]
    fn closures_are_migrations() {
        let migration = |m: &mut MigrationBuilder| -> MigrationResult<()> {
            m.table("posts", |t| {
                t.id("id");
                t.text("body").nullable();
            })
            .raw("SELECT 1", "");
            Ok(())
        };
        let mut builder = MigrationBuilder::new();
        migration.apply(&mut builder).unwrap();
        assert_eq!(builder.steps().len(), 2);
    }
}
