use std::collections::HashSet;

use crate::dialect::Dialect;
use crate::error::{BlueprintKind, MigrationError, MigrationResult, ValidationError};
use crate::schema::{
    ColumnDefinition, ColumnType, ForeignKeyDefinition, IndexDefinition, IndexKind, TableMetadata,
};
use crate::sql::SqlStatementBuilder;

use super::{
    ColumnBlueprint, DiffContext, ForeignKeyBlueprint, IndexBlueprint, SeedBlueprint, SqlPair,
};

/// Desired state of a table: columns, indexes, foreign keys and seed data.
///
/// ```ignore
/// let users = TableBlueprint::define("users", |t| {
///     t.id("id");
///     t.string("email", 191);
///     t.index("uq_users_email", IndexKind::Unique, ["email"]);
/// })?;
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableBlueprint {
    name: String,
    label: Option<String>,
    charset: Option<String>,
    collation: Option<String>,
    drop: bool,
    columns: Vec<ColumnBlueprint>,
    indexes: Vec<IndexBlueprint>,
    foreign_keys: Vec<ForeignKeyBlueprint>,
    seeds: Vec<SeedBlueprint>,
}

impl TableBlueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds a blueprint with `f` and validates it.
    pub fn define<F>(name: impl Into<String>, f: F) -> MigrationResult<Self>
    where
        F: FnOnce(&mut TableBlueprint),
    {
        let mut table = Self::new(name);
        f(&mut table);
        let errors = table.validate();
        if errors.is_empty() {
            Ok(table)
        } else {
            Err(MigrationError::Validation(errors))
        }
    }

    pub(super) fn from_column(column: ColumnBlueprint) -> Self {
        let mut table = Self::new(column.table());
        table.columns.push(column);
        table
    }

    pub(super) fn from_index(index: IndexBlueprint) -> Self {
        let mut table = Self::new(index.table());
        table.indexes.push(index);
        table
    }

    pub(super) fn from_foreign_key(fk: ForeignKeyBlueprint) -> Self {
        let mut table = Self::new(fk.table());
        table.foreign_keys.push(fk);
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn collation(&mut self, collation: impl Into<String>) -> &mut Self {
        self.collation = Some(collation.into());
        self
    }

    /// Marks the whole table for removal.
    pub fn drop_table(&mut self) -> &mut Self {
        self.drop = true;
        self
    }

    pub fn is_dropped(&self) -> bool {
        self.drop
    }

    pub fn columns(&self) -> &[ColumnBlueprint] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexBlueprint] {
        &self.indexes
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyBlueprint] {
        &self.foreign_keys
    }

    pub fn seeds(&self) -> &[SeedBlueprint] {
        &self.seeds
    }

    fn push_column(&mut self, column: ColumnBlueprint) -> &mut ColumnBlueprint {
        self.columns.push(column);
        let last = self.columns.len() - 1;
        &mut self.columns[last]
    }

    pub fn column(&mut self, name: impl Into<String>, column_type: ColumnType) -> &mut ColumnBlueprint {
        let column = ColumnBlueprint::new(self.name.clone(), name, column_type);
        self.push_column(column)
    }

    /// Unsigned auto-increment BIGINT primary key.
    pub fn id(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        let column = self.column(name, ColumnType::Bigint);
        column.unsigned().auto_increment().primary();
        column
    }

    pub fn string(&mut self, name: impl Into<String>, length: u32) -> &mut ColumnBlueprint {
        let column = self.column(name, ColumnType::String);
        column.length(length);
        column
    }

    pub fn text(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Text)
    }

    pub fn int(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Int)
    }

    pub fn bigint(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Bigint)
    }

    pub fn decimal(&mut self, name: impl Into<String>, precision: u32, scale: u32) -> &mut ColumnBlueprint {
        let column = self.column(name, ColumnType::Decimal);
        column.length(precision).scale(scale);
        column
    }

    pub fn float(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Float)
    }

    pub fn date(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Date)
    }

    pub fn datetime(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Datetime)
    }

    pub fn time(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Time)
    }

    pub fn timestamp(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Timestamp)
    }

    pub fn boolean(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Bool)
    }

    pub fn blob(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Blob)
    }

    pub fn json(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Json)
    }

    pub fn uuid(&mut self, name: impl Into<String>) -> &mut ColumnBlueprint {
        self.column(name, ColumnType::Uuid)
    }

    pub fn drop_column(&mut self, name: impl Into<String>) -> &mut Self {
        self.columns.push(ColumnBlueprint::dropped(self.name.clone(), name));
        self
    }

    pub fn index<I, S>(&mut self, name: impl Into<String>, kind: IndexKind, columns: I) -> &mut IndexBlueprint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .push(IndexBlueprint::new(self.name.clone(), name, kind, columns));
        let last = self.indexes.len() - 1;
        &mut self.indexes[last]
    }

    pub fn primary_key<I, S>(&mut self, columns: I) -> &mut IndexBlueprint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index(IndexDefinition::PRIMARY, IndexKind::Primary, columns)
    }

    pub fn drop_index(&mut self, name: impl Into<String>) -> &mut Self {
        self.indexes.push(IndexBlueprint::dropped(self.name.clone(), name));
        self
    }

    pub fn foreign<I, S>(&mut self, columns: I) -> &mut ForeignKeyBlueprint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_keys
            .push(ForeignKeyBlueprint::new(self.name.clone(), columns));
        let last = self.foreign_keys.len() - 1;
        &mut self.foreign_keys[last]
    }

    /// Drops the foreign key declared over `columns`, whatever its name.
    pub fn drop_foreign<I, S>(&mut self, columns: I) -> &mut ForeignKeyBlueprint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_keys
            .push(ForeignKeyBlueprint::dropped(self.name.clone(), columns));
        let last = self.foreign_keys.len() - 1;
        &mut self.foreign_keys[last]
    }

    pub fn seed(&mut self) -> &mut SeedBlueprint {
        self.seeds.push(SeedBlueprint::new(self.name.clone()));
        let last = self.seeds.len() - 1;
        &mut self.seeds[last]
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut fail = |message: String| {
            errors.push(ValidationError::new(BlueprintKind::Table, &self.name, message));
        };

        if self.name.trim().is_empty() {
            fail("table name must not be empty".to_owned());
        }
        if self.drop
            && !(self.columns.is_empty()
                && self.indexes.is_empty()
                && self.foreign_keys.is_empty()
                && self.seeds.is_empty())
        {
            fail("a dropped table cannot declare other elements".to_owned());
        }

        let mut names = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name()) {
                fail(format!("column '{}' is declared more than once", column.name()));
            }
        }
        let mut names = HashSet::new();
        for index in &self.indexes {
            if !names.insert(index.name()) {
                fail(format!("index '{}' is declared more than once", index.name()));
            }
        }

        let explicit_primaries = self
            .indexes
            .iter()
            .filter(|i| !i.is_dropped() && i.definition().kind == IndexKind::Primary)
            .count();
        let column_primary = self.columns.iter().any(|c| c.is_primary() && !c.is_dropped());
        if explicit_primaries + usize::from(column_primary) > 1 {
            fail("a table can only have one primary key".to_owned());
        }

        let mut local_sets = HashSet::new();
        let mut fk_names = HashSet::new();
        for fk in &self.foreign_keys {
            let def = fk.definition();
            if !local_sets.insert(def.columns.clone()) {
                fail(format!(
                    "more than one foreign key over ({})",
                    def.columns.join(", ")
                ));
            }
            if !fk_names.insert(def.name.as_str()) {
                fail(format!("foreign key '{}' is declared more than once", def.name));
            }
            if fk.is_dropped() || !fk.sets_null() {
                continue;
            }
            for local in &def.columns {
                let declared = self.columns.iter().find(|c| c.name() == local && !c.is_dropped());
                if declared.is_some_and(|c| !c.definition().nullable) {
                    fail(format!(
                        "foreign key '{}' uses SET NULL but column '{}' is not nullable",
                        def.name, local
                    ));
                }
            }
        }

        errors.extend(self.columns.iter().flat_map(ColumnBlueprint::validate));
        errors.extend(self.indexes.iter().flat_map(IndexBlueprint::validate));
        errors.extend(self.foreign_keys.iter().flat_map(ForeignKeyBlueprint::validate));
        errors.extend(self.seeds.iter().flat_map(SeedBlueprint::validate));
        errors
    }

    fn desired_columns(&self) -> impl Iterator<Item = &ColumnBlueprint> {
        self.columns.iter().filter(|c| !c.is_dropped())
    }

    /// The primary key implied by column `primary` flags, followed by explicit indexes.
    fn desired_indexes(&self) -> Vec<IndexDefinition> {
        let primary_columns: Vec<String> = self
            .desired_columns()
            .filter(|c| c.is_primary())
            .map(|c| c.name().to_owned())
            .collect();
        let mut indexes = Vec::new();
        if !primary_columns.is_empty() {
            indexes.push(IndexDefinition::new(
                IndexDefinition::PRIMARY,
                IndexKind::Primary,
                primary_columns,
            ));
        }
        indexes.extend(
            self.indexes
                .iter()
                .filter(|i| !i.is_dropped())
                .map(|i| i.definition().clone()),
        );
        indexes
    }

    fn has_structure(&self) -> bool {
        self.drop
            || !self.columns.is_empty()
            || !self.indexes.is_empty()
            || !self.foreign_keys.is_empty()
    }

    /// Diffs the blueprint against `current` (None when the table does not exist).
    pub fn obtain_sql(&self, current: Option<&TableMetadata>, ctx: &DiffContext) -> MigrationResult<SqlPair> {
        let mut pair = match (self.has_structure(), self.drop, current) {
            (false, _, _) => SqlPair::default(),
            (true, true, None) => {
                tracing::warn!(
                    operation = "blueprint_diff",
                    table = %self.name,
                    "table marked for drop does not exist"
                );
                return Ok(SqlPair::default());
            }
            (true, true, Some(current)) => self.drop_sql(current, ctx.dialect)?,
            (true, false, None) => self.create_sql(ctx.dialect)?,
            (true, false, Some(current)) => self.alter_sql(current, ctx.dialect)?,
        };

        for seed in &self.seeds {
            if seed.allowed_in(&ctx.environment) {
                pair.append(seed.obtain_sql(ctx)?);
            } else {
                tracing::info!(
                    operation = "seed_skip",
                    table = %self.name,
                    environment = %ctx.environment,
                    "seed not allowed in this environment"
                );
            }
        }
        Ok(pair)
    }

    fn create_sql(&self, dialect: Dialect) -> MigrationResult<SqlPair> {
        let mut up = DdlPlan::new(&self.name);
        let mut down = DdlPlan::new(&self.name);

        let columns: Vec<ColumnDefinition> =
            self.desired_columns().map(|c| c.definition().clone()).collect();
        up.set_auto_increment = columns.iter().filter(|c| c.auto_increment).cloned().collect();
        up.create_table = Some(NewTable {
            columns,
            charset: self.charset.clone(),
            collation: self.collation.clone(),
        });
        up.add_indexes = self.desired_indexes();
        for fk in self.foreign_keys.iter().filter(|f| !f.is_dropped()) {
            up.add_foreign_keys.push((self.name.clone(), fk.definition().clone()));
            down.drop_foreign_keys.push((self.name.clone(), fk.name().to_owned()));
        }
        down.drop_table = true;

        Ok(SqlPair::new(up.render(dialect)?, down.render(dialect)?))
    }

    fn drop_sql(&self, current: &TableMetadata, dialect: Dialect) -> MigrationResult<SqlPair> {
        let mut up = DdlPlan::new(&self.name);
        let mut down = DdlPlan::new(&self.name);

        for reference in &current.referenced_by {
            up.drop_foreign_keys
                .push((reference.table.clone(), reference.foreign_key.name.clone()));
        }
        for fk in &current.foreign_keys {
            up.drop_foreign_keys.push((self.name.clone(), fk.name.clone()));
            down.add_foreign_keys.push((self.name.clone(), fk.clone()));
        }
        for reference in &current.referenced_by {
            down.add_foreign_keys
                .push((reference.table.clone(), reference.foreign_key.clone()));
        }

        let auto_increment: Vec<ColumnDefinition> = current
            .columns
            .iter()
            .filter(|c| c.auto_increment)
            .cloned()
            .collect();
        up.strip_auto_increment = auto_increment.clone();
        down.set_auto_increment = auto_increment;
        up.drop_indexes = current.indexes.clone();
        down.add_indexes = current.indexes.clone();
        up.drop_table = true;
        down.create_table = Some(NewTable {
            columns: current.columns.clone(),
            charset: current.charset.clone(),
            collation: current.collation.clone(),
        });

        Ok(SqlPair::new(up.render(dialect)?, down.render(dialect)?))
    }

    fn alter_sql(&self, current: &TableMetadata, dialect: Dialect) -> MigrationResult<SqlPair> {
        let mut up = DdlPlan::new(&self.name);
        let mut down = DdlPlan::new(&self.name);

        // Columns of indexes that go away; AUTO_INCREMENT has to be lifted before them.
        let mut touched: HashSet<String> = HashSet::new();

        for index in &self.indexes {
            if !index.is_dropped() {
                continue;
            }
            match current.index(index.name()) {
                Some(existing) => {
                    touched.extend(existing.columns.iter().cloned());
                    up.drop_indexes.push(existing.clone());
                    down.add_indexes.push(existing.clone());
                }
                None => tracing::warn!(
                    operation = "blueprint_diff",
                    table = %self.name,
                    index = %index.name(),
                    "index marked for drop does not exist"
                ),
            }
        }
        for desired in self.desired_indexes() {
            match current.index(&desired.name) {
                None => {
                    down.drop_indexes.push(desired.clone());
                    up.add_indexes.push(desired);
                }
                Some(existing) if existing.kind != desired.kind || existing.columns != desired.columns => {
                    touched.extend(existing.columns.iter().cloned());
                    up.drop_indexes.push(existing.clone());
                    down.drop_indexes.push(desired.clone());
                    up.add_indexes.push(desired);
                    down.add_indexes.push(existing.clone());
                }
                Some(_) => {}
            }
        }

        for fk in &self.foreign_keys {
            let def = fk.definition();
            let existing = current.foreign_key(&def.name, &def.columns);
            match (fk.is_dropped(), existing) {
                (true, Some(existing)) => {
                    up.drop_foreign_keys.push((self.name.clone(), existing.name.clone()));
                    down.add_foreign_keys.push((self.name.clone(), existing.clone()));
                }
                (true, None) => tracing::warn!(
                    operation = "blueprint_diff",
                    table = %self.name,
                    foreign_key = %def.name,
                    "foreign key marked for drop does not exist"
                ),
                (false, None) => {
                    up.add_foreign_keys.push((self.name.clone(), def.clone()));
                    down.drop_foreign_keys.push((self.name.clone(), def.name.clone()));
                }
                (false, Some(existing)) if !def.same_as(existing) => {
                    up.drop_foreign_keys.push((self.name.clone(), existing.name.clone()));
                    up.add_foreign_keys.push((self.name.clone(), def.clone()));
                    down.drop_foreign_keys.push((self.name.clone(), def.name.clone()));
                    down.add_foreign_keys.push((self.name.clone(), existing.clone()));
                }
                (false, Some(_)) => {}
            }
        }

        for column in &self.columns {
            let desired = column.definition();
            let existing = current.column(&desired.name);

            if column.is_dropped() {
                let Some(existing) = existing else {
                    tracing::warn!(
                        operation = "blueprint_diff",
                        table = %self.name,
                        column = %desired.name,
                        "column marked for drop does not exist"
                    );
                    continue;
                };
                if existing.auto_increment {
                    up.strip_auto_increment.push(existing.clone());
                    down.set_auto_increment.push(existing.clone());
                }
                up.drop_columns.push(existing.name.clone());
                down.add_columns.push(existing.clone());
                continue;
            }

            let Some(existing) = existing else {
                up.add_columns.push(desired.clone());
                down.drop_columns.push(desired.name.clone());
                if desired.auto_increment {
                    up.set_auto_increment.push(desired.clone());
                    down.strip_auto_increment.push(desired.clone());
                }
                continue;
            };

            let needs_change = column_differs(dialect, desired, existing);
            let strip = existing.auto_increment
                && (needs_change || !desired.auto_increment || touched.contains(&desired.name));
            let set = desired.auto_increment && (!existing.auto_increment || strip);

            if strip {
                up.strip_auto_increment.push(existing.clone());
                down.set_auto_increment.push(existing.clone());
            }
            if needs_change {
                up.change_columns.push(desired.clone());
                down.change_columns.push(existing.clone());
            }
            if set {
                up.set_auto_increment.push(desired.clone());
                down.strip_auto_increment.push(desired.clone());
            }
        }

        Ok(SqlPair::new(up.render(dialect)?, down.render(dialect)?))
    }
}

#[derive(Debug, Clone)]
struct NewTable {
    columns: Vec<ColumnDefinition>,
    charset: Option<String>,
    collation: Option<String>,
}

/// DDL grouped by phase. Rendering always walks the phases in declaration
/// order, so constraints are released before the objects they depend on and
/// restored after them.
#[derive(Debug, Clone, Default)]
struct DdlPlan {
    table: String,
    drop_foreign_keys: Vec<(String, String)>,
    strip_auto_increment: Vec<ColumnDefinition>,
    drop_indexes: Vec<IndexDefinition>,
    drop_columns: Vec<String>,
    drop_table: bool,
    create_table: Option<NewTable>,
    add_columns: Vec<ColumnDefinition>,
    change_columns: Vec<ColumnDefinition>,
    add_indexes: Vec<IndexDefinition>,
    set_auto_increment: Vec<ColumnDefinition>,
    add_foreign_keys: Vec<(String, ForeignKeyDefinition)>,
}

impl DdlPlan {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            ..Self::default()
        }
    }

    fn render(&self, dialect: Dialect) -> MigrationResult<String> {
        match dialect {
            Dialect::MySql => Ok(self.render_mysql()),
            Dialect::Sqlite => self.render_sqlite(),
        }
    }

    fn render_mysql(&self) -> String {
        let table = self.table.as_str();
        let mut sql = SqlStatementBuilder::new(Dialect::MySql);

        for (owner, name) in &self.drop_foreign_keys {
            sql.drop_constraint(owner, name);
        }
        for column in &self.strip_auto_increment {
            sql.column_auto_increment(table, column, false);
        }
        for index in &self.drop_indexes {
            sql.drop_index(table, index);
        }
        for column in &self.drop_columns {
            sql.drop_column(table, column);
        }
        if self.drop_table {
            sql.drop_table(table);
        }
        if let Some(new) = &self.create_table {
            sql.create_table(table, &new.columns, new.charset.as_deref(), new.collation.as_deref());
        }
        for column in &self.add_columns {
            sql.add_column(table, column);
        }
        for column in &self.change_columns {
            sql.change_column(table, column);
        }
        for index in &self.add_indexes {
            sql.add_key(table, index);
        }
        for column in &self.set_auto_increment {
            sql.column_auto_increment(table, column, true);
        }
        for (owner, fk) in &self.add_foreign_keys {
            sql.add_constraint(owner, fk);
        }

        sql.output(true).sql
    }

    /// SQLite keeps the primary key, AUTOINCREMENT and foreign keys in the
    /// table definition. They are written by CREATE TABLE and released by
    /// DROP TABLE; an ALTER that would need to touch them is rejected.
    fn render_sqlite(&self) -> MigrationResult<String> {
        let table = self.table.as_str();
        let mut sql = SqlStatementBuilder::new(Dialect::Sqlite);

        if self.drop_table {
            sql.drop_table(table);
            return Ok(sql.output(true).sql);
        }

        if let Some(new) = &self.create_table {
            let primary = self.add_indexes.iter().find(|i| i.kind == IndexKind::Primary);
            if let Some(column) = new.columns.iter().find(|c| {
                c.auto_increment
                    && !(c.column_type.is_integer()
                        && primary.is_some_and(|p| p.columns == [c.name.as_str()]))
            }) {
                return Err(self.unsupported(vec![format!(
                    "auto-increment column '{}' must be the only primary key column on SQLite",
                    column.name
                )]));
            }
            let foreign_keys: Vec<ForeignKeyDefinition> = self
                .add_foreign_keys
                .iter()
                .filter(|(owner, _)| owner == table)
                .map(|(_, fk)| fk.clone())
                .collect();
            sql.create_table_with_keys(table, &new.columns, primary, &foreign_keys);
            for index in self.add_indexes.iter().filter(|i| i.kind != IndexKind::Primary) {
                sql.add_key(table, index);
            }
            return Ok(sql.output(true).sql);
        }

        let mut problems: Vec<String> = Vec::new();
        let mut reject = |message: String| {
            if !problems.contains(&message) {
                problems.push(message);
            }
        };
        for (_, name) in &self.drop_foreign_keys {
            reject(format!("cannot drop foreign key '{}' from an existing SQLite table", name));
        }
        for (_, fk) in &self.add_foreign_keys {
            reject(format!("cannot add foreign key '{}' to an existing SQLite table", fk.name));
        }
        for column in self.strip_auto_increment.iter().chain(&self.set_auto_increment) {
            reject(format!("cannot change AUTOINCREMENT of column '{}' on SQLite", column.name));
        }
        for column in &self.change_columns {
            reject(format!("cannot change column '{}' in place on SQLite", column.name));
        }
        if self
            .drop_indexes
            .iter()
            .chain(&self.add_indexes)
            .any(|i| i.kind == IndexKind::Primary)
        {
            reject("cannot change the primary key of an existing SQLite table".to_owned());
        }
        for column in &self.add_columns {
            if !column.nullable && column.default.is_none() {
                reject(format!(
                    "cannot add NOT NULL column '{}' without a default on SQLite",
                    column.name
                ));
            }
        }
        if !problems.is_empty() {
            return Err(self.unsupported(problems));
        }

        for index in &self.drop_indexes {
            sql.drop_index(table, index);
        }
        for column in &self.drop_columns {
            sql.drop_column(table, column);
        }
        for column in &self.add_columns {
            sql.add_column(table, column);
        }
        for index in &self.add_indexes {
            sql.add_key(table, index);
        }
        Ok(sql.output(true).sql)
    }

    fn unsupported(&self, problems: Vec<String>) -> MigrationError {
        MigrationError::Validation(
            problems
                .into_iter()
                .map(|message| ValidationError::new(BlueprintKind::Table, &self.table, message))
                .collect(),
        )
    }
}

/// SQLite has one integer storage class and no per-column charsets, so
/// those differences are not changes there.
fn column_differs(dialect: Dialect, desired: &ColumnDefinition, existing: &ColumnDefinition) -> bool {
    match dialect {
        Dialect::MySql => desired.differs_from(existing),
        Dialect::Sqlite => sqlite_affinity(desired).differs_from(&sqlite_affinity(existing)),
    }
}

fn sqlite_affinity(column: &ColumnDefinition) -> ColumnDefinition {
    let mut column = column.clone();
    if column.column_type.is_integer() {
        column.column_type = ColumnType::Bigint;
        column.unsigned = false;
    }
    column.charset = None;
    column.collation = None;
    column
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKeyReference, ReferentialAction};
    use crate::value::{Row, Value};

    fn ctx() -> DiffContext {
        DiffContext::new(Dialect::MySql, "dev")
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("`{needle}` not found in:\n{haystack}"))
    }

    fn users_table() -> TableMetadata {
        let mut id = ColumnDefinition::new("id", ColumnType::Int);
        id.auto_increment = true;
        let mut users = TableMetadata::new("users");
        users.columns = vec![id, ColumnDefinition::new("name", ColumnType::String)];
        users.indexes = vec![IndexDefinition::new(
            IndexDefinition::PRIMARY,
            IndexKind::Primary,
            vec!["id".to_owned()],
        )];
        users
    }

    #[test]
    fn create_table_orders_table_index_then_auto_increment() {
        let table = TableBlueprint::define("users", |t| {
            t.id("id");
            t.string("name", 255);
            t.index("idx_users_name", IndexKind::Index, ["name"]);
        })
        .unwrap();

        let pair = table.obtain_sql(None, &ctx()).unwrap();
        let create = position(&pair.up, "CREATE TABLE `users`");
        let primary = position(&pair.up, "ADD PRIMARY KEY (`id`)");
        let index = position(&pair.up, "ADD INDEX `idx_users_name` (`name`)");
        let auto = position(&pair.up, "AUTO_INCREMENT");
        assert!(create < primary && primary < index && index < auto);
        assert!(pair.up.contains("`name` VARCHAR(255) NOT NULL"));
        assert_eq!(pair.down, "DROP TABLE `users`;");
    }

    #[test]
    fn dropped_column_is_restored_with_its_previous_definition() {
        let mut qty = ColumnDefinition::new("qty", ColumnType::Int);
        qty.unsigned = true;
        qty.nullable = true;
        let mut current = TableMetadata::new("t");
        current.columns = vec![ColumnDefinition::new("name", ColumnType::Text), qty];

        let mut table = TableBlueprint::new("t");
        table.drop_column("qty");
        let pair = table.obtain_sql(Some(&current), &ctx()).unwrap();
        assert_eq!(pair.up, "ALTER TABLE `t` DROP COLUMN `qty`;");
        assert_eq!(pair.down, "ALTER TABLE `t` ADD COLUMN `qty` INT UNSIGNED NULL;");
    }

    #[test]
    fn changed_auto_increment_column_is_stripped_changed_and_restored() {
        let table = TableBlueprint::define("users", |t| {
            t.id("id");
        })
        .unwrap();
        let pair = table.obtain_sql(Some(&users_table()), &ctx()).unwrap();

        let lines: Vec<&str> = pair.up.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ALTER TABLE `users` MODIFY COLUMN `id` INT NOT NULL;",
                "ALTER TABLE `users` MODIFY COLUMN `id` BIGINT UNSIGNED NOT NULL;",
                "ALTER TABLE `users` MODIFY COLUMN `id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT;",
            ]
        );
        let down: Vec<&str> = pair.down.lines().collect();
        assert_eq!(
            down,
            vec![
                "ALTER TABLE `users` MODIFY COLUMN `id` BIGINT UNSIGNED NOT NULL;",
                "ALTER TABLE `users` MODIFY COLUMN `id` INT NOT NULL;",
                "ALTER TABLE `users` MODIFY COLUMN `id` INT NOT NULL AUTO_INCREMENT;",
            ]
        );
    }

    #[test]
    fn unchanged_column_produces_no_sql() {
        let mut table = TableBlueprint::new("users");
        table.string("name", 255);
        let pair = table.obtain_sql(Some(&users_table()), &ctx()).unwrap();
        assert!(pair.is_empty());
    }

    #[test]
    fn drop_table_releases_inbound_foreign_keys_first() {
        let mut users = users_table();
        users.referenced_by.push(ForeignKeyReference {
            table: "posts".to_owned(),
            foreign_key: ForeignKeyDefinition {
                name: "fk_posts_user_id".to_owned(),
                columns: vec!["user_id".to_owned()],
                referenced_table: "users".to_owned(),
                referenced_columns: vec!["id".to_owned()],
                on_update: ReferentialAction::Restrict,
                on_delete: ReferentialAction::Cascade,
            },
        });
        let mut table = TableBlueprint::new("users");
        table.drop_table();

        let pair = table.obtain_sql(Some(&users), &ctx()).unwrap();
        let fk = position(&pair.up, "ALTER TABLE `posts` DROP FOREIGN KEY `fk_posts_user_id`");
        let strip = position(&pair.up, "MODIFY COLUMN `id` INT NOT NULL");
        let primary = position(&pair.up, "DROP PRIMARY KEY");
        let drop = position(&pair.up, "DROP TABLE `users`");
        assert!(fk < strip && strip < primary && primary < drop);

        let create = position(&pair.down, "CREATE TABLE `users`");
        let restore = position(&pair.down, "ADD CONSTRAINT `fk_posts_user_id`");
        assert!(create < restore);
    }

    #[test]
    fn dropping_missing_table_is_a_no_op() {
        let mut table = TableBlueprint::new("ghosts");
        table.drop_table();
        assert!(table.obtain_sql(None, &ctx()).unwrap().is_empty());
    }

    #[test]
    fn equivalent_foreign_key_is_left_alone() {
        let mut posts = TableMetadata::new("posts");
        posts.columns = vec![ColumnDefinition::new("user_id", ColumnType::Bigint)];
        posts.foreign_keys.push(ForeignKeyDefinition {
            name: "posts_user_fk".to_owned(),
            columns: vec!["user_id".to_owned()],
            referenced_table: "users".to_owned(),
            referenced_columns: vec!["id".to_owned()],
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::Restrict,
        });

        let mut table = TableBlueprint::new("posts");
        table.foreign(["user_id"]).references(["id"]).at_table("users");
        assert!(table.obtain_sql(Some(&posts), &ctx()).unwrap().is_empty());

        let mut cascade = TableBlueprint::new("posts");
        cascade
            .foreign(["user_id"])
            .references(["id"])
            .at_table("users")
            .on_delete(ReferentialAction::Cascade);
        let pair = cascade.obtain_sql(Some(&posts), &ctx()).unwrap();
        let drop = position(&pair.up, "DROP FOREIGN KEY `posts_user_fk`");
        let add = position(&pair.up, "ADD CONSTRAINT `fk_posts_user_id`");
        assert!(drop < add);
    }

    #[test]
    fn rejects_second_primary_key() {
        let err = TableBlueprint::define("t", |t| {
            t.id("id");
            t.primary_key(["code"]);
        })
        .unwrap_err();
        assert!(err.to_string().contains("one primary key"));
    }

    #[test]
    fn rejects_set_null_on_required_column() {
        let result = TableBlueprint::define("posts", |t| {
            t.bigint("user_id");
            t.foreign(["user_id"])
                .references(["id"])
                .at_table("users")
                .on_delete(ReferentialAction::SetNull);
        });
        assert!(matches!(result, Err(MigrationError::Validation(ref e)) if e.len() == 1));
    }

    #[test]
    fn seeds_follow_structure_and_respect_environment() {
        let mut table = TableBlueprint::new("roles");
        table.id("id");
        table
            .seed()
            .row(Row::from([("id".to_owned(), Value::Int(1))]));
        table
            .seed()
            .row(Row::from([("id".to_owned(), Value::Int(2))]))
            .only_in(["production"]);

        let pair = table.obtain_sql(None, &ctx()).unwrap();
        assert!(position(&pair.up, "CREATE TABLE") < position(&pair.up, "INSERT INTO `roles`"));
        assert_eq!(pair.up.matches("INSERT INTO").count(), 1);
        assert!(pair.down.starts_with("DELETE FROM `roles` WHERE `id` = 1;"));
        assert!(pair.down.ends_with("DROP TABLE `roles`;"));
    }

    fn sqlite() -> DiffContext {
        DiffContext::new(Dialect::Sqlite, "dev")
    }

    #[test]
    fn sqlite_create_table_carries_keys_inline() {
        let table = TableBlueprint::define("posts", |t| {
            t.id("id");
            t.bigint("user_id").unsigned();
            t.index("idx_posts_user_id", IndexKind::Index, ["user_id"]);
            t.foreign(["user_id"])
                .references(["id"])
                .at_table("users")
                .on_delete(ReferentialAction::Cascade);
        })
        .unwrap();

        let pair = table.obtain_sql(None, &sqlite()).unwrap();
        assert!(!pair.up.contains("ALTER TABLE"), "{}", pair.up);
        assert!(pair.up.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        let fk = position(
            &pair.up,
            "CONSTRAINT \"fk_posts_user_id\" FOREIGN KEY (\"user_id\") REFERENCES \"users\" (\"id\") ON UPDATE RESTRICT ON DELETE CASCADE",
        );
        let index = position(&pair.up, "CREATE INDEX IF NOT EXISTS \"idx_posts_user_id\"");
        assert!(fk < index);
        assert_eq!(pair.down, "DROP TABLE \"posts\";");
    }

    #[test]
    fn sqlite_auto_increment_needs_a_single_integer_primary_key() {
        let mut table = TableBlueprint::new("t");
        table.int("seq").auto_increment();
        table.string("code", 8);
        table.primary_key(["code"]);
        let err = table.obtain_sql(None, &sqlite()).unwrap_err();
        assert!(matches!(err, MigrationError::Validation(ref e) if e.len() == 1), "{err}");
    }

    #[test]
    fn sqlite_rejects_alters_it_cannot_express() {
        let mut fk = TableBlueprint::new("users");
        fk.bigint("team_id").nullable();
        fk.foreign(["team_id"]).references(["id"]).at_table("teams");
        let err = fk.obtain_sql(Some(&users_table()), &sqlite()).unwrap_err();
        let MigrationError::Validation(errors) = err else {
            panic!("expected a validation error, got {err}");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("fk_users_team_id"));

        let mut change = TableBlueprint::new("users");
        change.string("name", 64);
        let err = change.obtain_sql(Some(&users_table()), &sqlite()).unwrap_err();
        assert!(err.to_string().contains("cannot change column 'name'"), "{err}");
    }

    #[test]
    fn sqlite_integer_affinity_is_not_a_change() {
        let mut table = TableBlueprint::new("users");
        table.id("id");
        table.string("name", 255).charset("utf8mb4");
        table.text("bio").nullable();
        let pair = table.obtain_sql(Some(&users_table()), &sqlite()).unwrap();
        assert_eq!(pair.up, "ALTER TABLE \"users\" ADD COLUMN \"bio\" TEXT NULL;");
        assert_eq!(pair.down, "ALTER TABLE \"users\" DROP COLUMN \"bio\";");
    }

    #[test]
    fn sqlite_drop_table_recreates_keys_on_the_way_down() {
        let mut table = TableBlueprint::new("users");
        table.drop_table();
        let pair = table.obtain_sql(Some(&users_table()), &sqlite()).unwrap();
        assert_eq!(pair.up, "DROP TABLE \"users\";");
        assert!(pair.down.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"), "{}", pair.down);
    }
}
