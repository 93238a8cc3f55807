use std::fmt;

use crate::dialect::Dialect;
use crate::error::{BlueprintKind, MigrationError, MigrationResult, ValidationError};
use crate::schema::{
    ColumnDefinition, ForeignKeyDefinition, IndexDefinition, IndexKind, ProcedureDefinition,
};
use crate::value::{Row, Value};

/// Immutable snapshot of a built statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlStatement {
    pub sql: String,
    pub table: Option<String>,
    /// Bound parameters, only populated in [`ValueMode::Bind`].
    pub params: Vec<Value>,
}

impl SqlStatement {
    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

impl fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// How scalars reach the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueMode {
    /// Escape every scalar into the text. Required for SQL stored in the ledger.
    #[default]
    Inline,
    /// Emit placeholders and collect the values separately.
    Bind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Like,
    NotLike,
}

impl Operator {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
        }
    }
}

/// One predicate of a WHERE clause. Conditions are joined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

impl Condition {
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            values: vec![value.into()],
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value)
    }

    pub fn like(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Like, value)
    }

    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            column: column.into(),
            operator: Operator::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            operator: Operator::NotIn,
            ..Self::in_list(column, values)
        }
    }
}

pub(crate) const GUARD_FLAG: &str = "@splitmig_exists";
const GUARD_SQL: &str = "@splitmig_sql";
pub(crate) const GUARD_STMT: &str = "splitmig_stmt";

/// Stateful builder accumulating a SQL script and its target table.
///
/// Statements are separated by `;\n`. WHERE fragments are appended to the
/// statement currently being built.
#[derive(Debug, Clone)]
pub struct SqlStatementBuilder {
    dialect: Dialect,
    mode: ValueMode,
    sql: String,
    table: Option<String>,
    params: Vec<Value>,
}

impl SqlStatementBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            mode: ValueMode::Inline,
            sql: String::new(),
            table: None,
            params: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ValueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    /// Writes raw SQL. `overwrite` replaces the accumulated text, otherwise it is appended verbatim.
    pub fn write(&mut self, sql: &str, table: Option<&str>, overwrite: bool) -> &mut Self {
        if overwrite {
            self.sql.clear();
            self.params.clear();
        }
        self.sql.push_str(sql);
        if let Some(table) = table {
            self.table = Some(table.to_owned());
        }
        self
    }

    /// Snapshots the current script. `clear` resets the builder afterwards.
    pub fn output(&mut self, clear: bool) -> SqlStatement {
        let mut sql = self.sql.trim_end().to_owned();
        if !sql.is_empty() && !sql.ends_with(';') {
            sql.push(';');
        }
        let statement = SqlStatement {
            sql,
            table: self.table.clone(),
            params: self.params.clone(),
        };
        if clear {
            self.sql.clear();
            self.table = None;
            self.params.clear();
        }
        statement
    }

    fn push_statement(&mut self, sql: &str, table: &str) -> &mut Self {
        if !self.sql.is_empty() && !self.sql.ends_with(";\n") {
            self.sql.push_str(";\n");
        }
        self.write(sql, Some(table), false)
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote_identifier(ident)
    }

    fn quote_list(&self, idents: &[String]) -> String {
        idents
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn value_sql(&mut self, value: &Value) -> String {
        match self.mode {
            ValueMode::Inline => self.dialect.literal(value),
            ValueMode::Bind => {
                self.params.push(value.clone());
                self.dialect.placeholder().to_owned()
            }
        }
    }

    /// Runs `statement` only when the catalog lookup in `exists_query` matches
    /// (`when_exists`) or does not match (`!when_exists`).
    fn guarded(&mut self, table: &str, exists_query: String, statement: String, when_exists: bool) {
        if !self.dialect.supports_guarded_ddl() {
            self.push_statement(&statement, table);
            return;
        }
        let statement = self.dialect.quote_string(&statement);
        let (then_sql, else_sql) = if when_exists {
            (statement.as_str(), "'DO 0'")
        } else {
            ("'DO 0'", statement.as_str())
        };
        let block = format!(
            "SET {flag} := ({query});\nSET {sql} := IF({flag} > 0, {then_sql}, {else_sql});\nPREPARE {stmt} FROM {sql};\nEXECUTE {stmt};\nDEALLOCATE PREPARE {stmt}",
            flag = GUARD_FLAG,
            sql = GUARD_SQL,
            stmt = GUARD_STMT,
            query = exists_query,
        );
        self.push_statement(&block, table);
    }

    fn index_exists_query(&self, table: &str, index: &str) -> String {
        format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.STATISTICS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = {} AND INDEX_NAME = {}",
            self.dialect.quote_string(table),
            self.dialect.quote_string(index)
        )
    }

    fn constraint_exists_query(&self, table: &str, name: &str) -> String {
        format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS WHERE CONSTRAINT_SCHEMA = DATABASE() AND TABLE_NAME = {} AND CONSTRAINT_NAME = {} AND CONSTRAINT_TYPE = 'FOREIGN KEY'",
            self.dialect.quote_string(table),
            self.dialect.quote_string(name)
        )
    }

    pub fn ensure_database(&mut self, name: &str) -> &mut Self {
        if let Some(sql) = self.dialect.ensure_database_sql(name) {
            self.push_statement(&sql, name);
        }
        self
    }

    /// `CREATE TABLE` with inline columns. Auto-increment is applied later by
    /// [`Self::column_auto_increment`] once the indexes exist.
    pub fn create_table(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        charset: Option<&str>,
        collation: Option<&str>,
    ) -> &mut Self {
        let cols = columns
            .iter()
            .map(|c| format!("  {}", c.to_sql(self.dialect, false)))
            .collect::<Vec<_>>()
            .join(",\n");
        let mut sql = format!("CREATE TABLE {} (\n{}\n)", self.quote(table), cols);
        if self.dialect == Dialect::MySql {
            sql.push_str(" ENGINE=InnoDB");
            if let Some(charset) = charset {
                sql.push_str(" DEFAULT CHARSET=");
                sql.push_str(charset);
            }
            if let Some(collation) = collation {
                sql.push_str(" COLLATE=");
                sql.push_str(collation);
            }
        }
        self.push_statement(&sql, table)
    }

    /// SQLite `CREATE TABLE` carrying its primary key and foreign keys, which
    /// cannot be added to an existing SQLite table. A single auto-increment
    /// primary key column becomes `INTEGER PRIMARY KEY AUTOINCREMENT`.
    pub fn create_table_with_keys(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        primary: Option<&IndexDefinition>,
        foreign_keys: &[ForeignKeyDefinition],
    ) -> &mut Self {
        let rowid = primary
            .filter(|p| p.columns.len() == 1)
            .and_then(|p| columns.iter().find(|c| c.auto_increment && c.name == p.columns[0]));
        let mut parts = columns
            .iter()
            .map(|c| match rowid {
                Some(r) if r.name == c.name => {
                    format!("  {} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(&c.name))
                }
                _ => format!("  {}", c.to_sql(self.dialect, false)),
            })
            .collect::<Vec<_>>();
        if let Some(primary) = primary.filter(|_| rowid.is_none()) {
            parts.push(format!("  PRIMARY KEY ({})", self.quote_list(&primary.columns)));
        }
        for fk in foreign_keys {
            parts.push(format!("  {}", self.foreign_key_clause(fk)));
        }
        let sql = format!("CREATE TABLE {} (\n{}\n)", self.quote(table), parts.join(",\n"));
        self.push_statement(&sql, table)
    }

    pub fn drop_table(&mut self, table: &str) -> &mut Self {
        let sql = format!("DROP TABLE {}", self.quote(table));
        self.push_statement(&sql, table)
    }

    /// Appends `ALTER TABLE <table> <clause>`.
    pub fn alter(&mut self, table: &str, clause: &str) -> &mut Self {
        let sql = format!("ALTER TABLE {} {}", self.quote(table), clause);
        self.push_statement(&sql, table)
    }

    pub fn add_column(&mut self, table: &str, column: &ColumnDefinition) -> &mut Self {
        let clause = format!("ADD COLUMN {}", column.to_sql(self.dialect, false));
        self.alter(table, &clause)
    }

    /// `MODIFY COLUMN`; SQLite has no equivalent.
    pub fn change_column(&mut self, table: &str, column: &ColumnDefinition) -> &mut Self {
        let clause = format!("MODIFY COLUMN {}", column.to_sql(self.dialect, false));
        self.alter(table, &clause)
    }

    pub fn drop_column(&mut self, table: &str, column: &str) -> &mut Self {
        let clause = format!("DROP COLUMN {}", self.quote(column));
        self.alter(table, &clause)
    }

    /// Sets or clears AUTO_INCREMENT on an existing column.
    pub fn column_auto_increment(
        &mut self,
        table: &str,
        column: &ColumnDefinition,
        enabled: bool,
    ) -> &mut Self {
        let mut def = column.clone();
        def.auto_increment = enabled;
        let clause = format!("MODIFY COLUMN {}", def.to_sql(self.dialect, true));
        self.alter(table, &clause)
    }

    /// Adds an index unless one with the same name already exists.
    pub fn add_key(&mut self, table: &str, index: &IndexDefinition) -> &mut Self {
        let columns = self.quote_list(&index.columns);
        if !self.dialect.supports_guarded_ddl() && index.kind != IndexKind::Primary {
            let unique = if index.kind == IndexKind::Unique { "UNIQUE " } else { "" };
            let sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                unique,
                self.quote(&index.name),
                self.quote(table),
                columns
            );
            return self.push_statement(&sql, table);
        }
        let clause = match index.kind {
            IndexKind::Primary => format!("ADD PRIMARY KEY ({})", columns),
            IndexKind::Unique => format!("ADD UNIQUE INDEX {} ({})", self.quote(&index.name), columns),
            IndexKind::Index => format!("ADD INDEX {} ({})", self.quote(&index.name), columns),
        };
        let statement = format!("ALTER TABLE {} {}", self.quote(table), clause);
        let exists = self.index_exists_query(table, &index.name);
        self.guarded(table, exists, statement, false);
        self
    }

    /// Drops an index if it exists.
    pub fn drop_index(&mut self, table: &str, index: &IndexDefinition) -> &mut Self {
        if !self.dialect.supports_guarded_ddl() && index.kind != IndexKind::Primary {
            let sql = format!("DROP INDEX IF EXISTS {}", self.quote(&index.name));
            return self.push_statement(&sql, table);
        }
        let clause = match index.kind {
            IndexKind::Primary => "DROP PRIMARY KEY".to_owned(),
            _ => format!("DROP INDEX {}", self.quote(&index.name)),
        };
        let statement = format!("ALTER TABLE {} {}", self.quote(table), clause);
        let exists = self.index_exists_query(table, &index.name);
        self.guarded(table, exists, statement, true);
        self
    }

    /// Adds a foreign key unless a constraint with that name already exists.
    pub fn add_constraint(&mut self, table: &str, fk: &ForeignKeyDefinition) -> &mut Self {
        let statement = format!(
            "ALTER TABLE {} ADD {}",
            self.quote(table),
            self.foreign_key_clause(fk)
        );
        let exists = self.constraint_exists_query(table, &fk.name);
        self.guarded(table, exists, statement, false);
        self
    }

    fn foreign_key_clause(&self, fk: &ForeignKeyDefinition) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
            self.quote(&fk.name),
            self.quote_list(&fk.columns),
            self.quote(&fk.referenced_table),
            self.quote_list(&fk.referenced_columns),
            fk.on_update.as_sql(),
            fk.on_delete.as_sql()
        )
    }

    /// Drops a foreign key if it exists.
    pub fn drop_constraint(&mut self, table: &str, name: &str) -> &mut Self {
        let statement = format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            self.quote(table),
            self.quote(name)
        );
        let exists = self.constraint_exists_query(table, name);
        self.guarded(table, exists, statement, true);
        self
    }

    pub fn create_procedure(&mut self, procedure: &ProcedureDefinition) -> &mut Self {
        let mut params: Vec<String> = procedure
            .args
            .iter()
            .map(|a| format!("IN {} {}", self.quote(&a.name), a.sql_type))
            .collect();
        if let Some(out) = &procedure.output {
            params.push(format!("OUT {} {}", self.quote(&out.name), out.sql_type));
        }
        let sql = format!(
            "CREATE PROCEDURE {}({})\nBEGIN\n{}\nEND",
            self.quote(&procedure.name),
            params.join(", "),
            procedure.body.trim()
        );
        self.push_statement(&sql, &procedure.name)
    }

    pub fn drop_procedure(&mut self, name: &str) -> &mut Self {
        let sql = format!("DROP PROCEDURE IF EXISTS {}", self.quote(name));
        self.push_statement(&sql, name)
    }

    /// Multi-row INSERT. Every row must share the first row's column set.
    pub fn insert(&mut self, table: &str, rows: &[Row]) -> MigrationResult<&mut Self> {
        let Some(first) = rows.first() else {
            return Ok(self);
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        if let Some(bad) = rows
            .iter()
            .position(|row| !row.keys().eq(columns.iter()))
        {
            return Err(MigrationError::Validation(vec![ValidationError::new(
                BlueprintKind::Seed,
                table,
                format!("row {} does not have the same columns as row 0", bad),
            )]));
        }
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Vec<String> = row.values().map(|v| self.value_sql(v)).collect();
            tuples.push(format!("({})", values.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote(table),
            self.quote_list(&columns),
            tuples.join(", ")
        );
        self.push_statement(&sql, table);
        Ok(self)
    }

    pub fn update(&mut self, table: &str, assignments: &Row) -> &mut Self {
        let sets: Vec<String> = assignments
            .iter()
            .map(|(col, v)| format!("{} = {}", self.quote(col), self.value_sql(v)))
            .collect();
        let sql = format!("UPDATE {} SET {}", self.quote(table), sets.join(", "));
        self.push_statement(&sql, table)
    }

    pub fn delete(&mut self, table: &str) -> &mut Self {
        let sql = format!("DELETE FROM {}", self.quote(table));
        self.push_statement(&sql, table)
    }

    /// Appends a WHERE clause to the current statement.
    pub fn where_clause(&mut self, conditions: &[Condition]) -> &mut Self {
        if conditions.is_empty() {
            return self;
        }
        let rendered: Vec<String> = conditions.iter().map(|c| self.render_condition(c)).collect();
        let clause = format!(" WHERE {}", rendered.join(" AND "));
        self.write(&clause, None, false)
    }

    fn render_condition(&mut self, condition: &Condition) -> String {
        let column = self.quote(&condition.column);
        match condition.operator {
            Operator::In | Operator::NotIn => self.render_list(&column, condition),
            Operator::Eq | Operator::NotEq
                if condition.values.first().is_none_or(Value::is_null) =>
            {
                if condition.operator == Operator::Eq {
                    format!("{} IS NULL", column)
                } else {
                    format!("{} IS NOT NULL", column)
                }
            }
            Operator::Like | Operator::NotLike => {
                let pattern = match condition.values.first() {
                    Some(Value::Text(text)) if text.contains('%') => Value::Text(text.clone()),
                    Some(other) => {
                        let text = other.canonical().unwrap_or_default();
                        Value::Text(format!("%{}%", text))
                    }
                    None => Value::Text("%".to_owned()),
                };
                let value = self.value_sql(&pattern);
                format!("{} {} {}", column, condition.operator.as_sql(), value)
            }
            op => {
                let value = condition.values.first().cloned().unwrap_or(Value::Null);
                let value = self.value_sql(&value);
                format!("{} {} {}", column, op.as_sql(), value)
            }
        }
    }

    /// `IN`/`NOT IN` with NULL split out, since `x IN (NULL)` never matches.
    fn render_list(&mut self, column: &str, condition: &Condition) -> String {
        let negated = condition.operator == Operator::NotIn;
        let has_null = condition.values.iter().any(Value::is_null);
        let present: Vec<Value> = condition
            .values
            .iter()
            .filter(|v| !v.is_null())
            .cloned()
            .collect();

        if present.is_empty() {
            return match (has_null, negated) {
                (true, false) => format!("{} IS NULL", column),
                (true, true) => format!("{} IS NOT NULL", column),
                (false, false) => "1=0".to_owned(),
                (false, true) => "1=1".to_owned(),
            };
        }

        let list = present
            .iter()
            .map(|v| self.value_sql(v))
            .collect::<Vec<_>>()
            .join(",");
        let base = format!("{} {} ({})", column, condition.operator.as_sql(), list);
        match (has_null, negated) {
            (false, _) => base,
            (true, false) => format!("({} OR {} IS NULL)", base, column),
            (true, true) => format!("({} AND {} IS NOT NULL)", base, column),
        }
    }
}
