//! Live schema catalog access and the cached [`SchemaMetadataReader`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use sqlx::AnyConnection;

use crate::blueprint::foreign_key_name;
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};
use crate::schema::{
    ColumnDefinition, ForeignKeyDefinition, ForeignKeyReference, IndexDefinition, IndexKind,
    ProcedureArg, ProcedureDefinition, ReferentialAction, TableMetadata, parse_catalog_default,
    parse_declared_type,
};

/// Read access to a database's schema catalog.
#[allow(async_fn_in_trait)]
pub trait Catalog {
    /// Fails with [`MigrationError::CatalogAccess`] when any catalog view cannot be read.
    async fn probe(&self, conn: &mut AnyConnection) -> MigrationResult<()>;

    async fn list_tables(&self, conn: &mut AnyConnection) -> MigrationResult<Vec<String>>;

    /// `None` when the table does not exist.
    async fn table(&self, conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<TableMetadata>>;

    async fn procedure(
        &self,
        conn: &mut AnyConnection,
        name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>>;
}

fn access_error(view: &str, err: sqlx::Error) -> MigrationError {
    MigrationError::CatalogAccess {
        view: view.to_owned(),
        source: err,
    }
}

const MYSQL_VIEWS: &[&str] = &[
    "TABLES",
    "COLUMNS",
    "STATISTICS",
    "KEY_COLUMN_USAGE",
    "REFERENTIAL_CONSTRAINTS",
    "ROUTINES",
    "PARAMETERS",
];

const MYSQL_FOREIGN_KEYS: &str = "SELECT CAST(k.TABLE_NAME AS CHAR), CAST(k.CONSTRAINT_NAME AS CHAR), CAST(k.COLUMN_NAME AS CHAR), \
     CAST(k.REFERENCED_TABLE_NAME AS CHAR), CAST(k.REFERENCED_COLUMN_NAME AS CHAR), \
     CAST(r.UPDATE_RULE AS CHAR), CAST(r.DELETE_RULE AS CHAR) \
     FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE k \
     JOIN INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS r \
       ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME AND r.TABLE_NAME = k.TABLE_NAME \
     WHERE k.TABLE_SCHEMA = DATABASE()";

type ForeignKeyRow = (String, String, String, String, String, String, String);

/// Groups per-column foreign key rows into definitions, keyed by owning table.
fn group_foreign_keys(rows: Vec<ForeignKeyRow>) -> Vec<(String, ForeignKeyDefinition)> {
    let mut grouped: Vec<(String, ForeignKeyDefinition)> = Vec::new();
    for (table, name, column, ref_table, ref_column, on_update, on_delete) in rows {
        match grouped
            .iter_mut()
            .find(|(t, fk)| *t == table && fk.name == name)
        {
            Some((_, fk)) => {
                fk.columns.push(column);
                fk.referenced_columns.push(ref_column);
            }
            None => grouped.push((
                table,
                ForeignKeyDefinition {
                    name,
                    columns: vec![column],
                    referenced_table: ref_table,
                    referenced_columns: vec![ref_column],
                    on_update: ReferentialAction::parse(&on_update),
                    on_delete: ReferentialAction::parse(&on_delete),
                },
            )),
        }
    }
    grouped
}

/// Strips the BEGIN/END wrapper the catalog reports around a routine body.
fn routine_body(definition: &str) -> String {
    let trimmed = definition.trim();
    let upper = trimmed.to_ascii_uppercase();
    if trimmed.len() >= 8 && upper.starts_with("BEGIN") && upper.ends_with("END") {
        trimmed[5..trimmed.len() - 3].trim().to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// INFORMATION_SCHEMA reader for MySQL and MariaDB, scoped to `DATABASE()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlCatalog;

impl Catalog for MySqlCatalog {
    async fn probe(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        for view in MYSQL_VIEWS {
            let sql = format!("SELECT 1 FROM INFORMATION_SCHEMA.{} LIMIT 0", view);
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| access_error(&format!("INFORMATION_SCHEMA.{}", view), e))?;
        }
        Ok(())
    }

    async fn list_tables(&self, conn: &mut AnyConnection) -> MigrationResult<Vec<String>> {
        let tables = sqlx::query_scalar(
            "SELECT CAST(TABLE_NAME AS CHAR) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(tables)
    }

    async fn table(&self, conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<TableMetadata>> {
        let header: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT CAST(c.CHARACTER_SET_NAME AS CHAR), CAST(t.TABLE_COLLATION AS CHAR) \
             FROM INFORMATION_SCHEMA.TABLES t \
             LEFT JOIN INFORMATION_SCHEMA.COLLATION_CHARACTER_SET_APPLICABILITY c ON c.COLLATION_NAME = t.TABLE_COLLATION \
             WHERE t.TABLE_SCHEMA = DATABASE() AND t.TABLE_NAME = ?",
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        let Some((charset, collation)) = header else {
            return Ok(None);
        };

        let mut table = TableMetadata::new(name);
        table.charset = charset;
        table.collation = collation;

        #[allow(clippy::type_complexity)]
        let columns: Vec<(String, String, String, Option<String>, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR), CAST(IS_NULLABLE AS CHAR), \
                 CAST(COLUMN_DEFAULT AS CHAR), CAST(EXTRA AS CHAR), CAST(CHARACTER_SET_NAME AS CHAR), CAST(COLLATION_NAME AS CHAR) \
                 FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            )
            .bind(name)
            .fetch_all(&mut *conn)
            .await?;
        for (col_name, col_type, nullable, default, extra, charset, collation) in columns {
            let declared = parse_declared_type(&col_type);
            let mut column = ColumnDefinition::new(col_name, declared.column_type);
            column.length = declared.length;
            column.scale = declared.scale;
            column.unsigned = declared.unsigned;
            column.nullable = nullable.eq_ignore_ascii_case("YES");
            column.auto_increment = extra.to_ascii_lowercase().contains("auto_increment");
            column.default = parse_catalog_default(default.as_deref(), declared.column_type);
            column.charset = charset;
            column.collation = collation;
            table.columns.push(column);
        }

        let index_rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT CAST(INDEX_NAME AS CHAR), CAST(NON_UNIQUE AS SIGNED), CAST(COLUMN_NAME AS CHAR) \
             FROM INFORMATION_SCHEMA.STATISTICS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
             ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
        for (index_name, non_unique, column) in index_rows {
            if let Some(index) = table.indexes.iter_mut().find(|i| i.name == index_name) {
                index.columns.push(column);
                continue;
            }
            let kind = if index_name == IndexDefinition::PRIMARY {
                IndexKind::Primary
            } else if non_unique == 0 {
                IndexKind::Unique
            } else {
                IndexKind::Index
            };
            table
                .indexes
                .push(IndexDefinition::new(index_name, kind, vec![column]));
        }

        let own: Vec<ForeignKeyRow> = sqlx::query_as(&format!(
            "{} AND k.TABLE_NAME = ? ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION",
            MYSQL_FOREIGN_KEYS
        ))
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
        table.foreign_keys = group_foreign_keys(own).into_iter().map(|(_, fk)| fk).collect();

        let inbound: Vec<ForeignKeyRow> = sqlx::query_as(&format!(
            "{} AND k.REFERENCED_TABLE_NAME = ? AND k.TABLE_NAME <> k.REFERENCED_TABLE_NAME \
             ORDER BY k.TABLE_NAME, k.CONSTRAINT_NAME, k.ORDINAL_POSITION",
            MYSQL_FOREIGN_KEYS
        ))
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
        table.referenced_by = group_foreign_keys(inbound)
            .into_iter()
            .map(|(table, foreign_key)| ForeignKeyReference { table, foreign_key })
            .collect();

        Ok(Some(table))
    }

    async fn procedure(
        &self,
        conn: &mut AnyConnection,
        name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>> {
        let definition: Option<Option<String>> = sqlx::query_scalar(
            "SELECT CAST(ROUTINE_DEFINITION AS CHAR) FROM INFORMATION_SCHEMA.ROUTINES \
             WHERE ROUTINE_SCHEMA = DATABASE() AND ROUTINE_TYPE = 'PROCEDURE' AND ROUTINE_NAME = ?",
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(definition) = definition else {
            return Ok(None);
        };

        let params: Vec<(Option<String>, Option<String>, String)> = sqlx::query_as(
            "SELECT CAST(PARAMETER_MODE AS CHAR), CAST(PARAMETER_NAME AS CHAR), CAST(DTD_IDENTIFIER AS CHAR) \
             FROM INFORMATION_SCHEMA.PARAMETERS WHERE SPECIFIC_SCHEMA = DATABASE() AND SPECIFIC_NAME = ? \
             AND ROUTINE_TYPE = 'PROCEDURE' ORDER BY ORDINAL_POSITION",
        )
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;

        let mut procedure = ProcedureDefinition {
            name: name.to_owned(),
            args: Vec::new(),
            output: None,
            body: routine_body(definition.as_deref().unwrap_or_default()),
        };
        for (mode, param, sql_type) in params {
            let arg = ProcedureArg {
                name: param.unwrap_or_default(),
                sql_type: sql_type.to_ascii_uppercase(),
            };
            if mode.as_deref() == Some("OUT") {
                procedure.output = Some(arg);
            } else {
                procedure.args.push(arg);
            }
        }
        Ok(Some(procedure))
    }
}

/// PRAGMA-based reader for SQLite. SQLite has no stored procedures and no
/// named foreign keys; constraint names are generated the same way blueprints
/// generate them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteCatalog;

impl SqliteCatalog {
    async fn foreign_keys(
        conn: &mut AnyConnection,
        table: &str,
    ) -> MigrationResult<Vec<ForeignKeyDefinition>> {
        let sql = format!(
            "PRAGMA foreign_key_list({})",
            Dialect::Sqlite.quote_identifier(table)
        );
        #[allow(clippy::type_complexity)]
        let rows: Vec<(i64, i64, String, String, Option<String>, String, String, String)> =
            sqlx::query_as(&sql).fetch_all(&mut *conn).await?;

        let mut by_id: BTreeMap<i64, ForeignKeyDefinition> = BTreeMap::new();
        for (id, _seq, ref_table, from, to, on_update, on_delete, _match) in rows {
            let fk = by_id.entry(id).or_insert_with(|| ForeignKeyDefinition {
                name: String::new(),
                columns: Vec::new(),
                referenced_table: ref_table,
                referenced_columns: Vec::new(),
                on_update: ReferentialAction::parse(&on_update),
                on_delete: ReferentialAction::parse(&on_delete),
            });
            fk.columns.push(from);
            fk.referenced_columns.push(to.unwrap_or_else(|| "rowid".to_owned()));
        }
        Ok(by_id
            .into_values()
            .map(|mut fk| {
                fk.name = foreign_key_name(table, &fk.columns);
                fk
            })
            .collect())
    }
}

impl Catalog for SqliteCatalog {
    async fn probe(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        sqlx::query("SELECT 1 FROM sqlite_master LIMIT 0")
            .execute(&mut *conn)
            .await
            .map_err(|e| access_error("sqlite_master", e))?;
        Ok(())
    }

    async fn list_tables(&self, conn: &mut AnyConnection) -> MigrationResult<Vec<String>> {
        let tables = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(tables)
    }

    async fn table(&self, conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<TableMetadata>> {
        let create_sql: Option<Option<String>> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        let Some(create_sql) = create_sql else {
            return Ok(None);
        };
        let autoincrement = create_sql
            .unwrap_or_default()
            .to_ascii_uppercase()
            .contains("AUTOINCREMENT");
        let quoted = Dialect::Sqlite.quote_identifier(name);
        let mut table = TableMetadata::new(name);

        let pragma_sql = format!("PRAGMA table_info({})", quoted);
        let rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as(&pragma_sql).fetch_all(&mut *conn).await?;
        let mut primary: Vec<(i64, String)> = Vec::new();
        for (_cid, col_name, col_type, notnull, default, pk) in rows {
            let declared = parse_declared_type(&col_type);
            let mut column = ColumnDefinition::new(col_name.clone(), declared.column_type);
            column.length = declared.length;
            column.scale = declared.scale;
            column.unsigned = declared.unsigned;
            column.nullable = pk == 0 && notnull == 0;
            column.default = parse_catalog_default(default.as_deref(), declared.column_type);
            column.auto_increment = pk > 0 && autoincrement && declared.column_type.is_integer();
            if pk > 0 {
                primary.push((pk, col_name));
            }
            table.columns.push(column);
        }
        if !primary.is_empty() {
            primary.sort();
            table.indexes.push(IndexDefinition::new(
                IndexDefinition::PRIMARY,
                IndexKind::Primary,
                primary.into_iter().map(|(_, c)| c).collect(),
            ));
        }

        let list_sql = format!("PRAGMA index_list({})", quoted);
        let index_rows: Vec<(i64, String, i64, String, i64)> =
            sqlx::query_as(&list_sql).fetch_all(&mut *conn).await?;
        for (_seq, index_name, unique, origin, _partial) in index_rows {
            if origin == "pk" || index_name.starts_with("sqlite_autoindex") {
                continue;
            }
            let info_sql = format!(
                "PRAGMA index_info({})",
                Dialect::Sqlite.quote_identifier(&index_name)
            );
            let info_rows: Vec<(i64, i64, String)> =
                sqlx::query_as(&info_sql).fetch_all(&mut *conn).await?;
            let kind = if unique != 0 {
                IndexKind::Unique
            } else {
                IndexKind::Index
            };
            table.indexes.push(IndexDefinition::new(
                index_name,
                kind,
                info_rows.into_iter().map(|(_, _, col)| col).collect(),
            ));
        }

        table.foreign_keys = Self::foreign_keys(conn, name).await?;
        for other in self.list_tables(conn).await? {
            if other == name {
                continue;
            }
            for fk in Self::foreign_keys(conn, &other).await? {
                if fk.referenced_table.eq_ignore_ascii_case(name) {
                    table.referenced_by.push(ForeignKeyReference {
                        table: other.clone(),
                        foreign_key: fk,
                    });
                }
            }
        }

        Ok(Some(table))
    }

    async fn procedure(
        &self,
        _conn: &mut AnyConnection,
        _name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>> {
        Ok(None)
    }
}

/// Catalog selected from the connection URL.
#[derive(Debug, Clone, Copy)]
pub enum DatabaseCatalog {
    MySql(MySqlCatalog),
    Sqlite(SqliteCatalog),
}

impl DatabaseCatalog {
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::MySql => Self::MySql(MySqlCatalog),
            Dialect::Sqlite => Self::Sqlite(SqliteCatalog),
        }
    }
}

impl Catalog for DatabaseCatalog {
    async fn probe(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        match self {
            Self::MySql(c) => c.probe(conn).await,
            Self::Sqlite(c) => c.probe(conn).await,
        }
    }

    async fn list_tables(&self, conn: &mut AnyConnection) -> MigrationResult<Vec<String>> {
        match self {
            Self::MySql(c) => c.list_tables(conn).await,
            Self::Sqlite(c) => c.list_tables(conn).await,
        }
    }

    async fn table(&self, conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<TableMetadata>> {
        match self {
            Self::MySql(c) => c.table(conn, name).await,
            Self::Sqlite(c) => c.table(conn, name).await,
        }
    }

    async fn procedure(
        &self,
        conn: &mut AnyConnection,
        name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>> {
        match self {
            Self::MySql(c) => c.procedure(conn, name).await,
            Self::Sqlite(c) => c.procedure(conn, name).await,
        }
    }
}

/// In-memory catalog for diffing without a live schema.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tables: BTreeMap<String, TableMetadata>,
    procedures: BTreeMap<String, ProcedureDefinition>,
    denied_view: Option<String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableMetadata) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn with_procedure(mut self, procedure: ProcedureDefinition) -> Self {
        self.procedures.insert(procedure.name.clone(), procedure);
        self
    }

    /// Makes [`Catalog::probe`] fail as if `view` were not readable.
    pub fn deny(mut self, view: impl Into<String>) -> Self {
        self.denied_view = Some(view.into());
        self
    }

    pub fn tables_mut(&mut self) -> &mut BTreeMap<String, TableMetadata> {
        &mut self.tables
    }
}

impl Catalog for StaticCatalog {
    async fn probe(&self, _conn: &mut AnyConnection) -> MigrationResult<()> {
        match &self.denied_view {
            Some(view) => Err(access_error(
                view,
                sqlx::Error::Protocol(format!("access denied to {}", view)),
            )),
            None => Ok(()),
        }
    }

    async fn list_tables(&self, _conn: &mut AnyConnection) -> MigrationResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn table(&self, _conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<TableMetadata>> {
        Ok(self.tables.get(name).cloned())
    }

    async fn procedure(
        &self,
        _conn: &mut AnyConnection,
        name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>> {
        Ok(self.procedures.get(name).cloned())
    }
}

/// Cached view over a [`Catalog`].
///
/// The first lookup probes the catalog so a permission problem surfaces as an
/// error instead of as an empty table. Looked-up tables are kept in memory and,
/// when a cache file is configured, merged into it one entry at a time.
#[derive(Debug)]
pub struct SchemaMetadataReader<C> {
    catalog: C,
    cache_path: Option<PathBuf>,
    tables: HashMap<String, TableMetadata>,
    probed: bool,
}

impl<C: Catalog> SchemaMetadataReader<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            cache_path: None,
            tables: HashMap::new(),
            probed: false,
        }
    }

    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut C {
        &mut self.catalog
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    async fn ensure_probed(&mut self, conn: &mut AnyConnection) -> MigrationResult<()> {
        if !self.probed {
            self.catalog.probe(conn).await?;
            self.probed = true;
        }
        Ok(())
    }

    /// Metadata for `name`, from memory, the cache file, or the catalog.
    /// `force_refresh` always goes to the catalog and rewrites the cached entry.
    pub async fn table_info(
        &mut self,
        conn: &mut AnyConnection,
        name: &str,
        force_refresh: bool,
    ) -> MigrationResult<Option<TableMetadata>> {
        self.ensure_probed(conn).await?;
        if !force_refresh {
            if let Some(table) = self.tables.get(name) {
                return Ok(Some(table.clone()));
            }
            if let Some(table) = self.read_cache_file().remove(name) {
                self.tables.insert(name.to_owned(), table.clone());
                return Ok(Some(table));
            }
        }

        let fresh = self.catalog.table(conn, name).await?;
        tracing::debug!(
            operation = "catalog_refresh",
            table = %name,
            exists = fresh.is_some(),
            "splitmig metadata"
        );
        match &fresh {
            Some(table) => {
                self.tables.insert(name.to_owned(), table.clone());
            }
            None => {
                self.tables.remove(name);
            }
        }
        self.merge_cache_entry(name, fresh.as_ref())?;
        Ok(fresh)
    }

    pub async fn list_tables(&mut self, conn: &mut AnyConnection) -> MigrationResult<Vec<String>> {
        self.ensure_probed(conn).await?;
        self.catalog.list_tables(conn).await
    }

    /// First column of the table's PRIMARY index.
    pub async fn primary_key(&mut self, conn: &mut AnyConnection, name: &str) -> MigrationResult<Option<String>> {
        let table = self.table_info(conn, name, false).await?;
        Ok(table
            .as_ref()
            .and_then(TableMetadata::primary_key)
            .and_then(|pk| pk.columns.first().cloned()))
    }

    pub async fn procedure_info(
        &mut self,
        conn: &mut AnyConnection,
        name: &str,
    ) -> MigrationResult<Option<ProcedureDefinition>> {
        self.ensure_probed(conn).await?;
        self.catalog.procedure(conn, name).await
    }

    /// Forgets the in-memory entry for `name`; the next lookup re-reads the cache file.
    pub fn invalidate(&mut self, name: &str) {
        self.tables.remove(name);
    }

    /// Drops every cached entry, in memory and on disk.
    pub fn clear_cache(&mut self) -> MigrationResult<()> {
        self.tables.clear();
        if let Some(path) = &self.cache_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_cache_file(&self) -> BTreeMap<String, TableMetadata> {
        let Some(path) = &self.cache_path else {
            return BTreeMap::new();
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    operation = "metadata_cache",
                    path = %path.display(),
                    error = %e,
                    "ignoring unreadable metadata cache"
                );
                BTreeMap::new()
            }
        }
    }

    fn merge_cache_entry(&self, name: &str, table: Option<&TableMetadata>) -> MigrationResult<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        let mut entries = self.read_cache_file();
        match table {
            Some(table) => {
                entries.insert(name.to_owned(), table.clone());
            }
            None => {
                entries.remove(name);
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| MigrationError::Message(format!("cannot encode metadata cache: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use crate::test_utils::memory_connection;

    fn users() -> TableMetadata {
        let mut users = TableMetadata::new("users");
        users.columns = vec![ColumnDefinition::new("id", ColumnType::Bigint)];
        users.indexes = vec![IndexDefinition::new(
            IndexDefinition::PRIMARY,
            IndexKind::Primary,
            vec!["id".to_owned()],
        )];
        users
    }

    fn temp_cache(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "splitmig_meta_{}_{}.json",
            tag,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn denied_catalog_fails_fast() {
        let mut conn = memory_connection().await.unwrap();
        let mut reader = SchemaMetadataReader::new(StaticCatalog::new().deny("INFORMATION_SCHEMA.COLUMNS"));
        let err = reader.table_info(&mut conn, "users", false).await.unwrap_err();
        assert!(
            matches!(err, MigrationError::CatalogAccess { ref view, .. } if view == "INFORMATION_SCHEMA.COLUMNS")
        );
    }

    #[tokio::test]
    async fn refresh_merges_into_cache_file() {
        let mut conn = memory_connection().await.unwrap();
        let path = temp_cache("merge");
        let mut orders = TableMetadata::new("orders");
        orders.columns = vec![ColumnDefinition::new("total", ColumnType::Decimal)];
        let catalog = StaticCatalog::new().with_table(users()).with_table(orders);
        let mut reader = SchemaMetadataReader::new(catalog).with_cache_file(&path);

        reader.table_info(&mut conn, "users", false).await.unwrap();
        reader.table_info(&mut conn, "orders", true).await.unwrap();

        let cached: BTreeMap<String, TableMetadata> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(cached.keys().collect::<Vec<_>>(), vec!["orders", "users"]);

        reader.clear_cache().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_table_is_removed_from_cache() {
        let mut conn = memory_connection().await.unwrap();
        let path = temp_cache("remove");
        let mut reader =
            SchemaMetadataReader::new(StaticCatalog::new().with_table(users())).with_cache_file(&path);
        assert!(reader.table_info(&mut conn, "users", false).await.unwrap().is_some());

        reader.catalog_mut().tables_mut().clear();
        assert!(reader.table_info(&mut conn, "users", false).await.unwrap().is_some());
        assert!(reader.table_info(&mut conn, "users", true).await.unwrap().is_none());

        let cached: BTreeMap<String, TableMetadata> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(cached.is_empty());
        reader.clear_cache().unwrap();
    }

    #[tokio::test]
    async fn primary_key_reports_first_column() {
        let mut conn = memory_connection().await.unwrap();
        let mut reader = SchemaMetadataReader::new(StaticCatalog::new().with_table(users()));
        assert_eq!(
            reader.primary_key(&mut conn, "users").await.unwrap().as_deref(),
            Some("id")
        );
        assert_eq!(reader.primary_key(&mut conn, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_catalog_reads_columns_indexes_and_references() {
        let mut conn = memory_connection().await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email VARCHAR(191) NOT NULL, bio TEXT);\
             CREATE UNIQUE INDEX uq_users_email ON users (email);\
             CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users (id) ON DELETE CASCADE);",
        )
        .execute(&mut conn)
        .await
        .unwrap();

        let catalog = SqliteCatalog;
        assert_eq!(
            catalog.list_tables(&mut conn).await.unwrap(),
            vec!["posts".to_owned(), "users".to_owned()]
        );

        let users = catalog.table(&mut conn, "users").await.unwrap().unwrap();
        let id = users.column("id").unwrap();
        assert!(id.auto_increment && !id.nullable);
        let email = users.column("email").unwrap();
        assert_eq!((email.column_type, email.length), (ColumnType::String, Some(191)));
        assert!(users.column("bio").unwrap().nullable);
        assert_eq!(users.primary_key().unwrap().columns, vec!["id".to_owned()]);
        assert_eq!(users.index("uq_users_email").unwrap().kind, IndexKind::Unique);
        assert_eq!(users.referenced_by.len(), 1);
        assert_eq!(users.referenced_by[0].table, "posts");
        assert_eq!(users.referenced_by[0].foreign_key.on_delete, ReferentialAction::Cascade);

        let posts = catalog.table(&mut conn, "posts").await.unwrap().unwrap();
        assert_eq!(posts.foreign_keys[0].name, "fk_posts_user_id");
        assert!(catalog.table(&mut conn, "missing").await.unwrap().is_none());
    }
}
