//! Append-only record of applied migrations and seeds.
//!
//! Each artifact kind has a header table (`_SPLITPHP_MIGRATION`, `_SPLITPHP_SEED`)
//! and an operation table holding the up/down SQL of every executed step.

use sqlx::AnyConnection;

use crate::blueprint::SqlPair;
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult, map_sqlx_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Migration,
    Seed,
}

impl ArtifactKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Migration => "_SPLITPHP_MIGRATION",
            Self::Seed => "_SPLITPHP_SEED",
        }
    }

    pub fn operation_table(&self) -> &'static str {
        match self {
            Self::Migration => "_SPLITPHP_MIGRATION_OPERATION",
            Self::Seed => "_SPLITPHP_SEED_OPERATION",
        }
    }

    /// Column holding the content hash.
    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Migration => "mkey",
            Self::Seed => "skey",
        }
    }

    /// Operation column pointing back at the header row.
    pub fn parent_column(&self) -> &'static str {
        match self {
            Self::Migration => "id_migration",
            Self::Seed => "id_seed",
        }
    }

    /// Directory scanned for files of this kind.
    pub fn directory(&self) -> &'static str {
        match self {
            Self::Migration => "migrations",
            Self::Seed => "seeds",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Seed => "seed",
        }
    }
}

/// One applied migration or seed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: i64,
    pub name: String,
    /// `%Y-%m-%d %H:%M:%S`, UTC.
    pub date_exec: String,
    pub filepath: String,
    /// SHA-256 of the file contents (`mkey` or `skey`).
    pub key: String,
    pub module: Option<String>,
}

/// Values for a header row about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry<'a> {
    pub name: &'a str,
    pub filepath: &'a str,
    pub key: &'a str,
    pub module: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEntry {
    pub id: i64,
    pub parent: i64,
    pub up: String,
    pub down: String,
}

type LedgerRow = (i64, String, String, String, String, Option<String>);

impl From<LedgerRow> for LedgerEntry {
    fn from((id, name, date_exec, filepath, key, module): LedgerRow) -> Self {
        Self {
            id,
            name,
            date_exec,
            filepath,
            key,
            module,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ledger {
    kind: ArtifactKind,
    dialect: Dialect,
}

impl Ledger {
    pub fn new(kind: ArtifactKind, dialect: Dialect) -> Self {
        Self { kind, dialect }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    fn header(&self) -> String {
        self.dialect.quote_identifier(self.kind.table())
    }

    fn operations_table(&self) -> String {
        self.dialect.quote_identifier(self.kind.operation_table())
    }

    fn select_header(&self) -> String {
        format!(
            "SELECT CAST(id AS SIGNED), name, CAST(date_exec AS CHAR), filepath, {key}, module FROM {table}",
            key = self.kind.key_column(),
            table = self.header()
        )
    }

    fn create_sql(&self) -> String {
        let key = self.kind.key_column();
        let parent = self.kind.parent_column();
        match self.dialect {
            Dialect::MySql => format!(
                "CREATE TABLE IF NOT EXISTS {header} (\n\
                 \x20 `id` INT UNSIGNED NOT NULL AUTO_INCREMENT,\n\
                 \x20 `name` VARCHAR(255) NOT NULL,\n\
                 \x20 `date_exec` DATETIME NOT NULL,\n\
                 \x20 `filepath` VARCHAR(255) NOT NULL,\n\
                 \x20 `{key}` VARCHAR(64) NOT NULL,\n\
                 \x20 `module` VARCHAR(255) NULL,\n\
                 \x20 PRIMARY KEY (`id`),\n\
                 \x20 KEY `idx_{table}_{key}` (`{key}`)\n\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;\n\
                 CREATE TABLE IF NOT EXISTS {ops} (\n\
                 \x20 `id` INT UNSIGNED NOT NULL AUTO_INCREMENT,\n\
                 \x20 `{parent}` INT UNSIGNED NOT NULL,\n\
                 \x20 `up` LONGTEXT NOT NULL,\n\
                 \x20 `down` LONGTEXT NULL,\n\
                 \x20 PRIMARY KEY (`id`),\n\
                 \x20 CONSTRAINT `fk_{op_table}` FOREIGN KEY (`{parent}`) REFERENCES {header} (`id`) ON DELETE CASCADE ON UPDATE CASCADE\n\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                header = self.header(),
                ops = self.operations_table(),
                table = self.kind.table().to_ascii_lowercase(),
                op_table = self.kind.operation_table().to_ascii_lowercase(),
            ),
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {header} (\n\
                 \x20 id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
                 \x20 name TEXT NOT NULL,\n\
                 \x20 date_exec TEXT NOT NULL,\n\
                 \x20 filepath TEXT NOT NULL,\n\
                 \x20 {key} TEXT NOT NULL,\n\
                 \x20 module TEXT NULL\n\
                 );\n\
                 CREATE TABLE IF NOT EXISTS {ops} (\n\
                 \x20 id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
                 \x20 {parent} INTEGER NOT NULL REFERENCES {header} (id) ON DELETE CASCADE,\n\
                 \x20 up TEXT NOT NULL,\n\
                 \x20 down TEXT NULL\n\
                 )",
                header = self.header(),
                ops = self.operations_table(),
            ),
        }
    }

    pub async fn ensure_tables(&self, conn: &mut AnyConnection) -> MigrationResult<()> {
        let sql = self.create_sql();
        sqlx::raw_sql(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        Ok(())
    }

    /// The ledger row whose content hash equals `key`, if any.
    pub async fn find_by_key(
        &self,
        conn: &mut AnyConnection,
        key: &str,
    ) -> MigrationResult<Option<LedgerEntry>> {
        let sql = format!(
            "{} WHERE {} = ? ORDER BY id DESC LIMIT 1",
            self.select_header(),
            self.kind.key_column()
        );
        let row: Option<LedgerRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        Ok(row.map(LedgerEntry::from))
    }

    /// Applied entries, newest first. `module` restricts to one module.
    pub async fn applied(
        &self,
        conn: &mut AnyConnection,
        module: Option<&str>,
    ) -> MigrationResult<Vec<LedgerEntry>> {
        let mut sql = self.select_header();
        if module.is_some() {
            sql.push_str(" WHERE module = ?");
        }
        sql.push_str(" ORDER BY date_exec DESC, id DESC");
        let mut query = sqlx::query_as::<_, LedgerRow>(&sql);
        if let Some(module) = module {
            query = query.bind(module);
        }
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    /// Writes one header row and one operation row per pair, in order.
    pub async fn record(
        &self,
        conn: &mut AnyConnection,
        entry: &NewLedgerEntry<'_>,
        operations: &[SqlPair],
    ) -> MigrationResult<i64> {
        let sql = format!(
            "INSERT INTO {} (name, date_exec, filepath, {}, module) VALUES (?, ?, ?, ?, ?)",
            self.header(),
            self.kind.key_column()
        );
        let date_exec = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let result = sqlx::query(&sql)
            .bind(entry.name)
            .bind(date_exec)
            .bind(entry.filepath)
            .bind(entry.key)
            .bind(entry.module.map(str::to_owned))
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        let id = result.last_insert_id().ok_or_else(|| {
            MigrationError::Message(format!("{} did not report an insert id", self.kind.table()))
        })?;

        let op_sql = format!(
            "INSERT INTO {} ({}, up, down) VALUES (?, ?, ?)",
            self.operations_table(),
            self.kind.parent_column()
        );
        for op in operations {
            sqlx::query(&op_sql)
                .bind(id)
                .bind(op.up.as_str())
                .bind(op.down.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error(&op_sql, e))?;
        }
        Ok(id)
    }

    /// Operations of one entry in insertion order.
    pub async fn operations(
        &self,
        conn: &mut AnyConnection,
        id: i64,
    ) -> MigrationResult<Vec<OperationEntry>> {
        let sql = format!(
            "SELECT CAST(id AS SIGNED), CAST({parent} AS SIGNED), up, down FROM {ops} WHERE {parent} = ? ORDER BY id ASC",
            parent = self.kind.parent_column(),
            ops = self.operations_table()
        );
        let rows: Vec<(i64, i64, String, Option<String>)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        Ok(rows
            .into_iter()
            .map(|(id, parent, up, down)| OperationEntry {
                id,
                parent,
                up,
                down: down.unwrap_or_default(),
            })
            .collect())
    }

    /// Deletes an entry and its operations.
    pub async fn remove(&self, conn: &mut AnyConnection, id: i64) -> MigrationResult<()> {
        let ops_sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.operations_table(),
            self.kind.parent_column()
        );
        sqlx::query(&ops_sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&ops_sql, e))?;
        let sql = format!("DELETE FROM {} WHERE id = ?", self.header());
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(&sql, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory_connection;

    #[tokio::test]
    async fn records_and_removes_entries_with_operations() {
        let mut conn = memory_connection().await.unwrap();
        let ledger = Ledger::new(ArtifactKind::Migration, Dialect::Sqlite);
        ledger.ensure_tables(&mut conn).await.unwrap();
        ledger.ensure_tables(&mut conn).await.unwrap();

        let entry = NewLedgerEntry {
            name: "1700000000_create_users",
            filepath: "migrations/1700000000_create_users.toml",
            key: "abc123",
            module: None,
        };
        let ops = vec![
            SqlPair::new("CREATE TABLE a (id INTEGER);", "DROP TABLE a;"),
            SqlPair::new("CREATE TABLE b (id INTEGER);", "DROP TABLE b;"),
        ];
        let id = ledger.record(&mut conn, &entry, &ops).await.unwrap();

        let found = ledger.find_by_key(&mut conn, "abc123").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.module, None);
        assert_eq!(found.date_exec.len(), 19);

        let recorded = ledger.operations(&mut conn, id).await.unwrap();
        assert_eq!(
            recorded.iter().map(|o| o.down.as_str()).collect::<Vec<_>>(),
            vec!["DROP TABLE a;", "DROP TABLE b;"]
        );

        ledger.remove(&mut conn, id).await.unwrap();
        assert!(ledger.find_by_key(&mut conn, "abc123").await.unwrap().is_none());
        assert!(ledger.operations(&mut conn, id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn applied_filters_by_module_newest_first() {
        let mut conn = memory_connection().await.unwrap();
        let ledger = Ledger::new(ArtifactKind::Seed, Dialect::Sqlite);
        ledger.ensure_tables(&mut conn).await.unwrap();

        for (name, module) in [("a", None), ("b", Some("billing")), ("c", Some("billing"))] {
            let entry = NewLedgerEntry {
                name,
                filepath: name,
                key: name,
                module,
            };
            ledger.record(&mut conn, &entry, &[]).await.unwrap();
        }

        let all = ledger.applied(&mut conn, None).await.unwrap();
        assert_eq!(all.len(), 3);
        let billing = ledger.applied(&mut conn, Some("billing")).await.unwrap();
        assert_eq!(
            billing.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
    }
}
