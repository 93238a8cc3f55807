//! Composition root owning the pool, the metadata reader and per-run state.

use std::collections::HashSet;

use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool};

use crate::blueprint::DiffContext;
use crate::config::Config;
use crate::dialect::Dialect;
use crate::error::{MigrationResult, map_sqlx_error};
use crate::executor::{ScriptConnection, run_script, with_retry};
use crate::metadata::{Catalog, DatabaseCatalog, SchemaMetadataReader};

#[derive(Debug)]
pub struct Context<C = DatabaseCatalog> {
    pub(crate) pool: AnyPool,
    pub(crate) dialect: Dialect,
    pub(crate) config: Config,
    pub(crate) reader: SchemaMetadataReader<C>,
    created_databases: HashSet<String>,
}

impl Context<DatabaseCatalog> {
    /// Connects to `config.database_url`, retrying transient failures.
    pub async fn connect(config: Config) -> MigrationResult<Self> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(&config.database_url)?;
        let url = config.database_url.as_str();
        // Runs are sequential; one connection also keeps `sqlite::memory:` coherent.
        let pool = with_retry(config.retry_policy(), "connect", || async move {
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await
        })
        .await
        .map_err(|e| map_sqlx_error("", e))?;

        let reader = SchemaMetadataReader::new(DatabaseCatalog::for_dialect(dialect))
            .with_cache_file(config.cache_path.clone());
        Ok(Self::from_parts(pool, dialect, config, reader))
    }
}

impl<C: Catalog> Context<C> {
    pub fn from_parts(
        pool: AnyPool,
        dialect: Dialect,
        config: Config,
        reader: SchemaMetadataReader<C>,
    ) -> Self {
        Self {
            pool,
            dialect,
            config,
            reader,
            created_databases: HashSet::new(),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reader(&self) -> &SchemaMetadataReader<C> {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut SchemaMetadataReader<C> {
        &mut self.reader
    }

    pub fn diff_context(&self) -> DiffContext {
        DiffContext::new(self.dialect, self.config.environment.clone())
    }

    pub async fn acquire(&self) -> MigrationResult<PoolConnection<Any>> {
        let pool = &self.pool;
        with_retry(self.config.retry_policy(), "acquire", || pool.acquire())
            .await
            .map_err(|e| map_sqlx_error("", e))
    }

    /// Runs `sql` statement by statement on `conn`, reopening it in place
    /// when the server drops it mid-script.
    pub async fn execute(&self, conn: &mut AnyConnection, sql: &str) -> MigrationResult<()> {
        let mut target = ScriptConnection::new(conn).reconnect_to(self.reconnect_url());
        run_script(&mut target, sql, self.config.retry_policy()).await
    }

    /// In-memory SQLite databases do not survive a new connection.
    fn reconnect_url(&self) -> Option<&str> {
        let url = self.config.database_url.as_str();
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        (!in_memory).then_some(url)
    }

    /// Creates `name` once per context. Engines without databases do nothing.
    pub async fn ensure_database(&mut self, conn: &mut AnyConnection, name: &str) -> MigrationResult<()> {
        if self.created_databases.contains(name) {
            return Ok(());
        }
        if let Some(sql) = self.dialect.ensure_database_sql(name) {
            self.execute(conn, &sql).await?;
            tracing::info!(operation = "database_ensure", database = %name, "splitmig migration");
        }
        self.created_databases.insert(name.to_owned());
        Ok(())
    }
}
