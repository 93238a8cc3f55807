use std::future::Future;
use std::pin::Pin;

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool, Connection};

/// Single in-memory SQLite connection through the Any driver.
pub async fn memory_connection() -> Result<AnyConnection, sqlx::Error> {
    sqlx::any::install_default_drivers();
    AnyConnection::connect("sqlite::memory:").await
}

/// In-memory SQLite pool. One connection, so every query sees the same database.
pub async fn memory_pool() -> Result<AnyPool, sqlx::Error> {
    sqlx::any::install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// Run an async test block inside a transaction that is always rolled back.
pub async fn with_test_transaction<F, T>(pool: &AnyPool, f: F) -> Result<T, sqlx::Error>
where
    F: for<'c> FnOnce(
        &'c mut AnyConnection,
    ) -> Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + 'c>>,
{
    let mut tx = pool.begin().await?;
    let result = f(&mut *tx).await;
    let rollback_result = tx.rollback().await;

    match (result, rollback_result) {
        (Ok(value), Ok(_)) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}
