//! Postgres pool and schema wiring.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_generation.sql");

pub const UNIQUE_VIOLATION: &str = "23505";
pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the schema. Statements are idempotent (`IF NOT EXISTS`).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema applied");
    Ok(())
}

/// SQLSTATE of a database error, if any.
pub fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

/// BIGINT arithmetic overflow, e.g. `balance + $2`.
pub fn is_out_of_range(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(NUMERIC_VALUE_OUT_OF_RANGE)
}
