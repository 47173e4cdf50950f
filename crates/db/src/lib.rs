//! Persistence for servers, channels, recordings, commands and logs.
//!
//! The agent is written against the [`Store`] trait. [`PgStore`] backs it
//! with PostgreSQL through the zero-sized repositories in
//! [`repositories`]; [`MemoryStore`] is an in-process fake used by tests
//! and local runs.

use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod memory_store;
pub mod models;
pub mod pg_store;
pub mod repositories;
pub mod store;

pub use error::StoreError;
pub use memory_store::{ChangeOp, MemoryStore, StoreChange, Table};
pub use pg_store::PgStore;
pub use store::Store;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Apply the bundled migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
