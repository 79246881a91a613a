//! SQLite persistence for users and documents.
//!
//! Repositories are thin wrappers around a shared [`SqlitePool`]; each method
//! is one statement (or one short transaction) so that every write is atomic
//! on its own. Counter updates are expressed as `col = col + ?` in SQL, never
//! as read-modify-write in Rust.

mod documents;
mod users;

pub use documents::DocumentRepository;
pub use users::UserRepository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Open (creating if needed) the database at `url` and apply migrations.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    info!(url, "Database ready");
    Ok(pool)
}

/// A private in-memory database, migrated. Every connection to
/// `sqlite::memory:` is a separate database, so the pool holds exactly one
/// and never recycles it.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
