use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    Pool, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

use crate::database::Result;

// State database connection pool type
pub type DbPool = Pool<Sqlite>;

// Concurrent writers wait this long for the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the shared state database, running migrations if necessary
pub async fn init_state_db(url: &str) -> Result<DbPool> {
    // Create database if it doesn't exist
    if !Sqlite::database_exists(url).await.unwrap_or(false) {
        Sqlite::create_database(url).await?;
    }

    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!(url, "state database ready");
    Ok(pool)
}
