use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::ConnectOptions;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod events;
pub mod settings;

pub use settings::{DbPing, RemoteParams, SettingsBackend, SettingsStore, StoreRead, StoreWrite};

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedded database error: {0}")]
    Embedded(#[from] sqlx::Error),

    #[error("remote database error: {0}")]
    Remote(String),

    #[error("remote database did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("fallback file error: {0}")]
    Fallback(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Open a fresh connection to the embedded database file, creating it if
/// needed. There is no long-lived pool: every call owns its connection.
pub async fn open_embedded(path: &Path) -> Result<SqliteConnection, sqlx::Error> {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT)
        .connect()
        .await
}
