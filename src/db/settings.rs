//! Settings Store: a flat key/value namespace with merge-upsert writes.
//!
//! The caller names the backend on every call; nothing is remembered between
//! calls. Values are stored as JSON text and handed back parsed, or as the
//! raw string when the text is not JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::SqliteConnection;
use sqlx::{ConnectOptions, Connection};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{open_embedded, StoreError};
use crate::config::SettingsConfig;

const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

const BACKEND_SQLITE: &str = "sqlite";
const BACKEND_POSTGRES: &str = "postgres";
const BACKEND_JSON: &str = "json";

static FALLBACK_TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Which backend a call targets.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SettingsBackend {
    #[default]
    #[serde(alias = "sqlite", alias = "embedded")]
    Local,
    #[serde(alias = "remote", alias = "postgresql")]
    Postgres(RemoteParams),
}

#[derive(Clone, Deserialize)]
pub struct RemoteParams {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(alias = "db")]
    pub database: String,
    #[serde(alias = "username")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_pg_port() -> u16 { 5432 }

impl fmt::Debug for RemoteParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreRead {
    pub backend: &'static str,
    /// True when the JSON fallback answered instead of the requested backend.
    pub degraded: bool,
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreWrite {
    pub ok: bool,
    pub backend: &'static str,
    pub degraded: bool,
    pub written: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPing {
    pub ok: bool,
    pub backend: &'static str,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SettingsStore {
    db_path: PathBuf,
    fallback_path: PathBuf,
    embedded_enabled: bool,
    remote_timeout: Duration,
}

impl SettingsStore {
    pub fn new(
        db_path: impl Into<PathBuf>,
        fallback_path: impl Into<PathBuf>,
        embedded_enabled: bool,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            fallback_path: fallback_path.into(),
            embedded_enabled,
            remote_timeout,
        }
    }

    pub fn from_config(cfg: &SettingsConfig) -> Self {
        Self::new(
            cfg.db_path.clone(),
            cfg.fallback_path.clone(),
            cfg.embedded_enabled,
            cfg.remote_connect_timeout(),
        )
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn read_all(&self, backend: &SettingsBackend) -> Result<StoreRead, StoreError> {
        match backend {
            SettingsBackend::Local => match self.embedded_conn().await {
                Some(conn) => {
                    let values = embedded_read(conn).await?;
                    Ok(StoreRead { backend: BACKEND_SQLITE, degraded: false, values })
                }
                None => Ok(StoreRead {
                    backend: BACKEND_JSON,
                    degraded: true,
                    values: fallback_read(&self.fallback_path).await,
                }),
            },
            SettingsBackend::Postgres(params) => {
                let values = self
                    .with_deadline(async {
                        let mut conn = self.remote_connect(params).await?;
                        let result = remote_read(&mut conn).await;
                        close_remote(conn).await;
                        result
                    })
                    .await?;
                Ok(StoreRead { backend: BACKEND_POSTGRES, degraded: false, values })
            }
        }
    }

    /// Merge `patch` into the store: patched keys are replaced, new keys
    /// added, everything else left alone. The JSON file is used only when the
    /// embedded database cannot be opened at all; a failed write on an open
    /// database is an error, so reads and writes never split across files.
    pub async fn write(&self, backend: &SettingsBackend, patch: &Map<String, Value>) -> Result<StoreWrite, StoreError> {
        match backend {
            SettingsBackend::Local => match self.embedded_conn().await {
                Some(conn) => {
                    embedded_write(conn, patch).await?;
                    tracing::debug!("Wrote {} settings keys to {}", patch.len(), self.db_path.display());
                    Ok(StoreWrite { ok: true, backend: BACKEND_SQLITE, degraded: false, written: patch.len() })
                }
                None => {
                    fallback_write(&self.fallback_path, patch).await?;
                    Ok(StoreWrite { ok: true, backend: BACKEND_JSON, degraded: true, written: patch.len() })
                }
            },
            SettingsBackend::Postgres(params) => {
                self.with_deadline(async {
                    let mut conn = self.remote_connect(params).await?;
                    let result = remote_write(&mut conn, patch).await;
                    close_remote(conn).await;
                    result
                })
                .await?;
                Ok(StoreWrite { ok: true, backend: BACKEND_POSTGRES, degraded: false, written: patch.len() })
            }
        }
    }

    /// Liveness check. Never fails: problems come back as `ok: false`.
    pub async fn ping(&self, backend: &SettingsBackend) -> DbPing {
        let started = Instant::now();
        match backend {
            SettingsBackend::Local => {
                let result = if self.embedded_enabled {
                    self.embedded_version().await.map_err(|e| e.to_string())
                } else {
                    Err("embedded database disabled".to_string())
                };
                let (ok, version, error) = match result {
                    Ok(v) => (true, Some(v), None),
                    Err(e) => (false, None, Some(e)),
                };
                DbPing {
                    ok,
                    backend: BACKEND_SQLITE,
                    latency_ms: started.elapsed().as_millis() as u64,
                    version,
                    error,
                }
            }
            SettingsBackend::Postgres(params) => {
                let result = self
                    .with_deadline(async {
                        let mut conn = self.remote_connect(params).await?;
                        let v = sqlx::query_scalar::<_, String>("SELECT version()")
                            .fetch_one(&mut conn)
                            .await
                            .map_err(|e| StoreError::Remote(e.to_string()));
                        close_remote(conn).await;
                        v
                    })
                    .await;
                let latency_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(version) => DbPing { ok: true, backend: BACKEND_POSTGRES, latency_ms, version: Some(version), error: None },
                    Err(e) => {
                        tracing::warn!("Remote settings backend {}:{} unreachable: {}", params.host, params.port, e);
                        DbPing { ok: false, backend: BACKEND_POSTGRES, latency_ms, version: None, error: Some(e.to_string()) }
                    }
                }
            }
        }
    }

    /// Open connection to the embedded database, or `None` when it is
    /// disabled or cannot be opened. Only `None` selects the JSON fallback.
    async fn embedded_conn(&self) -> Option<SqliteConnection> {
        if !self.embedded_enabled {
            return None;
        }
        match open_embedded(&self.db_path).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(
                    "Embedded settings database {} unavailable, using JSON fallback: {}",
                    self.db_path.display(),
                    e
                );
                None
            }
        }
    }

    async fn embedded_version(&self) -> Result<String, sqlx::Error> {
        let mut conn = open_embedded(&self.db_path).await?;
        sqlx::query(CREATE_TABLE).execute(&mut conn).await?;
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        Ok(format!("SQLite {version}"))
    }

    /// Bound a whole remote operation (connect, statements, close) by the
    /// configured timeout. On expiry the connection is dropped unclosed.
    async fn with_deadline<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.remote_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.remote_timeout))?
    }

    async fn remote_connect(&self, params: &RemoteParams) -> Result<PgConnection, StoreError> {
        let opts = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .database(&params.database)
            .username(&params.user)
            .password(&params.password);

        let mut conn = opts
            .connect()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        let created = sqlx::query(CREATE_TABLE).execute(&mut conn).await;
        if let Err(e) = created {
            close_remote(conn).await;
            return Err(StoreError::Remote(e.to_string()));
        }
        Ok(conn)
    }
}

async fn embedded_read(mut conn: SqliteConnection) -> Result<Map<String, Value>, sqlx::Error> {
    sqlx::query(CREATE_TABLE).execute(&mut conn).await?;
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(&mut conn)
        .await?;
    conn.close().await?;
    Ok(rows_to_map(rows))
}

async fn embedded_write(mut conn: SqliteConnection, patch: &Map<String, Value>) -> Result<(), StoreError> {
    sqlx::query(CREATE_TABLE).execute(&mut conn).await?;

    let mut tx = conn.begin().await?;
    for (key, value) in patch {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    conn.close().await?;
    Ok(())
}

async fn remote_read(conn: &mut PgConnection) -> Result<Map<String, Value>, StoreError> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::Remote(e.to_string()))?;
    Ok(rows_to_map(rows))
}

async fn remote_write(conn: &mut PgConnection, patch: &Map<String, Value>) -> Result<(), StoreError> {
    let remote = |e: sqlx::Error| StoreError::Remote(e.to_string());
    let mut tx = conn.begin().await.map_err(remote)?;
    for (key, value) in patch {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&mut *tx)
        .await
        .map_err(remote)?;
    }
    tx.commit().await.map_err(remote)
}

async fn close_remote(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!("Closing remote settings connection failed: {}", e);
    }
}

fn rows_to_map(rows: Vec<(String, String)>) -> Map<String, Value> {
    rows.into_iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(&v).unwrap_or(Value::String(v));
            (k, value)
        })
        .collect()
}

/// Any failure reads as an empty map.
async fn fallback_read(path: &Path) -> Map<String, Value> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
            Map::new()
        }),
        Err(_) => Map::new(),
    }
}

/// Read-modify-write. Concurrent writers on this path can lose updates.
async fn fallback_write(path: &Path, patch: &Map<String, Value>) -> Result<(), StoreError> {
    let mut current = fallback_read(path).await;
    for (k, v) in patch {
        current.insert(k.clone(), v.clone());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Unique per writer so racing writers never share a temp file.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.{}.tmp", std::process::id(), FALLBACK_TMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(&current)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
