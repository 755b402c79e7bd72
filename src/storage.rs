use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::credentials::Credentials;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored credential record for role '{role}' is malformed: {reason}")]
    Malformed { role: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Keyed credential persistence. One record per role, upserts are atomic on
/// the role key so sequential initializations can never create duplicates.
pub trait CredentialStore: Send + Sync + 'static {
    fn find_by_key(&self, role: &str) -> Result<Option<Credentials>, StoreError>;
    fn upsert(&self, role: &str, credentials: &Credentials) -> Result<Credentials, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    role         TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    scope        TEXT NOT NULL,
    expires_at   INTEGER NOT NULL,
    obtained_at  INTEGER NOT NULL
);
";

/// Sqlite-backed store. The connection sits behind a mutex; every caller goes
/// through `spawn_blocking` or runs during single-threaded bootstrap, so the
/// lock is never held across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("credential store opened");
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

impl CredentialStore for SqliteStore {
    fn find_by_key(&self, role: &str) -> Result<Option<Credentials>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT access_token, refresh_token, scope, expires_at, obtained_at
                 FROM credentials WHERE role = ?1",
                params![role],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((access_token, refresh_token, scope_json, expires_at, obtained_at)) => {
                let scope = serde_json::from_str(&scope_json).map_err(|e| StoreError::Malformed {
                    role: role.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(Credentials {
                    access_token,
                    refresh_token,
                    scope,
                    expires_at,
                    obtained_at,
                }))
            }
        }
    }

    fn upsert(&self, role: &str, credentials: &Credentials) -> Result<Credentials, StoreError> {
        let scope_json = serde_json::to_string(&credentials.scope).map_err(|e| {
            StoreError::Malformed {
                role: role.to_string(),
                reason: e.to_string(),
            }
        })?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO credentials (role, access_token, refresh_token, scope, expires_at, obtained_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(role) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 scope = excluded.scope,
                 expires_at = excluded.expires_at,
                 obtained_at = excluded.obtained_at",
            params![
                role,
                credentials.access_token,
                credentials.refresh_token,
                scope_json,
                credentials.expires_at,
                credentials.obtained_at,
            ],
        )?;

        Ok(credentials.clone())
    }
}
