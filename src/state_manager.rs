// src/state_manager.rs

use crate::models::{DownloadSession, LifecycleState};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Durable records that must survive process and device restarts: one
/// lifecycle row per device and one row per download session, keyed by the
/// target checksum. Rows hold JSON documents.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the database file and its tables.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS lifecycle (
                        device          TEXT PRIMARY KEY,
                        state_data      TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS sessions (
                        checksum        TEXT PRIMARY KEY,
                        session_data    TEXT NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn save_lifecycle(&self, device: &str, state: &LifecycleState) -> Result<(), StateError> {
        let state_data = serde_json::to_string(state)?;
        let device = device.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO lifecycle (device, state_data) VALUES (?1, ?2)",
                    params![device, state_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_lifecycle(&self, device: &str) -> Result<Option<LifecycleState>, StateError> {
        let device = device.to_string();
        let data = self
            .conn
            .call(move |conn| {
                let data = conn
                    .query_row(
                        "SELECT state_data FROM lifecycle WHERE device = ?1",
                        params![device],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;
        decode(data)
    }

    /// Saves (inserts or updates) a session under its checksum.
    pub async fn save_session(&self, session: &DownloadSession) -> Result<(), StateError> {
        let session_data = serde_json::to_string(session)?;
        let key = session.key().to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions (checksum, session_data) VALUES (?1, ?2)",
                    params![key, session_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_session(&self, key: &str) -> Result<Option<DownloadSession>, StateError> {
        let key = key.to_string();
        let data = self
            .conn
            .call(move |conn| {
                let data = conn
                    .query_row(
                        "SELECT session_data FROM sessions WHERE checksum = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;
        decode(data)
    }

    pub async fn load_all_sessions(&self) -> Result<Vec<DownloadSession>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT session_data FROM sessions")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StateError::from))
            .collect()
    }

    pub async fn delete_session(&self, key: &str) -> Result<(), StateError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM sessions WHERE checksum = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(data: Option<String>) -> Result<Option<T>, StateError> {
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}
