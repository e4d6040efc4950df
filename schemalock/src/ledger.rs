use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::Row;
use crate::error::DbError;

/// One applied migration, as stored in the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Script name, relative to the migration source.
    pub name: String,
    /// When execution of the script started.
    pub started_at: DateTime<Utc>,
    /// How long the script took to run, in milliseconds.
    pub duration_ms: i64,
    /// [`checksum`] of the script text that was executed.
    pub checksum: String,
}

impl MigrationRecord {
    /// Reads a row of `name, started_at, duration_ms, checksum`.
    pub fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            name: row.get(0)?,
            started_at: row.get(1)?,
            duration_ms: row.get(2)?,
            checksum: row.get::<String>(3)?.trim_end().to_string(),
        })
    }
}

/// SHA-256 of `content`, base64 encoded without padding (43 characters).
pub fn checksum(content: &str) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(content.as_bytes()))
}
