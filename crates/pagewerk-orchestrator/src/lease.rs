// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-document leases.
//
// A lease is a durable row `document id -> holder job id + expiry`. It is the
// only thing that serialises jobs targeting the same document. Any replica
// may take over a lease once it has expired; a holder that finds its lease
// gone must stop.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{DocumentId, JobId};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, instrument};

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS leases (
        document_id TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
"#;

fn db_err(e: rusqlite::Error) -> PagewerkError {
    PagewerkError::Database(e.to_string())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> i64 {
    now.timestamp_millis().saturating_add(ttl.as_millis() as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub document_id: DocumentId,
    pub holder: JobId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct LeaseStore {
    conn: Mutex<Connection>,
}

impl LeaseStore {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;
        info!("lease database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PagewerkError::Database("lease store connection poisoned".into()))
    }

    /// Take the lease on `document` for `holder`.
    ///
    /// Succeeds when no lease exists, the current one has expired, or
    /// `holder` already holds it (in which case it is extended).
    #[instrument(skip(self), fields(document_id = %document, holder = %holder))]
    pub fn acquire(&self, document: &DocumentId, holder: &JobId, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "INSERT INTO leases (document_id, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (document_id) DO UPDATE
                     SET holder = excluded.holder, expires_at = excluded.expires_at
                     WHERE leases.expires_at <= ?4 OR leases.holder = excluded.holder",
                params![
                    document.to_string(),
                    holder.to_string(),
                    expiry(now, ttl),
                    now.timestamp_millis()
                ],
            )
            .map_err(db_err)?;
        if rows == 1 {
            debug!("lease acquired");
        }
        Ok(rows == 1)
    }

    /// Extend a lease still held by `holder`. `false` means it was lost.
    pub fn renew(&self, document: &DocumentId, holder: &JobId, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE leases SET expires_at = ?1 WHERE document_id = ?2 AND holder = ?3",
                params![expiry(now, ttl), document.to_string(), holder.to_string()],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    /// Drop the lease if `holder` still has it.
    pub fn release(&self, document: &DocumentId, holder: &JobId) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM leases WHERE document_id = ?1 AND holder = ?2",
                params![document.to_string(), holder.to_string()],
            )
            .map_err(db_err)?;
        if rows == 1 {
            debug!(document_id = %document, holder = %holder, "lease released");
        }
        Ok(rows == 1)
    }

    pub fn get(&self, document: &DocumentId) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE document_id = ?1",
                params![document.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((holder, expires_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Lease {
            document_id: *document,
            holder: holder.parse()?,
            expires_at: DateTime::<Utc>::from_timestamp_millis(expires_at)
                .ok_or_else(|| PagewerkError::Database(format!("bad lease expiry {expires_at}")))?,
        }))
    }
}
