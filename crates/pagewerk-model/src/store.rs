// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page model store backed by SQLite.
//
// Schema:
//   documents(
//     id          TEXT    PRIMARY KEY,
//     version     INTEGER NOT NULL,   -- starts at 1, +1 per commit
//     pages       TEXT    NOT NULL,   -- JSON array of PageRef
//     created_at  TEXT    NOT NULL,   -- RFC 3339
//     updated_at  TEXT    NOT NULL
//   )
//   committed_steps(
//     job_id      TEXT    NOT NULL,
//     step_index  INTEGER NOT NULL,
//     document_id TEXT    NOT NULL,
//     version     INTEGER NOT NULL,   -- version the step produced
//     committed_at TEXT   NOT NULL,
//     PRIMARY KEY (job_id, step_index)
//   )

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{Document, DocumentId, INITIAL_VERSION, PageRef, StepKey, Version};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, instrument};

use crate::mutation::Mutation;

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        pages TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS committed_steps (
        job_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        document_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        committed_at TEXT NOT NULL,
        PRIMARY KEY (job_id, step_index)
    );
"#;

fn db_err(e: rusqlite::Error) -> PagewerkError {
    PagewerkError::Database(e.to_string())
}

/// Result of a successful commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The mutation was applied and produced this version.
    Committed(Version),
    /// The step marker was already present; nothing changed. Carries the
    /// version that step produced the first time.
    AlreadyCommitted(Version),
}

impl CommitOutcome {
    pub fn version(&self) -> Version {
        match self {
            Self::Committed(v) | Self::AlreadyCommitted(v) => *v,
        }
    }
}

/// Durable, versioned page sequences.
pub trait PageModelStore: Send + Sync {
    /// Create a document at [`INITIAL_VERSION`].
    fn create(&self, id: DocumentId, pages: Vec<PageRef>) -> Result<Document>;

    /// Latest committed snapshot; [`PagewerkError::DocumentNotFound`] if absent.
    fn read(&self, id: &DocumentId) -> Result<Document>;

    fn exists(&self, id: &DocumentId) -> Result<bool>;

    /// Optimistically apply `mutate` to the document at `expected` version.
    ///
    /// Fails with [`PagewerkError::Conflict`] when the stored version differs.
    /// When `marker` is given it is recorded in the same transaction; a
    /// marker already present short-circuits to
    /// [`CommitOutcome::AlreadyCommitted`] without calling `mutate`.
    fn commit(
        &self,
        id: &DocumentId,
        expected: Version,
        marker: Option<&StepKey>,
        mutate: &dyn Fn(&[PageRef]) -> Result<Mutation>,
    ) -> Result<CommitOutcome>;

    /// Version produced by a committed step, if it has committed.
    fn committed_version(&self, key: &StepKey) -> Result<Option<Version>>;
}

/// SQLite implementation of [`PageModelStore`].
///
/// The connection sits behind a mutex so the store can be shared across
/// tokio tasks; every call is a short transaction.
pub struct SqlitePageStore {
    conn: Mutex<Connection>,
}

impl SqlitePageStore {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        info!("page model database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        debug!("in-memory page model database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PagewerkError::Database("page store connection poisoned".into()))
    }

    /// Number of stored documents.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

fn read_document(conn: &Connection, id: &DocumentId) -> Result<Option<Document>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, pages FROM documents WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    match row {
        Some((version, pages_json)) => Ok(Some(Document {
            id: *id,
            version: version as Version,
            pages: serde_json::from_str(&pages_json)?,
        })),
        None => Ok(None),
    }
}

fn insert_document(conn: &Connection, id: &DocumentId, pages: &[PageRef]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO documents (id, version, pages, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            id.to_string(),
            INITIAL_VERSION as i64,
            serde_json::to_string(pages)?,
            now
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
            PagewerkError::Validation(format!("document {id} already exists"))
        }
        other => db_err(other),
    })?;
    Ok(())
}

fn marker_version(conn: &Connection, key: &StepKey) -> Result<Option<Version>> {
    conn.query_row(
        "SELECT version FROM committed_steps WHERE job_id = ?1 AND step_index = ?2",
        params![key.job_id.to_string(), key.step_index],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v as Version))
    .map_err(db_err)
}

fn check_unique_ids(pages: &[PageRef]) -> Result<()> {
    let mut seen = HashSet::with_capacity(pages.len());
    match pages.iter().find(|p| !seen.insert(p.id)) {
        Some(dup) => Err(PagewerkError::PermanentOperation(format!(
            "page {} appears twice in the resulting sequence",
            dup.id
        ))),
        None => Ok(()),
    }
}

impl PageModelStore for SqlitePageStore {
    #[instrument(skip(self, pages), fields(document_id = %id, pages = pages.len()))]
    fn create(&self, id: DocumentId, pages: Vec<PageRef>) -> Result<Document> {
        check_unique_ids(&pages)?;
        let conn = self.conn()?;
        insert_document(&conn, &id, &pages)?;
        info!("document created");
        Ok(Document {
            id,
            version: INITIAL_VERSION,
            pages,
        })
    }

    fn read(&self, id: &DocumentId) -> Result<Document> {
        let conn = self.conn()?;
        read_document(&conn, id)?.ok_or_else(|| PagewerkError::DocumentNotFound(id.to_string()))
    }

    fn exists(&self, id: &DocumentId) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM documents WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    #[instrument(skip(self, id, marker, mutate), fields(document_id = %id, step = ?marker))]
    fn commit(
        &self,
        id: &DocumentId,
        expected: Version,
        marker: Option<&StepKey>,
        mutate: &dyn Fn(&[PageRef]) -> Result<Mutation>,
    ) -> Result<CommitOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        if let Some(key) = marker
            && let Some(version) = marker_version(&tx, key)?
        {
            debug!(version, "step already committed");
            return Ok(CommitOutcome::AlreadyCommitted(version));
        }

        let current = read_document(&tx, id)?
            .ok_or_else(|| PagewerkError::DocumentNotFound(id.to_string()))?;
        if current.version != expected {
            debug!(actual = current.version, "version conflict");
            return Err(PagewerkError::Conflict {
                expected,
                actual: current.version,
            });
        }

        let mutation = mutate(&current.pages)?;
        check_unique_ids(&mutation.pages)?;
        let next = expected + 1;
        let now = Utc::now().to_rfc3339();

        let rows = tx
            .execute(
                "UPDATE documents SET version = ?1, pages = ?2, updated_at = ?3
                 WHERE id = ?4 AND version = ?5",
                params![
                    next as i64,
                    serde_json::to_string(&mutation.pages)?,
                    now,
                    id.to_string(),
                    expected as i64
                ],
            )
            .map_err(db_err)?;
        if rows != 1 {
            return Err(PagewerkError::Conflict {
                expected,
                actual: current.version,
            });
        }

        for derived in &mutation.derived {
            check_unique_ids(&derived.pages)?;
            insert_document(&tx, &derived.id, &derived.pages)?;
        }

        if let Some(key) = marker {
            tx.execute(
                "INSERT INTO committed_steps (job_id, step_index, document_id, version, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.job_id.to_string(),
                    key.step_index,
                    id.to_string(),
                    next as i64,
                    now
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        info!(
            version = next,
            pages = mutation.pages.len(),
            derived = mutation.derived.len(),
            "page model committed"
        );
        Ok(CommitOutcome::Committed(next))
    }

    fn committed_version(&self, key: &StepKey) -> Result<Option<Version>> {
        let conn = self.conn()?;
        marker_version(&conn, key)
    }
}
