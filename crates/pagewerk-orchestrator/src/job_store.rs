// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable job and step records backed by SQLite.
//
// Schema:
//   jobs(
//     id                TEXT    PRIMARY KEY,
//     target            TEXT    NOT NULL,
//     operations        TEXT    NOT NULL,   -- JSON array of Operation
//     state             TEXT    NOT NULL,   -- pending | running | succeeded | failed | cancelled
//     cursor            INTEGER NOT NULL,
//     document_version  INTEGER NOT NULL,
//     cancel_requested  INTEGER NOT NULL,
//     derived_documents TEXT    NOT NULL,   -- JSON array of document ids
//     outcome           TEXT,               -- JSON JobOutcome
//     error             TEXT,               -- JSON JobError
//     created_at        TEXT    NOT NULL,   -- RFC 3339
//     updated_at        TEXT    NOT NULL,
//     revision          INTEGER NOT NULL    -- bumped on every update
//   )
//   steps(job_id, step_index, operation, input_document, input_version,
//         attempt, deadline_ms, status, committed_version)
//   step_attempts(
//     id          INTEGER PRIMARY KEY AUTOINCREMENT,   -- append-only
//     job_id, step_index, attempt, outcome, error_kind, message, recorded_at
//   )
//
// Job rows are only ever updated with a compare-and-set on `revision`, so a
// writer holding a stale copy (an old cursor, a missed cancellation request)
// loses and has to re-read.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{ErrorKind, Job, JobId, JobState, Step, StepKey, StepStatus, Version};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        target TEXT NOT NULL,
        operations TEXT NOT NULL,
        state TEXT NOT NULL,
        cursor INTEGER NOT NULL,
        document_version INTEGER NOT NULL,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        derived_documents TEXT NOT NULL DEFAULT '[]',
        outcome TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS jobs_by_state ON jobs (state);
    CREATE TABLE IF NOT EXISTS steps (
        job_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        operation TEXT NOT NULL,
        input_document TEXT NOT NULL,
        input_version INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        deadline_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        committed_version INTEGER,
        PRIMARY KEY (job_id, step_index)
    );
    CREATE TABLE IF NOT EXISTS step_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        error_kind TEXT,
        message TEXT,
        recorded_at TEXT NOT NULL
    );
"#;

const JOB_COLUMNS: &str = "id, target, operations, state, cursor, document_version, \
     cancel_requested, derived_documents, outcome, error, created_at, updated_at, revision";

const STEP_COLUMNS: &str = "job_id, step_index, operation, input_document, input_version, \
     attempt, deadline_ms, status, committed_version";

fn db_err(e: rusqlite::Error) -> PagewerkError {
    PagewerkError::Database(e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PagewerkError::Database(format!("bad timestamp {s:?}: {e}")))
}

fn step_status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Dispatched => "dispatched",
        StepStatus::Committed => "committed",
        StepStatus::Failed => "failed",
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus> {
    match s {
        "dispatched" => Ok(StepStatus::Dispatched),
        "committed" => Ok(StepStatus::Committed),
        "failed" => Ok(StepStatus::Failed),
        other => Err(PagewerkError::Database(format!("unknown step status {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Attempt log types
// ---------------------------------------------------------------------------

/// What happened to one attempt of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "dispatched" => Ok(Self::Dispatched),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(PagewerkError::Database(format!("unknown attempt outcome {other:?}"))),
        }
    }
}

/// One row of the append-only attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub step_index: u32,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Raw column values of a `jobs` row, decoded outside the rusqlite closure
/// so JSON and enum errors surface as `PagewerkError`.
struct JobRow {
    id: String,
    target: String,
    operations: String,
    state: String,
    cursor: i64,
    document_version: i64,
    cancel_requested: bool,
    derived_documents: String,
    outcome: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    revision: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            operations: row.get(2)?,
            state: row.get(3)?,
            cursor: row.get(4)?,
            document_version: row.get(5)?,
            cancel_requested: row.get(6)?,
            derived_documents: row.get(7)?,
            outcome: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            revision: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id.parse()?,
            target: self.target.parse()?,
            operations: serde_json::from_str(&self.operations)?,
            state: self.state.parse()?,
            cursor: self.cursor as u32,
            document_version: self.document_version as Version,
            cancel_requested: self.cancel_requested,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            derived_documents: serde_json::from_str(&self.derived_documents)?,
            outcome: self.outcome.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            revision: self.revision as u64,
        })
    }
}

struct StepRow {
    job_id: String,
    step_index: i64,
    operation: String,
    input_document: String,
    input_version: i64,
    attempt: i64,
    deadline_ms: i64,
    status: String,
    committed_version: Option<i64>,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            step_index: row.get(1)?,
            operation: row.get(2)?,
            input_document: row.get(3)?,
            input_version: row.get(4)?,
            attempt: row.get(5)?,
            deadline_ms: row.get(6)?,
            status: row.get(7)?,
            committed_version: row.get(8)?,
        })
    }

    fn into_step(self) -> Result<Step> {
        Ok(Step {
            key: StepKey::new(self.job_id.parse()?, self.step_index as u32),
            operation: serde_json::from_str(&self.operation)?,
            input_document: self.input_document.parse()?,
            input_version: self.input_version as Version,
            attempt: self.attempt as u32,
            deadline: DateTime::<Utc>::from_timestamp_millis(self.deadline_ms)
                .ok_or_else(|| PagewerkError::Database(format!("bad deadline {}", self.deadline_ms)))?,
            status: parse_step_status(&self.status)?,
            committed_version: self.committed_version.map(|v| v as Version),
        })
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Durable job, step and attempt records.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        info!("job database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        debug!("in-memory job database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PagewerkError::Database("job store connection poisoned".into()))
    }

    // -- Jobs ------------------------------------------------------------------

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                job.id.to_string(),
                job.target.to_string(),
                serde_json::to_string(&job.operations)?,
                job.state.as_str(),
                job.cursor,
                job.document_version as i64,
                job.cancel_requested,
                serde_json::to_string(&job.derived_documents)?,
                job.outcome.as_ref().map(serde_json::to_string).transpose()?,
                job.error.as_ref().map(serde_json::to_string).transpose()?,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.revision as i64,
            ],
        )
        .map_err(db_err)?;
        debug!("job inserted");
        Ok(())
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                JobRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.ok_or_else(|| PagewerkError::JobNotFound(id.to_string()))?
            .into_job()
    }

    /// Persist `job` only if the stored row is still at `job.revision`.
    ///
    /// `from` is the state `job` was read in. Returns `false` when another
    /// writer got there first; on success `job.revision` is advanced to match
    /// the stored row.
    #[instrument(skip(self, job), fields(job_id = %job.id, from = %from, to = %job.state))]
    pub fn update_if(&self, job: &mut Job, from: JobState) -> Result<bool> {
        if from != job.state && !from.can_transition_to(job.state) {
            return Err(PagewerkError::InvalidTransition(format!(
                "job {}: {from} -> {}",
                job.id, job.state
            )));
        }
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, cursor = ?2, document_version = ?3,
                     cancel_requested = ?4, derived_documents = ?5, outcome = ?6,
                     error = ?7, updated_at = ?8, revision = revision + 1
                 WHERE id = ?9 AND revision = ?10",
                params![
                    job.state.as_str(),
                    job.cursor,
                    job.document_version as i64,
                    job.cancel_requested,
                    serde_json::to_string(&job.derived_documents)?,
                    job.outcome.as_ref().map(serde_json::to_string).transpose()?,
                    job.error.as_ref().map(serde_json::to_string).transpose()?,
                    job.updated_at.to_rfc3339(),
                    job.id.to_string(),
                    job.revision as i64,
                ],
            )
            .map_err(db_err)?;
        if rows == 0 {
            debug!(revision = job.revision, "job row changed underneath us");
            return Ok(false);
        }
        job.revision += 1;
        Ok(true)
    }

    /// Jobs in `state`, oldest first.
    pub fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY rowid"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![state.as_str()], JobRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub fn count_by_state(&self) -> Result<Vec<(JobState, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(state, n)| Ok((state.parse()?, n as u64)))
            .collect()
    }

    // -- Steps -----------------------------------------------------------------

    /// Insert or replace the runtime record of a step.
    pub fn put_step(&self, step: &Step) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                step.key.job_id.to_string(),
                step.key.step_index,
                serde_json::to_string(&step.operation)?,
                step.input_document.to_string(),
                step.input_version as i64,
                step.attempt,
                step.deadline.timestamp_millis(),
                step_status_str(step.status),
                step.committed_version.map(|v| v as i64),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn step(&self, key: &StepKey) -> Result<Option<Step>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE job_id = ?1 AND step_index = ?2"),
                params![key.job_id.to_string(), key.step_index],
                StepRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(StepRow::into_step).transpose()
    }

    pub fn set_step_status(&self, key: &StepKey, status: StepStatus, committed: Option<Version>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE steps SET status = ?1, committed_version = ?2 WHERE job_id = ?3 AND step_index = ?4",
            params![
                step_status_str(status),
                committed.map(|v| v as i64),
                key.job_id.to_string(),
                key.step_index
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Dispatched steps whose deadline is at or before `now`.
    pub fn expired_steps(&self, now: DateTime<Utc>) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps
                 WHERE status = 'dispatched' AND deadline_ms <= ?1 ORDER BY deadline_ms"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now.timestamp_millis()], StepRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    // -- Attempt log -----------------------------------------------------------

    pub fn record_attempt(
        &self,
        key: &StepKey,
        attempt: u32,
        outcome: AttemptOutcome,
        error: Option<(ErrorKind, &str)>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let (kind, message) = match error {
            Some((kind, message)) => (Some(serde_json::to_string(&kind)?), Some(message)),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO step_attempts (job_id, step_index, attempt, outcome, error_kind, message, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.job_id.to_string(),
                key.step_index,
                attempt,
                outcome.as_str(),
                kind,
                message,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        debug!(step = %key, attempt, outcome = outcome.as_str(), "attempt recorded");
        Ok(())
    }

    /// Full attempt history of a job, in the order it was recorded.
    pub fn attempts(&self, job_id: &JobId) -> Result<Vec<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT step_index, attempt, outcome, error_kind, message, recorded_at
                 FROM step_attempts WHERE job_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(step_index, attempt, outcome, kind, message, at)| {
                Ok(AttemptRecord {
                    step_index: step_index as u32,
                    attempt: attempt as u32,
                    outcome: AttemptOutcome::parse(&outcome)?,
                    error_kind: kind.as_deref().map(serde_json::from_str).transpose()?,
                    message,
                    recorded_at: parse_time(&at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewerk_core::{DocumentId, JobError, Operation, PageId};

    fn job() -> Job {
        Job::new(
            DocumentId::new(),
            vec![
                Operation::Delete {
                    pages: vec![PageId::new()],
                },
                Operation::Split { boundaries: vec![1] },
            ],
            1,
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = JobStore::open_in_memory().expect("open");
        let job = job();
        store.insert(&job).expect("insert");
        let loaded = store.get(&job.id).expect("get");
        assert_eq!(loaded.operations, job.operations);
        assert_eq!(loaded.state, JobState::Pending);
        assert_eq!(loaded.target, job.target);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = JobStore::open_in_memory().expect("open");
        assert!(matches!(
            store.get(&JobId::new()),
            Err(PagewerkError::JobNotFound(_))
        ));
    }

    #[test]
    fn update_if_is_compare_and_set() {
        let store = JobStore::open_in_memory().expect("open");
        let mut job = job();
        store.insert(&job).expect("insert");
        let mut stale = job.clone();

        job.state = JobState::Running;
        assert!(store.update_if(&mut job, JobState::Pending).expect("first"));
        assert_eq!(job.revision, 1);
        // A second writer still holding the pending copy loses.
        stale.state = JobState::Cancelled;
        assert!(!store.update_if(&mut stale, JobState::Pending).expect("second"));
        assert_eq!(stale.revision, 0);

        job.cursor = 1;
        job.document_version = 2;
        assert!(store.update_if(&mut job, JobState::Running).expect("advance"));
        let loaded = store.get(&job.id).expect("get");
        assert_eq!(loaded.cursor, 1);
        assert_eq!(loaded.document_version, 2);
        assert_eq!(loaded.revision, 2);
    }

    #[test]
    fn flag_only_update_invalidates_older_copies() {
        let store = JobStore::open_in_memory().expect("open");
        let mut job = job();
        store.insert(&job).expect("insert");
        job.state = JobState::Running;
        assert!(store.update_if(&mut job, JobState::Pending).expect("start"));

        let mut before_cancel = store.get(&job.id).expect("get");
        let mut cancelling = before_cancel.clone();
        cancelling.cancel_requested = true;
        assert!(store.update_if(&mut cancelling, JobState::Running).expect("cancel"));

        // Same state and cursor, but the copy predates the cancellation.
        before_cancel.cursor = 1;
        assert!(!store.update_if(&mut before_cancel, JobState::Running).expect("stale advance"));
        let loaded = store.get(&job.id).expect("get");
        assert!(loaded.cancel_requested);
        assert_eq!(loaded.cursor, 0);
    }

    #[test]
    fn terminal_states_cannot_be_left() {
        let store = JobStore::open_in_memory().expect("open");
        let mut job = job();
        job.state = JobState::Running;
        assert!(matches!(
            store.update_if(&mut job, JobState::Failed),
            Err(PagewerkError::InvalidTransition(_))
        ));
    }

    #[test]
    fn failed_job_keeps_its_error() {
        let store = JobStore::open_in_memory().expect("open");
        let mut job = job();
        store.insert(&job).expect("insert");
        job.state = JobState::Running;
        assert!(store.update_if(&mut job, JobState::Pending).expect("start"));
        job.state = JobState::Failed;
        job.error = Some(JobError {
            step_index: Some(1),
            kind: ErrorKind::PermanentOperation,
            message: "boom".into(),
        });
        assert!(store.update_if(&mut job, JobState::Running).expect("update"));
        assert_eq!(store.get(&job.id).expect("get").error, job.error);
        assert_eq!(store.count_by_state().expect("count"), vec![(JobState::Failed, 1)]);
    }

    #[test]
    fn jobs_in_state_are_oldest_first() {
        let store = JobStore::open_in_memory().expect("open");
        let first = job();
        let second = job();
        store.insert(&first).expect("insert");
        store.insert(&second).expect("insert");
        let pending: Vec<JobId> = store
            .jobs_in_state(JobState::Pending)
            .expect("pending")
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(pending, vec![first.id, second.id]);
    }

    #[test]
    fn expired_steps_only_returns_dispatched_past_deadline() {
        let store = JobStore::open_in_memory().expect("open");
        let job = job();
        let now = Utc::now();
        let mut step = Step {
            key: StepKey::new(job.id, 0),
            operation: job.operations[0].clone(),
            input_document: job.target,
            input_version: 1,
            attempt: 1,
            deadline: now - chrono::Duration::seconds(1),
            status: StepStatus::Dispatched,
            committed_version: None,
        };
        store.put_step(&step).expect("put");
        assert_eq!(store.expired_steps(now).expect("expired").len(), 1);

        step.attempt = 2;
        step.deadline = now + chrono::Duration::minutes(5);
        store.put_step(&step).expect("replace");
        assert!(store.expired_steps(now).expect("expired").is_empty());
        assert_eq!(store.step(&step.key).expect("step").expect("present").attempt, 2);

        store
            .set_step_status(&step.key, StepStatus::Committed, Some(2))
            .expect("status");
        let stored = store.step(&step.key).expect("step").expect("present");
        assert_eq!(stored.status, StepStatus::Committed);
        assert_eq!(stored.committed_version, Some(2));
    }

    #[test]
    fn attempt_log_is_append_only_and_ordered() {
        let store = JobStore::open_in_memory().expect("open");
        let key = StepKey::new(JobId::new(), 0);
        store
            .record_attempt(&key, 1, AttemptOutcome::Dispatched, None)
            .expect("record");
        store
            .record_attempt(&key, 1, AttemptOutcome::Failed, Some((ErrorKind::TransientWorker, "timeout")))
            .expect("record");
        store
            .record_attempt(&key, 2, AttemptOutcome::Succeeded, None)
            .expect("record");

        let log = store.attempts(&key.job_id).expect("attempts");
        let outcomes: Vec<_> = log.iter().map(|r| (r.attempt, r.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (1, AttemptOutcome::Dispatched),
                (1, AttemptOutcome::Failed),
                (2, AttemptOutcome::Succeeded)
            ]
        );
        assert_eq!(log[1].error_kind, Some(ErrorKind::TransientWorker));
        assert_eq!(log[1].message.as_deref(), Some("timeout"));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");
        let job = job();
        JobStore::open(&path).expect("open").insert(&job).expect("insert");
        let reopened = JobStore::open(&path).expect("reopen");
        assert_eq!(reopened.get(&job.id).expect("get").id, job.id);
    }
}
