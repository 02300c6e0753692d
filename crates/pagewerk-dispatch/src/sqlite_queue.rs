// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SQLite-backed queue transport.
//
// Messages survive process restarts. A received message is hidden until
// `visible_at`; if it is neither acked nor nacked by then it becomes visible
// again and is redelivered with a fresh receipt.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagewerk_core::error::{PagewerkError, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::transport::{DeadLetter, Delivery, DeliveryToken, QueueDepth, QueueTransport};

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        visible_at INTEGER NOT NULL,
        delivery_count INTEGER NOT NULL DEFAULT 0,
        receipt TEXT,
        enqueued_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_ready ON messages (queue, visible_at, id);
    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        delivery_count INTEGER NOT NULL,
        reason TEXT NOT NULL,
        dead_at TEXT NOT NULL
    );
"#;

fn db_err(e: rusqlite::Error) -> PagewerkError {
    PagewerkError::Queue(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Durable at-least-once queue in a single SQLite database.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    max_deliveries: u32,
}

impl SqliteQueue {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, max_deliveries: u32) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        info!(max_deliveries, "queue database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_deliveries,
        })
    }

    pub fn open_in_memory(max_deliveries: u32) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(db_err)?;
        debug!("in-memory queue database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_deliveries,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PagewerkError::Queue("queue connection poisoned".into()))
    }
}

/// Move message `id` to the dead-letter store.
fn bury(conn: &Connection, id: i64, reason: &str) -> Result<bool> {
    let moved = conn
        .execute(
            "INSERT INTO dead_letters (queue, payload, delivery_count, reason, dead_at)
             SELECT queue, payload, delivery_count, ?2, ?3 FROM messages WHERE id = ?1",
            params![id, reason, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
        .map_err(db_err)?;
    Ok(moved == 1)
}

#[async_trait]
impl QueueTransport for SqliteQueue {
    async fn publish(&self, queue: &str, payload: &str, delay: Duration) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (queue, payload, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                queue,
                payload,
                now_ms().saturating_add(millis(delay)),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        debug!(queue, delay_ms = millis(delay), "message published");
        Ok(())
    }

    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now = now_ms();

        loop {
            let next: Option<(i64, String, u32)> = tx
                .query_row(
                    "SELECT id, payload, delivery_count FROM messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY visible_at, id LIMIT 1",
                    params![queue, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(db_err)?;

            let Some((id, payload, delivered)) = next else {
                tx.commit().map_err(db_err)?;
                return Ok(None);
            };

            if delivered >= self.max_deliveries {
                warn!(queue, message_id = id, delivered, "delivery limit reached, dead-lettering");
                bury(&tx, id, &format!("delivered {delivered} times without acknowledgement"))?;
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE messages SET delivery_count = delivery_count + 1,
                        visible_at = ?2, receipt = ?3
                 WHERE id = ?1",
                params![id, now.saturating_add(millis(visibility)), receipt],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            return Ok(Some(Delivery {
                token: DeliveryToken {
                    message_id: id,
                    receipt,
                },
                payload,
                delivery_count: delivered + 1,
            }));
        }
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM messages WHERE id = ?1 AND receipt = ?2",
                params![token.message_id, token.receipt],
            )
            .map_err(db_err)?;
        if rows == 0 {
            debug!(%token, "ack with stale token ignored");
        }
        Ok(rows == 1)
    }

    async fn nack(&self, token: &DeliveryToken, delay: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE messages SET visible_at = ?3, receipt = NULL
                 WHERE id = ?1 AND receipt = ?2",
                params![
                    token.message_id,
                    token.receipt,
                    now_ms().saturating_add(millis(delay))
                ],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    async fn reject(&self, token: &DeliveryToken, reason: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT receipt FROM messages WHERE id = ?1",
                params![token.message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .flatten();
        if current.as_deref() != Some(token.receipt.as_str()) {
            return Ok(false);
        }
        let moved = bury(&tx, token.message_id, reason)?;
        tx.commit().map_err(db_err)?;
        warn!(%token, reason, "message rejected to dead letters");
        Ok(moved)
    }

    async fn drain_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let rows: Vec<(i64, DeadLetter)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, queue, payload, delivery_count, reason, dead_at
                     FROM dead_letters WHERE queue = ?1 ORDER BY id LIMIT ?2",
                )
                .map_err(db_err)?;
            stmt.query_map(params![queue, limit as i64], |row| {
                let dead_at: String = row.get(5)?;
                let dead_at = DateTime::parse_from_rfc3339(&dead_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            5,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                Ok((
                    row.get(0)?,
                    DeadLetter {
                        queue: row.get(1)?,
                        payload: row.get(2)?,
                        delivery_count: row.get(3)?,
                        reason: row.get(4)?,
                        dead_at,
                    },
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?
        };
        for (id, _) in &rows {
            tx.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(rows.into_iter().map(|(_, letter)| letter).collect())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let conn = self.conn()?;
        let (ready, pending): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(visible_at <= ?2), 0), COALESCE(SUM(visible_at > ?2), 0)
                 FROM messages WHERE queue = ?1",
                params![queue, now_ms()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        let dead: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(QueueDepth {
            ready: ready as u64,
            pending: pending as u64,
            dead: dead as u64,
        })
    }
}
