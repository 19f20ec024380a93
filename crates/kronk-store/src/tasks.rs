//! Task queue storage. Claim ordering (priority DESC, created_at ASC)
//! and the pending→running transition both live here so every pump
//! worker observes the same rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use kronk_domain::queue::{QueueTask, TaskStatus};
use kronk_domain::{Error, Result};

use crate::{json_err, parse_ts, ts, Store};

const COLS: &str = "id, type, payload, priority, status, retry_count, max_retries, error, \
     result, not_before, created_at, started_at, completed_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<QueueTask> {
    let payload: Option<String> = row.get(2)?;
    let status: String = row.get(4)?;
    let result: Option<String> = row.get(8)?;
    let not_before: Option<String> = row.get(9)?;
    let created: String = row.get(10)?;
    let started: Option<String> = row.get(11)?;
    let completed: Option<String> = row.get(12)?;
    Ok(QueueTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        payload: match payload {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        priority: row.get(3)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        retry_count: row.get::<_, i64>(5)? as u32,
        max_retries: row.get::<_, i64>(6)? as u32,
        error: row.get(7)?,
        result: match result {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        not_before: match not_before {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        created_at: parse_ts(&created)?,
        started_at: match started {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        completed_at: match completed {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
    })
}

impl Store {
    pub fn insert_task(&self, t: &QueueTask) -> Result<()> {
        let payload = t.payload.as_ref().map(serde_json::to_string).transpose()?;
        let result = t.result.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO task_queue ({COLS}) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"),
                params![
                    t.id,
                    t.task_type,
                    payload,
                    t.priority,
                    t.status.as_str(),
                    t.retry_count as i64,
                    t.max_retries as i64,
                    t.error,
                    result,
                    t.not_before.map(ts),
                    ts(t.created_at),
                    t.started_at.map(ts),
                    t.completed_at.map(ts),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<QueueTask>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM task_queue WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Claim the highest-priority eldest pending task whose type is in
    /// `types` and whose backoff window has passed. The pending→running
    /// transition and `started_at` stamp happen in one transaction, so
    /// concurrent pumps can never claim the same row.
    pub fn claim_next_task(
        &self,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>> {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders = (1..=types.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        self.with_transaction(|tx| {
            let sql = format!(
                "SELECT {COLS} FROM task_queue \
                 WHERE status = 'pending' AND type IN ({placeholders}) \
                 AND (not_before IS NULL OR not_before <= ?1) \
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1"
            );
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(ts(now))];
            for t in types {
                values.push(Box::new(t.clone()));
            }
            let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| &**v).collect();
            let task = tx
                .query_row(&sql, refs.as_slice(), row_to_task)
                .optional()?;
            let Some(mut task) = task else {
                return Ok(None);
            };
            let n = tx.execute(
                "UPDATE task_queue SET status = 'running', started_at = ?2 \
                 WHERE id = ?1 AND status = 'pending'",
                params![task.id, ts(now)],
            )?;
            if n == 0 {
                return Ok(None);
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            Ok(Some(task))
        })
    }

    pub fn complete_task(&self, id: &str, result: &Value, now: DateTime<Utc>) -> Result<()> {
        let raw = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_queue SET status = 'completed', result = ?2, completed_at = ?3 \
                 WHERE id = ?1",
                params![id, raw, ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn fail_task(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_queue SET status = 'failed', error = ?2, completed_at = ?3 \
                 WHERE id = ?1",
                params![id, error, ts(now)],
            )?;
            Ok(())
        })
    }

    /// Return a failed attempt to `pending` with its backoff window.
    pub fn retry_task(
        &self,
        id: &str,
        retry_count: u32,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_queue SET status = 'pending', retry_count = ?2, error = ?3, \
                 not_before = ?4, started_at = NULL WHERE id = ?1",
                params![id, retry_count as i64, error, ts(not_before)],
            )?;
            Ok(())
        })
    }

    /// Cancel a pending task. Running and terminal rows are untouched
    /// and the call returns false.
    pub fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE task_queue SET status = 'cancelled', completed_at = ?2 \
                 WHERE id = ?1 AND status = 'pending'",
                params![id, ts(now)],
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<QueueTask>> {
        let status_str = status.map(|s| s.as_str().to_string());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM task_queue WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![status_str, limit as i64], row_to_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn task_stats(&self) -> Result<HashMap<String, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM task_queue GROUP BY status")?;
            let mut stats: HashMap<String, u64> = TaskStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, n) = row?;
                stats.insert(status, n);
            }
            Ok(stats)
        })
    }

    pub fn count_running_tasks(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_queue WHERE status = 'running'",
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Any running rows left behind by a previous process are failed at
    /// startup; their handlers are gone.
    pub fn fail_orphaned_running_tasks(&self, now: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE task_queue SET status = 'failed', \
                 error = 'daemon restarted while task was running', completed_at = ?1 \
                 WHERE status = 'running'",
                [ts(now)],
            )?;
            Ok(n as u64)
        })
    }

    /// Delete terminal rows matching the filter; returns the count.
    pub fn cleanup_tasks(
        &self,
        status: Option<TaskStatus>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        if let Some(s) = status {
            if !s.is_terminal() {
                return Err(Error::invalid(format!(
                    "cleanup only applies to terminal statuses, got {}",
                    s.as_str()
                )));
            }
        }
        let status_str = status.map(|s| s.as_str().to_string());
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM task_queue \
                 WHERE status IN ('completed','failed','cancelled') \
                 AND (?1 IS NULL OR status = ?1) \
                 AND (?2 IS NULL OR created_at < ?2)",
                params![status_str, older_than.map(ts)],
            )?;
            Ok(n as u64)
        })
    }
}
