//! Session table queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use kronk_domain::session::{Session, SessionStatus};
use kronk_domain::{Error, Result};

use crate::{json_err, parse_ts, ts, Store};

const COLS: &str = "id, name, status, goal, context, started_at, ended_at";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    let context: String = row.get(4)?;
    let started: String = row.get(5)?;
    let ended: Option<String> = row.get(6)?;
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        goal: row.get(3)?,
        context: serde_json::from_str(&context).map_err(json_err)?,
        started_at: parse_ts(&started)?,
        ended_at: match ended {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
    })
}

impl Store {
    pub fn insert_session(&self, s: &Session) -> Result<()> {
        let context = serde_json::to_string(&s.context)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO sessions ({COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
                params![
                    s.id,
                    s.name,
                    s.status.as_str(),
                    s.goal,
                    context,
                    ts(s.started_at),
                    s.ended_at.map(ts),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                [id],
                row_to_session,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    pub fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<bool> {
        let ended = status != SessionStatus::Active && status != SessionStatus::Paused;
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET status = ?2, ended_at = COALESCE(ended_at, ?3) WHERE id = ?1",
                params![id, status.as_str(), ended.then(|| ts(Utc::now()))],
            )?;
            Ok(n > 0)
        })
    }

    /// Merge one key into the session's context map.
    pub fn set_session_context_key(&self, id: &str, key: &str, value: &Value) -> Result<bool> {
        let session = match self.get_session(id)? {
            Some(s) => s,
            None => return Ok(false),
        };
        let mut context = session.context;
        context.insert(key.to_string(), value.clone());
        let raw = serde_json::to_string(&context)?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET context = ?2 WHERE id = ?1",
                params![id, raw],
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM sessions ORDER BY started_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit as i64], row_to_session)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreOptions;
    use kronk_domain::id::new_id;
    use std::collections::HashMap;

    fn session(goal: &str) -> Session {
        Session {
            id: new_id(),
            name: None,
            status: SessionStatus::Active,
            goal: goal.into(),
            context: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    #[test]
    fn lifecycle() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let s = session("do the thing");
        store.insert_session(&s).unwrap();

        assert!(store.set_session_status(&s.id, SessionStatus::Completed).unwrap());
        let got = store.get_session(&s.id).unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Completed);
        assert!(got.ended_at.is_some());
    }

    #[test]
    fn context_key_merge() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let s = session("x");
        store.insert_session(&s).unwrap();

        store
            .set_session_context_key(&s.id, "messages", &serde_json::json!([{"role": "user"}]))
            .unwrap();
        let got = store.get_session(&s.id).unwrap().unwrap();
        assert!(got.context.contains_key("messages"));
    }
}
