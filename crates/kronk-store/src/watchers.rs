//! Watcher table queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use kronk_domain::id::new_id;
use kronk_domain::watcher::{Watcher, WatcherAction, WatcherInput};
use kronk_domain::{Error, Result};

use crate::{json_err, parse_ts, ts, Store};

const COLS: &str = "id, pattern, action, action_config, enabled, debounce_ms, created_at, updated_at";

fn row_to_watcher(row: &Row<'_>) -> rusqlite::Result<Watcher> {
    let action: String = row.get(2)?;
    let config: String = row.get(3)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Watcher {
        id: row.get(0)?,
        pattern: row.get(1)?,
        action: WatcherAction::parse(&action).unwrap_or(WatcherAction::Queue),
        action_config: serde_json::from_str(&config).map_err(json_err)?,
        enabled: row.get::<_, i64>(4)? != 0,
        debounce_ms: row.get::<_, i64>(5)? as u64,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

impl Store {
    pub fn insert_watcher(&self, input: &WatcherInput) -> Result<Watcher> {
        if input.debounce_ms == 0 {
            return Err(Error::invalid("watcher debounceMs must be positive"));
        }
        let now = Utc::now();
        let id = new_id();
        let config = serde_json::to_string(&input.action_config)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO watchers ({COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
                params![
                    id,
                    input.pattern,
                    input.action.as_str(),
                    config,
                    input.enabled as i64,
                    input.debounce_ms as i64,
                    ts(now),
                    ts(now),
                ],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM watchers WHERE id = ?1"),
                [&id],
                row_to_watcher,
            )
            .map_err(Error::from)
        })
    }

    pub fn get_watcher(&self, id: &str) -> Result<Option<Watcher>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM watchers WHERE id = ?1"),
                [id],
                row_to_watcher,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    pub fn list_watchers(&self, enabled_only: bool) -> Result<Vec<Watcher>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM watchers WHERE (?1 = 0 OR enabled = 1) \
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([enabled_only as i64], row_to_watcher)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn set_watcher_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE watchers SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, enabled as i64, ts(Utc::now())],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_watcher(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM watchers WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreOptions;

    fn input(pattern: &str) -> WatcherInput {
        WatcherInput {
            pattern: pattern.into(),
            action: WatcherAction::Memory,
            action_config: serde_json::json!({"tier": "working"}),
            enabled: true,
            debounce_ms: 200,
        }
    }

    #[test]
    fn insert_and_list() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let w = store.insert_watcher(&input("*.txt")).unwrap();
        assert_eq!(w.pattern, "*.txt");

        store.set_watcher_enabled(&w.id, false).unwrap();
        assert!(store.list_watchers(true).unwrap().is_empty());
        assert_eq!(store.list_watchers(false).unwrap().len(), 1);
    }

    #[test]
    fn zero_debounce_rejected() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let mut bad = input("*.txt");
        bad.debounce_ms = 0;
        assert!(store.insert_watcher(&bad).is_err());
    }
}
