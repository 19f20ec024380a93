//! Tool catalog queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use kronk_domain::id::new_id;
use kronk_domain::tool::{Tool, ToolSpec};
use kronk_domain::{Error, Result};

use crate::{json_err, parse_ts, ts, Store};

const COLS: &str =
    "id, name, description, schema, handler_ref, enabled, priority, metadata, created_at, updated_at";

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<Tool> {
    let schema: String = row.get(3)?;
    let metadata: String = row.get(7)?;
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;
    Ok(Tool {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        schema: serde_json::from_str(&schema).map_err(json_err)?,
        handler_ref: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        priority: row.get(6)?,
        metadata: serde_json::from_str(&metadata).map_err(json_err)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

impl Store {
    /// Insert or update by name; returns the persisted row.
    pub fn upsert_tool(&self, spec: &ToolSpec) -> Result<Tool> {
        let now = Utc::now();
        let schema = serde_json::to_string(&spec.schema)?;
        let metadata = serde_json::to_string(&spec.metadata)?;
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row("SELECT id FROM tools WHERE name = ?1", [&spec.name], |row| {
                    row.get(0)
                })
                .optional()?;
            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE tools SET description=?2, schema=?3, handler_ref=?4, \
                         enabled=?5, priority=?6, metadata=?7, updated_at=?8 WHERE id=?1",
                        params![
                            id,
                            spec.description,
                            schema,
                            spec.handler_ref,
                            spec.enabled as i64,
                            spec.priority,
                            metadata,
                            ts(now),
                        ],
                    )?;
                }
                None => {
                    conn.execute(
                        &format!("INSERT INTO tools ({COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"),
                        params![
                            new_id(),
                            spec.name,
                            spec.description,
                            schema,
                            spec.handler_ref,
                            spec.enabled as i64,
                            spec.priority,
                            metadata,
                            ts(now),
                            ts(now),
                        ],
                    )?;
                }
            }
            conn.query_row(
                &format!("SELECT {COLS} FROM tools WHERE name = ?1"),
                [&spec.name],
                row_to_tool,
            )
            .map_err(Error::from)
        })
    }

    pub fn get_tool(&self, name: &str) -> Result<Option<Tool>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM tools WHERE name = ?1"),
                [name],
                row_to_tool,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// All tools, priority DESC then name; optionally only enabled rows.
    pub fn list_tools(&self, enabled_only: bool) -> Result<Vec<Tool>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM tools WHERE (?1 = 0 OR enabled = 1) \
                 ORDER BY priority DESC, name ASC"
            ))?;
            let rows = stmt.query_map([enabled_only as i64], row_to_tool)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tools SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, enabled as i64, ts(Utc::now())],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_tool(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM tools WHERE name = ?1", [name])?;
            Ok(n > 0)
        })
    }

    pub fn count_tools(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM tools", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreOptions;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: "a tool".into(),
            schema: serde_json::json!({"type": "object", "properties": {}}),
            handler_ref: format!("core:{name}"),
            enabled: true,
            priority: 0,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn upsert_is_idempotent_by_name() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let first = store.upsert_tool(&spec("shell")).unwrap();
        let mut updated = spec("shell");
        updated.description = "runs commands".into();
        let second = store.upsert_tool(&updated).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.description, "runs commands");
        assert_eq!(store.count_tools().unwrap(), 1);
    }

    #[test]
    fn enabled_filter() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        store.upsert_tool(&spec("a")).unwrap();
        store.upsert_tool(&spec("b")).unwrap();
        store.set_tool_enabled("b", false).unwrap();

        assert_eq!(store.list_tools(false).unwrap().len(), 2);
        let enabled = store.list_tools(true).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
    }

    #[test]
    fn priority_orders_listing() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let mut low = spec("low");
        low.priority = 1;
        let mut high = spec("high");
        high.priority = 10;
        store.upsert_tool(&low).unwrap();
        store.upsert_tool(&high).unwrap();

        let tools = store.list_tools(false).unwrap();
        assert_eq!(tools[0].name, "high");
    }
}
