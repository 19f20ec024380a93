//! Schema creation and version checks.

use rusqlite::{Connection, OptionalExtension};

use kronk_domain::{Error, Result};

pub const SCHEMA_VERSION: i64 = 1;

/// Create the schema if absent, then verify the stored version and
/// vector-search setting match what this process expects.
pub fn init_schema(conn: &Connection, vector_dim: Option<usize>) -> Result<()> {
    let embedding_col = if vector_dim.is_some() {
        ",\n    embedding BLOB"
    } else {
        ""
    };

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS _meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tools (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            schema TEXT NOT NULL,
            handler_ref TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{{}}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory (
            id TEXT PRIMARY KEY,
            tier TEXT NOT NULL CHECK (tier IN ('system2','working','system1')),
            content TEXT NOT NULL,
            summary TEXT,
            importance REAL NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            decay_rate REAL NOT NULL,
            source TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            related_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            expires_at TEXT{embedding_col}
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT,
            status TEXT NOT NULL CHECK (status IN ('active','paused','completed','failed')),
            goal TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{{}}',
            started_at TEXT NOT NULL,
            ended_at TEXT
        );

        CREATE TABLE IF NOT EXISTS journal (
            id TEXT PRIMARY KEY,
            entry_type TEXT NOT NULL,
            content TEXT NOT NULL,
            session_id TEXT REFERENCES sessions(id),
            parent_id TEXT REFERENCES journal(id),
            tool_id TEXT REFERENCES tools(id),
            memory_ids TEXT NOT NULL DEFAULT '[]',
            input TEXT,
            output TEXT,
            duration_ms INTEGER,
            tokens_used INTEGER,
            confidence REAL,
            metadata TEXT,
            created_at TEXT NOT NULL{embedding_col}
        );

        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            payload TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','cancelled')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            result TEXT,
            not_before TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS watchers (
            id TEXT PRIMARY KEY,
            pattern TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('run','memory','queue')),
            action_config TEXT NOT NULL DEFAULT '{{}}',
            enabled INTEGER NOT NULL DEFAULT 1,
            debounce_ms INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memory_tier ON memory(tier, importance DESC);
        CREATE INDEX IF NOT EXISTS idx_journal_session ON journal(session_id);
        CREATE INDEX IF NOT EXISTS idx_journal_created ON journal(created_at);
        CREATE INDEX IF NOT EXISTS idx_queue_claim ON task_queue(status, priority DESC, created_at ASC);
        "#
    ))?;

    // Version row: written once at creation, verified on every open.
    let stored: Option<String> = conn
        .query_row("SELECT value FROM _meta WHERE key = 'schema_version'", [], |row| {
            row.get(0)
        })
        .optional()?;
    match stored {
        None => {
            conn.execute(
                "INSERT INTO _meta (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Store(format!(
                "schema version mismatch: database has {v}, expected {SCHEMA_VERSION}"
            )));
        }
    }

    // The embedding column is structural: a database created with the
    // opposite vector setting cannot be opened.
    let has_embedding = column_exists(conn, "memory", "embedding")?;
    if has_embedding != vector_dim.is_some() {
        return Err(Error::Store(format!(
            "vector search setting mismatch: database {} an embedding column",
            if has_embedding { "has" } else { "lacks" }
        )));
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
