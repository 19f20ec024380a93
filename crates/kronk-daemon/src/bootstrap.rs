//! Project initialization: directory layout, default config and
//! constitution, a starter skill, and the two seed memories.

use std::sync::Arc;

use chrono::Utc;

use kronk_domain::config::KronkConfig;
use kronk_domain::id::new_id;
use kronk_domain::memory::{Memory, MemorySource, MemoryTier};
use kronk_domain::{Error, Result};
use kronk_store::{Store, StoreOptions};

use crate::paths::ProjectPaths;

/// Embedding dimension used when vector search is enabled.
pub const EMBEDDING_DIM: usize = 1536;

const DEFAULT_CONSTITUTION: &str = "\
# Constitution

You are a persistent local agent. You keep durable memory across
conversations, you journal what you do, and you may define new tools for
yourself when a task calls for one.

## Principles

- Prefer small, verifiable steps over sweeping actions.
- Record decisions and surprising observations in the journal.
- Ask for confirmation before running shell commands.
- Store what you learn; future runs depend on your memory.
";

const STARTER_SKILL: &str = "\
# Getting started

Introduce kronk's moving parts: memory tiers, the journal, dynamic
tools, and the task queue.

## Notes

Use `discover_tools` to see what you can call, and `create_tool` to add
a new capability when a task needs one.
";

/// Create and seed a new project. Fails if one already exists at the
/// path.
pub fn init_project(paths: &ProjectPaths, config: &KronkConfig) -> Result<()> {
    if paths.is_initialized() {
        return Err(Error::Config(format!(
            "project already initialized at {}",
            paths.root.display()
        )));
    }
    std::fs::create_dir_all(&paths.root)?;
    std::fs::create_dir_all(paths.skills())?;

    config.save(&paths.config())?;
    std::fs::write(paths.constitution(), DEFAULT_CONSTITUTION)?;
    std::fs::write(paths.skills().join("getting-started.md"), STARTER_SKILL)?;

    let store = Arc::new(Store::open(&paths.db(), store_options(config))?);
    seed_memories(&store, &config.name)?;

    tracing::info!(root = %paths.root.display(), "project initialized");
    Ok(())
}

pub fn store_options(config: &KronkConfig) -> StoreOptions {
    StoreOptions {
        vector_dim: config.use_vector_search.then_some(EMBEDDING_DIM),
    }
}

/// Two long-horizon seed memories: one anchoring the constitution, one
/// describing the agent's own capabilities.
fn seed_memories(store: &Store, name: &str) -> Result<()> {
    let seeds = [
        format!(
            "I am {name}. My persona and policies live in constitution.md and are \
             loaded into every run."
        ),
        "I can store tiered memories, journal my activity, define new tools with \
         create_tool, queue background tasks, and watch files for changes."
            .to_string(),
    ];
    let now = Utc::now();
    for content in seeds {
        store.insert_memory(&Memory {
            id: new_id(),
            tier: MemoryTier::System2,
            content,
            summary: None,
            embedding: None,
            importance: MemoryTier::System2.default_importance(),
            access_count: 0,
            decay_rate: MemoryTier::System2.decay_rate(),
            source: MemorySource::Agent,
            tags: vec!["seed".into()],
            related_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kronk_domain::config::ProviderKind;

    #[test]
    fn init_seeds_expected_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path().join(".alpha"));
        let config = KronkConfig {
            name: "alpha".into(),
            provider: ProviderKind::Ollama,
            use_vector_search: false,
            ..Default::default()
        };
        init_project(&paths, &config).unwrap();

        assert!(paths.config().is_file());
        assert!(paths.constitution().is_file());
        assert!(paths.skills().join("getting-started.md").is_file());

        let store = Store::open(&paths.db(), store_options(&config)).unwrap();
        let counts = store.count_memories_by_tier().unwrap();
        assert_eq!(counts["system2"], 2);
        assert_eq!(counts["working"], 0);
        assert_eq!(counts["system1"], 0);
        assert_eq!(store.count_journal_entries().unwrap(), 0);
        assert_eq!(store.count_tools().unwrap(), 0);

        // Re-init refuses.
        assert!(init_project(&paths, &config).is_err());
    }
}
