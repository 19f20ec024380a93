//! Project configuration (`config.json`).
//!
//! Unknown keys are ignored so configs survive version skew. Environment
//! variables override the file where noted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Openai,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderKind> {
        match s {
            "ollama" => Some(ProviderKind::Ollama),
            "openai" => Some(ProviderKind::Openai),
            "anthropic" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-tier token budget overrides. `None` keeps the built-in budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryLimits {
    pub system2: Option<usize>,
    pub working: Option<usize>,
    pub system1: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Socket path override; defaults to `<project>/kronk.sock`.
    pub socket_path: Option<String>,
    /// PID file override; defaults to `<project>/kronk.pid`.
    pub pid_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Cron expression for the hourly importance decay pass.
    pub memory_decay: String,
    /// Cron expression for expired/low-importance cleanup.
    pub memory_cleanup: String,
    /// Cron expression for daily consolidation.
    pub consolidation: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_decay: "0 * * * *".into(),
            memory_cleanup: "0 * * * *".into(),
            consolidation: "0 0 * * *".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub default_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_retries: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KronkConfig {
    /// Agent display name.
    pub name: String,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub api_base_url: Option<String>,
    pub embedding_model: Option<String>,
    pub use_vector_search: bool,
    pub debug: bool,
    pub memory_limits: MemoryLimits,
    pub daemon: DaemonConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
}

impl Default for KronkConfig {
    fn default() -> Self {
        Self {
            name: "kronk".into(),
            provider: ProviderKind::Ollama,
            model: None,
            api_base_url: None,
            embedding_model: None,
            use_vector_search: false,
            debug: false,
            memory_limits: MemoryLimits::default(),
            daemon: DaemonConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl KronkConfig {
    /// Load from `config.json`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: KronkConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw + "\n")?;
        Ok(())
    }

    /// `LLM_PROVIDER`, `OLLAMA_HOST`, and `OLLAMA_MODEL` take precedence
    /// over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            if let Some(kind) = ProviderKind::parse(provider.trim()) {
                self.provider = kind;
            } else {
                tracing::warn!(provider, "ignoring unknown LLM_PROVIDER");
            }
        }
        if self.provider == ProviderKind::Ollama {
            if let Ok(host) = std::env::var("OLLAMA_HOST") {
                if !host.trim().is_empty() {
                    self.api_base_url = Some(host.trim().to_string());
                }
            }
            if let Ok(model) = std::env::var("OLLAMA_MODEL") {
                if !model.trim().is_empty() {
                    self.model = Some(model.trim().to_string());
                }
            }
            if let Ok(model) = std::env::var("OLLAMA_EMBED_MODEL") {
                if !model.trim().is_empty() {
                    self.embedding_model = Some(model.trim().to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = KronkConfig::default();
        assert_eq!(cfg.queue.max_concurrent, 3);
        assert_eq!(cfg.scheduler.memory_decay, "0 * * * *");
        assert_eq!(cfg.scheduler.consolidation, "0 0 * * *");
        assert!(!cfg.use_vector_search);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let raw = r#"{"name":"alpha","provider":"ollama","futureKnob":42}"#;
        let cfg: KronkConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.name, "alpha");
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let raw = r#"{
            "name": "alpha",
            "provider": "openai",
            "useVectorSearch": true,
            "memoryLimits": {"working": 16000},
            "queue": {"maxConcurrent": 5}
        }"#;
        let cfg: KronkConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.provider, ProviderKind::Openai);
        assert!(cfg.use_vector_search);
        assert_eq!(cfg.memory_limits.working, Some(16000));
        assert_eq!(cfg.queue.max_concurrent, 5);
    }
}
