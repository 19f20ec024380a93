//! Context-window assembly and the token estimator.

use serde::Serialize;

use kronk_domain::memory::{Memory, MemoryTier};

/// Estimated token count for arbitrary content: `ceil(len / 4)`.
///
/// Budgeting, stats, and tests all assume this exact formula.
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4)
}

/// The per-tier memory selection rendered into every system prompt.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindow {
    pub system2: Vec<Memory>,
    pub working: Vec<Memory>,
    pub system1: Vec<Memory>,
    pub total_tokens: usize,
}

impl ContextWindow {
    pub fn tier(&self, tier: MemoryTier) -> &[Memory] {
        match tier {
            MemoryTier::System2 => &self.system2,
            MemoryTier::Working => &self.working,
            MemoryTier::System1 => &self.system1,
        }
    }

    pub fn tier_mut(&mut self, tier: MemoryTier) -> &mut Vec<Memory> {
        match tier {
            MemoryTier::System2 => &mut self.system2,
            MemoryTier::Working => &mut self.working,
            MemoryTier::System1 => &mut self.system1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.system2.is_empty() && self.working.is_empty() && self.system1.is_empty()
    }

    /// Render the window as a prompt section.
    pub fn format_for_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Memory\n");
        for (tier, title) in [
            (MemoryTier::System2, "Long-term knowledge"),
            (MemoryTier::Working, "Working memory"),
            (MemoryTier::System1, "Recent context"),
        ] {
            let memories = self.tier(tier);
            if memories.is_empty() {
                continue;
            }
            out.push_str(&format!("\n### {title}\n"));
            for m in memories {
                let text = m.summary.as_deref().unwrap_or(&m.content);
                out.push_str(&format!("- {text}\n"));
            }
        }
        out
    }
}
