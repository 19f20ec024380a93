//! Skill discovery: Markdown files under the project's `skills/`
//! directory. The first paragraph after the `#` title is the
//! description.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use kronk_domain::{Error, Result};

use crate::registry::ToolHandler;

/// A parsed skill file.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub title: String,
    pub description: String,
}

/// Skill names are a restricted character class; anything that could
/// form a path component is rejected at the boundary.
pub fn sanitize_skill_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::invalid(format!("invalid skill name: {name:?}")));
    }
    Ok(name)
}

/// Parse a skill's title and description out of its Markdown.
fn parse_skill(name: &str, markdown: &str) -> Skill {
    let mut title = name.to_string();
    let mut description = String::new();
    let mut in_description = false;
    for line in markdown.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            title = heading.trim().to_string();
            in_description = true;
            continue;
        }
        if in_description {
            if trimmed.is_empty() {
                if !description.is_empty() {
                    break;
                }
                continue;
            }
            if !description.is_empty() {
                description.push(' ');
            }
            description.push_str(trimmed);
        }
    }
    Skill {
        name: name.to_string(),
        title,
        description,
    }
}

/// All `.md` skills in the directory, sorted by name.
pub fn discover_skills(dir: &Path) -> Result<Vec<Skill>> {
    let mut skills = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(skills),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(markdown) = std::fs::read_to_string(&path) else {
            continue;
        };
        skills.push(parse_skill(stem, &markdown));
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DiscoverSkillsTool {
    skills_dir: Arc<PathBuf>,
}

impl DiscoverSkillsTool {
    pub fn new(skills_dir: Arc<PathBuf>) -> Self {
        Self { skills_dir }
    }
}

#[async_trait::async_trait]
impl ToolHandler for DiscoverSkillsTool {
    async fn call(&self, _args: Value) -> Result<Value> {
        let skills: Vec<Value> = discover_skills(&self.skills_dir)?
            .into_iter()
            .map(|s| json!({"name": s.name, "title": s.title, "description": s.description}))
            .collect();
        Ok(json!({"skills": skills}))
    }
}

#[derive(Debug, Deserialize)]
struct ReadSkillArgs {
    name: String,
}

pub struct ReadSkillTool {
    skills_dir: Arc<PathBuf>,
}

impl ReadSkillTool {
    pub fn new(skills_dir: Arc<PathBuf>) -> Self {
        Self { skills_dir }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ReadSkillTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let args: ReadSkillArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid(format!("read_skill args: {e}")))?;
        let name = sanitize_skill_name(&args.name)?;
        let path = self.skills_dir.join(format!("{name}.md"));
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(json!({"name": name, "content": content})),
            Err(_) => Ok(json!({"name": name, "content": Value::Null, "found": false})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_with_path_components_rejected() {
        for bad in ["../etc/passwd", "a/b", "a\\b", "", "dot.dot", "sp ace"] {
            assert!(sanitize_skill_name(bad).is_err(), "{bad}");
        }
        assert!(sanitize_skill_name("web-research_2").is_ok());
    }

    #[test]
    fn description_is_first_paragraph_after_title() {
        let markdown = "# Web research\n\nSearch the web and cite sources.\nUse sparingly.\n\n## Steps\nirrelevant\n";
        let skill = parse_skill("web-research", markdown);
        assert_eq!(skill.title, "Web research");
        assert_eq!(skill.description, "Search the web and cite sources. Use sparingly.");
    }

    #[test]
    fn discover_reads_md_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.md"), "# Alpha\n\nFirst skill.\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a skill").unwrap();

        let skills = discover_skills(dir.path()).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "alpha");
        assert_eq!(skills[0].description, "First skill.");
    }

    #[tokio::test]
    async fn read_skill_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.md"), "# Alpha\n\nBody.\n").unwrap();
        let tool = ReadSkillTool::new(Arc::new(dir.path().to_path_buf()));

        let found = tool.call(json!({"name": "alpha"})).await.unwrap();
        assert!(found["content"].as_str().unwrap().contains("Body."));

        let missing = tool.call(json!({"name": "ghost"})).await.unwrap();
        assert_eq!(missing["found"], false);

        let escape = tool.call(json!({"name": "../alpha"})).await;
        assert!(escape.is_err());
    }
}
