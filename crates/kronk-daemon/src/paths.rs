//! On-disk project layout.
//!
//! A project lives in a dot-directory under the user's chosen base:
//! `.<name>/` containing the database, config, constitution, skills,
//! socket, PID file, and log.

use std::path::{Path, PathBuf};

use kronk_domain::{Error, Result};

pub const DB_FILE: &str = "kronk.db";
pub const CONFIG_FILE: &str = "config.json";
pub const CONSTITUTION_FILE: &str = "constitution.md";
pub const SKILLS_DIR: &str = "skills";
pub const SOCKET_FILE: &str = "kronk.sock";
pub const PID_FILE: &str = "kronk.pid";
pub const LOG_FILE: &str = "kronk.log";

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn db(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn constitution(&self) -> PathBuf {
        self.root.join(CONSTITUTION_FILE)
    }

    pub fn skills(&self) -> PathBuf {
        self.root.join(SKILLS_DIR)
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join(SOCKET_FILE)
    }

    pub fn pid(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.config().is_file() && self.db().is_file()
    }
}

/// Resolve the project root: `KRONK_PATH` wins, then the first
/// initialized dot-directory under `base`, then `base/.kronk`.
pub fn resolve_project_root(base: &Path) -> ProjectPaths {
    if let Ok(path) = std::env::var("KRONK_PATH") {
        if !path.trim().is_empty() {
            return ProjectPaths::new(PathBuf::from(path));
        }
    }
    if let Ok(entries) = std::fs::read_dir(base) {
        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'))
                    && p.join(CONFIG_FILE).is_file()
            })
            .collect();
        candidates.sort();
        if let Some(found) = candidates.into_iter().next() {
            return ProjectPaths::new(found);
        }
    }
    ProjectPaths::new(base.join(".kronk"))
}

/// Socket path honoring the `daemon.socketPath` config override.
pub fn effective_socket(
    paths: &ProjectPaths,
    config: &kronk_domain::config::KronkConfig,
) -> PathBuf {
    config
        .daemon
        .socket_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.socket())
}

/// PID file path honoring the `daemon.pidFile` config override.
pub fn effective_pid(
    paths: &ProjectPaths,
    config: &kronk_domain::config::KronkConfig,
) -> PathBuf {
    config
        .daemon
        .pid_file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.pid())
}

/// The project root for a named `init`.
pub fn project_root_for(base: &Path, name: &str) -> Result<ProjectPaths> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::invalid(format!("invalid project name: {name:?}")));
    }
    Ok(ProjectPaths::new(base.join(format!(".{name}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the KRONK_PATH mutation cannot race a parallel case.
    #[test]
    fn resolution_order() {
        let dir = tempfile::tempdir().unwrap();

        // Fallback when nothing is initialized.
        let paths = resolve_project_root(dir.path());
        assert_eq!(paths.root, dir.path().join(".kronk"));

        // An initialized dot-directory wins over the fallback.
        let project = dir.path().join(".alpha");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join(CONFIG_FILE), "{}").unwrap();
        let paths = resolve_project_root(dir.path());
        assert_eq!(paths.root, project);

        // KRONK_PATH wins over everything.
        std::env::set_var("KRONK_PATH", dir.path().join(".custom"));
        let paths = resolve_project_root(dir.path());
        std::env::remove_var("KRONK_PATH");
        assert_eq!(paths.root, dir.path().join(".custom"));
    }

    #[test]
    fn project_names_are_validated() {
        assert!(project_root_for(Path::new("/tmp"), "alpha-2").is_ok());
        assert!(project_root_for(Path::new("/tmp"), "../evil").is_err());
        assert!(project_root_for(Path::new("/tmp"), "").is_err());
    }
}
