//! PID file management for daemon-style operation.
//!
//! The daemon writes its PID and holds an `fs2` exclusive lock for its
//! lifetime; a second instance fails to lock and refuses to start. The
//! lock releases when the handle drops, but removal is explicit so no
//! stale file lingers.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

/// Write the current PID to `path` and take the exclusive lock. The
/// returned handle must stay alive for the daemon's lifetime.
pub fn write_pid_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .read(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("opening PID file {}: {e}", path.display()))?;

    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another kronk daemon is running (PID file {} is locked)",
            path.display()
        )
    })?;

    let pid = std::process::id();
    {
        let mut f = &file;
        writeln!(f, "{pid}")?;
        f.flush()?;
    }

    tracing::info!(path = %path.display(), pid, "PID file written");
    Ok(file)
}

pub fn remove_pid_file(path: &Path, _handle: File) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    }
}

/// Read the PID recorded at `path`, if any.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_lock_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("kronk.pid");

        let handle = write_pid_file(&pid_path).unwrap();
        assert_eq!(read_pid(&pid_path), Some(std::process::id()));

        // Second lock attempt fails while the first handle is alive.
        assert!(write_pid_file(&pid_path).is_err());

        remove_pid_file(&pid_path, handle);
        assert!(!pid_path.exists());
    }
}
