// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - LOCKED APPLICATION LOG
//
// Rotating text log with exclusive file-range locking so appends from
// multiple handlers on the same host never interleave. Unix uses flock;
// other platforms fall back to plain appends.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Rotate once the log grows past this size.
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Per-OS exclusive lock helpers. The lock is held for the duration of one
/// append and released by `unlock` (and by the OS on close either way).
pub mod filelock {
    use super::File;

    #[cfg(unix)]
    pub fn lock_exclusive(file: &File) -> Result<(), String> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret == 0 {
            Ok(())
        } else {
            Err(format!("flock failed: {}", std::io::Error::last_os_error()))
        }
    }

    #[cfg(unix)]
    pub fn unlock(file: &File) {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    }

    #[cfg(not(unix))]
    pub fn lock_exclusive(_file: &File) -> Result<(), String> {
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn unlock(_file: &File) {}
}

#[derive(Clone)]
pub struct AppLog {
    path: PathBuf,
}

impl AppLog {
    pub fn new(dir: &std::path::Path) -> Self {
        AppLog {
            path: dir.join("hashpass.log"),
        }
    }

    /// Append one timestamped line, rotating first if the file is full.
    /// Log failures are reported to stderr, never propagated.
    pub fn line(&self, message: &str) {
        if let Err(e) = self.append(message) {
            eprintln!("⚠️  app log write failed: {}", e);
        }
    }

    fn append(&self, message: &str) -> Result<(), String> {
        self.rotate_if_needed()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("open {}: {}", self.path.display(), e))?;

        filelock::lock_exclusive(&file)?;
        let result = writeln!(
            &file,
            "{} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        )
        .map_err(|e| format!("write {}: {}", self.path.display(), e));
        filelock::unlock(&file);
        result
    }

    fn rotate_if_needed(&self) -> Result<(), String> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()), // no log yet
        };
        if len < MAX_LOG_BYTES {
            return Ok(());
        }
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let rotated = self
            .path
            .with_file_name(format!("hashpass_{}.log", stamp));
        std::fs::rename(&self.path, &rotated)
            .map_err(|e| format!("rotate {}: {}", self.path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppLog::new(dir.path());
        log.line("first event");
        log.line("second event");

        let contents = std::fs::read_to_string(dir.path().join("hashpass.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first event"));
        assert!(lines[1].ends_with("second event"));
        assert!(lines[0].contains('T'), "line should carry a timestamp");
    }

    #[test]
    fn test_rotation_preserves_old_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppLog::new(dir.path());

        // Pre-fill past the rotation threshold.
        std::fs::write(
            dir.path().join("hashpass.log"),
            vec![b'x'; (MAX_LOG_BYTES + 1) as usize],
        )
        .unwrap();

        log.line("after rotation");

        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("hashpass_") && name.ends_with(".log")
            })
            .collect();
        assert_eq!(rotated.len(), 1, "old log must be rotated aside");

        let fresh = std::fs::read_to_string(dir.path().join("hashpass.log")).unwrap();
        assert!(fresh.contains("after rotation"));
        assert!(fresh.len() < 100, "fresh log starts near-empty");
    }
}
