// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - IP BLACKLIST
//
// Banned IPs, persisted as a JSON array in blacklist.json. Re-read at
// startup, rewritten on every change. Enforcement (closing channels,
// revoking sessions) is the caller's job — this is just the set.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const BLACKLIST_FILE: &str = "blacklist.json";

/// Recover from poisoned mutex instead of panicking
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct Blacklist {
    inner: Arc<Mutex<HashSet<IpAddr>>>,
    path: PathBuf,
}

impl Blacklist {
    /// Load from `dir/blacklist.json`; a missing file means an empty set.
    /// Unparseable entries are skipped with a warning rather than failing
    /// startup.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(BLACKLIST_FILE);
        let mut set = HashSet::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(entries) => {
                    for entry in entries {
                        match entry.parse::<IpAddr>() {
                            Ok(ip) => {
                                set.insert(ip);
                            }
                            Err(_) => {
                                eprintln!("⚠️  blacklist: skipping unparseable IP {:?}", entry)
                            }
                        }
                    }
                }
                Err(e) => eprintln!("⚠️  blacklist: {} is corrupt ({}), starting empty", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => eprintln!("⚠️  blacklist: cannot read {}: {}", path.display(), e),
        }

        Blacklist {
            inner: Arc::new(Mutex::new(set)),
            path,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        safe_lock(&self.inner).contains(&ip)
    }

    /// Add `ip` and persist. Returns false if it was already banned.
    pub fn ban(&self, ip: IpAddr) -> bool {
        let inserted = safe_lock(&self.inner).insert(ip);
        if inserted {
            self.persist();
        }
        inserted
    }

    /// Remove `ip` and persist. Returns false if it was not banned.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let removed = safe_lock(&self.inner).remove(&ip);
        if removed {
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        safe_lock(&self.inner).is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        let mut entries: Vec<String> = safe_lock(&self.inner).iter().map(|ip| ip.to_string()).collect();
        entries.sort();
        entries
    }

    fn persist(&self) {
        let entries = self.list();
        let serialized = match serde_json::to_string_pretty(&entries) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("⚠️  blacklist: serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, serialized) {
            eprintln!("⚠️  blacklist: cannot write {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = Blacklist::load(dir.path());
        assert!(blacklist.is_empty());
    }

    #[test]
    fn test_ban_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = Blacklist::load(dir.path());

        assert!(blacklist.ban(ip("203.0.113.7")));
        assert!(!blacklist.ban(ip("203.0.113.7")), "double ban is a no-op");
        assert!(blacklist.ban(ip("::1")));
        assert!(blacklist.contains(ip("203.0.113.7")));

        // Fresh load sees the same set.
        let reloaded = Blacklist::load(dir.path());
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(ip("203.0.113.7")));
        assert!(reloaded.contains(ip("::1")));
    }

    #[test]
    fn test_unban_persists() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = Blacklist::load(dir.path());
        blacklist.ban(ip("203.0.113.7"));

        assert!(blacklist.unban(ip("203.0.113.7")));
        assert!(!blacklist.unban(ip("203.0.113.7")));

        let reloaded = Blacklist::load(dir.path());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_corrupt_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(BLACKLIST_FILE),
            r#"["203.0.113.7", "not-an-ip", "10.0.0.1"]"#,
        )
        .unwrap();

        let blacklist = Blacklist::load(dir.path());
        assert_eq!(blacklist.len(), 2);
        assert!(blacklist.contains(ip("203.0.113.7")));
        assert!(blacklist.contains(ip("10.0.0.1")));
    }
}
