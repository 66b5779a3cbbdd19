// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - AUDIT LOG
//
// Every minted invite is appended to verify.json (a JSON array of records).
// When the array reaches 1000 entries the file is renamed to
// verify_<UTCstamp>.json and a fresh one starts. Appends are serialized
// through a single writer task and protected with an exclusive flock while
// the file is rewritten. Audit failures are logged and never surface to the
// winner.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::applog::filelock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub const AUDIT_FILE: &str = "verify.json";

/// Rotate once the array holds this many records.
pub const ROTATE_AT: usize = 1000;

/// One winning (or consolation) mint, with everything needed to re-derive
/// and cross-check the code later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC 3339 UTC timestamp of the mint.
    pub timestamp: String,
    pub invite_code: String,
    pub fingerprint: String,
    pub nonce: u64,
    pub hash: String,
    pub seed: String,
    pub real_ip: String,
    pub trace: String,
    pub difficulty: u32,
    pub solve_time_secs: f64,
    pub new_difficulty: u32,
    pub adjustment_reason: String,
}

impl AuditRecord {
    pub fn now_timestamp() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

/// Handle for enqueueing audit appends; cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
    dir: PathBuf,
}

impl AuditLog {
    /// Spawn the writer task and return the enqueue handle.
    pub fn start(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let writer_dir = dir.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let dir = writer_dir.clone();
                let result =
                    tokio::task::spawn_blocking(move || append_record(&dir, &record)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => eprintln!("⚠️  audit log append failed: {}", e),
                    Err(e) => eprintln!("⚠️  audit log writer task failed: {}", e),
                }
            }
        });
        AuditLog { tx, dir }
    }

    /// Fire-and-forget append; called outside the puzzle lock.
    pub fn append(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            eprintln!("⚠️  audit log channel closed — record dropped");
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Read-modify-write under an exclusive flock, then rotate if full.
fn append_record(dir: &Path, record: &AuditRecord) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("create {}: {}", dir.display(), e))?;
    let path = dir.join(AUDIT_FILE);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|e| format!("open {}: {}", path.display(), e))?;

    filelock::lock_exclusive(&file)?;
    let result = append_locked(&mut file, record);
    filelock::unlock(&file);
    let count = result?;

    if count >= ROTATE_AT {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let rotated = dir.join(format!("verify_{}.json", stamp));
        std::fs::rename(&path, &rotated)
            .map_err(|e| format!("rotate {}: {}", path.display(), e))?;
    }
    Ok(())
}

fn append_locked(file: &mut std::fs::File, record: &AuditRecord) -> Result<usize, String> {
    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|e| format!("read audit log: {}", e))?;

    let mut records: Vec<AuditRecord> = if raw.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&raw).map_err(|e| format!("audit log is corrupt: {}", e))?
    };
    records.push(record.clone());

    let serialized =
        serde_json::to_string_pretty(&records).map_err(|e| format!("serialize audit log: {}", e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| format!("seek audit log: {}", e))?;
    file.set_len(0).map_err(|e| format!("truncate audit log: {}", e))?;
    file.write_all(serialized.as_bytes())
        .map_err(|e| format!("write audit log: {}", e))?;
    Ok(records.len())
}

/// One page of an admin log query.
#[derive(Debug, Serialize)]
pub struct LogPage {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub records: Vec<AuditRecord>,
}

/// Paginated, newest-first query over the current audit file with an
/// optional case-insensitive substring search across all record fields.
pub fn query(dir: &Path, page: usize, per_page: usize, search: Option<&str>) -> Result<LogPage, String> {
    let path = dir.join(AUDIT_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(format!("read {}: {}", path.display(), e)),
    };

    let mut records: Vec<AuditRecord> = if raw.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&raw).map_err(|e| format!("audit log is corrupt: {}", e))?
    };
    records.reverse(); // newest first

    if let Some(needle) = search.map(str::to_lowercase).filter(|s| !s.is_empty()) {
        records.retain(|r| {
            serde_json::to_string(r)
                .map(|s| s.to_lowercase().contains(&needle))
                .unwrap_or(false)
        });
    }

    let per_page = per_page.clamp(1, 200);
    let total = records.len();
    let start = page.saturating_mul(per_page);
    let records = records.into_iter().skip(start).take(per_page).collect();

    Ok(LogPage {
        total,
        page,
        per_page,
        records,
    })
}
