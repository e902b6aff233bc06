//! Session persistence
//!
//! One JSON file per session under `<store>/sessions/`, written atomically
//! (temp file + rename). Writes to the same session id are serialized by an
//! in-process mutex plus an advisory file lock; distinct ids never contend.
//! The escalation ladder's failure streaks live in `<store>/ledger.json`.

mod redact;

pub use redact::{is_secret_key, redact, REDACTED};

use crate::error::{HuntError, HuntResult};
use crate::ladder::FailureLedger;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const SESSIONS_DIR: &str = "sessions";
const LOCKS_DIR: &str = "locks";
const LEDGER_FILE: &str = "ledger.json";
const STORE_LOCK_FILE: &str = ".lock";

const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Saved between convergence cycles
    InProgress,
    Completed,
    Paused,
    Interrupted,
    Escalated,
    Failed,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Paused => "paused",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Escalated => "escalated",
            SessionStatus::Failed => "failed",
        }
    }
}

/// The persisted envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            status: session.status,
            created_at: session.created_at,
            saved_at: session.saved_at,
        }
    }
}

/// Releases the advisory lock when dropped
struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Every method does blocking file I/O and may wait on a lock; async
/// callers go through `spawn_blocking`.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open (and create) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> HuntResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SESSIONS_DIR))
            .and_then(|_| fs::create_dir_all(dir.join(LOCKS_DIR)))
            .map_err(|e| {
                HuntError::persistence(format!("cannot create store at {}: {}", dir.display(), e))
            })?;
        Ok(Self {
            dir,
            id_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `payload` as a new completed session
    pub fn save_session<T: Serialize>(&self, payload: &T) -> HuntResult<Session> {
        self.save_session_with_status(payload, SessionStatus::Completed)
    }

    pub fn save_session_with_status<T: Serialize>(
        &self,
        payload: &T,
        status: SessionStatus,
    ) -> HuntResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            status,
            created_at: now,
            saved_at: now,
            payload: scrubbed(payload)?,
        };
        self.write_session(&session)?;
        tracing::debug!(id = %session.id, status = session.status.label(), "session saved");
        Ok(session)
    }

    /// Replace the whole record of an existing session
    pub fn replace_session<T: Serialize>(
        &self,
        id: &str,
        payload: &T,
        status: SessionStatus,
    ) -> HuntResult<Session> {
        let payload = scrubbed(payload)?;
        let guard = self.id_lock(id);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.lock_file(&self.lock_path(id)?)?;

        let existing = self.read_session(id)?;
        let session = Session {
            id: existing.id,
            status,
            created_at: existing.created_at,
            saved_at: Utc::now(),
            payload,
        };
        write_atomic(&self.session_path(id)?, &serde_json::to_string_pretty(&session)?)?;
        tracing::debug!(id, status = status.label(), "session replaced");
        Ok(session)
    }

    /// The payload of session `id`
    pub fn load_session(&self, id: &str) -> HuntResult<Value> {
        Ok(self.load_record(id)?.payload)
    }

    /// The full envelope of session `id`
    pub fn load_record(&self, id: &str) -> HuntResult<Session> {
        self.read_session(id)
    }

    /// Every readable session, newest first
    pub fn list_sessions(&self) -> HuntResult<Vec<SessionSummary>> {
        let entries = match fs::read_dir(self.dir.join(SESSIONS_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<Session>(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable session: {}", e),
            }
        }
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    fn write_session(&self, session: &Session) -> HuntResult<()> {
        let guard = self.id_lock(&session.id);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.lock_file(&self.lock_path(&session.id)?)?;
        write_atomic(
            &self.session_path(&session.id)?,
            &serde_json::to_string_pretty(session)?,
        )
    }

    fn read_session(&self, id: &str) -> HuntResult<Session> {
        let path = self.session_path(id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HuntError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Session ids are UUIDs; anything else cannot name a file in the store
    fn checked_id(id: &str) -> HuntResult<Uuid> {
        Uuid::parse_str(id).map_err(|_| HuntError::NotFound(id.to_string()))
    }

    fn session_path(&self, id: &str) -> HuntResult<PathBuf> {
        let uuid = Self::checked_id(id)?;
        Ok(self.dir.join(SESSIONS_DIR).join(format!("{}.json", uuid)))
    }

    fn lock_path(&self, id: &str) -> HuntResult<PathBuf> {
        let uuid = Self::checked_id(id)?;
        Ok(self.dir.join(LOCKS_DIR).join(format!("{}.lock", uuid)))
    }

    fn lock_file(&self, path: &Path) -> HuntResult<StoreLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(StoreLock { file }),
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(HuntError::persistence(format!(
                            "timed out waiting for lock {} ({}s)",
                            path.display(),
                            LOCK_TIMEOUT_SECS
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }
    }

    fn read_ledger(&self) -> HuntResult<BTreeMap<String, u32>> {
        let path = self.dir.join(LEDGER_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                let backup = path.with_extension("json.corrupt");
                tracing::warn!(
                    "ledger is unreadable ({}); moving it to {} and starting fresh",
                    e,
                    backup.display()
                );
                fs::rename(&path, &backup)?;
                Ok(BTreeMap::new())
            }
        }
    }
}

impl FailureLedger for SessionStore {
    fn streak(&self, fingerprint: &str) -> HuntResult<u32> {
        let _lock = self.lock_file(&self.dir.join(STORE_LOCK_FILE))?;
        Ok(self.read_ledger()?.get(fingerprint).copied().unwrap_or(0))
    }

    fn record(&self, fingerprint: &str, passed: bool) -> HuntResult<u32> {
        let _lock = self.lock_file(&self.dir.join(STORE_LOCK_FILE))?;
        let mut ledger = self.read_ledger()?;
        let streak = if passed {
            ledger.remove(fingerprint);
            0
        } else {
            let streak = ledger.entry(fingerprint.to_string()).or_insert(0);
            *streak += 1;
            *streak
        };
        write_atomic(&self.dir.join(LEDGER_FILE), &serde_json::to_string_pretty(&ledger)?)?;
        Ok(streak)
    }
}

fn scrubbed<T: Serialize>(payload: &T) -> HuntResult<Value> {
    let mut value = serde_json::to_value(payload)?;
    let count = redact(&mut value);
    if count > 0 {
        tracing::debug!(count, "redacted secret-named fields before saving");
    }
    Ok(value)
}

/// Write a file atomically (temp file + rename), readable by the owner only.
///
/// On Unix `rename()` is atomic. Windows cannot rename over an existing
/// file, so the old file is moved aside first and restored on failure.
pub fn write_atomic(path: &Path, content: &str) -> HuntResult<()> {
    let tmp_path = path.with_extension("tmp");
    if let Err(err) = write_private(&tmp_path, content) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Write `content` to a file only the owner can read, permissions first
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // `mode` only applies on creation; a leftover temp file keeps its old bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let payload = json!({"unit": "a.rb", "violations": [{"rule_id": "BH003"}], "usage": {"tokens_in": 4}});
        let session = store.save_session(&payload).unwrap();
        assert!(Uuid::parse_str(&session.id).is_ok());
        assert_eq!(store.load_session(&session.id).unwrap(), payload);
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4().to_string();
        assert!(matches!(store.load_session(&id), Err(HuntError::NotFound(_))));
        assert!(matches!(store.load_session("../../etc/passwd"), Err(HuntError::NotFound(_))));
    }

    #[test]
    fn test_secrets_never_reach_disk() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store
            .save_session(&json!({"config": {"api_key": "sk-or-v1-abc"}}))
            .unwrap();
        let raw = fs::read_to_string(dir.path().join(SESSIONS_DIR).join(format!("{}.json", session.id))).unwrap();
        assert!(!raw.contains("sk-or-v1-abc"));
        assert_eq!(store.load_session(&session.id).unwrap()["config"]["api_key"], REDACTED);
    }

    #[test]
    fn test_replace_keeps_created_at() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let first = store
            .save_session_with_status(&json!({"cycle": 1}), SessionStatus::Paused)
            .unwrap();
        let second = store
            .replace_session(&first.id, &json!({"cycle": 2}), SessionStatus::Completed)
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        let record = store.load_record(&first.id).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.payload, json!({"cycle": 2}));

        let missing = Uuid::new_v4().to_string();
        assert!(matches!(
            store.replace_session(&missing, &json!({}), SessionStatus::Failed),
            Err(HuntError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let a = store.save_session(&json!({"n": 1})).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = store.save_session(&json!({"n": 2})).unwrap();
        fs::write(dir.path().join(SESSIONS_DIR).join("junk.json"), "{").unwrap();

        let listed = store.list_sessions().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn test_concurrent_saves_on_distinct_ids() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.save_session(&json!({ "n": n })).unwrap().id)
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (n, id) in ids.iter().enumerate() {
            assert_eq!(store.load_session(id).unwrap(), json!({ "n": n }));
        }
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).unwrap();
            assert_eq!(store.record("fp", false).unwrap(), 1);
            assert_eq!(store.record("fp", false).unwrap(), 2);
        }
        let store = SessionStore::open(dir.path()).unwrap();
        assert_eq!(store.streak("fp").unwrap(), 2);
        assert_eq!(store.record("fp", true).unwrap(), 0);
        assert_eq!(store.streak("fp").unwrap(), 0);
    }

    #[test]
    fn test_corrupt_ledger_is_set_aside() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(LEDGER_FILE), "not json").unwrap();
        assert_eq!(store.streak("fp").unwrap(), 0);
        assert!(dir.path().join("ledger.json.corrupt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_tightens_a_leftover_temp_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, "stale").unwrap();
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomic(&path, "{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_write_atomic_failure_keeps_the_old_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "old").unwrap();
        fs::create_dir(path.with_extension("tmp")).unwrap();

        assert!(matches!(write_atomic(&path, "new"), Err(HuntError::Persistence(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }
}
