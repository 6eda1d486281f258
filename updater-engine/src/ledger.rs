//! Deployment ledger: the durable record of every attempted tag change.
//!
//! Records are appended `Pending` and move exactly once to a terminal
//! outcome. An environment holds at most one `Pending` record at a time.
//!
//! [`FileLedger`] persists one JSON document per environment at
//! `<dir>/<environment>.json`, rewritten atomically (`.tmp` + rename) on every
//! change. It re-reads from disk on each call so a CLI process and the daemon
//! see each other's records. Writers hold an advisory lock on `<dir>/.lock`
//! for the whole read-modify-write cycle.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use updater_core::{DeploymentId, DeploymentRecord, EnvironmentId, Outcome};

use crate::error::{io_err, LedgerError};

pub const LEDGER_VERSION: u32 = 1;

const LOCK_FILE: &str = ".lock";

/// Storage for deployment records.
pub trait DeploymentLedger: Send + Sync {
    /// Store a new `Pending` record.
    ///
    /// Fails with [`LedgerError::PendingExists`] when the environment already
    /// has a pending record, and with [`LedgerError::InvalidTransition`] when
    /// the record is not pending or its id is taken.
    fn append(&self, record: DeploymentRecord) -> Result<(), LedgerError>;

    /// Move a `Pending` record to a terminal outcome. Returns the stored record.
    fn update_outcome(
        &self,
        id: &DeploymentId,
        outcome: Outcome,
        commit: Option<String>,
        attempts: u32,
    ) -> Result<DeploymentRecord, LedgerError>;

    /// Records for `environment`, newest first.
    fn list_by_environment(
        &self,
        environment: &EnvironmentId,
    ) -> Result<Vec<DeploymentRecord>, LedgerError>;

    fn get(&self, id: &DeploymentId) -> Result<Option<DeploymentRecord>, LedgerError>;

    /// The environment's in-flight record, if any.
    fn pending(&self, environment: &EnvironmentId)
        -> Result<Option<DeploymentRecord>, LedgerError>;
}

// ---------------------------------------------------------------------------
// Shared transition rules
// ---------------------------------------------------------------------------

fn check_append(records: &[DeploymentRecord], record: &DeploymentRecord) -> Result<(), LedgerError> {
    if record.outcome != Outcome::Pending {
        return Err(LedgerError::InvalidTransition {
            id: record.id.clone(),
            reason: format!("new records must be pending, got {}", record.outcome),
        });
    }
    if records.iter().any(|r| r.id == record.id) {
        return Err(LedgerError::InvalidTransition {
            id: record.id.clone(),
            reason: "duplicate deployment id".to_string(),
        });
    }
    if records
        .iter()
        .any(|r| r.environment == record.environment && r.outcome == Outcome::Pending)
    {
        return Err(LedgerError::PendingExists(record.environment.clone()));
    }
    Ok(())
}

fn apply_outcome(
    record: &mut DeploymentRecord,
    outcome: Outcome,
    commit: Option<String>,
    attempts: u32,
) -> Result<(), LedgerError> {
    if record.outcome.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: record.id.clone(),
            reason: format!("record is already {}", record.outcome),
        });
    }
    if !outcome.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: record.id.clone(),
            reason: "outcome must be terminal".to_string(),
        });
    }
    record.outcome = outcome;
    record.commit = commit;
    record.attempts = attempts;
    record.updated_at = Utc::now();
    Ok(())
}

fn not_found(id: &DeploymentId) -> LedgerError {
    LedgerError::InvalidTransition {
        id: id.clone(),
        reason: "no such deployment".to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// 1. In-memory ledger
// ---------------------------------------------------------------------------

/// Volatile ledger, insertion ordered. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<DeploymentRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeploymentLedger for MemoryLedger {
    fn append(&self, record: DeploymentRecord) -> Result<(), LedgerError> {
        let mut records = lock(&self.records);
        check_append(&records, &record)?;
        records.push(record);
        Ok(())
    }

    fn update_outcome(
        &self,
        id: &DeploymentId,
        outcome: Outcome,
        commit: Option<String>,
        attempts: u32,
    ) -> Result<DeploymentRecord, LedgerError> {
        let mut records = lock(&self.records);
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| not_found(id))?;
        apply_outcome(record, outcome, commit, attempts)?;
        Ok(record.clone())
    }

    fn list_by_environment(
        &self,
        environment: &EnvironmentId,
    ) -> Result<Vec<DeploymentRecord>, LedgerError> {
        Ok(lock(&self.records)
            .iter()
            .rev()
            .filter(|r| &r.environment == environment)
            .cloned()
            .collect())
    }

    fn get(&self, id: &DeploymentId) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(lock(&self.records).iter().find(|r| &r.id == id).cloned())
    }

    fn pending(
        &self,
        environment: &EnvironmentId,
    ) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(lock(&self.records)
            .iter()
            .find(|r| &r.environment == environment && r.outcome == Outcome::Pending)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// 2. File ledger
// ---------------------------------------------------------------------------

/// On-disk payload for one environment. Records are stored oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerFile {
    pub version: u32,
    pub environment: EnvironmentId,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<DeploymentRecord>,
}

impl LedgerFile {
    fn empty(environment: &EnvironmentId) -> Self {
        Self {
            version: LEDGER_VERSION,
            environment: environment.clone(),
            updated_at: Utc::now(),
            records: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    /// Ledger rooted at `dir`. The directory is created on first write.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<environment>.json`. Bytes outside `[A-Za-z0-9.-]` are
    /// percent-encoded, so distinct ids never share a file.
    pub fn path_for(&self, environment: &EnvironmentId) -> PathBuf {
        let mut file = String::with_capacity(environment.0.len());
        for byte in environment.0.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
                file.push(char::from(byte));
            } else {
                let _ = write!(file, "%{byte:02X}");
            }
        }
        self.dir.join(format!("{file}.json"))
    }

    /// Take the directory's exclusive advisory lock, blocking until other
    /// writers (in this process or another) release it. Released on drop.
    fn lock_dir(&self) -> Result<File, LedgerError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        #[cfg(unix)]
        set_dir_permissions(&self.dir)?;

        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.lock_exclusive().map_err(|e| io_err(&path, e))?;
        Ok(file)
    }

    /// Load one environment's file; empty if it does not exist yet.
    pub fn load(&self, environment: &EnvironmentId) -> Result<LedgerFile, LedgerError> {
        let path = self.path_for(environment);
        if !path.exists() {
            return Ok(LedgerFile::empty(environment));
        }
        read_file(&path)
    }

    /// Callers hold the directory lock.
    fn save(&self, file: &LedgerFile) -> Result<(), LedgerError> {
        let path = self.path_for(&file.environment);
        let json = serde_json::to_string_pretty(file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Every ledger file in the directory, in file-name order.
    fn load_all(&self) -> Result<Vec<LedgerFile>, LedgerError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| io_err(&self.dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths.iter().map(|p| read_file(p)).collect()
    }
}

fn read_file(path: &Path) -> Result<LedgerFile, LedgerError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> Result<(), LedgerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(dir, e))
}

impl DeploymentLedger for FileLedger {
    fn append(&self, record: DeploymentRecord) -> Result<(), LedgerError> {
        let _lock = self.lock_dir()?;
        let mut file = self.load(&record.environment)?;
        check_append(&file.records, &record)?;
        if self.get(&record.id)?.is_some() {
            return Err(LedgerError::InvalidTransition {
                id: record.id.clone(),
                reason: "duplicate deployment id".to_string(),
            });
        }
        file.records.push(record);
        file.updated_at = Utc::now();
        self.save(&file)
    }

    fn update_outcome(
        &self,
        id: &DeploymentId,
        outcome: Outcome,
        commit: Option<String>,
        attempts: u32,
    ) -> Result<DeploymentRecord, LedgerError> {
        let _lock = self.lock_dir()?;
        for mut file in self.load_all()? {
            if let Some(record) = file.records.iter_mut().find(|r| &r.id == id) {
                apply_outcome(record, outcome, commit, attempts)?;
                let updated = record.clone();
                file.updated_at = Utc::now();
                self.save(&file)?;
                return Ok(updated);
            }
        }
        Err(not_found(id))
    }

    fn list_by_environment(
        &self,
        environment: &EnvironmentId,
    ) -> Result<Vec<DeploymentRecord>, LedgerError> {
        let mut records = self.load(environment)?.records;
        records.retain(|r| &r.environment == environment);
        records.reverse();
        Ok(records)
    }

    fn get(&self, id: &DeploymentId) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(self
            .load_all()?
            .into_iter()
            .flat_map(|f| f.records)
            .find(|r| &r.id == id))
    }

    fn pending(
        &self,
        environment: &EnvironmentId,
    ) -> Result<Option<DeploymentRecord>, LedgerError> {
        Ok(self
            .load(environment)?
            .records
            .into_iter()
            .find(|r| &r.environment == environment && r.outcome == Outcome::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use updater_core::{Digest, Initiator};

    fn record(id: &str, env: &str, tag: &str) -> DeploymentRecord {
        DeploymentRecord::pending(
            DeploymentId::from(id),
            EnvironmentId::from(env),
            None,
            tag,
            Digest::from(format!("sha256:{tag}")),
            Initiator::Poller,
        )
    }

    fn exercise(ledger: &dyn DeploymentLedger) {
        let env = EnvironmentId::from("staging");
        ledger.append(record("d1", "staging", "1.0.0")).unwrap();
        assert_eq!(ledger.pending(&env).unwrap().unwrap().id.0, "d1");

        let second = ledger.append(record("d2", "staging", "1.1.0")).unwrap_err();
        assert!(matches!(second, LedgerError::PendingExists(_)), "{second:?}");

        // Other environments are unaffected.
        ledger.append(record("p1", "prod", "1.0.0")).unwrap();

        let done = ledger
            .update_outcome(&DeploymentId::from("d1"), Outcome::Succeeded, Some("abc".into()), 1)
            .unwrap();
        assert_eq!(done.outcome, Outcome::Succeeded);
        assert_eq!(done.commit.as_deref(), Some("abc"));
        assert!(ledger.pending(&env).unwrap().is_none());

        let again = ledger
            .update_outcome(&DeploymentId::from("d1"), Outcome::failed("x"), None, 2)
            .unwrap_err();
        assert!(matches!(again, LedgerError::InvalidTransition { .. }));

        ledger.append(record("d2", "staging", "1.1.0")).unwrap();
        ledger
            .update_outcome(&DeploymentId::from("d2"), Outcome::failed("push-failed: denied"), None, 1)
            .unwrap();

        let history = ledger.list_by_environment(&env).unwrap();
        let ids: Vec<_> = history.iter().map(|r| r.id.0.as_str()).collect();
        assert_eq!(ids, ["d2", "d1"]);

        assert_eq!(ledger.get(&DeploymentId::from("p1")).unwrap().unwrap().new_tag, "1.0.0");
        assert!(ledger.get(&DeploymentId::from("nope")).unwrap().is_none());
    }

    #[test]
    fn memory_ledger_lifecycle() {
        exercise(&MemoryLedger::new());
    }

    #[test]
    fn file_ledger_lifecycle() {
        let tmp = TempDir::new().unwrap();
        exercise(&FileLedger::open(tmp.path().join("ledger")));
    }

    #[test]
    fn rejects_non_pending_append_and_pending_update() {
        let ledger = MemoryLedger::new();
        let mut done = record("d1", "staging", "1.0.0");
        done.outcome = Outcome::Succeeded;
        assert!(matches!(
            ledger.append(done).unwrap_err(),
            LedgerError::InvalidTransition { .. }
        ));

        ledger.append(record("d1", "staging", "1.0.0")).unwrap();
        assert!(matches!(
            ledger
                .update_outcome(&DeploymentId::from("d1"), Outcome::Pending, None, 0)
                .unwrap_err(),
            LedgerError::InvalidTransition { .. }
        ));
        assert!(matches!(
            ledger
                .update_outcome(&DeploymentId::from("missing"), Outcome::Succeeded, None, 1)
                .unwrap_err(),
            LedgerError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn file_ledger_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ledger");
        FileLedger::open(&dir)
            .append(record("d1", "staging", "1.0.0"))
            .unwrap();

        let reopened = FileLedger::open(&dir);
        let pending = reopened.pending(&EnvironmentId::from("staging")).unwrap();
        assert_eq!(pending.unwrap().new_tag, "1.0.0");
        assert!(reopened.path_for(&EnvironmentId::from("staging")).exists());
        assert!(!dir.join("staging.json.tmp").exists());
    }

    #[test]
    fn file_names_are_encoded() {
        let ledger = FileLedger::open("/tmp/ledger");
        assert_eq!(
            ledger.path_for(&EnvironmentId::from("eu/prod west")),
            PathBuf::from("/tmp/ledger/eu%2Fprod%20west.json")
        );
        assert_eq!(
            ledger.path_for(&EnvironmentId::from("staging-1.a")),
            PathBuf::from("/tmp/ledger/staging-1.a.json")
        );
    }

    #[test]
    fn similar_ids_get_separate_files() {
        let tmp = TempDir::new().unwrap();
        let ledger = FileLedger::open(tmp.path().join("ledger"));
        let slash = EnvironmentId::from("eu/prod");
        let underscore = EnvironmentId::from("eu_prod");
        assert_ne!(ledger.path_for(&slash), ledger.path_for(&underscore));

        ledger.append(record("d1", "eu/prod", "1.0.0")).unwrap();

        assert!(ledger.pending(&underscore).unwrap().is_none());
        assert!(ledger.list_by_environment(&underscore).unwrap().is_empty());
        ledger.append(record("d2", "eu_prod", "1.0.0")).unwrap();
        assert_eq!(ledger.pending(&slash).unwrap().unwrap().id.0, "d1");
        assert_eq!(ledger.list_by_environment(&underscore).unwrap()[0].id.0, "d2");
    }

    #[test]
    fn readers_skip_records_of_other_environments() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ledger");
        let ledger = FileLedger::open(&dir);
        // A file whose records belong to someone else, as an older naming
        // scheme could leave behind.
        let stray = LedgerFile {
            records: vec![record("x1", "eu/prod", "1.0.0")],
            ..LedgerFile::empty(&EnvironmentId::from("eu_prod"))
        };
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            ledger.path_for(&EnvironmentId::from("eu_prod")),
            serde_json::to_string(&stray).unwrap(),
        )
        .unwrap();

        let env = EnvironmentId::from("eu_prod");
        assert!(ledger.pending(&env).unwrap().is_none());
        assert!(ledger.list_by_environment(&env).unwrap().is_empty());
    }

    #[test]
    fn concurrent_writers_with_separate_handles_lose_nothing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ledger");
        let env = EnvironmentId::from("staging");

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    // A handle of its own, like a second process would have.
                    let ledger = FileLedger::open(dir);
                    for n in 0..10 {
                        let id = format!("w{w}-{n}");
                        loop {
                            match ledger.append(record(&id, "staging", "1.0.0")) {
                                Ok(()) => break,
                                Err(LedgerError::PendingExists(_)) => std::thread::yield_now(),
                                Err(e) => panic!("append failed: {e}"),
                            }
                        }
                        ledger
                            .update_outcome(&DeploymentId::from(id.as_str()), Outcome::Succeeded, None, 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let history = FileLedger::open(&dir).list_by_environment(&env).unwrap();
        assert_eq!(history.len(), 40);
        assert!(history.iter().all(|r| r.outcome == Outcome::Succeeded));
        assert!(dir.join(LOCK_FILE).exists());
    }

    #[test]
    fn missing_directory_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let ledger = FileLedger::open(tmp.path().join("absent"));
        let env = EnvironmentId::from("staging");
        assert!(ledger.list_by_environment(&env).unwrap().is_empty());
        assert!(ledger.pending(&env).unwrap().is_none());
    }
}
