//! Activation record store and validation log persistence.
//!
//! Pure data access, no policy: the engine decides what to write, the store
//! only guarantees the single-active-row invariant on write. File-backed
//! implementations keep a small JSON document (records) and a JSON-lines
//! file (log) under the platform data directory; in-memory implementations
//! back the test suites.

use crate::error::{LicenseError, LicenseResult};
use crate::record::{ActivationRecord, ValidationLogEntry};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Persistence seam for the activation record.
pub trait ActivationStore: Send + Sync {
    /// Loads the record currently marked active, if any.
    fn load_active(&self) -> LicenseResult<Option<ActivationRecord>>;

    /// Inserts or updates `record` (matched by normalized license key) and
    /// marks it the single active row, flipping all others to inactive.
    fn upsert_active(&self, record: &ActivationRecord) -> LicenseResult<()>;

    /// Flips every stored record to inactive.
    fn deactivate_all(&self) -> LicenseResult<()>;
}

/// Append-only audit trail sink.
pub trait ValidationLog: Send + Sync {
    fn append(&self, entry: ValidationLogEntry) -> LicenseResult<()>;
}

fn upsert_rows(rows: &mut Vec<ActivationRecord>, record: &ActivationRecord) {
    for row in rows.iter_mut() {
        row.is_active = false;
    }
    let mut record = record.clone();
    record.is_active = true;
    match rows
        .iter_mut()
        .find(|row| row.license_key == record.license_key)
    {
        Some(existing) => *existing = record,
        None => rows.push(record),
    }
}

// ── File-backed implementations ──────────────────────────────

/// JSON-file record store.
pub struct FileActivationStore {
    path: PathBuf,
    // Serializes read-modify-write cycles against the file.
    guard: Mutex<()>,
}

impl FileActivationStore {
    /// Creates a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Opens the store at the platform data directory
    /// (`<data_dir>/tillpoint/activation.json`), creating parents.
    pub fn open_default() -> LicenseResult<Self> {
        let dir = data_dir()?;
        Ok(Self::new(dir.join("activation.json")))
    }

    fn load_rows(&self) -> LicenseResult<Vec<ActivationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| LicenseError::Storage(format!("read {}: {e}", self.path.display())))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_rows(&self, rows: &[ActivationRecord]) -> LicenseResult<()> {
        let raw = serde_json::to_string_pretty(rows)?;
        // Write-then-rename so a crash mid-write never truncates the record.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|e| LicenseError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| LicenseError::Storage(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }
}

impl ActivationStore for FileActivationStore {
    fn load_active(&self) -> LicenseResult<Option<ActivationRecord>> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load_rows()?.into_iter().find(|r| r.is_active))
    }

    fn upsert_active(&self, record: &ActivationRecord) -> LicenseResult<()> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows = self.load_rows()?;
        upsert_rows(&mut rows, record);
        self.save_rows(&rows)
    }

    fn deactivate_all(&self) -> LicenseResult<()> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows = self.load_rows()?;
        for row in &mut rows {
            row.is_active = false;
        }
        self.save_rows(&rows)
    }
}

/// JSON-lines append-only log file.
pub struct FileValidationLog {
    path: PathBuf,
}

impl FileValidationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the log at `<data_dir>/tillpoint/validation_log.jsonl`.
    pub fn open_default() -> LicenseResult<Self> {
        let dir = data_dir()?;
        Ok(Self::new(dir.join("validation_log.jsonl")))
    }
}

impl ValidationLog for FileValidationLog {
    fn append(&self, entry: ValidationLogEntry) -> LicenseResult<()> {
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LicenseError::Storage(format!("open {}: {e}", self.path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| LicenseError::Storage(format!("append {}: {e}", self.path.display())))?;
        Ok(())
    }
}

fn data_dir() -> LicenseResult<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| LicenseError::Storage("no platform data directory".into()))?
        .join("tillpoint");
    fs::create_dir_all(&dir)
        .map_err(|e| LicenseError::Storage(format!("create {}: {e}", dir.display())))?;
    Ok(dir)
}

// ── In-memory implementations (tests, previews) ──────────────

/// In-memory record store.
#[derive(Default)]
pub struct MemoryActivationStore {
    rows: Mutex<Vec<ActivationRecord>>,
}

impl MemoryActivationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with a pre-existing record (startup-flow tests).
    pub fn seed(&self, record: ActivationRecord) {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }

    /// Snapshot of all rows, active or not.
    #[must_use]
    pub fn rows(&self) -> Vec<ActivationRecord> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ActivationStore for MemoryActivationStore {
    fn load_active(&self) -> LicenseResult<Option<ActivationRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.is_active)
            .cloned())
    }

    fn upsert_active(&self, record: &ActivationRecord) -> LicenseResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        upsert_rows(&mut rows, record);
        Ok(())
    }

    fn deactivate_all(&self) -> LicenseResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows.iter_mut() {
            row.is_active = false;
        }
        Ok(())
    }
}

/// In-memory validation log.
#[derive(Default)]
pub struct MemoryValidationLog {
    entries: Mutex<Vec<ValidationLogEntry>>,
}

impl MemoryValidationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<ValidationLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ValidationLog for MemoryValidationLog {
    fn append(&self, entry: ValidationLogEntry) -> LicenseResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }
}
