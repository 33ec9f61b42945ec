//! Durable per-session files: the generated trial list, the configuration
//! snapshot, and the header-only CSV logs the execution engine appends to.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, RunnerError};

pub const BLOCK_LIST_FILE: &str = "experiment_block_list.json";
pub const STIMULUS_LIST_FILE: &str = "stimulus_list.json";
pub const CONFIGURATIONS_FILE: &str = "configurations.json";
pub const SESSION_KEYS_FILE: &str = "session_keys_dictionary.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.csv";
pub const EVENTS_FILE: &str = "events.csv";
pub const TIMING_FILE: &str = "timing.csv";
pub const PULSES_FILE: &str = "pulses.csv";
pub const DELAYS_FILE: &str = "delays.csv";
pub const COMMUNICATIONS_FILE: &str = "communications.csv";
pub const PSYCH_RATINGS_FILE: &str = "psych_ratings.csv";
pub const PSYCH_SCORES_FILE: &str = "psych_scores.csv";
pub const LOCK_FILE: &str = "session_lock.txt";

/// File layout of one (subject, session) directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    /// `<data_dir>/<subject>/session_<session>/`
    pub fn new(data_dir: &Path, subject: &str, session: &str) -> Self {
        Self {
            dir: data_dir.join(subject).join(format!("session_{}", session)),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn block_list(&self) -> PathBuf {
        self.file(BLOCK_LIST_FILE)
    }

    pub fn stimulus_list(&self) -> PathBuf {
        self.file(STIMULUS_LIST_FILE)
    }

    pub fn configurations(&self) -> PathBuf {
        self.file(CONFIGURATIONS_FILE)
    }

    pub fn session_keys(&self) -> PathBuf {
        self.file(SESSION_KEYS_FILE)
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.file(CHECKPOINT_FILE)
    }

    pub fn events(&self) -> PathBuf {
        self.file(EVENTS_FILE)
    }

    pub fn communications(&self) -> PathBuf {
        self.file(COMMUNICATIONS_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.file(LOCK_FILE)
    }

    pub fn session_logs(&self) -> PathBuf {
        self.dir.join("session_logs")
    }
}

/// A CSV log created header-only at initialization.
#[derive(Debug, Clone, Copy)]
pub struct LogFile {
    pub name: &'static str,
    pub fieldnames: &'static [&'static str],
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write to a sibling temp file, fsync, then rename over the target, so a
/// reader sees either the previous state or the complete new file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// sha256 over the key-sorted compact JSON encoding.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

/// Data rows in a CSV log, not counting the header. Missing file is 0.
pub fn count_data_rows(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        if record.iter().any(|field| !field.trim().is_empty()) {
            rows += 1;
        }
    }
    Ok(rows)
}

/// Create each log with only its header row. Existing files are left alone.
pub fn bootstrap_logs(paths: &SessionPaths, logs: &[LogFile]) -> Result<Vec<PathBuf>> {
    ensure_dir(paths.dir())?;
    let mut created = Vec::new();
    for log in logs {
        let path = paths.file(log.name);
        if path.exists() {
            continue;
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(log.fieldnames)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| RunnerError::Io(e.into_error()))?;
        atomic_write_bytes(&path, &bytes)?;
        debug!(path = %path.display(), "created log header");
        created.push(path);
    }
    Ok(created)
}

/// Files written by a successful initialization, in write order. The trial
/// list goes last: its presence is what marks the session as initialized.
pub struct SessionFiles {
    pub trial_list: (PathBuf, Value),
    pub snapshots: Vec<(PathBuf, Value)>,
}

pub fn write_session_files(files: &SessionFiles) -> Result<String> {
    for (path, value) in &files.snapshots {
        atomic_write_json_pretty(path, value)?;
    }
    let (list_path, list) = &files.trial_list;
    atomic_write_json_pretty(list_path, list)?;
    let digest = canonical_json_digest(list);
    info!(path = %list_path.display(), digest = %digest, "persisted trial list");
    Ok(digest)
}

/// Refuse to regenerate a missing trial list once the session has logged
/// trials against the previous one.
pub fn guard_regeneration(paths: &SessionPaths) -> Result<()> {
    for path in [paths.checkpoint(), paths.events()] {
        let rows = count_data_rows(&path)?;
        if rows > 0 {
            return Err(RunnerError::SessionIncomplete(format!(
                "{} has {} logged rows but the trial list is missing; verify the session directory {}",
                path.display(),
                rows,
                paths.dir().display()
            )));
        }
    }
    Ok(())
}
