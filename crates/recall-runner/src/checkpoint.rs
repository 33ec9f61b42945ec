//! The append-only checkpoint log: one row per completed trial.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};
use crate::trial::BlockNumber;

/// Timed sequence recognition logs `sequence_index` in place of `trial_index`.
const INDEX_COLUMNS: [&str; 2] = ["trial_index", "sequence_index"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// 1-based line in the CSV file, header included.
    pub line: u64,
    pub experiment_block: Option<BlockNumber>,
    pub experiment_phase: Option<String>,
    pub trial_index: u32,
}

/// Values for one appended row. Columns the log does not have are ignored;
/// columns without a value here are left empty.
#[derive(Debug, Clone, Default)]
pub struct CheckpointEntry {
    pub subject: String,
    pub session: String,
    pub experiment_block: Option<BlockNumber>,
    pub experiment_phase: Option<String>,
    pub trial_index: u32,
    pub log_num: u64,
}

impl CheckpointEntry {
    fn field(&self, column: &str, log_time: &str) -> String {
        match column {
            "subject" => self.subject.clone(),
            "session" => self.session.clone(),
            "experiment_block" => self
                .experiment_block
                .map(|b| b.to_string())
                .unwrap_or_default(),
            "experiment_phase" => self.experiment_phase.clone().unwrap_or_default(),
            "trial_index" | "sequence_index" => self.trial_index.to_string(),
            "log_num" => self.log_num.to_string(),
            "log_time" => log_time.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLog {
    path: PathBuf,
}

impl CheckpointLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn integrity(&self, line: u64, reason: impl Into<String>) -> RunnerError {
        RunnerError::CheckpointIntegrity {
            path: self.path.clone(),
            line,
            reason: reason.into(),
        }
    }

    /// Every data row in file order. A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<CheckpointRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let index_column = INDEX_COLUMNS.iter().find_map(|&name| column(name));
        let block_column = column("experiment_block");
        let phase_column = column("experiment_phase");

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let line = row.position().map(|p| p.line()).unwrap_or(0);
            if row.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            let index_column = index_column
                .ok_or_else(|| self.integrity(1, "header has no trial_index column"))?;
            let raw_index = row.get(index_column).unwrap_or("").trim();
            let trial_index = raw_index.parse::<u32>().map_err(|_| {
                self.integrity(line, format!("invalid trial index '{}'", raw_index))
            })?;
            let experiment_block = match block_column {
                Some(i) => {
                    let raw = row.get(i).unwrap_or("").trim();
                    Some(raw.parse::<u32>().map(BlockNumber).map_err(|_| {
                        self.integrity(line, format!("invalid experiment block '{}'", raw))
                    })?)
                }
                None => None,
            };
            let experiment_phase = match phase_column {
                Some(i) => {
                    let raw = row.get(i).unwrap_or("").trim();
                    if raw.is_empty() {
                        return Err(self.integrity(line, "empty experiment phase"));
                    }
                    Some(raw.to_string())
                }
                None => None,
            };
            records.push(CheckpointRecord {
                line,
                experiment_block,
                experiment_phase,
                trial_index,
            });
        }
        debug!(path = %self.path.display(), rows = records.len(), "read checkpoint log");
        Ok(records)
    }

    /// Append one row in the column order of the existing header.
    pub fn append(&self, entry: &CheckpointEntry) -> Result<()> {
        let headers = {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_path(&self.path)?;
            reader.headers()?.clone()
        };
        let log_time = Utc::now().to_rfc3339();
        let row: Vec<String> = headers
            .iter()
            .map(|column| entry.field(column.trim(), &log_time))
            .collect();
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

/// The row with the greatest `key`; on ties the later row wins. Logs a
/// warning when that is not the physically last row.
pub fn select_authoritative<'a, K, F>(
    log: &CheckpointLog,
    records: &'a [CheckpointRecord],
    key: F,
) -> Result<Option<&'a CheckpointRecord>>
where
    K: Ord,
    F: Fn(&CheckpointRecord) -> Result<K>,
{
    let mut best: Option<(K, &CheckpointRecord)> = None;
    for record in records {
        let k = key(record)?;
        match &best {
            Some((current, _)) if *current > k => {}
            _ => best = Some((k, record)),
        }
    }
    let chosen = best.map(|(_, record)| record);
    if let (Some(chosen), Some(last)) = (chosen, records.last()) {
        if chosen.line != last.line {
            warn!(
                path = %log.path().display(),
                authoritative_line = chosen.line,
                last_line = last.line,
                "checkpoint rows are out of order; resuming from the furthest trial"
            );
        }
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_log(tag: &str, contents: &str) -> (PathBuf, CheckpointLog) {
        let dir = std::env::temp_dir().join(format!(
            "recall_checkpoint_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("checkpoint.csv");
        fs::write(&path, contents).expect("write checkpoint");
        (dir, CheckpointLog::new(path))
    }

    const HEADER: &str =
        "subject,session,experiment_block,experiment_phase,trial_index,log_num,log_time\n";

    #[test]
    fn missing_file_reads_empty() {
        let log = CheckpointLog::new("/nonexistent/recall/checkpoint.csv");
        assert!(log.read().expect("read").is_empty());
    }

    #[test]
    fn reads_rows_with_line_numbers() {
        let (dir, log) = temp_log(
            "rows",
            &format!("{}SC001,1,0,ENCODING,0,1,t\nSC001,1,0,ENCODING,1,2,t\n", HEADER),
        );
        let records = log.read().expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].line, 3);
        assert_eq!(records[1].experiment_block, Some(BlockNumber(0)));
        assert_eq!(records[1].experiment_phase.as_deref(), Some("ENCODING"));
        assert_eq!(records[1].trial_index, 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn sequence_index_column_is_accepted() {
        let (dir, log) = temp_log(
            "sequence",
            "subject,session,experiment_block,experiment_phase,sequence_index,log_num,log_time\nSC004,1,3,RETRIEVAL,0,9,t\n",
        );
        let records = log.read().expect("read");
        assert_eq!(records[0].experiment_block, Some(BlockNumber(3)));
        assert_eq!(records[0].trial_index, 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_index_is_integrity_error() {
        let (dir, log) = temp_log("bad", &format!("{}SC001,1,0,ENCODING,,1,t\n", HEADER));
        match log.read().expect_err("empty index") {
            RunnerError::CheckpointIntegrity { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn append_follows_header_order() {
        let (dir, log) = temp_log("append", HEADER);
        log.append(&CheckpointEntry {
            subject: "SC001".to_string(),
            session: "1".to_string(),
            experiment_block: Some(BlockNumber(1)),
            experiment_phase: Some("RETRIEVAL".to_string()),
            trial_index: 2,
            log_num: 7,
        })
        .expect("append");
        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.lines().nth(1).expect("row").starts_with("SC001,1,1,RETRIEVAL,2,7,"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn authoritative_row_is_the_furthest() {
        let (dir, log) = temp_log(
            "order",
            &format!(
                "{}SC001,1,0,ENCODING,2,1,t\nSC001,1,0,RETRIEVAL,0,2,t\nSC001,1,0,ENCODING,1,3,t\n",
                HEADER
            ),
        );
        let records = log.read().expect("read");
        let chosen = select_authoritative(&log, &records, |r| {
            let rank = if r.experiment_phase.as_deref() == Some("RETRIEVAL") { 1 } else { 0 };
            Ok((r.experiment_block, rank, r.trial_index))
        })
        .expect("select")
        .expect("some row");
        assert_eq!(chosen.line, 3);
        let _ = fs::remove_dir_all(dir);
    }
}
