//! Experiment selection, tunable parameters and identifier validation.

use std::fmt;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, RunnerError};
use crate::experiments::associative::AssociativeParams;
use crate::experiments::item_consolidation::ConsolidationParams;
use crate::experiments::parameter_search::ParameterSearchParams;
use crate::experiments::time_associative::TimeAssociativeParams;
use crate::experiments::timed_sequence::{TimedSequenceParams, MAX_BLOCKS};
use crate::protocol::COMMUNICATIONS_FIELDS;
use crate::store::{
    LogFile, BLOCK_LIST_FILE, CHECKPOINT_FILE, COMMUNICATIONS_FILE, DELAYS_FILE, EVENTS_FILE,
    PSYCH_RATINGS_FILE, PSYCH_SCORES_FILE, PULSES_FILE, STIMULUS_LIST_FILE, TIMING_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Experiment {
    AssociativeRecognition,
    ItemConsolidation,
    TimeAssociativeRecognition,
    TimedSequenceRecognition,
    StimulationParameterSearch,
}

impl Experiment {
    pub const ALL: [Experiment; 5] = [
        Experiment::AssociativeRecognition,
        Experiment::ItemConsolidation,
        Experiment::TimeAssociativeRecognition,
        Experiment::TimedSequenceRecognition,
        Experiment::StimulationParameterSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Experiment::AssociativeRecognition => "associative_recognition",
            Experiment::ItemConsolidation => "item_consolidation",
            Experiment::TimeAssociativeRecognition => "time_associative_recognition",
            Experiment::TimedSequenceRecognition => "timed_sequence_recognition",
            Experiment::StimulationParameterSearch => "stimulation_parameter_search",
        }
    }

    pub fn trial_list_file(&self) -> &'static str {
        match self {
            Experiment::StimulationParameterSearch => STIMULUS_LIST_FILE,
            _ => BLOCK_LIST_FILE,
        }
    }

    /// Allowed values for the requested block count, or `None` when the
    /// experiment has a fixed structure.
    pub fn block_range(&self) -> Option<RangeInclusive<u32>> {
        match self {
            Experiment::AssociativeRecognition | Experiment::TimeAssociativeRecognition => {
                Some(0..=6)
            }
            Experiment::TimedSequenceRecognition => Some(1..=MAX_BLOCKS),
            Experiment::ItemConsolidation | Experiment::StimulationParameterSearch => None,
        }
    }

    pub fn talks_to_server(&self) -> bool {
        matches!(
            self,
            Experiment::AssociativeRecognition | Experiment::StimulationParameterSearch
        )
    }

    /// CSV logs bootstrapped header-only at initialization.
    pub fn log_files(&self) -> Vec<LogFile> {
        let mut logs = match self {
            Experiment::AssociativeRecognition => vec![
                log(CHECKPOINT_FILE, ASSOCIATIVE_CHECKPOINT),
                log(EVENTS_FILE, ASSOCIATIVE_EVENTS),
                log(TIMING_FILE, ASSOCIATIVE_TIMING),
                log(PULSES_FILE, ASSOCIATIVE_PULSES),
            ],
            Experiment::ItemConsolidation => vec![
                log(CHECKPOINT_FILE, CONSOLIDATION_CHECKPOINT),
                log(EVENTS_FILE, CONSOLIDATION_EVENTS),
                log(TIMING_FILE, CONSOLIDATION_TIMING),
                log(PULSES_FILE, CONSOLIDATION_PULSES),
            ],
            Experiment::TimeAssociativeRecognition => vec![
                log(CHECKPOINT_FILE, ASSOCIATIVE_CHECKPOINT),
                log(EVENTS_FILE, TIME_ASSOCIATIVE_EVENTS),
                log(TIMING_FILE, TIME_ASSOCIATIVE_TIMING),
                log(PULSES_FILE, ASSOCIATIVE_PULSES),
                log(DELAYS_FILE, TIME_ASSOCIATIVE_DELAYS),
            ],
            Experiment::TimedSequenceRecognition => vec![
                log(CHECKPOINT_FILE, SEQUENCE_CHECKPOINT),
                log(EVENTS_FILE, SEQUENCE_EVENTS),
                log(TIMING_FILE, SEQUENCE_TIMING),
                log(PULSES_FILE, SEQUENCE_PULSES),
                log(DELAYS_FILE, SEQUENCE_DELAYS),
            ],
            Experiment::StimulationParameterSearch => vec![
                log(CHECKPOINT_FILE, SEARCH_CHECKPOINT),
                log(EVENTS_FILE, SEARCH_EVENTS),
                log(PULSES_FILE, SEARCH_PULSES),
                log(PSYCH_RATINGS_FILE, SEARCH_PSYCH_RATINGS),
                log(PSYCH_SCORES_FILE, SEARCH_PSYCH_SCORES),
            ],
        };
        if self.talks_to_server() {
            logs.push(log(COMMUNICATIONS_FILE, &COMMUNICATIONS_FIELDS));
        }
        logs
    }
}

fn log(name: &'static str, fieldnames: &'static [&'static str]) -> LogFile {
    LogFile { name, fieldnames }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Experiment {
    type Err = RunnerError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().replace('-', "_");
        Experiment::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| {
                RunnerError::config(format!(
                    "unknown experiment '{}': expected one of {}",
                    raw,
                    Experiment::ALL.map(|e| e.as_str()).join(", ")
                ))
            })
    }
}

const ASSOCIATIVE_CHECKPOINT: &[&str] = &[
    "subject", "session", "experiment_block", "experiment_phase", "trial_index", "log_num",
    "log_time",
];
const ASSOCIATIVE_PULSES: &[&str] = &[
    "subject", "session", "experiment_block", "experiment_phase", "trial_index", "pulse_time",
    "log_num", "log_time",
];
const ASSOCIATIVE_EVENTS: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "trial_index",
    "top_word",
    "bottom_word",
    "study_answer",
    "test_condition",
    "test_stimulation_condition",
    "study_response",
    "study_time_to_respond",
    "test_response",
    "test_time_to_respond",
    "log_num",
    "log_time",
];
const ASSOCIATIVE_TIMING: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "trial_index",
    "sync_time",
    "orient_time",
    "trial_time",
    "response_time",
    "log_num",
    "log_time",
];

const CONSOLIDATION_CHECKPOINT: &[&str] = &[
    "subject", "session", "experiment_phase", "trial_index", "log_num", "log_time",
];
const CONSOLIDATION_PULSES: &[&str] = &[
    "subject", "session", "experiment_phase", "trial_index", "pulse_time", "log_num", "log_time",
];
const CONSOLIDATION_EVENTS: &[&str] = &[
    "subject",
    "session",
    "experiment_phase",
    "event",
    "trial_index",
    "noun",
    "noun_type",
    "noun_category",
    "environment",
    "test_condition",
    "response",
    "time_to_respond",
    "log_num",
    "log_time",
];
const CONSOLIDATION_TIMING: &[&str] = &[
    "subject",
    "session",
    "experiment_phase",
    "event",
    "trial_index",
    "sync_time",
    "orient_time",
    "trial_time",
    "time_to_respond",
    "log_num",
    "log_time",
];

const TIME_ASSOCIATIVE_EVENTS: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "trial_index",
    "item",
    "item_category",
    "celebrity_face",
    "celebrity_gender",
    "interval",
    "interval_type",
    "test_condition",
    "item_response",
    "item_time_to_respond",
    "face_response",
    "face_time_to_respond",
    "interval_response",
    "interval_time_to_respond",
    "trial_time",
    "log_num",
    "log_time",
];
const TIME_ASSOCIATIVE_TIMING: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "trial_index",
    "sync_time",
    "orient_time",
    "trial_time",
    "item_time",
    "interval_time",
    "interval",
    "face_time",
    "item_question_time",
    "item_time_to_respond",
    "face_question_time",
    "face_time_to_respond",
    "interval_question_time",
    "interval_time_to_respond",
    "log_num",
    "log_time",
];
const TIME_ASSOCIATIVE_DELAYS: &[&str] = &[
    "subject", "session", "experiment_block", "experiment_phase", "delay_time", "delay_duration",
    "log_num", "log_time",
];

const SEQUENCE_CHECKPOINT: &[&str] = &[
    "subject", "session", "experiment_block", "experiment_phase", "sequence_index", "log_num",
    "log_time",
];
const SEQUENCE_PULSES: &[&str] = &[
    "subject", "session", "experiment_block", "experiment_phase", "sequence_index", "pulse_time",
    "log_num", "log_time",
];
const SEQUENCE_EVENTS: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "sequence_index",
    "sequence_group",
    "interval_type",
    "emoji",
    "interval",
    "face1",
    "face2",
    "response",
    "correct_response",
    "time_to_respond",
    "trial_time",
    "log_num",
    "log_time",
];
const SEQUENCE_TIMING: &[&str] = &[
    "subject",
    "session",
    "experiment_block",
    "experiment_phase",
    "sequence_index",
    "sequence_group",
    "interval_type",
    "sync_time",
    "orient_time",
    "trial_time",
    "emoji_time",
    "face1_time",
    "interval_time",
    "interval",
    "face2_time",
    "question_time",
    "time_to_respond",
    "log_num",
    "log_time",
];
const SEQUENCE_DELAYS: &[&str] = &[
    "subject", "session", "experiment_block", "delay_time", "delay_duration", "log_num", "log_time",
];

const SEARCH_CHECKPOINT: &[&str] = &["subject", "session", "experiment_block", "trial_index"];
const SEARCH_EVENTS: &[&str] = &[
    "subject",
    "session",
    "event_type",
    "label",
    "anode",
    "cathode",
    "amplitude",
    "frequency",
    "pulse_width",
    "duration",
    "time",
    "trial_index",
];
const SEARCH_PULSES: &[&str] = &["subject", "session", "time", "pulse_id"];
/// One row per scale item rated during the session.
const SEARCH_PSYCH_RATINGS: &[&str] = &["subject", "session", "test", "scale", "rating", "time"];
/// One row per scale total.
const SEARCH_PSYCH_SCORES: &[&str] = &["subject", "session", "test", "score", "time"];

/// Effective settings: built-in defaults, optionally overridden from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub subject_prefix: String,
    pub subject_digits: usize,
    pub associative_recognition: AssociativeParams,
    pub item_consolidation: ConsolidationParams,
    pub time_associative_recognition: TimeAssociativeParams,
    pub timed_sequence_recognition: TimedSequenceParams,
    pub stimulation_parameter_search: ParameterSearchParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            subject_prefix: "SC".to_string(),
            subject_digits: 3,
            associative_recognition: AssociativeParams::default(),
            item_consolidation: ConsolidationParams::default(),
            time_associative_recognition: TimeAssociativeParams::default(),
            timed_sequence_recognition: TimedSequenceParams::default(),
            stimulation_parameter_search: ParameterSearchParams::default(),
        }
    }
}

impl Settings {
    /// Defaults when `path` is `None`. An empty file also yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.is_file() {
            return Err(RunnerError::config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(&raw)?;
        debug!(path = %path.display(), "loaded settings overrides");
        Ok(settings)
    }

    /// Prefix followed by exactly `subject_digits` ASCII digits, e.g. `SC001`.
    pub fn validate_subject(&self, subject: &str) -> Result<()> {
        let digits = subject.strip_prefix(self.subject_prefix.as_str());
        let valid = matches!(
            digits,
            Some(d) if d.len() == self.subject_digits && d.bytes().all(|b| b.is_ascii_digit())
        );
        if valid {
            Ok(())
        } else {
            Err(RunnerError::config(format!(
                "invalid subject code '{}': expected {} followed by {} digits",
                subject, self.subject_prefix, self.subject_digits
            )))
        }
    }

    /// The parameters of one experiment as JSON.
    pub fn params_value(&self, experiment: Experiment) -> Result<Value> {
        Ok(match experiment {
            Experiment::AssociativeRecognition => {
                serde_json::to_value(&self.associative_recognition)?
            }
            Experiment::ItemConsolidation => serde_json::to_value(&self.item_consolidation)?,
            Experiment::TimeAssociativeRecognition => {
                serde_json::to_value(&self.time_associative_recognition)?
            }
            Experiment::TimedSequenceRecognition => {
                serde_json::to_value(&self.timed_sequence_recognition)?
            }
            Experiment::StimulationParameterSearch => {
                serde_json::to_value(&self.stimulation_parameter_search)?
            }
        })
    }
}

pub fn validate_session(session: &str) -> Result<()> {
    if !session.is_empty() && session.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(RunnerError::config(format!(
            "invalid session '{}': expected digits only",
            session
        )))
    }
}

/// Block count to build. A missing count takes the top of the range;
/// fixed-structure experiments reject an explicit one.
pub fn validate_block_count(experiment: Experiment, blocks: Option<u32>) -> Result<u32> {
    match (experiment.block_range(), blocks) {
        (Some(range), Some(n)) if range.contains(&n) => Ok(n),
        (Some(range), Some(n)) => Err(RunnerError::config(format!(
            "{} takes {} to {} blocks, {} requested",
            experiment,
            range.start(),
            range.end(),
            n
        ))),
        (Some(range), None) => Ok(*range.end()),
        (None, None) => Ok(0),
        (None, Some(n)) => Err(RunnerError::config(format!(
            "{} has a fixed structure; a block count of {} cannot be applied",
            experiment, n
        ))),
    }
}

/// Snapshot key telling a parameter search session that runs without
/// stimulation apart from one whose stimulus list was never written.
pub const STIMULATION_ENABLED_KEY: &str = "stimulation_enabled";

/// Provenance recorded alongside the snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotMeta<'a> {
    pub experiment: Experiment,
    pub subject: &'a str,
    pub session: &'a str,
    pub blocks: u32,
    pub seed: Option<u64>,
    /// `None` when the session has no trial list.
    pub block_list_digest: Option<&'a str>,
}

/// Flat map of the effective parameters. Nested objects are joined with
/// dots, e.g. `study_run_limits.environment`.
pub fn snapshot(settings: &Settings, meta: &SnapshotMeta<'_>) -> Result<Value> {
    let mut flat = Map::new();
    flatten_into(&mut flat, "", settings.params_value(meta.experiment)?);
    flat.insert("experiment".to_string(), Value::from(meta.experiment.as_str()));
    flat.insert("subject".to_string(), Value::from(meta.subject));
    flat.insert("session".to_string(), Value::from(meta.session));
    flat.insert("subject_prefix".to_string(), Value::from(settings.subject_prefix.as_str()));
    if meta.experiment.block_range().is_some() {
        flat.insert("experiment_blocks".to_string(), Value::from(meta.blocks));
    }
    flat.insert("seed".to_string(), meta.seed.map(Value::from).unwrap_or(Value::Null));
    flat.insert("created_at".to_string(), Value::from(Utc::now().to_rfc3339()));
    flat.insert(
        "block_list_digest".to_string(),
        meta.block_list_digest.map(Value::from).unwrap_or(Value::Null),
    );
    if meta.experiment == Experiment::StimulationParameterSearch {
        flat.insert(
            STIMULATION_ENABLED_KEY.to_string(),
            Value::from(settings.stimulation_parameter_search.locations_label().is_some()),
        );
    }
    Ok(Value::Object(flat))
}

fn flatten_into(out: &mut Map<String, Value>, prefix: &str, value: Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let key = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(out, &key, child);
            }
        }
        other => {
            out.insert(prefix.to_string(), other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_yaml(tag: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "recall_config_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("overrides.yaml");
        fs::write(&path, contents).expect("write yaml");
        (dir, path)
    }

    #[test]
    fn experiment_names_round_trip() {
        for experiment in Experiment::ALL {
            assert_eq!(experiment.as_str().parse::<Experiment>().expect("parse"), experiment);
        }
        assert_eq!(
            "timed-sequence-recognition".parse::<Experiment>().expect("dashes"),
            Experiment::TimedSequenceRecognition
        );
        assert!("free_recall".parse::<Experiment>().is_err());
    }

    #[test]
    fn subject_codes_need_prefix_and_exact_digits() {
        let settings = Settings::default();
        settings.validate_subject("SC001").expect("valid");
        for bad in ["SC01", "SC0001", "XX001", "sc001", "SC0a1", ""] {
            assert!(settings.validate_subject(bad).is_err(), "{} should be rejected", bad);
        }
        validate_session("12").expect("valid session");
        assert!(validate_session("").is_err());
        assert!(validate_session("1a").is_err());
    }

    #[test]
    fn block_counts_follow_experiment_ranges() {
        assert_eq!(validate_block_count(Experiment::AssociativeRecognition, Some(0)).expect("ok"), 0);
        assert!(validate_block_count(Experiment::AssociativeRecognition, Some(7)).is_err());
        assert_eq!(
            validate_block_count(Experiment::TimedSequenceRecognition, None).expect("default"),
            45
        );
        assert!(validate_block_count(Experiment::TimedSequenceRecognition, Some(0)).is_err());
        assert!(validate_block_count(Experiment::ItemConsolidation, Some(2)).is_err());
    }

    #[test]
    fn yaml_overrides_replace_fields_and_reject_unknown() {
        let (dir, path) = temp_yaml(
            "override",
            "associative_recognition:\n  same_per_block: 20\nitem_consolidation:\n  study_repetitions: 2\n",
        );
        let settings = Settings::load(Some(&path)).expect("load");
        assert_eq!(settings.associative_recognition.same_per_block, 20);
        assert_eq!(settings.associative_recognition.rearranged_per_block, 15);
        assert_eq!(settings.item_consolidation.study_repetitions, 2);
        let _ = fs::remove_dir_all(dir);

        let (dir, path) = temp_yaml("unknown", "associative_recognition:\n  pairs: 3\n");
        let err = Settings::load(Some(&path)).expect_err("unknown field");
        assert_eq!(err.code(), "yaml_error");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_is_flat_with_provenance() {
        let settings = Settings::default();
        let value = snapshot(
            &settings,
            &SnapshotMeta {
                experiment: Experiment::ItemConsolidation,
                subject: "SC002",
                session: "1",
                blocks: 0,
                seed: Some(7),
                block_list_digest: Some("sha256:abc"),
            },
        )
        .expect("snapshot");
        assert_eq!(value["experiment"], "item_consolidation");
        assert_eq!(value["seed"], 7);
        assert_eq!(value["block_list_digest"], "sha256:abc");
        assert_eq!(value["study_run_limits.environment"], 3);
        assert!(value.get("experiment_blocks").is_none());
        assert!(value.as_object().expect("map").values().all(|v| !v.is_object()));
        assert!(value.get(STIMULATION_ENABLED_KEY).is_none());
    }

    #[test]
    fn parameter_search_snapshot_records_stimulation_mode() {
        let settings = Settings::default();
        let value = snapshot(
            &settings,
            &SnapshotMeta {
                experiment: Experiment::StimulationParameterSearch,
                subject: "SC005",
                session: "2",
                blocks: 0,
                seed: None,
                block_list_digest: None,
            },
        )
        .expect("snapshot");
        assert_eq!(value[STIMULATION_ENABLED_KEY], false);
        assert!(value["block_list_digest"].is_null());
    }

    #[test]
    fn server_linked_experiments_get_communications_log() {
        let names = |e: Experiment| e.log_files().iter().map(|l| l.name).collect::<Vec<_>>();
        assert!(names(Experiment::AssociativeRecognition).contains(&COMMUNICATIONS_FILE));
        assert!(!names(Experiment::ItemConsolidation).contains(&COMMUNICATIONS_FILE));
        assert!(names(Experiment::TimedSequenceRecognition).contains(&DELAYS_FILE));
        let search = names(Experiment::StimulationParameterSearch);
        assert!(search.contains(&PSYCH_RATINGS_FILE));
        assert!(search.contains(&PSYCH_SCORES_FILE));
        assert!(!search.contains(&TIMING_FILE));
        assert_eq!(
            Experiment::TimedSequenceRecognition.log_files()[0].fieldnames[4],
            "sequence_index"
        );
    }
}
