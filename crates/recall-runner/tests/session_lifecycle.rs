use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use recall_runner::experiments::associative::AssociativeBlock;
use recall_runner::trial::ExperimentBlock;
use recall_runner::{
    BlockNumber, CheckpointEntry, CheckpointLog, Experiment, InitRequest, ResumeState,
    Resumption, RunnerError, SessionLock, SessionPaths, Settings,
};
use tempfile::TempDir;

fn words(prefix: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("{}{}", prefix, i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_associative_resources(root: &Path, per_list: usize) {
    let dir = root.join("word_lists").join("associative_recognition");
    fs::create_dir_all(&dir).expect("word list dir");
    fs::write(dir.join("inside.txt"), words("inside", per_list)).expect("inside list");
    fs::write(dir.join("outside.txt"), words("outside", per_list)).expect("outside list");
}

fn request(tmp: &TempDir, experiment: Experiment, blocks: Option<u32>) -> InitRequest {
    InitRequest {
        experiment,
        subject: "SC001".to_string(),
        session: "1".to_string(),
        data_dir: tmp.path().join("data"),
        resources: tmp.path().join("resources"),
        blocks,
        seed: Some(11),
    }
}

fn paths(tmp: &TempDir) -> SessionPaths {
    SessionPaths::new(&tmp.path().join("data"), "SC001", "1")
}

fn checkpoint(block: u32, phase: &str, trial_index: u32, log_num: u64) -> CheckpointEntry {
    CheckpointEntry {
        subject: "SC001".to_string(),
        session: "1".to_string(),
        experiment_block: Some(BlockNumber(block)),
        experiment_phase: Some(phase.to_string()),
        trial_index,
        log_num,
    }
}

#[test]
fn initialize_writes_list_snapshot_and_log_headers() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 420);
    let mut rng = StdRng::seed_from_u64(11);
    let result = recall_runner::initialize(
        &request(&tmp, Experiment::AssociativeRecognition, Some(1)),
        &Settings::default(),
        &mut rng,
    )
    .expect("initialize");
    assert!(result.created);

    let paths = paths(&tmp);
    let blocks: Vec<AssociativeBlock> =
        serde_json::from_slice(&fs::read(paths.block_list()).expect("read list")).expect("parse list");
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].experiment_block, BlockNumber(1));

    let header = fs::read_to_string(paths.checkpoint()).expect("checkpoint");
    assert_eq!(
        header,
        "subject,session,experiment_block,experiment_phase,trial_index,log_num,log_time\n"
    );
    assert!(paths.communications().exists());
    assert!(paths.session_logs().is_dir());

    let snapshot: serde_json::Value =
        serde_json::from_slice(&fs::read(paths.configurations()).expect("read snapshot"))
            .expect("parse snapshot");
    assert_eq!(snapshot["experiment"], "associative_recognition");
    assert_eq!(snapshot["seed"], 11);
    assert_eq!(snapshot["same_per_block"], 30);
    assert_eq!(
        snapshot["block_list_digest"].as_str(),
        result.block_list_digest.as_deref()
    );
}

#[test]
fn second_initialize_leaves_block_list_byte_identical() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 420);
    let req = request(&tmp, Experiment::AssociativeRecognition, Some(2));
    recall_runner::initialize(&req, &Settings::default(), &mut StdRng::seed_from_u64(1))
        .expect("first initialize");
    let before = fs::read(paths(&tmp).block_list()).expect("read list");

    let again = recall_runner::initialize(&req, &Settings::default(), &mut StdRng::seed_from_u64(2))
        .expect("second initialize");
    assert!(!again.created);
    assert!(again.created_logs.is_empty());
    assert_eq!(fs::read(paths(&tmp).block_list()).expect("reread list"), before);
}

#[test]
fn fresh_list_resumes_unchanged() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 420);
    recall_runner::initialize(
        &request(&tmp, Experiment::AssociativeRecognition, Some(1)),
        &Settings::default(),
        &mut StdRng::seed_from_u64(3),
    )
    .expect("initialize");
    let paths = paths(&tmp);
    let persisted: Vec<AssociativeBlock> =
        serde_json::from_slice(&fs::read(paths.block_list()).expect("read list")).expect("parse list");

    let resumption = recall_runner::resume_blocks::<AssociativeBlock>(
        &paths,
        Experiment::AssociativeRecognition,
    )
    .expect("resume");
    assert_eq!(
        resumption,
        Resumption::Continue {
            remaining: persisted,
            skip_study_phase: false,
            state: ResumeState::NotStarted,
        }
    );
}

#[test]
fn logged_trials_drive_resume_and_final_trial_locks() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 420);
    recall_runner::initialize(
        &request(&tmp, Experiment::AssociativeRecognition, Some(1)),
        &Settings::default(),
        &mut StdRng::seed_from_u64(4),
    )
    .expect("initialize");
    let paths = paths(&tmp);
    let log = CheckpointLog::new(paths.checkpoint());

    log.append(&checkpoint(0, "ENCODING", 4, 1)).expect("append");
    let report = recall_runner::resume(Experiment::AssociativeRecognition, &paths).expect("resume");
    assert_eq!(report.state, ResumeState::MidStudy);
    assert!(!report.skip_study_phase);
    assert_eq!(report.remaining[0].phase.as_deref(), Some("ENCODING"));
    assert_eq!(report.remaining[0].trials, 40);
    assert_eq!(report.remaining.len(), 4);

    log.append(&checkpoint(1, "RETRIEVAL", 59, 2)).expect("append");
    let report = recall_runner::resume(Experiment::AssociativeRecognition, &paths).expect("resume");
    assert!(report.is_complete());
    assert!(paths.lock().exists());
    assert_eq!(fs::metadata(paths.lock()).expect("lock").len(), 0);

    // A locked session stays complete without consulting the log again.
    fs::write(paths.checkpoint(), "garbage\n\"unterminated").expect("clobber log");
    let report = recall_runner::resume(Experiment::AssociativeRecognition, &paths).expect("resume");
    assert!(report.is_complete());
}

#[test]
fn missing_list_with_logged_rows_refuses_regeneration() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 420);
    let req = request(&tmp, Experiment::AssociativeRecognition, Some(0));
    recall_runner::initialize(&req, &Settings::default(), &mut StdRng::seed_from_u64(5))
        .expect("initialize");
    let paths = paths(&tmp);
    CheckpointLog::new(paths.checkpoint())
        .append(&checkpoint(0, "ENCODING", 0, 1))
        .expect("append");
    fs::remove_file(paths.block_list()).expect("remove list");

    let err = recall_runner::initialize(&req, &Settings::default(), &mut StdRng::seed_from_u64(6))
        .expect_err("regeneration refused");
    assert!(matches!(err, RunnerError::SessionIncomplete(_)));
    assert!(!paths.block_list().exists());

    let err = recall_runner::resume(Experiment::AssociativeRecognition, &paths)
        .expect_err("nothing to resume");
    assert_eq!(err.code(), "session_incomplete");
}

#[test]
fn undersized_pool_fails_before_anything_is_written() {
    let tmp = TempDir::new().expect("tempdir");
    write_associative_resources(&tmp.path().join("resources"), 100);
    let err = recall_runner::initialize(
        &request(&tmp, Experiment::AssociativeRecognition, Some(1)),
        &Settings::default(),
        &mut StdRng::seed_from_u64(7),
    )
    .expect_err("pool too small");
    assert!(matches!(err, RunnerError::Configuration(_)));
    assert!(!paths(&tmp).dir().exists());

    let err = recall_runner::initialize(
        &request(&tmp, Experiment::AssociativeRecognition, Some(9)),
        &Settings::default(),
        &mut StdRng::seed_from_u64(7),
    )
    .expect_err("block count out of range");
    assert_eq!(err.code(), "configuration_error");
}

#[test]
fn timed_sequence_resumes_at_probe_after_study() {
    let tmp = TempDir::new().expect("tempdir");
    let images = tmp.path().join("resources").join("image_lists");
    fs::create_dir_all(&images).expect("image dir");
    fs::write(images.join("all_emojis.txt"), "e0 e1 e2 e3\ne4 e5 e6 e7\n").expect("emojis");
    fs::write(images.join("all_celebrities.txt"), "f0 f1 f2 f3 f4 f5 f6 f7").expect("faces");
    recall_runner::initialize(
        &request(&tmp, Experiment::TimedSequenceRecognition, Some(2)),
        &Settings::default(),
        &mut StdRng::seed_from_u64(8),
    )
    .expect("initialize");
    let paths = paths(&tmp);
    let header = fs::read_to_string(paths.checkpoint()).expect("checkpoint");
    assert!(header.contains("sequence_index"));
    assert!(paths.file("delays.csv").exists());

    CheckpointLog::new(paths.checkpoint())
        .append(&checkpoint(0, "ENCODING", 3, 1))
        .expect("append");
    let report = recall_runner::resume(Experiment::TimedSequenceRecognition, &paths).expect("resume");
    assert_eq!(report.state, ResumeState::StudyDoneMidTest);
    assert!(report.skip_study_phase);
    assert_eq!(report.remaining[0].block, Some(BlockNumber(0)));
    assert_eq!(report.remaining[1].trials, 1);
}

#[test]
fn parameter_search_resumes_flat_list() {
    let tmp = TempDir::new().expect("tempdir");
    let config_dir = tmp
        .path()
        .join("resources")
        .join("subject_configurations")
        .join("SC001");
    fs::create_dir_all(&config_dir).expect("config dir");
    fs::write(
        config_dir.join("SC001_stimulation_locations_macro.csv"),
        "LA1-LA2,1,2\n",
    )
    .expect("locations");
    let mut settings = Settings::default();
    settings.stimulation_parameter_search.stimulation_label = Some("macro".to_string());
    settings.stimulation_parameter_search.trials_per_combination = 2;
    recall_runner::initialize(
        &request(&tmp, Experiment::StimulationParameterSearch, None),
        &settings,
        &mut StdRng::seed_from_u64(9),
    )
    .expect("initialize");
    let paths = paths(&tmp);
    assert_eq!(
        fs::read_to_string(paths.file("psych_ratings.csv")).expect("ratings log"),
        "subject,session,test,scale,rating,time\n"
    );
    assert_eq!(
        fs::read_to_string(paths.file("psych_scores.csv")).expect("scores log"),
        "subject,session,test,score,time\n"
    );
    let stimuli: Vec<serde_json::Value> =
        serde_json::from_slice(&fs::read(paths.stimulus_list()).expect("read list")).expect("parse");
    assert_eq!(stimuli.len(), 3 * 3 * 2 * 2);

    let log = CheckpointLog::new(paths.checkpoint());
    log.append(&CheckpointEntry {
        experiment_block: Some(BlockNumber(0)),
        trial_index: 9,
        ..checkpoint(0, "", 0, 0)
    })
    .expect("append");
    let report = recall_runner::resume(Experiment::StimulationParameterSearch, &paths).expect("resume");
    assert_eq!(report.remaining_trials(), 36 - 10);
    assert!(!report.skip_study_phase);
}

#[test]
fn parameter_search_without_stimulation_logs_only() {
    let tmp = TempDir::new().expect("tempdir");
    let mut settings = Settings::default();
    settings.stimulation_parameter_search.stimulation_label = Some("none".to_string());
    let result = recall_runner::initialize(
        &request(&tmp, Experiment::StimulationParameterSearch, None),
        &settings,
        &mut StdRng::seed_from_u64(10),
    )
    .expect("initialize without stimulation");
    let paths = paths(&tmp);
    assert!(result.created);
    assert!(result.trial_list.is_none());
    assert!(!paths.stimulus_list().exists());
    for name in [
        "checkpoint.csv",
        "events.csv",
        "pulses.csv",
        "psych_ratings.csv",
        "psych_scores.csv",
        "communications.csv",
    ] {
        assert!(paths.file(name).exists(), "{} should be bootstrapped", name);
    }
    assert_eq!(result.created_logs.len(), 6);

    let report = recall_runner::resume(Experiment::StimulationParameterSearch, &paths).expect("resume");
    assert_eq!(report.state, ResumeState::NoTrials);
    assert_eq!(report.remaining_trials(), 0);
    assert!(!report.is_complete());

    fs::write(
        paths.events(),
        format!(
            "{}SC001,1,SHAM,,,,,,,,1.5,0\n",
            fs::read_to_string(paths.events()).expect("events")
        ),
    )
    .expect("log an event");
    let again = recall_runner::initialize(
        &request(&tmp, Experiment::StimulationParameterSearch, None),
        &settings,
        &mut StdRng::seed_from_u64(10),
    )
    .expect("repeat initialize");
    assert!(!again.created);
    assert!(again.created_logs.is_empty());
    assert!(fs::read_to_string(paths.events()).expect("events").contains("SHAM"));
}

#[test]
fn parameter_search_missing_list_with_label_is_not_initialized() {
    let tmp = TempDir::new().expect("tempdir");
    let err = recall_runner::resume(Experiment::StimulationParameterSearch, &paths(&tmp))
        .expect_err("nothing initialized");
    assert!(matches!(err, RunnerError::Configuration(_)));
}

fn two_by_three() -> Vec<ExperimentBlock<u32>> {
    (0..2)
        .map(|b| ExperimentBlock {
            subject: None,
            session: None,
            experiment_block: BlockNumber(b),
            study_phase: vec![0, 1, 2],
            test_phase: vec![0, 1, 2],
        })
        .collect()
}

fn resolve_with(rows: &str) -> (TempDir, SessionLock, Resumption<Vec<ExperimentBlock<u32>>>) {
    let tmp = TempDir::new().expect("tempdir");
    let log = CheckpointLog::new(tmp.path().join("checkpoint.csv"));
    fs::write(
        log.path(),
        format!(
            "subject,session,experiment_block,experiment_phase,trial_index,log_num,log_time\n{}",
            rows
        ),
    )
    .expect("write checkpoint");
    let lock = SessionLock::new(tmp.path().join("session_lock.txt"));
    let resumption =
        recall_runner::resume::resolve_checkpoint(two_by_three(), &log, &lock).expect("resolve");
    (tmp, lock, resumption)
}

#[test]
fn mid_study_checkpoint_truncates_first_block() {
    let (_tmp, lock, resumption) = resolve_with("SC001,1,0,ENCODING,0,1,t\nSC001,1,0,ENCODING,1,2,t\n");
    match resumption {
        Resumption::Continue {
            remaining,
            skip_study_phase,
            state,
        } => {
            assert_eq!(remaining.len(), 2);
            assert_eq!(remaining[0].experiment_block, BlockNumber(0));
            assert_eq!(remaining[0].study_phase, vec![2]);
            assert_eq!(remaining[0].test_phase, vec![0, 1, 2]);
            assert!(!skip_study_phase);
            assert_eq!(state, ResumeState::MidStudy);
        }
        Resumption::SessionComplete => panic!("session should continue"),
    }
    assert!(!lock.is_locked());
}

#[test]
fn last_trial_of_last_block_locks_session() {
    let (_tmp, lock, resumption) = resolve_with("SC001,1,1,RETRIEVAL,2,12,t\n");
    assert_eq!(resumption, Resumption::SessionComplete);
    assert!(lock.is_locked());
}

#[test]
fn out_of_order_rows_resume_from_furthest_trial() {
    let (_tmp, _lock, resumption) =
        resolve_with("SC001,1,1,ENCODING,1,8,t\nSC001,1,0,RETRIEVAL,2,6,t\n");
    match resumption {
        Resumption::Continue { remaining, state, .. } => {
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].study_phase, vec![2]);
            assert_eq!(state, ResumeState::MidStudy);
        }
        Resumption::SessionComplete => panic!("session should continue"),
    }
}
