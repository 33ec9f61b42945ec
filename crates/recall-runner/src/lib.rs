pub mod checkpoint;
pub mod config;
pub mod error;
pub mod experiments;
pub mod lock;
pub mod pool;
pub mod protocol;
pub mod resume;
pub mod shuffle;
pub mod store;
pub mod trial;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub use checkpoint::{CheckpointEntry, CheckpointLog, CheckpointRecord};
pub use config::{Experiment, Settings};
pub use error::{Result, RunnerError};
pub use lock::SessionLock;
pub use protocol::{HandshakeOptions, Message, SessionContext, StimMode, StimulationLink};
pub use resume::{ResumeState, Resumption};
pub use store::SessionPaths;
pub use trial::{BlockNumber, BlockPhase, PhasedBlock};

use config::{
    snapshot, validate_block_count, validate_session, SnapshotMeta, STIMULATION_ENABLED_KEY,
};
use experiments::item_consolidation::ConsolidationPhases;
use experiments::parameter_search::Stimulus;
use experiments::{
    associative, item_consolidation, parameter_search, time_associative, timed_sequence,
    SessionIdentity,
};
use pool::ResourceLayout;
use protocol::CommunicationsLog;
use store::{
    atomic_write_json_pretty, bootstrap_logs, canonical_json_digest, count_data_rows, ensure_dir,
    guard_regeneration, load_json, write_session_files, SessionFiles,
};

pub struct InitRequest {
    pub experiment: Experiment,
    pub subject: String,
    pub session: String,
    pub data_dir: PathBuf,
    /// Root holding `word_lists/`, `image_lists/` and `subject_configurations/`.
    pub resources: PathBuf,
    pub blocks: Option<u32>,
    /// Recorded in the configuration snapshot; the caller seeds the RNG.
    pub seed: Option<u64>,
}

#[derive(Debug)]
pub struct InitResult {
    pub session_dir: PathBuf,
    /// `None` for a parameter search session run without stimulation.
    pub trial_list: Option<PathBuf>,
    /// False when the session was already initialized and nothing was written.
    pub created: bool,
    pub blocks: u32,
    pub block_list_digest: Option<String>,
    pub created_logs: Vec<PathBuf>,
}

/// Build and persist the trial list for a new session.
///
/// Identifiers, block count and stimulus pools are all checked before the
/// first write. An existing trial list makes this a no-op. A parameter
/// search without a stimulation label only gets its logs and snapshot.
pub fn initialize<R: Rng + ?Sized>(
    request: &InitRequest,
    settings: &Settings,
    rng: &mut R,
) -> Result<InitResult> {
    let experiment = request.experiment;
    settings.validate_subject(&request.subject)?;
    validate_session(&request.session)?;
    let blocks = validate_block_count(experiment, request.blocks)?;

    let paths = SessionPaths::new(&request.data_dir, &request.subject, &request.session);
    let trial_list = paths.file(experiment.trial_list_file());
    if trial_list.exists() {
        info!(
            experiment = %experiment,
            path = %trial_list.display(),
            "session already initialized; leaving it untouched"
        );
        return Ok(InitResult {
            session_dir: paths.dir().to_path_buf(),
            trial_list: Some(trial_list),
            created: false,
            blocks,
            block_list_digest: None,
            created_logs: Vec::new(),
        });
    }
    if experiment == Experiment::StimulationParameterSearch
        && settings.stimulation_parameter_search.locations_label().is_none()
    {
        return initialize_without_stimulation(request, settings, &paths);
    }
    guard_regeneration(&paths)?;

    let identity = SessionIdentity::new(request.subject.as_str(), request.session.as_str());
    let layout = ResourceLayout::new(&request.resources);
    let (list, session_keys) = build_trial_list(experiment, &identity, &layout, settings, blocks, rng)?;
    let digest = canonical_json_digest(&list);
    let configurations = snapshot(
        settings,
        &SnapshotMeta {
            experiment,
            subject: &request.subject,
            session: &request.session,
            blocks,
            seed: request.seed,
            block_list_digest: Some(&digest),
        },
    )?;

    let created_logs = bootstrap_logs(&paths, &experiment.log_files())?;
    ensure_dir(&paths.session_logs())?;
    let mut snapshots = vec![(paths.configurations(), configurations)];
    if let Some(keys) = session_keys {
        snapshots.push((paths.session_keys(), keys));
    }
    write_session_files(&SessionFiles {
        trial_list: (trial_list.clone(), list),
        snapshots,
    })?;
    info!(
        experiment = %experiment,
        subject = %request.subject,
        session = %request.session,
        blocks = blocks,
        "initialized session"
    );
    Ok(InitResult {
        session_dir: paths.dir().to_path_buf(),
        trial_list: Some(trial_list),
        created: true,
        blocks,
        block_list_digest: Some(digest),
        created_logs,
    })
}

/// Logs and a configuration snapshot, no stimulus list. Repeating it only
/// fills in missing logs.
fn initialize_without_stimulation(
    request: &InitRequest,
    settings: &Settings,
    paths: &SessionPaths,
) -> Result<InitResult> {
    let experiment = request.experiment;
    let created_logs = bootstrap_logs(paths, &experiment.log_files())?;
    ensure_dir(&paths.session_logs())?;
    let created = !paths.configurations().exists();
    if created {
        let configurations = snapshot(
            settings,
            &SnapshotMeta {
                experiment,
                subject: &request.subject,
                session: &request.session,
                blocks: 0,
                seed: request.seed,
                block_list_digest: None,
            },
        )?;
        atomic_write_json_pretty(&paths.configurations(), &configurations)?;
    }
    info!(
        experiment = %experiment,
        subject = %request.subject,
        session = %request.session,
        created,
        "initialized session without stimulation; no stimulus list"
    );
    Ok(InitResult {
        session_dir: paths.dir().to_path_buf(),
        trial_list: None,
        created,
        blocks: 0,
        block_list_digest: None,
        created_logs,
    })
}

/// A parameter search session whose snapshot says stimulation is off.
fn runs_without_stimulation(paths: &SessionPaths) -> Result<bool> {
    if paths.stimulus_list().exists() || !paths.configurations().exists() {
        return Ok(false);
    }
    let configurations: Value = load_json(&paths.configurations())?;
    Ok(configurations.get(STIMULATION_ENABLED_KEY) == Some(&Value::Bool(false)))
}

/// The persisted trial list and, for time associative recognition, the
/// session's response key mapping.
fn build_trial_list<R: Rng + ?Sized>(
    experiment: Experiment,
    identity: &SessionIdentity,
    layout: &ResourceLayout,
    settings: &Settings,
    blocks: u32,
    rng: &mut R,
) -> Result<(Value, Option<Value>)> {
    Ok(match experiment {
        Experiment::AssociativeRecognition => {
            let pools = associative::AssociativePools::load(layout)?;
            let list = associative::build(
                identity,
                pools,
                &settings.associative_recognition,
                blocks,
                rng,
            )?;
            (serde_json::to_value(list)?, None)
        }
        Experiment::ItemConsolidation => {
            let pools = item_consolidation::ConsolidationPools::load(layout)?;
            let phases = item_consolidation::build(identity, pools, &settings.item_consolidation, rng)?;
            (serde_json::to_value(phases)?, None)
        }
        Experiment::TimeAssociativeRecognition => {
            let params = &settings.time_associative_recognition;
            let pools = time_associative::TimeAssociativePools::load(layout)?;
            let list = time_associative::build(identity, pools, params, blocks, rng)?;
            let keys = time_associative::SessionKeys::draw(params, rng);
            (serde_json::to_value(list)?, Some(serde_json::to_value(keys)?))
        }
        Experiment::TimedSequenceRecognition => {
            let pools = timed_sequence::TimedSequencePools::load(layout)?;
            let list = timed_sequence::build(
                identity,
                pools,
                &settings.timed_sequence_recognition,
                blocks,
                rng,
            )?;
            (serde_json::to_value(list)?, None)
        }
        Experiment::StimulationParameterSearch => {
            let params = &settings.stimulation_parameter_search;
            let label = params.locations_label().ok_or_else(|| {
                RunnerError::config("stimulation is off; there is no stimulus list to build")
            })?;
            let path = parameter_search::locations_file(layout, &identity.subject, label);
            let locations = parameter_search::read_locations(&path)?;
            let list = parameter_search::build(&locations, params, rng)?;
            (serde_json::to_value(list)?, None)
        }
    })
}

/// One stretch of remaining work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub trials: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub experiment: Experiment,
    pub state: ResumeState,
    pub skip_study_phase: bool,
    pub remaining: Vec<Segment>,
}

impl ResumeReport {
    pub fn is_complete(&self) -> bool {
        self.state == ResumeState::SessionDone
    }

    pub fn remaining_trials(&self) -> usize {
        self.remaining.iter().map(|s| s.trials).sum()
    }
}

fn load_trial_list<T: DeserializeOwned>(paths: &SessionPaths, experiment: Experiment) -> Result<T> {
    let path = paths.file(experiment.trial_list_file());
    if !path.exists() {
        guard_regeneration(paths)?;
        return Err(RunnerError::config(format!(
            "session {} is not initialized: {} is missing",
            paths.dir().display(),
            path.display()
        )));
    }
    load_json(&path)
}

/// Load a block list and trim it to the work still to do.
pub fn resume_blocks<B>(paths: &SessionPaths, experiment: Experiment) -> Result<Resumption<Vec<B>>>
where
    B: DeserializeOwned + PhasedBlock,
{
    let lock = SessionLock::new(paths.lock());
    if lock.is_locked() {
        return Ok(Resumption::SessionComplete);
    }
    let blocks: Vec<B> = load_trial_list(paths, experiment)?;
    resume::resolve_checkpoint(blocks, &CheckpointLog::new(paths.checkpoint()), &lock)
}

fn block_segments<B: PhasedBlock>(blocks: &[B]) -> Vec<Segment> {
    blocks
        .iter()
        .flat_map(|b| {
            [
                (BlockPhase::Encoding, b.study_len()),
                (BlockPhase::Retrieval, b.test_len()),
            ]
            .map(|(phase, trials)| Segment {
                block: Some(b.block_number()),
                phase: Some(phase.as_str().to_string()),
                trials,
            })
        })
        .collect()
}

fn report<L>(
    experiment: Experiment,
    resumption: Resumption<L>,
    segments: impl FnOnce(&L) -> Vec<Segment>,
) -> ResumeReport {
    match resumption {
        Resumption::Continue {
            remaining,
            skip_study_phase,
            state,
        } => ResumeReport {
            experiment,
            state,
            skip_study_phase,
            remaining: segments(&remaining),
        },
        Resumption::SessionComplete => ResumeReport {
            experiment,
            state: ResumeState::SessionDone,
            skip_study_phase: false,
            remaining: Vec::new(),
        },
    }
}

/// Resolve where an interrupted session picks up. A completed session is
/// locked and reported as [`ResumeState::SessionDone`].
pub fn resume(experiment: Experiment, paths: &SessionPaths) -> Result<ResumeReport> {
    let lock = SessionLock::new(paths.lock());
    let log = CheckpointLog::new(paths.checkpoint());
    let no_trials = experiment == Experiment::StimulationParameterSearch
        && !lock.is_locked()
        && runs_without_stimulation(paths)?;
    let report = match experiment {
        Experiment::AssociativeRecognition => report(
            experiment,
            resume_blocks::<associative::AssociativeBlock>(paths, experiment)?,
            |blocks| block_segments(blocks),
        ),
        Experiment::TimeAssociativeRecognition => report(
            experiment,
            resume_blocks::<time_associative::TimeAssociativeBlock>(paths, experiment)?,
            |blocks| block_segments(blocks),
        ),
        Experiment::TimedSequenceRecognition => report(
            experiment,
            resume_blocks::<timed_sequence::TimedSequenceBlock>(paths, experiment)?,
            |blocks| block_segments(blocks),
        ),
        Experiment::ItemConsolidation => {
            let resumption = if lock.is_locked() {
                Resumption::SessionComplete
            } else {
                let phases: ConsolidationPhases = load_trial_list(paths, experiment)?;
                resume::resolve_phases(phases, &log, &lock)?
            };
            report(experiment, resumption, |phases| {
                phases
                    .iter()
                    .map(|(phase, trials)| Segment {
                        block: None,
                        phase: Some(phase.as_str().to_string()),
                        trials: trials.len(),
                    })
                    .collect()
            })
        }
        Experiment::StimulationParameterSearch if no_trials => {
            ResumeReport {
                experiment,
                state: ResumeState::NoTrials,
                skip_study_phase: false,
                remaining: Vec::new(),
            }
        }
        Experiment::StimulationParameterSearch => {
            let resumption = if lock.is_locked() {
                Resumption::SessionComplete
            } else {
                let stimuli: Vec<Stimulus> = load_trial_list(paths, experiment)?;
                resume::resolve_flat(stimuli, &log, &lock)?
            };
            report(experiment, resumption, |stimuli| {
                vec![Segment {
                    block: None,
                    phase: None,
                    trials: stimuli.len(),
                }]
            })
        }
    };
    info!(
        experiment = %experiment,
        state = ?report.state,
        remaining_trials = report.remaining_trials(),
        skip_study_phase = report.skip_study_phase,
        "resume decision"
    );
    Ok(report)
}

pub struct StatusResult {
    pub session_dir: PathBuf,
    pub locked: bool,
    /// Experiment recorded in the configuration snapshot, when readable.
    pub experiment: Option<String>,
    pub files: BTreeMap<&'static str, bool>,
    pub checkpoint_rows: usize,
}

pub fn status(paths: &SessionPaths) -> Result<StatusResult> {
    let files = [
        store::BLOCK_LIST_FILE,
        store::STIMULUS_LIST_FILE,
        store::CONFIGURATIONS_FILE,
        store::SESSION_KEYS_FILE,
        store::CHECKPOINT_FILE,
        store::EVENTS_FILE,
        store::TIMING_FILE,
        store::PULSES_FILE,
        store::DELAYS_FILE,
        store::COMMUNICATIONS_FILE,
        store::PSYCH_RATINGS_FILE,
        store::PSYCH_SCORES_FILE,
    ]
    .into_iter()
    .map(|name| (name, paths.file(name).exists()))
    .collect();
    let experiment = load_json::<Value>(&paths.configurations())
        .ok()
        .and_then(|v| v.get("experiment").and_then(|e| e.as_str()).map(str::to_string));
    Ok(StatusResult {
        session_dir: paths.dir().to_path_buf(),
        locked: SessionLock::new(paths.lock()).is_locked(),
        experiment,
        files,
        checkpoint_rows: count_data_rows(&paths.checkpoint())?,
    })
}

/// Run the opening handshake and then close the link, logging all traffic
/// to the session's `communications.csv`.
pub fn handshake<S: Read + Write>(
    stream: S,
    paths: &SessionPaths,
    configure: Message,
    options: &HandshakeOptions,
) -> Result<SessionContext> {
    ensure_dir(paths.dir())?;
    let mut link = StimulationLink::new(stream, CommunicationsLog::new(paths.communications()));
    let mut ctx = SessionContext::new();
    link.open(&mut ctx, configure, options)?;
    link.close(&mut ctx, options)?;
    Ok(ctx)
}
