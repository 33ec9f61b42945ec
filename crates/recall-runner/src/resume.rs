//! Resumption from the checkpoint log.
//!
//! The furthest recorded trial, by (block, phase, trial index), decides where
//! an interrupted session picks up. A session whose final trial is recorded
//! gets locked and reports [`Resumption::SessionComplete`].

use serde::Serialize;
use tracing::info;

use crate::checkpoint::{select_authoritative, CheckpointLog, CheckpointRecord};
use crate::error::{Result, RunnerError};
use crate::experiments::item_consolidation::{
    ConsolidationPhase, ConsolidationPhases, ConsolidationTrial,
};
use crate::lock::SessionLock;
use crate::trial::{BlockPhase, PhasedBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeState {
    NotStarted,
    MidStudy,
    StudyDoneMidTest,
    BlockDone,
    SessionDone,
    /// Initialized without a trial list; there is nothing to run.
    NoTrials,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resumption<L> {
    Continue {
        remaining: L,
        /// The first remaining block's study phase already ran.
        skip_study_phase: bool,
        state: ResumeState,
    },
    SessionComplete,
}

impl<L> Resumption<L> {
    pub fn state(&self) -> ResumeState {
        match self {
            Resumption::Continue { state, .. } => *state,
            Resumption::SessionComplete => ResumeState::SessionDone,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Resumption::SessionComplete)
    }

    pub fn map<M>(self, f: impl FnOnce(L) -> M) -> Resumption<M> {
        match self {
            Resumption::Continue {
                remaining,
                skip_study_phase,
                state,
            } => Resumption::Continue {
                remaining: f(remaining),
                skip_study_phase,
                state,
            },
            Resumption::SessionComplete => Resumption::SessionComplete,
        }
    }
}

fn integrity(log: &CheckpointLog, record: &CheckpointRecord, reason: String) -> RunnerError {
    RunnerError::CheckpointIntegrity {
        path: log.path().to_path_buf(),
        line: record.line,
        reason,
    }
}

fn complete<L>(lock: &SessionLock) -> Result<Resumption<L>> {
    lock.create()?;
    info!(lock = %lock.path().display(), "session already completed");
    Ok(Resumption::SessionComplete)
}

fn block_phase(log: &CheckpointLog, record: &CheckpointRecord) -> Result<BlockPhase> {
    let raw = record.experiment_phase.as_deref().unwrap_or("");
    BlockPhase::parse(raw)
        .ok_or_else(|| integrity(log, record, format!("unknown experiment phase '{}'", raw)))
}

/// Trim a study/test block list to the work still to do.
pub fn resolve_checkpoint<B: PhasedBlock>(
    mut blocks: Vec<B>,
    log: &CheckpointLog,
    lock: &SessionLock,
) -> Result<Resumption<Vec<B>>> {
    if lock.is_locked() {
        info!(lock = %lock.path().display(), "session is locked");
        return Ok(Resumption::SessionComplete);
    }
    let records = log.read()?;
    let last = select_authoritative(log, &records, |record| {
        let block = record.experiment_block.ok_or_else(|| {
            integrity(log, record, "row has no experiment block".to_string())
        })?;
        Ok((block, block_phase(log, record)?.rank(), record.trial_index))
    })?;
    let Some(last) = last else {
        return Ok(Resumption::Continue {
            remaining: blocks,
            skip_study_phase: false,
            state: ResumeState::NotStarted,
        });
    };

    let block_number = last.experiment_block.ok_or_else(|| {
        integrity(log, last, "row has no experiment block".to_string())
    })?;
    let phase = block_phase(log, last)?;
    let position = blocks
        .iter()
        .position(|b| b.block_number() == block_number)
        .ok_or_else(|| {
            integrity(log, last, format!("block {} is not in the trial list", block_number))
        })?;
    let index = last.trial_index as usize;
    let phase_len = match phase {
        BlockPhase::Encoding => blocks[position].study_len(),
        BlockPhase::Retrieval => blocks[position].test_len(),
    };
    if index >= phase_len {
        return Err(integrity(
            log,
            last,
            format!(
                "trial index {} is outside the {} phase of block {} ({} trials)",
                index,
                phase.as_str(),
                block_number,
                phase_len
            ),
        ));
    }

    let resumption = match phase {
        BlockPhase::Encoding if index + 1 < phase_len => {
            blocks.drain(..position);
            blocks[0].drop_completed_study(index + 1);
            Resumption::Continue {
                remaining: blocks,
                skip_study_phase: false,
                state: ResumeState::MidStudy,
            }
        }
        BlockPhase::Encoding => {
            blocks.drain(..position);
            Resumption::Continue {
                remaining: blocks,
                skip_study_phase: true,
                state: ResumeState::StudyDoneMidTest,
            }
        }
        BlockPhase::Retrieval if index + 1 < phase_len => {
            blocks.drain(..position);
            blocks[0].drop_completed_test(index + 1);
            Resumption::Continue {
                remaining: blocks,
                skip_study_phase: true,
                state: ResumeState::StudyDoneMidTest,
            }
        }
        BlockPhase::Retrieval if position + 1 < blocks.len() => {
            blocks.drain(..=position);
            Resumption::Continue {
                remaining: blocks,
                skip_study_phase: false,
                state: ResumeState::BlockDone,
            }
        }
        BlockPhase::Retrieval => return complete(lock),
    };
    info!(
        block = %block_number,
        phase = phase.as_str(),
        trial_index = index,
        state = ?resumption.state(),
        "resolved checkpoint"
    );
    Ok(resumption)
}

/// Remaining item consolidation phases, in order. The first one is trimmed
/// to start after the last recorded trial.
pub type PhaseList = Vec<(ConsolidationPhase, Vec<ConsolidationTrial>)>;

fn phase_position(
    ordered: &PhaseList,
    phase: ConsolidationPhase,
    log: &CheckpointLog,
    record: &CheckpointRecord,
) -> Result<usize> {
    ordered
        .iter()
        .position(|(p, _)| *p == phase)
        .ok_or_else(|| {
            integrity(
                log,
                record,
                format!("phase {} is not in the trial list", phase.as_str()),
            )
        })
}

pub fn resolve_phases(
    phases: ConsolidationPhases,
    log: &CheckpointLog,
    lock: &SessionLock,
) -> Result<Resumption<PhaseList>> {
    if lock.is_locked() {
        info!(lock = %lock.path().display(), "session is locked");
        return Ok(Resumption::SessionComplete);
    }
    let parse = |record: &CheckpointRecord| -> Result<ConsolidationPhase> {
        let raw = record.experiment_phase.as_deref().unwrap_or("");
        ConsolidationPhase::parse(raw)
            .ok_or_else(|| integrity(log, record, format!("unknown experiment phase '{}'", raw)))
    };
    let records = log.read()?;
    let last = select_authoritative(log, &records, |record| {
        Ok((parse(record)?, record.trial_index))
    })?;
    let mut ordered = phases.into_ordered();
    let Some(last) = last else {
        return Ok(Resumption::Continue {
            remaining: ordered,
            skip_study_phase: false,
            state: ResumeState::NotStarted,
        });
    };

    let phase = parse(last)?;
    let position = phase_position(&ordered, phase, log, last)?;
    let index = last.trial_index as usize;
    let phase_len = ordered[position].1.len();
    if index >= phase_len {
        return Err(integrity(
            log,
            last,
            format!(
                "trial index {} is outside phase {} ({} trials)",
                index,
                phase.as_str(),
                phase_len
            ),
        ));
    }

    let resumption = if index + 1 < phase_len {
        ordered.drain(..position);
        ordered[0].1.drain(..=index);
        Resumption::Continue {
            remaining: ordered,
            skip_study_phase: phase == ConsolidationPhase::Test,
            state: if phase == ConsolidationPhase::Test {
                ResumeState::StudyDoneMidTest
            } else {
                ResumeState::MidStudy
            },
        }
    } else if position + 1 < ordered.len() {
        ordered.drain(..=position);
        let next = ordered[0].0;
        Resumption::Continue {
            remaining: ordered,
            skip_study_phase: next == ConsolidationPhase::Test,
            state: ResumeState::BlockDone,
        }
    } else {
        return complete(lock);
    };
    info!(
        phase = phase.as_str(),
        trial_index = index,
        state = ?resumption.state(),
        "resolved checkpoint"
    );
    Ok(resumption)
}

/// Resume a single unphased list, such as the stimulation parameter search
/// stimulus list, after the furthest recorded trial.
pub fn resolve_flat<T>(
    mut items: Vec<T>,
    log: &CheckpointLog,
    lock: &SessionLock,
) -> Result<Resumption<Vec<T>>> {
    if lock.is_locked() {
        info!(lock = %lock.path().display(), "session is locked");
        return Ok(Resumption::SessionComplete);
    }
    let records = log.read()?;
    let last = select_authoritative(log, &records, |record| {
        Ok((record.experiment_block, record.trial_index))
    })?;
    let Some(last) = last else {
        return Ok(Resumption::Continue {
            remaining: items,
            skip_study_phase: false,
            state: ResumeState::NotStarted,
        });
    };
    let index = last.trial_index as usize;
    if index >= items.len() {
        return Err(integrity(
            log,
            last,
            format!("trial index {} is outside the list of {} trials", index, items.len()),
        ));
    }
    if index + 1 == items.len() {
        return complete(lock);
    }
    items.drain(..=index);
    info!(trial_index = index, remaining = items.len(), "resolved checkpoint");
    Ok(Resumption::Continue {
        remaining: items,
        skip_study_phase: false,
        state: ResumeState::MidStudy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::{BlockNumber, ExperimentBlock};
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;

    const HEADER: &str =
        "subject,session,experiment_block,experiment_phase,trial_index,log_num,log_time\n";

    fn session_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "recall_resume_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn blocks() -> Vec<ExperimentBlock<u32>> {
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

    fn resolve_rows(tag: &str, rows: &str) -> (PathBuf, Result<Resumption<Vec<ExperimentBlock<u32>>>>) {
        let dir = session_dir(tag);
        let log = CheckpointLog::new(dir.join("checkpoint.csv"));
        fs::write(log.path(), format!("{}{}", HEADER, rows)).expect("write checkpoint");
        let lock = SessionLock::new(dir.join("session_lock.txt"));
        (dir, resolve_checkpoint(blocks(), &log, &lock))
    }

    #[test]
    fn study_done_keeps_block_and_skips_study() {
        let (dir, result) = resolve_rows("study_done", "SC001,1,1,ENCODING,2,1,t\n");
        match result.expect("resolve") {
            Resumption::Continue {
                remaining,
                skip_study_phase,
                state,
            } => {
                assert_eq!(remaining.len(), 1);
                assert_eq!(remaining[0].experiment_block, BlockNumber(1));
                assert_eq!(remaining[0].test_phase, vec![0, 1, 2]);
                assert!(skip_study_phase);
                assert_eq!(state, ResumeState::StudyDoneMidTest);
            }
            Resumption::SessionComplete => panic!("session is not complete"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn mid_test_trims_test_phase() {
        let (dir, result) = resolve_rows("mid_test", "SC001,1,0,RETRIEVAL,0,1,t\n");
        match result.expect("resolve") {
            Resumption::Continue {
                remaining,
                skip_study_phase,
                ..
            } => {
                assert_eq!(remaining.len(), 2);
                assert_eq!(remaining[0].test_phase, vec![1, 2]);
                assert!(skip_study_phase);
            }
            Resumption::SessionComplete => panic!("session is not complete"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn finished_block_moves_to_next() {
        let (dir, result) = resolve_rows("block_done", "SC001,1,0,RETRIEVAL,2,1,t\n");
        let resumption = result.expect("resolve");
        assert_eq!(resumption.state(), ResumeState::BlockDone);
        match resumption {
            Resumption::Continue { remaining, skip_study_phase, .. } => {
                assert_eq!(remaining.len(), 1);
                assert_eq!(remaining[0].experiment_block, BlockNumber(1));
                assert_eq!(remaining[0].study_phase, vec![0, 1, 2]);
                assert!(!skip_study_phase);
            }
            Resumption::SessionComplete => panic!("session is not complete"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn index_past_phase_end_is_integrity_error() {
        let (dir, result) = resolve_rows("overrun", "SC001,1,0,ENCODING,3,1,t\n");
        assert!(matches!(
            result.expect_err("index 3 of 3"),
            RunnerError::CheckpointIntegrity { line: 2, .. }
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_phase_is_integrity_error() {
        let (dir, result) = resolve_rows("phase", "SC001,1,0,PRACTICE,0,1,t\n");
        assert!(matches!(
            result.expect_err("unknown phase"),
            RunnerError::CheckpointIntegrity { .. }
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn phase_missing_from_list_is_integrity_error() {
        let dir = session_dir("missing_phase");
        let log = CheckpointLog::new(dir.join("checkpoint.csv"));
        let record = CheckpointRecord {
            line: 4,
            experiment_block: None,
            experiment_phase: Some("TEST".to_string()),
            trial_index: 0,
        };
        let ordered: PhaseList = vec![
            (ConsolidationPhase::Study1, Vec::new()),
            (ConsolidationPhase::Study2, Vec::new()),
        ];
        assert_eq!(
            phase_position(&ordered, ConsolidationPhase::Study2, &log, &record).expect("present"),
            1
        );
        assert!(matches!(
            phase_position(&ordered, ConsolidationPhase::Test, &log, &record)
                .expect_err("TEST is absent"),
            RunnerError::CheckpointIntegrity { line: 4, .. }
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_block_is_integrity_error() {
        let (dir, result) = resolve_rows("block", "SC001,1,5,ENCODING,0,1,t\n");
        assert!(matches!(
            result.expect_err("block 5"),
            RunnerError::CheckpointIntegrity { .. }
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn flat_list_resumes_after_last_trial_and_locks_at_end() {
        let dir = session_dir("flat");
        let log = CheckpointLog::new(dir.join("checkpoint.csv"));
        let lock = SessionLock::new(dir.join("session_lock.txt"));
        fs::write(
            log.path(),
            "subject,session,experiment_block,trial_index\nSC005,1,0,0\nSC005,1,0,1\n",
        )
        .expect("write checkpoint");
        match resolve_flat(vec!["a", "b", "c", "d"], &log, &lock).expect("resolve") {
            Resumption::Continue { remaining, .. } => assert_eq!(remaining, vec!["c", "d"]),
            Resumption::SessionComplete => panic!("two trials remain"),
        }
        fs::write(
            log.path(),
            "subject,session,experiment_block,trial_index\nSC005,1,0,3\n",
        )
        .expect("write checkpoint");
        assert!(resolve_flat(vec!["a", "b", "c", "d"], &log, &lock)
            .expect("resolve")
            .is_complete());
        assert!(lock.is_locked());
        let _ = fs::remove_dir_all(dir);
    }
}
