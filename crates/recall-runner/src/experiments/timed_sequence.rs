//! Timed sequence recognition: four emoji-face-blank-face sequences per
//! block, two face pairs each shown with a long and a short blank. One
//! sequence is replayed without its emoji and the subject picks the emoji
//! from four screen quadrants.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SessionIdentity;
use crate::error::{Result, RunnerError};
use crate::pool::{ResourceLayout, StimulusPool};
use crate::trial::{BlockNumber, BlockPhase, IndexedTrial, PhasedBlock};

pub const MAX_BLOCKS: u32 = 45;
const SEQUENCES_PER_BLOCK: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimedSequenceParams {
    pub orient_duration_ms: u64,
    pub image_duration_ms: u64,
    pub short_blank_duration_s: u64,
    pub long_blank_duration_s: u64,
    pub intersequence_interval_ms: u64,
    pub intersequence_jitter_ms: u64,
    pub intertrial_interval_ms: u64,
    pub intertrial_jitter_ms: u64,
    pub preresponse_pause_ms: u64,
    pub standard_delay_ms: u64,
    pub deviant_delay_ms: u64,
    pub p_standard_delay: f64,
}

impl Default for TimedSequenceParams {
    fn default() -> Self {
        Self {
            orient_duration_ms: 2000,
            image_duration_ms: 2000,
            short_blank_duration_s: 2,
            long_blank_duration_s: 4,
            intersequence_interval_ms: 3000,
            intersequence_jitter_ms: 250,
            intertrial_interval_ms: 3000,
            intertrial_jitter_ms: 250,
            preresponse_pause_ms: 3000,
            standard_delay_ms: 20_000,
            deviant_delay_ms: 10_000,
            p_standard_delay: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceGroup {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceInterval {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quadrant {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::TopLeft,
        Quadrant::TopRight,
        Quadrant::BottomLeft,
        Quadrant::BottomRight,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub subject: String,
    pub session: String,
    pub experiment_block: BlockNumber,
    pub experiment_phase: BlockPhase,
    pub sequence_index: u32,
    pub sequence_group: SequenceGroup,
    pub interval_type: SequenceInterval,
    pub emoji: String,
    pub face1: String,
    /// Blank duration in seconds.
    pub interval: u64,
    pub face2: String,
}

impl IndexedTrial for Sequence {
    fn trial_index(&self) -> u32 {
        self.sequence_index
    }
}

/// The single retrieval trial of a block. Its checkpoint row carries
/// sequence index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeTrial {
    pub subject: String,
    pub session: String,
    pub experiment_block: BlockNumber,
    pub experiment_phase: BlockPhase,
    pub sequence: Sequence,
    /// Emojis in quadrant order: top left, top right, bottom left, bottom right.
    pub emojis: Vec<String>,
    pub correct_response: Quadrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSequenceBlock {
    pub subject: String,
    pub session: String,
    pub experiment_block: BlockNumber,
    pub study_phase: Vec<Sequence>,
    pub test_phase: ProbeTrial,
}

impl PhasedBlock for TimedSequenceBlock {
    fn block_number(&self) -> BlockNumber {
        self.experiment_block
    }

    fn study_len(&self) -> usize {
        self.study_phase.len()
    }

    fn test_len(&self) -> usize {
        1
    }

    fn drop_completed_study(&mut self, completed: usize) {
        let n = completed.min(self.study_phase.len());
        self.study_phase.drain(..n);
    }

    // A finished probe closes the block, so there is never a partial test
    // phase to trim.
    fn drop_completed_test(&mut self, _completed: usize) {}
}

pub struct TimedSequencePools {
    pub emojis: StimulusPool,
    pub faces: StimulusPool,
}

impl TimedSequencePools {
    pub fn load(layout: &ResourceLayout) -> Result<Self> {
        Ok(Self {
            emojis: StimulusPool::from_tokens(&layout.image_list("all_emojis.txt"))?,
            faces: StimulusPool::from_tokens(&layout.image_list("all_celebrities.txt"))?,
        })
    }
}

/// Build `n_blocks` blocks, numbered from 0.
pub fn build<R: Rng + ?Sized>(
    identity: &SessionIdentity,
    pools: TimedSequencePools,
    params: &TimedSequenceParams,
    n_blocks: u32,
    rng: &mut R,
) -> Result<Vec<TimedSequenceBlock>> {
    if !(1..=MAX_BLOCKS).contains(&n_blocks) {
        return Err(RunnerError::config(format!(
            "timed sequence recognition runs 1 to {} blocks, {} requested",
            MAX_BLOCKS, n_blocks
        )));
    }
    let needed = n_blocks as usize * SEQUENCES_PER_BLOCK;
    pools.emojis.require(needed)?;
    pools.faces.require(needed)?;
    let emojis = pools.emojis.shuffled(rng);
    let faces = pools.faces.shuffled(rng);

    let mut blocks = Vec::with_capacity(n_blocks as usize);
    for block in 0..n_blocks as usize {
        let number = BlockNumber(block as u32);
        let start = block * SEQUENCES_PER_BLOCK;
        let block_emojis = emojis.slice(start, start + SEQUENCES_PER_BLOCK)?;
        let block_faces = faces.slice(start, start + SEQUENCES_PER_BLOCK)?;

        let layout = [
            (SequenceGroup::A, SequenceInterval::Long, 0),
            (SequenceGroup::A, SequenceInterval::Short, 0),
            (SequenceGroup::B, SequenceInterval::Long, 2),
            (SequenceGroup::B, SequenceInterval::Short, 2),
        ];
        let mut study: Vec<Sequence> = layout
            .iter()
            .zip(block_emojis)
            .map(|(&(group, interval_type, face), emoji)| Sequence {
                subject: identity.subject.clone(),
                session: identity.session.clone(),
                experiment_block: number,
                experiment_phase: BlockPhase::Encoding,
                sequence_index: 0,
                sequence_group: group,
                interval_type,
                emoji: emoji.clone(),
                face1: block_faces[face].clone(),
                interval: match interval_type {
                    SequenceInterval::Long => params.long_blank_duration_s,
                    SequenceInterval::Short => params.short_blank_duration_s,
                },
                face2: block_faces[face + 1].clone(),
            })
            .collect();
        study.shuffle(rng);
        for (index, sequence) in study.iter_mut().enumerate() {
            sequence.sequence_index = index as u32;
        }

        let probe = study[rng.gen_range(0..study.len())].clone();
        let mut choices = block_emojis.to_vec();
        choices.shuffle(rng);
        let correct_response = choices
            .iter()
            .position(|e| *e == probe.emoji)
            .map(|i| Quadrant::ALL[i])
            .ok_or_else(|| RunnerError::config("probe emoji missing from response choices"))?;
        debug!(block = block, probe = probe.sequence_index, "arranged timed sequence block");

        blocks.push(TimedSequenceBlock {
            subject: identity.subject.clone(),
            session: identity.session.clone(),
            experiment_block: number,
            study_phase: study,
            test_phase: ProbeTrial {
                subject: identity.subject.clone(),
                session: identity.session.clone(),
                experiment_block: number,
                experiment_phase: BlockPhase::Retrieval,
                sequence: probe,
                emojis: choices,
                correct_response,
            },
        });
    }
    Ok(blocks)
}
