//! Associative recognition: noun pairs studied in an imagined interaction,
//! then tested as same, rearranged (top words swapped between pairs) or new.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use super::SessionIdentity;
use crate::error::{Result, RunnerError};
use crate::pool::{ResourceLayout, StimulusPool};
use crate::shuffle::{derange, DEFAULT_MAX_ATTEMPTS};
use crate::trial::{BlockNumber, BlockPhase, ExperimentBlock, IndexedTrial};

pub const WORD_LIST_DIR: &str = "associative_recognition";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssociativeParams {
    /// Nouns per response position drawn from each list.
    pub pairs_per_position: usize,
    pub same_per_block: usize,
    pub rearranged_per_block: usize,
    pub new_per_block: usize,
    pub orient_duration_ms: u64,
    pub allowed_response_time_ms: u64,
    pub intertrial_interval_ms: u64,
    pub intertrial_jitter_ms: u64,
    pub top_key: String,
    pub bottom_key: String,
    pub new_key: String,
    pub same_key: String,
    pub rearranged_key: String,
    pub max_attempts: usize,
}

impl Default for AssociativeParams {
    fn default() -> Self {
        Self {
            pairs_per_position: 210,
            same_per_block: 30,
            rearranged_per_block: 15,
            new_per_block: 15,
            orient_duration_ms: 2000,
            allowed_response_time_ms: 4000,
            intertrial_interval_ms: 3000,
            intertrial_jitter_ms: 250,
            top_key: "A".to_string(),
            bottom_key: "S".to_string(),
            new_key: "F".to_string(),
            same_key: "G".to_string(),
            rearranged_key: "H".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AssociativeParams {
    pub fn block_size(&self) -> usize {
        self.same_per_block + self.rearranged_per_block + self.new_per_block
    }
}

/// Which word of the studied pair names the noun that fits inside the
/// other. Pairs that only appear at test were never studied and persist
/// as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyAnswer {
    Top,
    Bottom,
    NotStudied,
}

impl Serialize for StudyAnswer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            StudyAnswer::Top => serializer.serialize_str("top"),
            StudyAnswer::Bottom => serializer.serialize_str("bottom"),
            StudyAnswer::NotStudied => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for StudyAnswer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(-1) => Ok(StudyAnswer::NotStudied),
            Raw::Text(s) if s == "top" => Ok(StudyAnswer::Top),
            Raw::Text(s) if s == "bottom" => Ok(StudyAnswer::Bottom),
            Raw::Text(s) if s == "-1" => Ok(StudyAnswer::NotStudied),
            Raw::Text(s) => Err(serde::de::Error::custom(format!("invalid study answer '{}'", s))),
            Raw::Number(n) => Err(serde::de::Error::custom(format!("invalid study answer {}", n))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairCondition {
    Same,
    Rearranged,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordPairTrial {
    pub subject: String,
    pub session: String,
    pub experiment_block: BlockNumber,
    pub experiment_phase: BlockPhase,
    pub trial_index: u32,
    pub top_word: String,
    pub bottom_word: String,
    pub study_answer: StudyAnswer,
    pub test_condition: PairCondition,
}

impl IndexedTrial for WordPairTrial {
    fn trial_index(&self) -> u32 {
        self.trial_index
    }
}

pub type AssociativeBlock = ExperimentBlock<WordPairTrial>;

#[derive(Debug, Clone)]
struct WordPair {
    top: String,
    bottom: String,
    answer: StudyAnswer,
    condition: PairCondition,
}

pub struct AssociativePools {
    /// Nouns that fit inside the other in an imagined interaction.
    pub inside: StimulusPool,
    pub outside: StimulusPool,
}

impl AssociativePools {
    pub fn load(layout: &ResourceLayout) -> Result<Self> {
        Ok(Self {
            inside: StimulusPool::from_lines(&layout.word_list(WORD_LIST_DIR, "inside.txt"))?,
            outside: StimulusPool::from_lines(&layout.word_list(WORD_LIST_DIR, "outside.txt"))?,
        })
    }
}

/// Build `extra_blocks + 1` blocks; block 0 is the practice block.
pub fn build<R: Rng + ?Sized>(
    identity: &SessionIdentity,
    pools: AssociativePools,
    params: &AssociativeParams,
    extra_blocks: u32,
    rng: &mut R,
) -> Result<Vec<AssociativeBlock>> {
    let per_position = params.pairs_per_position;
    pools.inside.require(per_position * 2)?;
    pools.outside.require(per_position * 2)?;
    let block_size = params.block_size();
    let n_blocks = extra_blocks as usize + 1;
    if block_size == 0 {
        return Err(RunnerError::config("associative recognition blocks hold no trials"));
    }
    if block_size * n_blocks > per_position * 2 {
        return Err(RunnerError::config(format!(
            "{} blocks of {} pairs need {} word pairs but only {} can be formed",
            n_blocks,
            block_size,
            block_size * n_blocks,
            per_position * 2
        )));
    }

    let inside = pools.inside.shuffled(rng);
    let outside = pools.outside.shuffled(rng);
    let top_inside = inside.slice(0, per_position)?;
    let bottom_inside = inside.slice(per_position, per_position * 2)?;
    let top_outside = outside.slice(0, per_position)?;
    let bottom_outside = outside.slice(per_position, per_position * 2)?;

    // Inside nouns on top answer "top"; inside nouns at the bottom answer "bottom".
    let mut pairs: Vec<WordPair> = top_inside
        .iter()
        .zip(bottom_outside)
        .map(|(top, bottom)| (top, bottom, StudyAnswer::Top))
        .chain(
            top_outside
                .iter()
                .zip(bottom_inside)
                .map(|(top, bottom)| (top, bottom, StudyAnswer::Bottom)),
        )
        .map(|(top, bottom, answer)| WordPair {
            top: top.clone(),
            bottom: bottom.clone(),
            answer,
            condition: PairCondition::Same,
        })
        .collect();
    pairs.shuffle(rng);

    let mut blocks = Vec::with_capacity(n_blocks);
    for (block, chunk) in pairs.chunks(block_size).take(n_blocks).enumerate() {
        let number = BlockNumber(block as u32);
        let (study, test) = arrange_phases(chunk, params, rng)?;
        debug!(block = block, study = study.len(), test = test.len(), "arranged associative block");
        blocks.push(ExperimentBlock {
            subject: None,
            session: None,
            experiment_block: number,
            study_phase: into_trials(identity, number, BlockPhase::Encoding, study),
            test_phase: into_trials(identity, number, BlockPhase::Retrieval, test),
        });
    }
    Ok(blocks)
}

fn arrange_phases<R: Rng + ?Sized>(
    chunk: &[WordPair],
    params: &AssociativeParams,
    rng: &mut R,
) -> Result<(Vec<WordPair>, Vec<WordPair>)> {
    let same_end = params.same_per_block;
    let rearranged_end = same_end + params.rearranged_per_block;

    let same: Vec<WordPair> = chunk[..same_end].to_vec();
    let rearranged: Vec<WordPair> = chunk[same_end..rearranged_end]
        .iter()
        .cloned()
        .map(|pair| WordPair {
            condition: PairCondition::Rearranged,
            ..pair
        })
        .collect();
    let new: Vec<WordPair> = chunk[rearranged_end..]
        .iter()
        .cloned()
        .map(|pair| WordPair {
            answer: StudyAnswer::NotStudied,
            condition: PairCondition::New,
            ..pair
        })
        .collect();

    // Top words move between rearranged pairs; bottom words and answers stay.
    let tops: Vec<String> = rearranged.iter().map(|p| p.top.clone()).collect();
    let swapped_tops = derange(&tops, rng, params.max_attempts)?;
    let swapped: Vec<WordPair> = rearranged
        .iter()
        .zip(swapped_tops)
        .map(|(pair, top)| WordPair {
            top,
            ..pair.clone()
        })
        .collect();

    let mut study: Vec<WordPair> = same.iter().chain(&rearranged).cloned().collect();
    study.shuffle(rng);
    let mut test: Vec<WordPair> = same.into_iter().chain(swapped).chain(new).collect();
    test.shuffle(rng);
    Ok((study, test))
}

fn into_trials(
    identity: &SessionIdentity,
    block: BlockNumber,
    phase: BlockPhase,
    pairs: Vec<WordPair>,
) -> Vec<WordPairTrial> {
    pairs
        .into_iter()
        .enumerate()
        .map(|(index, pair)| WordPairTrial {
            subject: identity.subject.clone(),
            session: identity.session.clone(),
            experiment_block: block,
            experiment_phase: phase,
            trial_index: index as u32,
            top_word: pair.top,
            bottom_word: pair.bottom,
            study_answer: pair.answer,
            test_condition: pair.condition,
        })
        .collect()
}
