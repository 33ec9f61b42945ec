//! Time associative recognition: an emoji item, a blank interval, then a
//! celebrity face. At test the face, the interval, both or neither change.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SessionIdentity;
use crate::error::{Result, RunnerError};
use crate::pool::{ResourceLayout, StimulusPool};
use crate::shuffle::{derange, DEFAULT_MAX_ATTEMPTS};
use crate::trial::{BlockNumber, BlockPhase, ExperimentBlock, IndexedTrial};

/// Items per category; faces split evenly into two halves per gender.
const ITEMS_PER_CATEGORY: usize = 84;
const BLOCK_SLOTS: usize = 7;
/// Test conditions of one 42-row cycle, repeated to fill the 168 rows.
const CONDITION_CYCLE: [(TestCondition, usize); 4] = [
    (TestCondition::None, 21),
    (TestCondition::Time, 7),
    (TestCondition::Face, 7),
    (TestCondition::Both, 7),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeAssociativeParams {
    pub orient_duration_ms: u64,
    pub image_duration_ms: u64,
    pub short_blank_duration_s: u64,
    pub long_blank_duration_s: u64,
    pub intertrial_interval_ms: u64,
    pub intertrial_jitter_ms: u64,
    pub preresponse_pause_ms: u64,
    pub allowed_response_time_ms: u64,
    pub standard_delay_ms: u64,
    pub deviant_delay_ms: u64,
    pub p_standard_delay: f64,
    pub left_key: String,
    pub right_key: String,
    pub max_attempts: usize,
}

impl Default for TimeAssociativeParams {
    fn default() -> Self {
        Self {
            orient_duration_ms: 3000,
            image_duration_ms: 3000,
            short_blank_duration_s: 3,
            long_blank_duration_s: 6,
            intertrial_interval_ms: 3000,
            intertrial_jitter_ms: 250,
            preresponse_pause_ms: 2000,
            allowed_response_time_ms: 4000,
            standard_delay_ms: 20_000,
            deviant_delay_ms: 10_000,
            p_standard_delay: 0.8,
            left_key: "F".to_string(),
            right_key: "H".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Organic,
    Inorganic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    Short,
    Long,
}

impl IntervalType {
    pub fn flipped(self) -> Self {
        match self {
            IntervalType::Short => IntervalType::Long,
            IntervalType::Long => IntervalType::Short,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Short => "short",
            IntervalType::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCondition {
    None,
    Time,
    Face,
    Both,
}

impl TestCondition {
    pub fn changes_face(self) -> bool {
        matches!(self, TestCondition::Face | TestCondition::Both)
    }

    pub fn changes_time(self) -> bool {
        matches!(self, TestCondition::Time | TestCondition::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedPairTrial {
    pub subject: String,
    pub session: String,
    pub experiment_block: BlockNumber,
    pub experiment_phase: BlockPhase,
    pub trial_index: u32,
    pub item: String,
    pub item_category: ItemCategory,
    pub celebrity_face: String,
    pub celebrity_gender: Gender,
    /// Blank duration in seconds.
    pub interval: u64,
    pub interval_type: IntervalType,
    pub test_condition: TestCondition,
}

impl IndexedTrial for TimedPairTrial {
    fn trial_index(&self) -> u32 {
        self.trial_index
    }
}

pub type TimeAssociativeBlock = ExperimentBlock<TimedPairTrial>;

/// Randomized left/right response mapping, persisted per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub organic_key: String,
    pub inorganic_key: String,
    pub study_left_label: String,
    pub study_right_label: String,
    pub same_key: String,
    pub different_key: String,
    pub test_left_label: String,
    pub test_right_label: String,
}

impl SessionKeys {
    pub fn draw<R: Rng + ?Sized>(params: &TimeAssociativeParams, rng: &mut R) -> Self {
        let left = params.left_key.clone();
        let right = params.right_key.clone();
        let (organic_key, inorganic_key, study_left, study_right) = if rng.gen_bool(0.5) {
            (left.clone(), right.clone(), "ORGANIC", "INORGANIC")
        } else {
            (right.clone(), left.clone(), "INORGANIC", "ORGANIC")
        };
        let (same_key, different_key, test_left, test_right) = if rng.gen_bool(0.5) {
            (left, right, "SAME", "DIFFERENT")
        } else {
            (right, left, "DIFFERENT", "SAME")
        };
        Self {
            organic_key,
            inorganic_key,
            study_left_label: study_left.to_string(),
            study_right_label: study_right.to_string(),
            same_key,
            different_key,
            test_left_label: test_left.to_string(),
            test_right_label: test_right.to_string(),
        }
    }
}

pub struct TimeAssociativePools {
    pub organic: StimulusPool,
    pub inorganic: StimulusPool,
    pub male: StimulusPool,
    pub female: StimulusPool,
}

impl TimeAssociativePools {
    pub fn load(layout: &ResourceLayout) -> Result<Self> {
        Ok(Self {
            organic: StimulusPool::from_tokens(&layout.image_list("organic_emojis.txt"))?,
            inorganic: StimulusPool::from_tokens(&layout.image_list("inorganic_emojis.txt"))?,
            male: StimulusPool::from_tokens(&layout.image_list("male_celebrities.txt"))?,
            female: StimulusPool::from_tokens(&layout.image_list("female_celebrities.txt"))?,
        })
    }
}

#[derive(Debug, Clone)]
struct Row {
    item: String,
    category: ItemCategory,
    face: String,
    gender: Gender,
    interval_type: IntervalType,
    condition: TestCondition,
}

/// Build `extra_blocks + 1` blocks of 24 trials; block 0 is practice.
pub fn build<R: Rng + ?Sized>(
    identity: &SessionIdentity,
    pools: TimeAssociativePools,
    params: &TimeAssociativeParams,
    extra_blocks: u32,
    rng: &mut R,
) -> Result<Vec<TimeAssociativeBlock>> {
    let n_blocks = extra_blocks as usize + 1;
    if n_blocks > BLOCK_SLOTS {
        return Err(RunnerError::config(format!(
            "time associative recognition has {} blocks, {} requested",
            BLOCK_SLOTS, n_blocks
        )));
    }
    for pool in [&pools.organic, &pools.inorganic, &pools.male, &pools.female] {
        pool.require(ITEMS_PER_CATEGORY)?;
    }

    let organic = pools.organic.shuffled(rng);
    let inorganic = pools.inorganic.shuffled(rng);
    let male = pools.male.shuffled(rng);
    let female = pools.female.shuffled(rng);

    let half = ITEMS_PER_CATEGORY / 2;
    let items: Vec<(&String, ItemCategory)> = organic
        .slice(0, ITEMS_PER_CATEGORY)?
        .iter()
        .map(|i| (i, ItemCategory::Organic))
        .chain(
            inorganic
                .slice(0, ITEMS_PER_CATEGORY)?
                .iter()
                .map(|i| (i, ItemCategory::Inorganic)),
        )
        .collect();
    let faces: Vec<(&String, Gender)> = male
        .slice(0, half)?
        .iter()
        .map(|f| (f, Gender::Male))
        .chain(female.slice(0, half)?.iter().map(|f| (f, Gender::Female)))
        .chain(male.slice(half, ITEMS_PER_CATEGORY)?.iter().map(|f| (f, Gender::Male)))
        .chain(
            female
                .slice(half, ITEMS_PER_CATEGORY)?
                .iter()
                .map(|f| (f, Gender::Female)),
        )
        .collect();
    let conditions: Vec<TestCondition> = CONDITION_CYCLE
        .iter()
        .flat_map(|(condition, count)| std::iter::repeat(*condition).take(*count))
        .cycle()
        .take(items.len())
        .collect();

    let rows: Vec<Row> = items
        .into_iter()
        .zip(faces)
        .zip(conditions)
        .enumerate()
        .map(|(r, (((item, category), (face, gender)), condition))| Row {
            item: item.clone(),
            category,
            face: face.clone(),
            gender,
            interval_type: if r % 2 == 0 {
                IntervalType::Short
            } else {
                IntervalType::Long
            },
            condition,
        })
        .collect();

    let mut blocks = Vec::with_capacity(n_blocks);
    for block in 0..n_blocks {
        let number = BlockNumber(block as u32);
        let block_rows: Vec<Row> = rows
            .iter()
            .enumerate()
            .filter(|(r, _)| r % BLOCK_SLOTS == block)
            .map(|(_, row)| row.clone())
            .collect();

        let mut study = block_rows.clone();
        study.shuffle(rng);
        let mut test = transform_for_test(block_rows, &male, params, rng)?;
        test.shuffle(rng);
        debug!(block = block, trials = study.len(), "arranged time associative block");

        blocks.push(ExperimentBlock {
            subject: Some(identity.subject.clone()),
            session: Some(identity.session.clone()),
            experiment_block: number,
            study_phase: into_trials(identity, number, BlockPhase::Encoding, study, params),
            test_phase: into_trials(identity, number, BlockPhase::Retrieval, test, params),
        });
    }
    Ok(blocks)
}

/// Derange faces among face-changing rows, re-deriving gender from the
/// face that landed there, then flip intervals of time-changing rows.
fn transform_for_test<R: Rng + ?Sized>(
    rows: Vec<Row>,
    male: &StimulusPool,
    params: &TimeAssociativeParams,
    rng: &mut R,
) -> Result<Vec<Row>> {
    let faces: Vec<String> = rows
        .iter()
        .filter(|r| r.condition.changes_face())
        .map(|r| r.face.clone())
        .collect();
    let mut swapped = derange(&faces, rng, params.max_attempts)?.into_iter();
    Ok(rows
        .into_iter()
        .map(|mut row| {
            if row.condition.changes_face() {
                if let Some(face) = swapped.next() {
                    row.gender = if male.contains(&face) {
                        Gender::Male
                    } else {
                        Gender::Female
                    };
                    row.face = face;
                }
            }
            if row.condition.changes_time() {
                row.interval_type = row.interval_type.flipped();
            }
            row
        })
        .collect())
}

fn into_trials(
    identity: &SessionIdentity,
    block: BlockNumber,
    phase: BlockPhase,
    rows: Vec<Row>,
    params: &TimeAssociativeParams,
) -> Vec<TimedPairTrial> {
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| TimedPairTrial {
            subject: identity.subject.clone(),
            session: identity.session.clone(),
            experiment_block: block,
            experiment_phase: phase,
            trial_index: index as u32,
            item: row.item,
            item_category: row.category,
            celebrity_face: row.face,
            celebrity_gender: row.gender,
            interval: match row.interval_type {
                IntervalType::Short => params.short_blank_duration_s,
                IntervalType::Long => params.long_blank_duration_s,
            },
            interval_type: row.interval_type,
            test_condition: row.condition,
        })
        .collect()
}
