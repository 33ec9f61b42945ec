//! Item consolidation: nouns paired with environment scenes across two
//! study phases (long and short delay before test) and one combined test.
//!
//! Each of the eight noun categories contributes 24 nouns: 6 same and 3
//! rearranged per study phase plus 6 new nouns for the test. Environments
//! are split into two disjoint sets of three, one per study phase, and the
//! rearranged nouns move to another environment of their own set at test.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{cycle_to, SessionIdentity};
use crate::error::{Result, RunnerError};
use crate::pool::{ResourceLayout, StimulusPool};
use crate::shuffle::{balanced_derangement_cycles, pseudorandomize, RunCap};
use crate::trial::IndexedTrial;

pub const WORD_LIST_DIR: &str = "item_consolidation";
pub const ANIMATE_CATEGORIES: [&str; 4] = ["mammals", "aquatic_species", "birds", "people"];
pub const INANIMATE_CATEGORIES: [&str; 4] = ["vehicles", "food", "furniture", "clothing"];

const SAME_PER_CATEGORY: usize = 6;
const REARRANGED_PER_CATEGORY: usize = 3;
const NEW_PER_CATEGORY: usize = 6;
const ENVIRONMENT_SET_SIZE: usize = 3;
/// Environments drawn per session: two disjoint sets of three, taken from a
/// shuffle of the configured list. The default list has eight, so two go
/// unused in any one session; any list of six or more distinct names works.
const ENVIRONMENTS_PER_SESSION: usize = 2 * ENVIRONMENT_SET_SIZE;

/// Longest allowed runs of (environment, noun type, noun category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunLimits {
    pub environment: usize,
    pub noun_type: usize,
    pub noun_category: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidationParams {
    pub environments: Vec<String>,
    pub study_repetitions: usize,
    pub study_run_limits: RunLimits,
    pub test_run_limits: RunLimits,
    /// Times one environment may fill the same slot across the deranged
    /// environment cycles of the rearranged nouns.
    pub rearranged_position_cap: usize,
    pub orient_duration_ms: u64,
    pub allowed_response_time_ms: u64,
    pub intertrial_interval_ms: u64,
    pub intertrial_jitter_ms: u64,
    pub animate_key: String,
    pub inanimate_key: String,
    pub new_key: String,
    pub same_key: String,
    pub rearranged_key: String,
    /// The test phase accepts roughly one shuffle in ten thousand under the
    /// default limits.
    pub max_attempts: usize,
}

impl Default for ConsolidationParams {
    fn default() -> Self {
        Self {
            environments: [
                "beach",
                "canyon",
                "forest",
                "glacier",
                "mountain",
                "sand_dunes",
                "snow",
                "wheat_field",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            study_repetitions: 3,
            study_run_limits: RunLimits {
                environment: 3,
                noun_type: 3,
                noun_category: 2,
            },
            test_run_limits: RunLimits {
                environment: 3,
                noun_type: 4,
                noun_category: 2,
            },
            rearranged_position_cap: 5,
            orient_duration_ms: 2000,
            allowed_response_time_ms: 4000,
            intertrial_interval_ms: 3000,
            intertrial_jitter_ms: 250,
            animate_key: "A".to_string(),
            inanimate_key: "S".to_string(),
            new_key: "F".to_string(),
            same_key: "G".to_string(),
            rearranged_key: "H".to_string(),
            max_attempts: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsolidationPhase {
    #[serde(rename = "STUDY1")]
    Study1,
    #[serde(rename = "STUDY2")]
    Study2,
    #[serde(rename = "TEST")]
    Test,
}

impl ConsolidationPhase {
    pub const ORDER: [ConsolidationPhase; 3] = [
        ConsolidationPhase::Study1,
        ConsolidationPhase::Study2,
        ConsolidationPhase::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationPhase::Study1 => "STUDY1",
            ConsolidationPhase::Study2 => "STUDY2",
            ConsolidationPhase::Test => "TEST",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ORDER.iter().copied().find(|p| p.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsolidationEvent {
    EncodingLong,
    EncodingShort,
    RetrievalLong,
    RetrievalShort,
    NewNoun,
}

impl ConsolidationEvent {
    fn at_test(self) -> Self {
        match self {
            ConsolidationEvent::EncodingLong => ConsolidationEvent::RetrievalLong,
            ConsolidationEvent::EncodingShort => ConsolidationEvent::RetrievalShort,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NounType {
    Animate,
    Inanimate,
}

impl NounType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NounType::Animate => "ANIMATE",
            NounType::Inanimate => "INANIMATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsolidationCondition {
    Same,
    Rearranged,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationTrial {
    pub subject: String,
    pub session: String,
    pub experiment_phase: ConsolidationPhase,
    pub event: ConsolidationEvent,
    pub trial_index: u32,
    pub noun: String,
    pub noun_type: NounType,
    pub noun_category: String,
    pub environment: String,
    pub test_condition: ConsolidationCondition,
}

impl IndexedTrial for ConsolidationTrial {
    fn trial_index(&self) -> u32 {
        self.trial_index
    }
}

/// Persisted as `{"STUDY1": [...], "STUDY2": [...], "TEST": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationPhases {
    #[serde(rename = "STUDY1")]
    pub study1: Vec<ConsolidationTrial>,
    #[serde(rename = "STUDY2")]
    pub study2: Vec<ConsolidationTrial>,
    #[serde(rename = "TEST")]
    pub test: Vec<ConsolidationTrial>,
}

impl ConsolidationPhases {
    pub fn phase(&self, phase: ConsolidationPhase) -> &[ConsolidationTrial] {
        match phase {
            ConsolidationPhase::Study1 => &self.study1,
            ConsolidationPhase::Study2 => &self.study2,
            ConsolidationPhase::Test => &self.test,
        }
    }

    pub fn into_ordered(self) -> Vec<(ConsolidationPhase, Vec<ConsolidationTrial>)> {
        vec![
            (ConsolidationPhase::Study1, self.study1),
            (ConsolidationPhase::Study2, self.study2),
            (ConsolidationPhase::Test, self.test),
        ]
    }
}

#[derive(Debug, Clone)]
struct Draft {
    noun: String,
    noun_type: NounType,
    category: String,
    environment: String,
    event: ConsolidationEvent,
    condition: ConsolidationCondition,
}

fn environment_tag(d: &Draft) -> &str {
    &d.environment
}

fn noun_type_tag(d: &Draft) -> &str {
    d.noun_type.as_str()
}

fn category_tag(d: &Draft) -> &str {
    &d.category
}

fn run_caps(limits: &RunLimits) -> [RunCap<Draft>; 3] {
    [
        RunCap::new("environment_run", limits.environment, environment_tag),
        RunCap::new("noun_type_run", limits.noun_type, noun_type_tag),
        RunCap::new("noun_category_run", limits.noun_category, category_tag),
    ]
}

/// One pool per category, in `ANIMATE_CATEGORIES` then `INANIMATE_CATEGORIES` order.
pub struct ConsolidationPools {
    pub categories: Vec<(NounType, StimulusPool)>,
}

impl ConsolidationPools {
    pub fn load(layout: &ResourceLayout) -> Result<Self> {
        let mut categories = Vec::with_capacity(8);
        for (noun_type, names) in [
            (NounType::Animate, ANIMATE_CATEGORIES),
            (NounType::Inanimate, INANIMATE_CATEGORIES),
        ] {
            for name in names {
                let path = layout.word_list(WORD_LIST_DIR, &format!("{}.txt", name));
                categories.push((noun_type, StimulusPool::from_lines(&path)?));
            }
        }
        Ok(Self { categories })
    }
}

#[derive(Default)]
struct Groups {
    same1: Vec<Draft>,
    same2: Vec<Draft>,
    rearranged1: Vec<Draft>,
    rearranged2: Vec<Draft>,
    new: Vec<Draft>,
}

pub fn build<R: Rng + ?Sized>(
    identity: &SessionIdentity,
    pools: ConsolidationPools,
    params: &ConsolidationParams,
    rng: &mut R,
) -> Result<ConsolidationPhases> {
    let per_category = 2 * (SAME_PER_CATEGORY + REARRANGED_PER_CATEGORY) + NEW_PER_CATEGORY;
    for (_, pool) in &pools.categories {
        pool.require(per_category)?;
    }
    if params.environments.len() < ENVIRONMENTS_PER_SESSION {
        return Err(RunnerError::config(format!(
            "item consolidation needs at least {} environments, got {}",
            ENVIRONMENTS_PER_SESSION,
            params.environments.len()
        )));
    }
    let mut distinct = params.environments.clone();
    distinct.sort();
    distinct.dedup();
    if distinct.len() != params.environments.len() {
        return Err(RunnerError::config(
            "item consolidation environments must have distinct names",
        ));
    }
    if params.study_repetitions == 0 {
        return Err(RunnerError::config("study_repetitions must be at least 1"));
    }

    let mut groups = Groups::default();
    for (noun_type, pool) in pools.categories {
        let pool = pool.shuffled(rng);
        let take = |start: usize, len: usize| -> Result<Vec<Draft>> {
            Ok(pool
                .slice(start, start + len)?
                .iter()
                .map(|noun| Draft {
                    noun: noun.clone(),
                    noun_type,
                    category: pool.name().to_string(),
                    environment: String::new(),
                    event: ConsolidationEvent::NewNoun,
                    condition: ConsolidationCondition::Same,
                })
                .collect())
        };
        let mut offset = 0;
        groups.same1.extend(take(offset, SAME_PER_CATEGORY)?);
        offset += SAME_PER_CATEGORY;
        groups.same2.extend(take(offset, SAME_PER_CATEGORY)?);
        offset += SAME_PER_CATEGORY;
        groups.rearranged1.extend(take(offset, REARRANGED_PER_CATEGORY)?);
        offset += REARRANGED_PER_CATEGORY;
        groups.rearranged2.extend(take(offset, REARRANGED_PER_CATEGORY)?);
        offset += REARRANGED_PER_CATEGORY;
        groups.new.extend(take(offset, NEW_PER_CATEGORY)?);
    }

    let mut environments = params.environments.clone();
    environments.shuffle(rng);
    let set1 = environments[..ENVIRONMENT_SET_SIZE].to_vec();
    let set2 = environments[ENVIRONMENT_SET_SIZE..ENVIRONMENTS_PER_SESSION].to_vec();
    let both: Vec<String> = set1.iter().chain(&set2).cloned().collect();

    let same_len = groups.same1.len();
    let same1 = assign(
        groups.same1,
        &cycle_to(&set1, same_len),
        ConsolidationEvent::EncodingLong,
        ConsolidationCondition::Same,
    );
    let same2 = assign(
        groups.same2,
        &cycle_to(&set2, same_len),
        ConsolidationEvent::EncodingShort,
        ConsolidationCondition::Same,
    );
    let rearranged_len = groups.rearranged1.len();
    let rearranged1 = assign(
        groups.rearranged1,
        &cycle_to(&set1, rearranged_len),
        ConsolidationEvent::EncodingLong,
        ConsolidationCondition::Rearranged,
    );
    let rearranged2 = assign(
        groups.rearranged2,
        &cycle_to(&set2, rearranged_len),
        ConsolidationEvent::EncodingShort,
        ConsolidationCondition::Rearranged,
    );
    let new_len = groups.new.len();
    let new = assign(
        groups.new,
        &cycle_to(&both, new_len),
        ConsolidationEvent::NewNoun,
        ConsolidationCondition::New,
    );

    let cycles = rearranged_len / ENVIRONMENT_SET_SIZE;
    let cap = params.rearranged_position_cap;
    let moved1 = balanced_derangement_cycles(&set1, cycles, cap, rng, params.max_attempts)?;
    let moved2 = balanced_derangement_cycles(&set2, cycles, cap, rng, params.max_attempts)?;
    let test_rearranged1 = with_environments(&rearranged1, &moved1);
    let test_rearranged2 = with_environments(&rearranged2, &moved2);

    let study_caps = run_caps(&params.study_run_limits);
    let study1_block: Vec<Draft> = same1.iter().chain(&rearranged1).cloned().collect();
    let study2_block: Vec<Draft> = same2.iter().chain(&rearranged2).cloned().collect();
    let mut study1 = Vec::with_capacity(study1_block.len() * params.study_repetitions);
    let mut study2 = Vec::with_capacity(study2_block.len() * params.study_repetitions);
    for _ in 0..params.study_repetitions {
        study1.extend(pseudorandomize(&study1_block, &study_caps, rng, params.max_attempts)?);
    }
    for _ in 0..params.study_repetitions {
        study2.extend(pseudorandomize(&study2_block, &study_caps, rng, params.max_attempts)?);
    }

    let test_block: Vec<Draft> = same1
        .into_iter()
        .chain(same2)
        .chain(test_rearranged1)
        .chain(test_rearranged2)
        .chain(new)
        .collect();
    let test = pseudorandomize(&test_block, &run_caps(&params.test_run_limits), rng, params.max_attempts)?;

    info!(
        study1 = study1.len(),
        study2 = study2.len(),
        test = test.len(),
        "built item consolidation phases"
    );
    Ok(ConsolidationPhases {
        study1: into_trials(identity, ConsolidationPhase::Study1, study1),
        study2: into_trials(identity, ConsolidationPhase::Study2, study2),
        test: into_trials(identity, ConsolidationPhase::Test, test),
    })
}

fn assign(
    drafts: Vec<Draft>,
    environments: &[String],
    event: ConsolidationEvent,
    condition: ConsolidationCondition,
) -> Vec<Draft> {
    drafts
        .into_iter()
        .zip(environments)
        .map(|(draft, environment)| Draft {
            environment: environment.clone(),
            event,
            condition,
            ..draft
        })
        .collect()
}

fn with_environments(drafts: &[Draft], environments: &[String]) -> Vec<Draft> {
    debug!(count = drafts.len(), "moving rearranged nouns to new environments");
    drafts
        .iter()
        .zip(environments)
        .map(|(draft, environment)| Draft {
            environment: environment.clone(),
            ..draft.clone()
        })
        .collect()
}

fn into_trials(
    identity: &SessionIdentity,
    phase: ConsolidationPhase,
    drafts: Vec<Draft>,
) -> Vec<ConsolidationTrial> {
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| ConsolidationTrial {
            subject: identity.subject.clone(),
            session: identity.session.clone(),
            experiment_phase: phase,
            event: if phase == ConsolidationPhase::Test {
                draft.event.at_test()
            } else {
                draft.event
            },
            trial_index: index as u32,
            noun: draft.noun,
            noun_type: draft.noun_type,
            noun_category: draft.category,
            environment: draft.environment,
            test_condition: draft.condition,
        })
        .collect()
}
