use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Block number, persisted as a decimal string (`"experiment_block": "3"`)
/// for compatibility with the analysis scripts. Numeric input is accepted
/// when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumber(pub u32);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u32),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(BlockNumber(n)),
            Raw::Text(s) => s
                .trim()
                .parse()
                .map(BlockNumber)
                .map_err(|_| serde::de::Error::custom(format!("invalid block number '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockPhase {
    #[serde(rename = "ENCODING")]
    Encoding,
    #[serde(rename = "RETRIEVAL")]
    Retrieval,
}

impl BlockPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockPhase::Encoding => "ENCODING",
            BlockPhase::Retrieval => "RETRIEVAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ENCODING" => Some(BlockPhase::Encoding),
            "RETRIEVAL" => Some(BlockPhase::Retrieval),
            _ => None,
        }
    }

    /// Position of the phase within a block, for ordering checkpoint rows.
    pub fn rank(&self) -> u8 {
        match self {
            BlockPhase::Encoding => 0,
            BlockPhase::Retrieval => 1,
        }
    }
}

pub trait IndexedTrial {
    fn trial_index(&self) -> u32;
}

/// True when the trial indices read exactly `0..len` in order.
pub fn has_dense_indices<T: IndexedTrial>(trials: &[T]) -> bool {
    trials
        .iter()
        .enumerate()
        .all(|(i, t)| t.trial_index() as usize == i)
}

/// A block with a study phase followed by a test phase, as seen by the
/// checkpoint resolver.
pub trait PhasedBlock {
    fn block_number(&self) -> BlockNumber;
    fn study_len(&self) -> usize;
    fn test_len(&self) -> usize;
    /// Drop the first `completed` study trials.
    fn drop_completed_study(&mut self, completed: usize);
    /// Drop the first `completed` test trials.
    fn drop_completed_test(&mut self, completed: usize);
}

/// Study and test trial lists sharing one stimulus pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentBlock<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub experiment_block: BlockNumber,
    pub study_phase: Vec<T>,
    pub test_phase: Vec<T>,
}

impl<T> PhasedBlock for ExperimentBlock<T> {
    fn block_number(&self) -> BlockNumber {
        self.experiment_block
    }

    fn study_len(&self) -> usize {
        self.study_phase.len()
    }

    fn test_len(&self) -> usize {
        self.test_phase.len()
    }

    fn drop_completed_study(&mut self, completed: usize) {
        let n = completed.min(self.study_phase.len());
        self.study_phase.drain(..n);
    }

    fn drop_completed_test(&mut self, completed: usize) {
        let n = completed.min(self.test_phase.len());
        self.test_phase.drain(..n);
    }
}
