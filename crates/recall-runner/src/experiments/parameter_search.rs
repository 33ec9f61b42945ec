//! Stimulation parameter search: every (location, amplitude, frequency,
//! pulse width) combination, replicated and globally shuffled. Sham trials
//! are decided when a stimulus is delivered, not when the list is built.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RunnerError};
use crate::pool::ResourceLayout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterSearchParams {
    /// Names the subject's locations file,
    /// `<subject>_stimulation_locations_<label>.csv`. Unset or `none` runs
    /// the session without stimulation and without a stimulus list.
    pub stimulation_label: Option<String>,
    /// mA
    pub amplitudes: Vec<f64>,
    /// Hz
    pub frequencies: Vec<u32>,
    /// microseconds
    pub pulse_widths: Vec<u32>,
    pub stimulation_duration_ms: u64,
    pub trials_per_combination: usize,
    /// Percent chance, 0 to 100, that a delivery is replaced by a sham.
    pub p_sham_trials: u8,
    pub classification_duration_ms: u64,
    pub post_stim_lockout_ms: u64,
    pub configuration_wait_ms: u64,
    pub intertrial_interval_ms: u64,
    pub intertrial_jitter_ms: u64,
}

impl Default for ParameterSearchParams {
    fn default() -> Self {
        Self {
            stimulation_label: None,
            amplitudes: vec![1.0, 2.0, 4.0],
            frequencies: vec![20, 50, 130],
            pulse_widths: vec![75, 150],
            stimulation_duration_ms: 500,
            trials_per_combination: 20,
            p_sham_trials: 3,
            classification_duration_ms: 1200,
            post_stim_lockout_ms: 400,
            configuration_wait_ms: 100,
            intertrial_interval_ms: 500,
            intertrial_jitter_ms: 50,
        }
    }
}

impl ParameterSearchParams {
    /// Label of the locations file, or `None` when stimulation is off.
    pub fn locations_label(&self) -> Option<&str> {
        self.stimulation_label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty() && !label.eq_ignore_ascii_case("none"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub label: String,
    pub anode: String,
    pub cathode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    pub location: Location,
    pub amplitude: f64,
    pub frequency: u32,
    pub pulse_width: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stimulate,
    Sham,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShamPolicy {
    percent: u8,
}

impl ShamPolicy {
    pub fn new(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(RunnerError::config(format!(
                "p_sham_trials must be between 0 and 100, got {}",
                percent
            )));
        }
        Ok(Self { percent })
    }

    /// Sham when a uniform draw from 1..=100 lands at or below the percentage.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Delivery {
        if rng.gen_range(1..=100u8) <= self.percent {
            Delivery::Sham
        } else {
            Delivery::Stimulate
        }
    }
}

pub fn locations_file(layout: &ResourceLayout, subject: &str, label: &str) -> std::path::PathBuf {
    layout.subject_configuration(
        subject,
        &format!("{}_stimulation_locations_{}.csv", subject, label),
    )
}

/// Headerless `label,anode,cathode` rows.
pub fn read_locations(path: &Path) -> Result<Vec<Location>> {
    if !path.is_file() {
        return Err(RunnerError::config(format!(
            "stimulation locations not found: {}",
            path.display()
        )));
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut locations = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.iter().all(|f| f.is_empty()) {
            continue;
        }
        if row.len() != 3 {
            return Err(RunnerError::config(format!(
                "{}: expected label,anode,cathode but found {} fields",
                path.display(),
                row.len()
            )));
        }
        locations.push(Location {
            label: row[0].to_string(),
            anode: row[1].to_string(),
            cathode: row[2].to_string(),
        });
    }
    debug!(path = %path.display(), count = locations.len(), "loaded stimulation locations");
    Ok(locations)
}

pub fn build<R: Rng + ?Sized>(
    locations: &[Location],
    params: &ParameterSearchParams,
    rng: &mut R,
) -> Result<Vec<Stimulus>> {
    ShamPolicy::new(params.p_sham_trials)?;
    if locations.is_empty()
        || params.amplitudes.is_empty()
        || params.frequencies.is_empty()
        || params.pulse_widths.is_empty()
        || params.trials_per_combination == 0
    {
        return Err(RunnerError::config(
            "stimulation parameter search needs at least one value for every parameter",
        ));
    }

    let mut combinations = Vec::with_capacity(
        locations.len() * params.amplitudes.len() * params.frequencies.len() * params.pulse_widths.len(),
    );
    for location in locations {
        for &amplitude in &params.amplitudes {
            for &frequency in &params.frequencies {
                for &pulse_width in &params.pulse_widths {
                    combinations.push(Stimulus {
                        location: location.clone(),
                        amplitude,
                        frequency,
                        pulse_width,
                    });
                }
            }
        }
    }
    let mut stimuli: Vec<Stimulus> = std::iter::repeat(combinations)
        .take(params.trials_per_combination)
        .flatten()
        .collect();
    stimuli.shuffle(rng);
    info!(trials = stimuli.len(), "built stimulus list");
    Ok(stimuli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    fn locations() -> Vec<Location> {
        vec![
            Location {
                label: "LA1-LA2".to_string(),
                anode: "1".to_string(),
                cathode: "2".to_string(),
            },
            Location {
                label: "LH3-LH4".to_string(),
                anode: "3".to_string(),
                cathode: "4".to_string(),
            },
        ]
    }

    #[test]
    fn every_combination_appears_equally_often() {
        let mut rng = StdRng::seed_from_u64(41);
        let params = ParameterSearchParams::default();
        let stimuli = build(&locations(), &params, &mut rng).expect("build");
        assert_eq!(stimuli.len(), 2 * 3 * 3 * 2 * 20);
        let target = Stimulus {
            location: locations()[1].clone(),
            amplitude: 4.0,
            frequency: 130,
            pulse_width: 75,
        };
        assert_eq!(stimuli.iter().filter(|s| **s == target).count(), 20);
    }

    #[test]
    fn none_label_turns_stimulation_off() {
        let label = |raw: Option<&str>| ParameterSearchParams {
            stimulation_label: raw.map(str::to_string),
            ..ParameterSearchParams::default()
        };
        assert_eq!(label(Some("macro")).locations_label(), Some("macro"));
        assert_eq!(label(Some("none")).locations_label(), None);
        assert_eq!(label(Some("None")).locations_label(), None);
        assert_eq!(label(None).locations_label(), None);
    }

    #[test]
    fn sham_policy_extremes() {
        let mut rng = StdRng::seed_from_u64(42);
        let never = ShamPolicy::new(0).expect("policy");
        let always = ShamPolicy::new(100).expect("policy");
        for _ in 0..200 {
            assert_eq!(never.draw(&mut rng), Delivery::Stimulate);
            assert_eq!(always.draw(&mut rng), Delivery::Sham);
        }
        assert!(ShamPolicy::new(101).is_err());
    }

    #[test]
    fn reads_headerless_location_rows() {
        let dir = std::env::temp_dir().join(format!(
            "recall_locations_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("SC005_stimulation_locations_macro.csv");
        fs::write(&path, "LA1-LA2,1,2\nLH3-LH4, 3, 4\n").expect("write");
        let parsed = read_locations(&path).expect("read");
        assert_eq!(parsed, locations());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn persisted_stimulus_shape() {
        let json = serde_json::to_value(Stimulus {
            location: locations()[0].clone(),
            amplitude: 2.0,
            frequency: 50,
            pulse_width: 150,
        })
        .expect("serialize");
        assert_eq!(json["location"]["label"], "LA1-LA2");
        assert_eq!(json["frequency"], 50);
        assert_eq!(json["pulse_width"], 150);
    }
}
