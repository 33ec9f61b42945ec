use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::error::{Result, RunnerError};

/// An ordered list of raw stimulus identifiers read from a resource list.
///
/// Pools only live through initialization: they are shuffled once and then
/// carved into condition groups. Every slice is bounds-checked, so a list
/// that is too short for the configured counts fails with a configuration
/// error naming the pool instead of quietly producing a shorter session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulusPool {
    name: String,
    items: Vec<String>,
}

impl StimulusPool {
    pub fn new(name: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    /// One stimulus per line, trimmed, blank lines skipped.
    pub fn from_lines(path: &Path) -> Result<Self> {
        let raw = read_list(path)?;
        let items = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self::new(pool_name(path), items))
    }

    /// Whitespace-separated stimuli, as the image lists are written.
    pub fn from_tokens(path: &Path) -> Result<Self> {
        let raw = read_list(path)?;
        let items = raw.split_whitespace().map(str::to_string).collect();
        Ok(Self::new(pool_name(path), items))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.iter().any(|s| s == item)
    }

    pub fn shuffled<R: Rng + ?Sized>(mut self, rng: &mut R) -> Self {
        self.items.shuffle(rng);
        self
    }

    pub fn require(&self, needed: usize) -> Result<()> {
        if self.items.len() < needed {
            return Err(RunnerError::config(format!(
                "stimulus pool '{}' holds {} items but {} are required",
                self.name,
                self.items.len(),
                needed
            )));
        }
        Ok(())
    }

    /// Items `start..end`, failing if the pool ends before `end`.
    pub fn slice(&self, start: usize, end: usize) -> Result<&[String]> {
        if start > end {
            return Err(RunnerError::config(format!(
                "invalid range {}..{} on stimulus pool '{}'",
                start, end, self.name
            )));
        }
        self.require(end)?;
        Ok(&self.items[start..end])
    }
}

fn read_list(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(RunnerError::config(format!(
            "stimulus list not found: {}",
            path.display()
        )));
    }
    let raw = fs::read_to_string(path)?;
    debug!(path = %path.display(), bytes = raw.len(), "loaded stimulus list");
    Ok(raw)
}

fn pool_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pool")
        .to_string()
}

/// Resource file locations, resolved against a resources root.
#[derive(Debug, Clone)]
pub struct ResourceLayout {
    pub root: PathBuf,
}

impl ResourceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn word_list(&self, experiment: &str, file: &str) -> PathBuf {
        self.root.join("word_lists").join(experiment).join(file)
    }

    pub fn image_list(&self, file: &str) -> PathBuf {
        self.root.join("image_lists").join(file)
    }

    pub fn subject_configuration(&self, subject: &str, file: &str) -> PathBuf {
        self.root
            .join("subject_configurations")
            .join(subject)
            .join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "recall_pool_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn from_lines_trims_and_skips_blank_lines() {
        let dir = temp_dir("lines");
        let path = dir.join("inside.txt");
        fs::write(&path, "cup\n  key \n\nring\n").expect("write list");
        let pool = StimulusPool::from_lines(&path).expect("pool");
        assert_eq!(pool.name(), "inside");
        assert_eq!(pool.items(), ["cup", "key", "ring"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn from_tokens_splits_on_any_whitespace() {
        let dir = temp_dir("tokens");
        let path = dir.join("faces.txt");
        fs::write(&path, "a.png b.png\nc.png\td.png").expect("write list");
        let pool = StimulusPool::from_tokens(&path).expect("pool");
        assert_eq!(pool.len(), 4);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_list_is_configuration_error() {
        let err = StimulusPool::from_lines(Path::new("/nonexistent/recall/list.txt"))
            .expect_err("missing file");
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn slice_refuses_to_run_past_the_end() {
        let pool = StimulusPool::new("nouns", vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(pool.slice(1, 3).expect("in range"), ["b", "c"]);
        let err = pool.slice(2, 5).expect_err("too short");
        assert!(err.to_string().contains("'nouns' holds 3 items but 5 are required"));
    }

    #[test]
    fn shuffled_keeps_every_item() {
        let mut rng = StdRng::seed_from_u64(9);
        let items: Vec<String> = (0..30).map(|i| i.to_string()).collect();
        let pool = StimulusPool::new("n", items.clone()).shuffled(&mut rng);
        let mut sorted = pool.items().to_vec();
        sorted.sort();
        let mut expected = items;
        expected.sort();
        assert_eq!(sorted, expected);
    }
}
