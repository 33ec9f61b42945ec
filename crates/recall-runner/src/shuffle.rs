//! Rejection-sampling shuffles under combinatorial constraints.
//!
//! Every draw is a fresh uniform permutation; the first one that passes the
//! predicate wins. Attempts are always bounded, and the constraints that can
//! be checked for feasibility up front are, so a structurally impossible
//! request fails fast with [`RunnerError::ConstraintInfeasible`] instead of
//! burning the whole attempt budget.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::error::{Result, RunnerError};

pub const DEFAULT_MAX_ATTEMPTS: usize = 10_000;

/// Cap on the longest run of identical consecutive tags.
pub struct RunCap<T> {
    pub name: &'static str,
    pub max: usize,
    pub tag: fn(&T) -> &str,
}

impl<T> Clone for RunCap<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RunCap<T> {}

impl<T> RunCap<T> {
    pub fn new(name: &'static str, max: usize, tag: fn(&T) -> &str) -> Self {
        Self { name, max, tag }
    }
}

pub fn shuffle_until<T, R, F>(
    items: &[T],
    rng: &mut R,
    max_attempts: usize,
    constraint: &'static str,
    mut accept: F,
) -> Result<Vec<T>>
where
    T: Clone,
    R: Rng + ?Sized,
    F: FnMut(&[T]) -> bool,
{
    let mut candidate = items.to_vec();
    for attempt in 1..=max_attempts {
        candidate.shuffle(rng);
        if accept(&candidate) {
            debug!(constraint, attempt, len = items.len(), "constrained shuffle accepted");
            return Ok(candidate);
        }
    }
    Err(RunnerError::ConstraintUnsatisfied {
        constraint,
        attempts: max_attempts,
    })
}

pub fn is_derangement<T: PartialEq>(before: &[T], candidate: &[T]) -> bool {
    before.len() == candidate.len() && before.iter().zip(candidate).all(|(a, b)| a != b)
}

pub fn longest_run<'a, I>(tags: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let mut longest = 0;
    let mut current = 0;
    let mut last: Option<&str> = None;
    for tag in tags {
        if last == Some(tag) {
            current += 1;
        } else {
            current = 1;
            last = Some(tag);
        }
        longest = longest.max(current);
    }
    longest
}

pub fn within_run_caps<T>(items: &[T], caps: &[RunCap<T>]) -> bool {
    caps.iter()
        .all(|cap| longest_run(items.iter().map(cap.tag)) <= cap.max)
}

/// Permutation of `items` in which no position keeps an equal value.
pub fn derange<T, R>(items: &[T], rng: &mut R, max_attempts: usize) -> Result<Vec<T>>
where
    T: Clone + PartialEq,
    R: Rng + ?Sized,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    // A multiset admits a derangement iff no value fills more than half of it.
    let worst = items
        .iter()
        .map(|item| items.iter().filter(|other| *other == item).count())
        .max()
        .unwrap_or(0);
    if worst * 2 > items.len() {
        return Err(RunnerError::ConstraintInfeasible {
            constraint: "derangement",
            reason: format!(
                "a value occupies {} of {} positions, so some position must keep it",
                worst,
                items.len()
            ),
        });
    }
    shuffle_until(items, rng, max_attempts, "derangement", |candidate| {
        is_derangement(items, candidate)
    })
}

/// Shuffle subject to several simultaneous run-length caps.
pub fn pseudorandomize<T, R>(
    items: &[T],
    caps: &[RunCap<T>],
    rng: &mut R,
    max_attempts: usize,
) -> Result<Vec<T>>
where
    T: Clone,
    R: Rng + ?Sized,
{
    for cap in caps {
        check_run_cap_feasible(items, cap)?;
    }
    shuffle_until(items, rng, max_attempts, "run_length_cap", |candidate| {
        within_run_caps(candidate, caps)
    })
}

fn check_run_cap_feasible<T>(items: &[T], cap: &RunCap<T>) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for item in items {
        let tag = (cap.tag)(item);
        match counts.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, n)) => *n += 1,
            None => counts.push((tag, 1)),
        }
    }
    let (tag, most) = counts
        .iter()
        .copied()
        .max_by_key(|(_, n)| *n)
        .unwrap_or(("", 0));
    let others = items.len() - most;
    // Each of the `others + 1` gaps between other tags holds at most `max`.
    if most > cap.max * (others + 1) {
        return Err(RunnerError::ConstraintInfeasible {
            constraint: cap.name,
            reason: format!(
                "{} items tagged '{}' cannot be split into runs of at most {} by {} other items",
                most, tag, cap.max, others
            ),
        });
    }
    Ok(())
}

/// Concatenate `repetitions` derangements of `set`, rejecting any result in
/// which one value lands on the same intra-block position more than
/// `position_cap` times.
pub fn balanced_derangement_cycles<T, R>(
    set: &[T],
    repetitions: usize,
    position_cap: usize,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Vec<T>>
where
    T: Clone + PartialEq,
    R: Rng + ?Sized,
{
    let width = set.len();
    if width < 2 {
        return Err(RunnerError::ConstraintInfeasible {
            constraint: "position_balance",
            reason: format!("a set of {} value(s) has no derangement", width),
        });
    }
    // Each slot is filled by one of the width - 1 values that did not start there.
    if (width - 1) * position_cap < repetitions {
        return Err(RunnerError::ConstraintInfeasible {
            constraint: "position_balance",
            reason: format!(
                "{} repetitions over {} candidate values per slot exceed cap {}",
                repetitions,
                width - 1,
                position_cap
            ),
        });
    }
    for attempt in 1..=max_attempts {
        let mut cycles = Vec::with_capacity(width * repetitions);
        for _ in 0..repetitions {
            cycles.extend(derange(set, rng, max_attempts)?);
        }
        if position_counts_within(set, &cycles, position_cap) {
            debug!(attempt, repetitions, position_cap, "balanced derangement accepted");
            return Ok(cycles);
        }
    }
    Err(RunnerError::ConstraintUnsatisfied {
        constraint: "position_balance",
        attempts: max_attempts,
    })
}

pub fn position_counts_within<T: PartialEq>(set: &[T], cycles: &[T], cap: usize) -> bool {
    let width = set.len();
    if width == 0 {
        return cycles.is_empty();
    }
    set.iter().all(|value| {
        (0..width).all(|slot| {
            cycles
                .iter()
                .skip(slot)
                .step_by(width)
                .filter(|v| *v == value)
                .count()
                <= cap
        })
    })
}
