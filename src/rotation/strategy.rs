//! Credential selection strategies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::config::RotationStrategy;

/// What a strategy knows about a usable credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Position in the credential store.
    pub position: usize,
    /// Last time the credential was handed out.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Requests issued so far.
    pub requests_issued: u64,
}

/// Orders candidates by preference.
///
/// The rotator tries candidates in the returned order and takes the first
/// one with budget, so a strategy only ranks; it never filters.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Indices into `candidates`, most preferred first. Every index appears
    /// exactly once.
    fn order(&self, candidates: &[Candidate]) -> Vec<usize>;
}

/// Starts one past the previous starting point on every call.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn order(&self, candidates: &[Candidate]) -> Vec<usize> {
        let n = candidates.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n).map(|i| (start + i) % n).collect()
    }
}

/// Prefers the credential used longest ago; never-used credentials first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl SelectionStrategy for LeastRecentlyUsed {
    fn order(&self, candidates: &[Candidate]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&i| (candidates[i].last_used_at, candidates[i].position));
        order
    }
}

/// Uniform random order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn order(&self, candidates: &[Candidate]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}

impl RotationStrategy {
    /// Strategy implementation for this setting.
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            Self::RoundRobin => Box::<RoundRobin>::default(),
            Self::LeastRecentlyUsed => Box::new(LeastRecentlyUsed),
            Self::Random => Box::new(RandomStrategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|position| Candidate {
                position,
                last_used_at: None,
                requests_issued: 0,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let strategy = RoundRobin::default();
        let c = candidates(3);
        assert_eq!(strategy.order(&c), vec![0, 1, 2]);
        assert_eq!(strategy.order(&c), vec![1, 2, 0]);
        assert_eq!(strategy.order(&c), vec![2, 0, 1]);
        assert_eq!(strategy.order(&c), vec![0, 1, 2]);
    }

    #[test]
    fn test_lru_prefers_oldest() {
        let now = Utc::now();
        let mut c = candidates(3);
        c[0].last_used_at = Some(now);
        c[1].last_used_at = Some(now - Duration::seconds(30));
        c[2].last_used_at = None;
        assert_eq!(LeastRecentlyUsed.order(&c), vec![2, 1, 0]);
    }

    #[test]
    fn test_random_is_a_permutation() {
        let mut order = RandomStrategy.order(&candidates(5));
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(RoundRobin::default().order(&[]).is_empty());
        assert!(LeastRecentlyUsed.order(&[]).is_empty());
    }
}
