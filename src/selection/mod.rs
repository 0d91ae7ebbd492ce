//! Owner selection strategies.
//!
//! A strategy maps the current owner and the viable candidates of an entity to
//! the next owner. The shard filters out down and non-voting members before
//! calling it, and never calls it with an empty candidate list.

pub mod config;
pub mod statistics;

pub use config::{StrategyConfig, StrategyKind, StrategyRegistry, StrategySpec};
pub use statistics::OwnershipStatistics;

use crate::types::MemberName;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Picks the owner of an entity among its viable candidates.
pub trait EntityOwnerSelectionStrategy: Send + Sync + fmt::Debug {
    /// How long to wait for more candidates before selecting. Zero selects immediately.
    fn selection_delay(&self) -> Duration;

    /// Choose the new owner. `viable` is never empty.
    fn new_owner(&mut self, current: Option<&MemberName>, viable: &[MemberName]) -> MemberName;
}

/// Keeps the current owner while it stays viable, otherwise takes the earliest candidate.
#[derive(Debug, Clone, Default)]
pub struct FirstCandidateSelectionStrategy {
    delay: Duration,
}

impl FirstCandidateSelectionStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl EntityOwnerSelectionStrategy for FirstCandidateSelectionStrategy {
    fn selection_delay(&self) -> Duration {
        self.delay
    }

    fn new_owner(&mut self, current: Option<&MemberName>, viable: &[MemberName]) -> MemberName {
        match current {
            Some(current) if viable.contains(current) => current.clone(),
            _ => viable[0].clone(),
        }
    }
}

/// Spreads ownership of one entity type evenly over its candidates.
///
/// The per-candidate counts start from the committed [`OwnershipStatistics`] and
/// are then tracked locally, so a burst of selections made before their owner
/// writes commit still balances.
#[derive(Debug, Clone, Default)]
pub struct LeastLoadedCandidateSelectionStrategy {
    delay: Duration,
    local_statistics: HashMap<MemberName, u64>,
}

impl LeastLoadedCandidateSelectionStrategy {
    pub fn new(delay: Duration, initial_statistics: HashMap<MemberName, u64>) -> Self {
        Self {
            delay,
            local_statistics: initial_statistics,
        }
    }

    /// Locally tracked number of entities owned by `member`.
    pub fn owned_count(&self, member: &MemberName) -> u64 {
        self.local_statistics.get(member).copied().unwrap_or(0)
    }
}

impl EntityOwnerSelectionStrategy for LeastLoadedCandidateSelectionStrategy {
    fn selection_delay(&self) -> Duration {
        self.delay
    }

    fn new_owner(&mut self, current: Option<&MemberName>, viable: &[MemberName]) -> MemberName {
        if let Some(current) = current {
            if let Some(count) = self.local_statistics.get_mut(current) {
                *count = count.saturating_sub(1);
            }
        }

        // First candidate wins ties
        let mut chosen = &viable[0];
        let mut chosen_count = self.owned_count(chosen);
        for candidate in &viable[1..] {
            let count = self.owned_count(candidate);
            if count < chosen_count {
                chosen = candidate;
                chosen_count = count;
            }
        }

        let chosen = chosen.clone();
        *self.local_statistics.entry(chosen.clone()).or_insert(0) += 1;
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> Vec<MemberName> {
        names.iter().map(|n| MemberName::new(n)).collect()
    }

    #[test]
    fn test_first_candidate_is_sticky() {
        let mut strategy = FirstCandidateSelectionStrategy::default();
        let viable = members(&["member-1", "member-2"]);

        assert_eq!(strategy.new_owner(None, &viable).as_str(), "member-1");

        let current = MemberName::new("member-2");
        assert_eq!(strategy.new_owner(Some(&current), &viable), current);

        let gone = MemberName::new("member-3");
        assert_eq!(strategy.new_owner(Some(&gone), &viable).as_str(), "member-1");
    }

    #[test]
    fn test_least_loaded_balances() {
        let mut initial = HashMap::new();
        initial.insert(MemberName::new("member-1"), 2);
        initial.insert(MemberName::new("member-2"), 1);
        let mut strategy = LeastLoadedCandidateSelectionStrategy::new(Duration::ZERO, initial);
        let viable = members(&["member-1", "member-2", "member-3"]);

        assert_eq!(strategy.new_owner(None, &viable).as_str(), "member-3");
        assert_eq!(strategy.new_owner(None, &viable).as_str(), "member-2");
        assert_eq!(strategy.new_owner(None, &viable).as_str(), "member-3");
        // All at two now, ties go to the first candidate.
        assert_eq!(strategy.new_owner(None, &viable).as_str(), "member-1");
        assert_eq!(strategy.owned_count(&MemberName::new("member-1")), 3);
    }

    #[test]
    fn test_least_loaded_releases_current_owner() {
        let mut initial = HashMap::new();
        initial.insert(MemberName::new("member-1"), 1);
        initial.insert(MemberName::new("member-2"), 0);
        let mut strategy = LeastLoadedCandidateSelectionStrategy::new(Duration::ZERO, initial);
        let viable = members(&["member-1", "member-2"]);

        // Re-selecting for an entity member-1 owns drops its count first, so it keeps it.
        let current = MemberName::new("member-1");
        assert_eq!(strategy.new_owner(Some(&current), &viable), current);
        assert_eq!(strategy.owned_count(&current), 1);
    }
}
