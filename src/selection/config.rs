//! Per entity type strategy configuration and the shard's strategy cache.

use super::{
    EntityOwnerSelectionStrategy, FirstCandidateSelectionStrategy,
    LeastLoadedCandidateSelectionStrategy, OwnershipStatistics,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Property key prefix of a strategy entry, followed by the entity type.
pub const ENTITY_TYPE_PREFIX: &str = "entity.type.";

/// Built-in selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    FirstCandidate,
    LeastLoaded,
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-candidate" | "firstcandidate" | "firstcandidateselectionstrategy" => {
                Ok(StrategyKind::FirstCandidate)
            }
            "least-loaded" | "leastloaded" | "leastloadedcandidateselectionstrategy" => {
                Ok(StrategyKind::LeastLoaded)
            }
            other => Err(Error::Config(format!("unknown selection strategy: {}", other))),
        }
    }
}

/// Strategy and selection delay configured for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrategySpec {
    pub kind: StrategyKind,
    pub delay: Duration,
}

/// Strategies per entity type. Unconfigured types select the first candidate immediately.
#[derive(Debug, Clone, Default)]
pub struct StrategyConfig {
    entity_types: HashMap<String, StrategySpec>,
}

impl StrategyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the strategy for an entity type.
    pub fn with_strategy(
        mut self,
        entity_type: impl Into<String>,
        kind: StrategyKind,
        delay: Duration,
    ) -> Self {
        self.entity_types
            .insert(entity_type.into(), StrategySpec { kind, delay });
        self
    }

    /// Parse one `entity.type.<type> = <strategy>[,<delay ms>]` property.
    pub fn parse_entry(&mut self, key: &str, value: &str) -> Result<()> {
        let entity_type = key
            .strip_prefix(ENTITY_TYPE_PREFIX)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config(format!("invalid strategy key: {}", key)))?;

        let mut parts = value.splitn(2, ',');
        let kind: StrategyKind = parts.next().unwrap_or_default().parse()?;
        let delay = match parts.next() {
            Some(ms) => {
                let ms: u64 = ms.trim().parse().map_err(|_| {
                    Error::Config(format!("invalid selection delay for {}: {}", entity_type, ms))
                })?;
                Duration::from_millis(ms)
            }
            None => Duration::ZERO,
        };

        self.entity_types
            .insert(entity_type.to_string(), StrategySpec { kind, delay });
        Ok(())
    }

    /// Build a configuration from property pairs, ignoring keys for other settings.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::new();
        for (key, value) in properties {
            if key.starts_with(ENTITY_TYPE_PREFIX) {
                config.parse_entry(key, value)?;
            }
        }
        Ok(config)
    }

    /// Strategy settings for an entity type, falling back to the default.
    pub fn spec(&self, entity_type: &str) -> StrategySpec {
        self.entity_types
            .get(entity_type)
            .copied()
            .unwrap_or_default()
    }
}

/// Strategy instances created on demand per entity type.
///
/// Cleared whenever the local replica becomes leader, so stateful strategies are
/// re-seeded from current statistics.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    config: StrategyConfig,
    strategies: HashMap<String, Box<dyn EntityOwnerSelectionStrategy>>,
}

impl StrategyRegistry {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            strategies: HashMap::new(),
        }
    }

    /// Get or create the strategy for an entity type.
    pub fn strategy(
        &mut self,
        entity_type: &str,
        statistics: &OwnershipStatistics,
    ) -> &mut dyn EntityOwnerSelectionStrategy {
        let spec = self.config.spec(entity_type);
        self.strategies
            .entry(entity_type.to_string())
            .or_insert_with(|| {
                let strategy: Box<dyn EntityOwnerSelectionStrategy> = match spec.kind {
                    StrategyKind::FirstCandidate => {
                        Box::new(FirstCandidateSelectionStrategy::new(spec.delay))
                    }
                    StrategyKind::LeastLoaded => {
                        Box::new(LeastLoadedCandidateSelectionStrategy::new(
                            spec.delay,
                            statistics.by_entity_type(entity_type),
                        ))
                    }
                };
                strategy
            })
            .as_mut()
    }

    /// Configured delay for an entity type.
    pub fn selection_delay(&self, entity_type: &str) -> Duration {
        self.config.spec(entity_type).delay
    }

    /// Drop all instances.
    pub fn clear(&mut self) {
        self.strategies.clear();
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
