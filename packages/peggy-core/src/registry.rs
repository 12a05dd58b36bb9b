//! Validator registry: active validator set and voting power by height

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{Power, ValidatorId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no validator set known at height {0}")]
    NoSetAtHeight(u64),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid validator set entry: {0}")]
    InvalidEntry(String),
}

/// One validator and its power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorPower {
    pub validator: ValidatorId,
    pub power: Power,
}

/// Snapshot of the validator set at a height, ordered by validator id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub height: u64,
    validators: Vec<ValidatorPower>,
}

impl ValidatorSet {
    /// Build a set; entries are sorted by id and zero-power entries dropped.
    /// A validator listed twice is an error.
    pub fn new(height: u64, entries: impl IntoIterator<Item = ValidatorPower>) -> Result<Self, RegistryError> {
        let mut by_id = BTreeMap::new();
        for entry in entries {
            if entry.power == 0 {
                continue;
            }
            if by_id.insert(entry.validator, entry.power).is_some() {
                return Err(RegistryError::InvalidEntry(format!(
                    "validator {} listed twice",
                    entry.validator
                )));
            }
        }
        let validators = by_id
            .into_iter()
            .map(|(validator, power)| ValidatorPower { validator, power })
            .collect();
        Ok(Self { height, validators })
    }

    pub fn validators(&self) -> &[ValidatorPower] {
        &self.validators
    }

    pub fn power_of(&self, validator: &ValidatorId) -> Option<Power> {
        self.validators
            .binary_search_by(|v| v.validator.cmp(validator))
            .ok()
            .map(|i| self.validators[i].power)
    }

    pub fn total_power(&self) -> Power {
        self.validators.iter().map(|v| v.power).sum()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Source of validator sets.
///
/// Aggregators only depend on this trait, so tests inject fixed power tables.
#[async_trait]
pub trait ValidatorRegistry: Send + Sync {
    /// Ordered validator set active at `height`
    async fn current_set(&self, height: u64) -> Result<ValidatorSet, RegistryError>;

    /// Total power active at `height`
    async fn total_power(&self, height: u64) -> Result<Power, RegistryError> {
        Ok(self.current_set(height).await?.total_power())
    }
}

/// Registry backed by fixed tables, each effective from a start height
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    sets: BTreeMap<u64, Vec<ValidatorPower>>,
}

impl StaticRegistry {
    /// One set, effective from height 0
    pub fn new(validators: Vec<ValidatorPower>) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(0, validators);
        Self { sets }
    }

    /// Add a set that takes effect at `height`
    pub fn with_set_from(mut self, height: u64, validators: Vec<ValidatorPower>) -> Self {
        self.sets.insert(height, validators);
        self
    }

    /// Parse `0xaddr:power,0xaddr:power,...`
    pub fn parse(table: &str) -> Result<Self, RegistryError> {
        let mut validators = Vec::new();
        for entry in table.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (addr, power) = entry
                .split_once(':')
                .ok_or_else(|| RegistryError::InvalidEntry(format!("missing ':' in '{}'", entry)))?;
            let validator = ValidatorId::from_hex(addr.trim())
                .map_err(|e| RegistryError::InvalidEntry(format!("{}: {}", addr, e)))?;
            let power: Power = power
                .trim()
                .parse()
                .map_err(|e| RegistryError::InvalidEntry(format!("{}: {}", power, e)))?;
            validators.push(ValidatorPower { validator, power });
        }
        if validators.is_empty() {
            return Err(RegistryError::InvalidEntry("empty validator set".to_string()));
        }
        // Reject duplicates up front
        ValidatorSet::new(0, validators.clone())?;
        Ok(Self::new(validators))
    }
}

#[async_trait]
impl ValidatorRegistry for StaticRegistry {
    async fn current_set(&self, height: u64) -> Result<ValidatorSet, RegistryError> {
        let (_, validators) = self
            .sets
            .range(..=height)
            .next_back()
            .ok_or(RegistryError::NoSetAtHeight(height))?;
        ValidatorSet::new(height, validators.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(byte: u8, power: Power) -> ValidatorPower {
        ValidatorPower {
            validator: ValidatorId([byte; 20]),
            power,
        }
    }

    #[test]
    fn test_set_is_ordered_and_summed() {
        let set = ValidatorSet::new(5, vec![vp(3, 10), vp(1, 20), vp(2, 0)]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.validators()[0].validator, ValidatorId([1; 20]));
        assert_eq!(set.total_power(), 30);
        assert_eq!(set.power_of(&ValidatorId([3; 20])), Some(10));
        assert_eq!(set.power_of(&ValidatorId([2; 20])), None);
    }

    #[test]
    fn test_duplicate_validator_rejected() {
        assert!(ValidatorSet::new(0, vec![vp(1, 1), vp(1, 2)]).is_err());
    }

    #[tokio::test]
    async fn test_static_registry_heights() {
        let registry = StaticRegistry::new(vec![vp(1, 10)]).with_set_from(100, vec![vp(1, 10), vp(2, 30)]);

        assert_eq!(registry.total_power(0).await.unwrap(), 10);
        assert_eq!(registry.total_power(99).await.unwrap(), 10);
        assert_eq!(registry.total_power(100).await.unwrap(), 40);
        assert_eq!(registry.current_set(500).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_set_before_first_height() {
        let registry = StaticRegistry::default().with_set_from(10, vec![vp(1, 1)]);
        assert_eq!(
            registry.current_set(9).await.unwrap_err(),
            RegistryError::NoSetAtHeight(9)
        );
    }

    #[tokio::test]
    async fn test_parse_validator_set() {
        let registry = StaticRegistry::parse(
            "0x0101010101010101010101010101010101010101:10, 0x0202020202020202020202020202020202020202:30",
        )
        .unwrap();
        let set = registry.current_set(0).await.unwrap();
        assert_eq!(set.total_power(), 40);
        assert_eq!(set.power_of(&ValidatorId([2; 20])), Some(30));

        assert!(StaticRegistry::parse("").is_err());
        assert!(StaticRegistry::parse("0x01:10").is_err());
        assert!(StaticRegistry::parse("0x0101010101010101010101010101010101010101").is_err());
        assert!(StaticRegistry::parse("0x0101010101010101010101010101010101010101:abc").is_err());
    }
}
