//! Seed sets issued to workers.
//!
//! A [`SeedSet`] is an ordered list of disjoint half-open ranges. The builder
//! accepts ranges and explicit seed lists in any order and normalizes them,
//! merging ranges that overlap or touch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{ConfigKind, Configuration};
use crate::error::{CoreError, CoreResult};

/// A half-open seed interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeedRange {
    pub from: u64,
    pub to: u64,
}

impl SeedRange {
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn contains(&self, seed: u64) -> bool {
        self.from <= seed && seed < self.to
    }
}

/// Normalized set of seed ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSet {
    ranges: Vec<SeedRange>,
}

impl SeedSet {
    pub fn builder() -> SeedSetBuilder {
        SeedSetBuilder::default()
    }

    /// A set covering the single range `[from, to)`.
    pub fn range(from: u64, to: u64) -> CoreResult<Self> {
        Ok(SeedSetBuilder::default().add_range(from, to)?.build())
    }

    pub fn ranges(&self) -> &[SeedRange] {
        &self.ranges
    }

    /// Number of seeds covered.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(SeedRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, seed: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.to <= seed);
        self.ranges.get(idx).is_some_and(|r| r.contains(seed))
    }

    /// The seed set as a `SEEDS` configuration, for content-addressed storage.
    pub fn to_configuration(&self) -> Configuration {
        let encoded = self
            .ranges
            .iter()
            .map(|r| format!("{}-{}", r.from, r.to))
            .collect::<Vec<_>>()
            .join(",");
        let mut fields = BTreeMap::new();
        fields.insert("ranges".to_string(), encoded);
        Configuration::new(ConfigKind::Seeds, fields)
    }

    pub fn hash(&self) -> u64 {
        self.to_configuration().hash()
    }
}

/// Incremental builder for [`SeedSet`].
#[derive(Debug, Clone, Default)]
pub struct SeedSetBuilder {
    ranges: Vec<SeedRange>,
}

impl SeedSetBuilder {
    /// Add the range `[from, to)`. Empty ranges are ignored.
    pub fn add_range(mut self, from: u64, to: u64) -> CoreResult<Self> {
        if from > to {
            return Err(CoreError::InvalidSeedRange { from, to });
        }
        if from < to {
            self.ranges.push(SeedRange { from, to });
        }
        Ok(self)
    }

    /// Add individual seeds.
    pub fn add_seeds<I: IntoIterator<Item = u64>>(mut self, seeds: I) -> Self {
        for seed in seeds {
            // u64::MAX cannot be expressed as a half-open range end.
            if let Some(to) = seed.checked_add(1) {
                self.ranges.push(SeedRange { from: seed, to });
            }
        }
        self
    }

    pub fn build(mut self) -> SeedSet {
        self.ranges.sort();
        let mut merged: Vec<SeedRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges {
            match merged.last_mut() {
                Some(last) if range.from <= last.to => last.to = last.to.max(range.to),
                _ => merged.push(range),
            }
        }
        SeedSet { ranges: merged }
    }
}
