//! Boolean configuration permuters.
//!
//! A permuter walks every on/off assignment of a set of permeable keys, merged
//! with a fixed preset map. Assignments are numbered by the unsigned integer
//! whose binary form (zero padded to the number of permeable keys, most
//! significant bit first) assigns the lexicographically ordered keys. The
//! sequence is ordered once at construction; emitted maps are built lazily.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Upper bound on permeable keys (2^24 assignments).
pub const MAX_PERMEABLE_KEYS: usize = 24;

/// A resumable source of configuration maps.
pub trait Permuter: Send {
    /// Return the current assignment and advance.
    fn next(&mut self) -> Option<BTreeMap<String, String>>;

    /// Return what the next call to [`Permuter::next`] would, without advancing.
    fn peek(&self) -> Option<BTreeMap<String, String>>;

    /// Reset to the start of the sequence.
    fn loop_back(&mut self);

    /// The only configuration of a permuter with nothing to vary. Such a
    /// permuter does not wrap around on [`Permuter::loop_back`].
    fn fixed_point(&self) -> Option<BTreeMap<String, String>> {
        None
    }
}

/// Order in which assignments are emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    /// Ascending number of enabled keys, ties by ascending value.
    #[default]
    SetBitCount,
    /// Ascending number of disabled keys, ties by ascending value.
    UnsetBitCount,
    /// Ascending assignment value.
    BitValue,
}

/// Permuter over boolean (`"true"` / `"false"`) keys.
#[derive(Debug, Clone)]
pub struct BooleanPermuter {
    fixed: BTreeMap<String, String>,
    free: Vec<String>,
    order: Vec<u32>,
    pos: usize,
}

impl BooleanPermuter {
    /// Build a permuter with the canonical [`SortMode::SetBitCount`] order.
    pub fn new<I, S>(fixed: BTreeMap<String, String>, free: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_sort_mode(fixed, free, SortMode::default())
    }

    pub fn with_sort_mode<I, S>(
        fixed: BTreeMap<String, String>,
        free: I,
        mode: SortMode,
    ) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let free: Vec<String> = free
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        if let Some(key) = free.iter().find(|k| fixed.contains_key(k.as_str())) {
            return Err(CoreError::OverlappingKeys(key.clone()));
        }
        if free.len() > MAX_PERMEABLE_KEYS {
            return Err(CoreError::TooManyPermeableKeys {
                count: free.len(),
                max: MAX_PERMEABLE_KEYS,
            });
        }

        let width = free.len() as u32;
        let mut order: Vec<u32> = (0..(1u32 << width)).collect();
        match mode {
            SortMode::SetBitCount => order.sort_by_key(|v| (v.count_ones(), *v)),
            SortMode::UnsetBitCount => order.sort_by_key(|v| (width - v.count_ones(), *v)),
            SortMode::BitValue => {}
        }

        debug!(
            permeable = free.len(),
            preset = fixed.len(),
            assignments = order.len(),
            ?mode,
            "permuter built"
        );

        Ok(Self {
            fixed,
            free,
            order,
            pos: 0,
        })
    }

    /// Total number of assignments in one pass.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of assignments already emitted in the current pass.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Keys that vary, in bit order.
    pub fn permeable(&self) -> &[String] {
        &self.free
    }

    fn assignment(&self, value: u32) -> BTreeMap<String, String> {
        let width = self.free.len();
        let mut out = self.fixed.clone();
        for (j, key) in self.free.iter().enumerate() {
            let bit = (value >> (width - 1 - j)) & 1;
            let flag = if bit == 1 { "true" } else { "false" };
            out.insert(key.clone(), flag.to_string());
        }
        out
    }
}

impl Permuter for BooleanPermuter {
    fn next(&mut self) -> Option<BTreeMap<String, String>> {
        let item = self.peek()?;
        self.pos += 1;
        Some(item)
    }

    fn peek(&self) -> Option<BTreeMap<String, String>> {
        self.order.get(self.pos).map(|v| self.assignment(*v))
    }

    fn loop_back(&mut self) {
        if !self.free.is_empty() {
            self.pos = 0;
        }
    }

    fn fixed_point(&self) -> Option<BTreeMap<String, String>> {
        self.free.is_empty().then(|| self.fixed.clone())
    }
}
