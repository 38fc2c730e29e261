//! Tip pick-up counts per tip type.

use std::collections::BTreeMap;

use crate::rates::TipType;

/// Monotonic pick-up counter. Drops are logged by the tracker but never
/// change a count.
#[derive(Debug, Default, Clone)]
pub struct TipUsage {
    counts: BTreeMap<TipType, u32>,
}

impl TipUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one pick-up and returns the running total for the tip type.
    pub fn pick_up(&mut self, tip_type: &TipType) -> u32 {
        let count = self.counts.entry(tip_type.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn count(&self, tip_type: &TipType) -> u32 {
        self.counts.get(tip_type).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> BTreeMap<TipType, u32> {
        self.counts.clone()
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}
