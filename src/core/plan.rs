use crate::core::error::PlanError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EpisodePlanEntry {
    pub number: u32,
    pub title: String,
    pub summary: String,
}

impl EpisodePlanEntry {
    pub fn new(number: u32, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            summary: summary.into(),
        }
    }
}

/// Ordered list of planned episodes, unique by number.
///
/// Entries are kept sorted by number, so "plan order" and ascending number order
/// are the same thing.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(try_from = "Vec<EpisodePlanEntry>", into = "Vec<EpisodePlanEntry>")]
pub struct EpisodePlan {
    entries: Vec<EpisodePlanEntry>,
}

impl TryFrom<Vec<EpisodePlanEntry>> for EpisodePlan {
    type Error = PlanError;

    fn try_from(entries: Vec<EpisodePlanEntry>) -> Result<Self, PlanError> {
        Self::new(entries)
    }
}

impl From<EpisodePlan> for Vec<EpisodePlanEntry> {
    fn from(plan: EpisodePlan) -> Self {
        plan.entries
    }
}

impl EpisodePlan {
    pub fn new(entries: Vec<EpisodePlanEntry>) -> Result<Self, PlanError> {
        let mut plan = Self::default();
        plan.replace(entries)?;
        Ok(plan)
    }

    pub fn entries(&self) -> &[EpisodePlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, number: u32) -> Option<&EpisodePlanEntry> {
        self.entries.iter().find(|e| e.number == number)
    }

    pub fn last(&self) -> Option<&EpisodePlanEntry> {
        self.entries.last()
    }

    pub fn max_number(&self) -> u32 {
        self.entries.iter().map(|e| e.number).max().unwrap_or(0)
    }

    /// Bulk-sets the plan. Generated episodes are not touched.
    pub fn replace(&mut self, mut entries: Vec<EpisodePlanEntry>) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.number == 0 {
                return Err(PlanError::InvalidEpisodeNumber {
                    number: 0,
                    current_max: 0,
                });
            }
            if !seen.insert(entry.number) {
                return Err(PlanError::DuplicateEpisodeNumber(entry.number));
            }
        }
        entries.sort_by_key(|e| e.number);
        self.entries = entries;
        Ok(())
    }

    /// Appends entries whose numbers are strictly increasing and above the current maximum.
    /// Nothing is appended if any entry violates that.
    pub fn append(&mut self, entries: Vec<EpisodePlanEntry>) -> Result<(), PlanError> {
        let mut current_max = self.max_number();
        for entry in &entries {
            if entry.number <= current_max {
                return Err(PlanError::InvalidEpisodeNumber {
                    number: entry.number,
                    current_max,
                });
            }
            current_max = entry.number;
        }
        self.entries.extend(entries);
        Ok(())
    }

    pub fn update_summary(&mut self, number: u32, summary: impl Into<String>) -> Result<(), PlanError> {
        let entry = self.get_mut(number)?;
        entry.summary = summary.into();
        Ok(())
    }

    pub fn update_title(&mut self, number: u32, title: impl Into<String>) -> Result<(), PlanError> {
        let entry = self.get_mut(number)?;
        entry.title = title.into();
        Ok(())
    }

    /// Removes one entry and renumbers the rest to `1..=len`.
    ///
    /// Returns the `(old, new)` number of every remaining entry so callers can move
    /// content keyed by the old numbers.
    pub fn remove_and_renumber(&mut self, number: u32) -> Result<Vec<(u32, u32)>, PlanError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.number == number)
            .ok_or(PlanError::UnknownEpisode(number))?;
        self.entries.remove(idx);

        let mut mapping = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let new_number = i as u32 + 1;
            mapping.push((entry.number, new_number));
            entry.number = new_number;
        }
        debug!("Removed episode {} and renumbered {} entries", number, mapping.len());
        Ok(mapping)
    }

    fn get_mut(&mut self, number: u32) -> Result<&mut EpisodePlanEntry, PlanError> {
        self.entries
            .iter_mut()
            .find(|e| e.number == number)
            .ok_or(PlanError::UnknownEpisode(number))
    }
}

/// Plan numbers that have no generated text yet, in plan order.
pub fn pending_numbers(plan: &EpisodePlan, episodes: &BTreeMap<u32, String>) -> Vec<u32> {
    plan.entries()
        .iter()
        .map(|e| e.number)
        .filter(|n| !episodes.contains_key(n))
        .collect()
}
