use std::collections::HashMap;

use parking_lot::Mutex;

use crate::store::PageId;

/// Records only every Nth view of a page, with a delta of N.
///
/// Tallies live in memory and are lost on restart, so the long-run total is
/// accurate in expectation only.
#[derive(Debug)]
pub struct UpdateSampler {
    frequency: u32,
    tallies: Mutex<HashMap<PageId, u32>>,
}

impl UpdateSampler {
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency: frequency.max(1),
            tallies: Mutex::new(HashMap::new()),
        }
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Count one view; returns the increment to persist when this view completes a batch.
    pub fn observe(&self, page_id: PageId) -> Option<u64> {
        if self.frequency == 1 {
            return Some(1);
        }
        let mut tallies = self.tallies.lock();
        let tally = tallies.entry(page_id).or_insert(0);
        *tally = tally.saturating_add(1);
        if *tally >= self.frequency {
            tallies.remove(&page_id);
            Some(u64::from(self.frequency))
        } else {
            None
        }
    }

    /// Views seen for `page_id` since its last persisted batch.
    pub fn pending(&self, page_id: PageId) -> u32 {
        self.tallies.lock().get(&page_id).copied().unwrap_or(0)
    }
}
