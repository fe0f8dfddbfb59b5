use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::store::{
    CounterStore, MAX_COUNT, PageId, PageRecord, StoreError, StoreResult, TopPage,
    TopPagesQuery,
};

#[derive(Debug, Default)]
struct MemoryState {
    counters: BTreeMap<PageId, u64>,
    pages: BTreeMap<PageId, PageRecord>,
}

/// Process-local [`CounterStore`].
///
/// Counts calls per operation and can be switched offline so callers can be
/// checked against cache hits and store outages.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    count_reads: AtomicUsize,
    sum_reads: AtomicUsize,
    increments: AtomicUsize,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with [`StoreError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn count_reads(&self) -> usize {
        self.count_reads.load(Ordering::SeqCst)
    }

    pub fn sum_reads(&self) -> usize {
        self.sum_reads.load(Ordering::SeqCst)
    }

    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    fn ensure_online(&self, operation: &'static str) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Offline { operation });
        }
        Ok(())
    }
}

impl CounterStore for MemoryCounterStore {
    fn get_count(&self, page_id: PageId) -> StoreResult<Option<u64>> {
        self.count_reads.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("get_count")?;
        Ok(self.state.lock().counters.get(&page_id).copied())
    }

    fn increment_count(&self, page_id: PageId, delta: u64) -> StoreResult<u64> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("increment_count")?;
        let mut state = self.state.lock();
        if delta == 0 {
            return Ok(state.counters.get(&page_id).copied().unwrap_or(0));
        }
        let count = state.counters.entry(page_id).or_insert(0);
        *count = count.saturating_add(delta).min(MAX_COUNT);
        Ok(*count)
    }

    fn sum_all_counts(&self) -> StoreResult<u64> {
        self.sum_reads.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("sum_all_counts")?;
        Ok(self
            .state
            .lock()
            .counters
            .values()
            .fold(0u64, |total, count| total.saturating_add(*count))
            .min(MAX_COUNT))
    }

    fn list_top_pages(&self, query: &TopPagesQuery) -> StoreResult<Vec<TopPage>> {
        self.ensure_online("list_top_pages")?;
        let state = self.state.lock();
        let mut rows: Vec<TopPage> = state
            .counters
            .iter()
            .filter_map(|(page_id, count)| {
                let page = state.pages.get(page_id)?;
                if query.exclude_redirects && page.is_redirect {
                    return None;
                }
                if !query.namespaces.contains(&page.namespace) {
                    return None;
                }
                Some(TopPage {
                    page_id: *page_id,
                    namespace: page.namespace,
                    title: page.title.clone(),
                    count: *count,
                    length: page.length,
                })
            })
            .collect();
        rows.sort_by_key(|row| (Reverse(row.count), row.page_id));
        rows.truncate(query.limit);
        Ok(rows)
    }

    fn upsert_page(&self, page: &PageRecord) -> StoreResult<()> {
        self.ensure_online("upsert_page")?;
        self.state.lock().pages.insert(page.page_id, page.clone());
        Ok(())
    }

    fn page(&self, page_id: PageId) -> StoreResult<Option<PageRecord>> {
        self.ensure_online("page")?;
        Ok(self.state.lock().pages.get(&page_id).cloned())
    }
}
