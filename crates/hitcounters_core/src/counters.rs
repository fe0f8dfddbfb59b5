use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, CacheKey, CounterCache, needs_read_through};
use crate::config::CountersConfig;
use crate::deferred::{DeferredStats, DeferredUpdates, Increment};
use crate::sampling::UpdateSampler;
use crate::store::{CounterStore, PageRef, TopPage, TopPagesQuery};

/// Read side used by magic words, the footer, statistics and abuse-filter variables.
pub trait CounterReader: Send + Sync {
    fn page_view_count(&self, page: &PageRef) -> Option<u64>;
    fn site_total_views(&self) -> Option<u64>;
    fn top_pages(&self, limit: i64) -> Vec<TopPage>;
}

/// Write side fed by page-view events that already passed the host's checks.
pub trait ViewRecorder: Send + Sync {
    fn record_view(&self, page: &PageRef);
}

/// View counters for one serving process.
///
/// Reads go through the shared cache and fall back to the store; views are
/// sampled and written by a background worker. The site total is additionally
/// memoised for the lifetime of this value.
pub struct HitCounters {
    store: Arc<dyn CounterStore>,
    cache: CounterCache,
    config: CountersConfig,
    sampler: UpdateSampler,
    deferred: DeferredUpdates,
    site_total: Mutex<Option<u64>>,
}

impl HitCounters {
    pub fn new(
        store: Arc<dyn CounterStore>,
        cache_backend: Arc<dyn CacheBackend>,
        config: CountersConfig,
    ) -> Result<Self> {
        let cache = CounterCache::new(cache_backend, config.ttl);
        let deferred = DeferredUpdates::spawn(Arc::clone(&store), cache.clone())?;
        Ok(Self {
            sampler: UpdateSampler::new(config.update_frequency),
            store,
            cache,
            config,
            deferred,
            site_total: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CountersConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn CounterStore {
        self.store.as_ref()
    }

    /// View count of `page`, or `None` when it has no counter or none can be read.
    pub fn get_page_view_count(&self, page: &PageRef) -> Option<u64> {
        if !page.is_countable() {
            return None;
        }

        let key = CacheKey::view_count(page.id);
        let generation = self.cache.generation(&key);
        let cached = self.cache.get(&key);
        if !needs_read_through(cached) {
            return cached;
        }

        match self.store.get_count(page.id) {
            Ok(Some(count)) => {
                // A write that landed during the read invalidated the key; leave it empty.
                self.cache.put_if_current(&key, count, generation);
                Some(count)
            }
            Ok(None) => {
                debug!(page_id = page.id, "no counter row for page");
                None
            }
            Err(error) => {
                warn!(page_id = page.id, %error, "counter store unavailable; serving cached count");
                cached
            }
        }
    }

    /// Sum of all page counters; may lag behind recent views by one cache TTL.
    ///
    /// The memo lock is never held across the store read, so concurrent callers
    /// may each compute the sum once before the memo is filled.
    pub fn get_site_total_views(&self) -> Option<u64> {
        let memo = *self.site_total.lock();
        if let Some(total) = memo
            && total > 1
        {
            return Some(total);
        }

        let key = CacheKey::site_total();
        let cached = self.cache.get(&key);
        debug!(?cached, "site total from cache");
        if !needs_read_through(cached) {
            *self.site_total.lock() = cached;
            return cached;
        }

        match self.store.sum_all_counts() {
            Ok(total) => {
                debug!(total, "site total from store");
                self.cache.put(&key, total);
                *self.site_total.lock() = Some(total);
                Some(total)
            }
            Err(error) => {
                warn!(%error, "counter store unavailable; serving cached site total");
                cached
            }
        }
    }

    /// Schedule a sampled increment for `page`. Never blocks on the store and never fails.
    pub fn record_view(&self, page: &PageRef) {
        if self.config.disable_counters {
            debug!(page_id = page.id, "counters are disabled");
            return;
        }
        if !page.is_countable() {
            return;
        }
        if let Some(delta) = self.sampler.observe(page.id) {
            self.deferred.push(Increment {
                page_id: page.id,
                delta,
            });
        }
    }

    /// Most viewed content pages. `limit <= 0` and store failures give an empty list.
    pub fn list_top_pages(&self, limit: i64) -> Vec<TopPage> {
        let Ok(limit) = usize::try_from(limit) else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }
        let query = TopPagesQuery::new(limit, &self.config.content_namespaces);
        match self.store.list_top_pages(&query) {
            Ok(rows) => rows,
            Err(error) => {
                warn!(%error, "counter store unavailable; no top pages");
                Vec::new()
            }
        }
    }

    /// Wait for queued increments to reach the store.
    pub fn flush(&self) {
        self.deferred.flush();
    }

    pub fn deferred_stats(&self) -> DeferredStats {
        self.deferred.stats()
    }
}

impl CounterReader for HitCounters {
    fn page_view_count(&self, page: &PageRef) -> Option<u64> {
        self.get_page_view_count(page)
    }

    fn site_total_views(&self) -> Option<u64> {
        self.get_site_total_views()
    }

    fn top_pages(&self, limit: i64) -> Vec<TopPage> {
        self.list_top_pages(limit)
    }
}

impl ViewRecorder for HitCounters {
    fn record_view(&self, page: &PageRef) {
        HitCounters::record_view(self, page);
    }
}

impl fmt::Debug for HitCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HitCounters")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::cache::{ManualClock, MemoryCache};
    use crate::memory_store::MemoryCounterStore;
    use crate::store::{PageId, PageRecord, StoreResult};

    struct Gate {
        operation: &'static str,
        reached: Sender<()>,
        release: Receiver<()>,
    }

    /// Memory store that can park one read after it has seen the data.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryCounterStore,
        gate: Mutex<Option<Gate>>,
    }

    impl GatedStore {
        /// Returns (parked, release): `parked` fires once the read is held.
        fn pause(&self, operation: &'static str) -> (Receiver<()>, Sender<()>) {
            let (reached, parked) = mpsc::channel();
            let (release_tx, release) = mpsc::channel();
            *self.gate.lock() = Some(Gate {
                operation,
                reached,
                release,
            });
            (parked, release_tx)
        }

        fn hold(&self, operation: &'static str) {
            let gate = {
                let mut gate = self.gate.lock();
                if gate.as_ref().is_some_and(|gate| gate.operation == operation) {
                    gate.take()
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                gate.reached.send(()).expect("parked");
                gate.release.recv().expect("released");
            }
        }
    }

    impl CounterStore for GatedStore {
        fn get_count(&self, page_id: PageId) -> StoreResult<Option<u64>> {
            let count = self.inner.get_count(page_id);
            self.hold("get_count");
            count
        }

        fn increment_count(&self, page_id: PageId, delta: u64) -> StoreResult<u64> {
            self.inner.increment_count(page_id, delta)
        }

        fn sum_all_counts(&self) -> StoreResult<u64> {
            let total = self.inner.sum_all_counts();
            self.hold("sum_all_counts");
            total
        }

        fn list_top_pages(&self, query: &TopPagesQuery) -> StoreResult<Vec<TopPage>> {
            self.inner.list_top_pages(query)
        }

        fn upsert_page(&self, page: &PageRecord) -> StoreResult<()> {
            self.inner.upsert_page(page)
        }

        fn page(&self, page_id: PageId) -> StoreResult<Option<PageRecord>> {
            self.inner.page(page_id)
        }
    }

    struct Fixture {
        store: Arc<MemoryCounterStore>,
        cache: Arc<MemoryCache<Arc<ManualClock>>>,
        clock: Arc<ManualClock>,
        counters: HitCounters,
    }

    fn fixture(config: CountersConfig) -> Fixture {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(MemoryCache::with_clock(Arc::clone(&clock)));
        let counters =
            HitCounters::new(store.clone(), cache.clone(), config).expect("counters");
        Fixture {
            store,
            cache,
            clock,
            counters,
        }
    }

    fn main_page(id: PageId) -> PageRef {
        PageRef::new(id, 0)
    }

    #[test]
    fn missing_row_is_unknown_and_not_cached() {
        let f = fixture(CountersConfig::default());
        for _ in 0..3 {
            assert_eq!(f.counters.get_page_view_count(&main_page(8)), None);
        }
        assert_eq!(f.store.count_reads(), 3);
        assert!(f.cache.is_empty());
    }

    #[test]
    fn untrusted_cached_values_read_through() {
        let f = fixture(CountersConfig::default());
        f.store.increment_count(8, 7).expect("inc");

        for untrusted in [0, 1] {
            f.cache.put("viewcount:8", untrusted, Duration::from_secs(60));
            let before = f.store.count_reads();
            assert_eq!(f.counters.get_page_view_count(&main_page(8)), Some(7));
            assert_eq!(f.store.count_reads(), before + 1);
        }
    }

    #[test]
    fn trusted_cached_values_skip_the_store() {
        let f = fixture(CountersConfig::default());
        f.cache.put("viewcount:8", 2, Duration::from_secs(60));
        f.cache.put("viewcount:9", 12_345, Duration::from_secs(60));
        assert_eq!(f.counters.get_page_view_count(&main_page(8)), Some(2));
        assert_eq!(f.counters.get_page_view_count(&main_page(9)), Some(12_345));
        assert_eq!(f.store.count_reads(), 0);
    }

    #[test]
    fn read_through_caches_with_adaptive_ttl() {
        let f = fixture(CountersConfig::default());
        f.store.increment_count(1, 40).expect("inc");
        f.store.increment_count(2, 400).expect("inc");

        f.counters.get_page_view_count(&main_page(1));
        f.counters.get_page_view_count(&main_page(2));
        assert_eq!(
            f.cache.ttl_remaining("viewcount:1"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            f.cache.ttl_remaining("viewcount:2"),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn expired_entry_reads_through_again() {
        let f = fixture(CountersConfig::default());
        f.store.increment_count(1, 40).expect("inc");
        f.counters.get_page_view_count(&main_page(1));
        f.counters.get_page_view_count(&main_page(1));
        assert_eq!(f.store.count_reads(), 1);

        f.clock.advance(Duration::from_secs(60));
        f.counters.get_page_view_count(&main_page(1));
        assert_eq!(f.store.count_reads(), 2);
    }

    #[test]
    fn non_countable_pages_touch_nothing() {
        let f = fixture(CountersConfig::default());
        let special = PageRef::new(5, -1);
        let redirect = PageRef::new(5, 0).redirect(true);
        let missing = PageRef::new(0, 0);
        for page in [special, redirect, missing] {
            assert_eq!(f.counters.get_page_view_count(&page), None);
            f.counters.record_view(&page);
        }
        f.counters.flush();
        assert_eq!(f.store.count_reads(), 0);
        assert_eq!(f.store.increments(), 0);
        assert!(f.cache.is_empty());
    }

    #[test]
    fn store_outage_serves_cached_value_or_unknown() {
        let f = fixture(CountersConfig::default());
        f.cache.put("viewcount:3", 1, Duration::from_secs(60));
        f.store.set_offline(true);
        assert_eq!(f.counters.get_page_view_count(&main_page(3)), Some(1));
        assert_eq!(f.counters.get_page_view_count(&main_page(4)), None);
        assert_eq!(f.counters.get_site_total_views(), None);
        assert!(f.counters.list_top_pages(10).is_empty());
    }

    #[test]
    fn record_view_reaches_store_and_invalidates_cache() {
        let f = fixture(CountersConfig::default());
        f.store.increment_count(6, 300).expect("inc");
        assert_eq!(f.counters.get_page_view_count(&main_page(6)), Some(300));

        f.counters.record_view(&main_page(6));
        f.counters.flush();

        assert_eq!(f.counters.get_page_view_count(&main_page(6)), Some(301));
    }

    #[test]
    fn disabled_counters_suppress_writes_but_not_reads() {
        let f = fixture(CountersConfig {
            disable_counters: true,
            ..CountersConfig::default()
        });
        f.store.increment_count(6, 30).expect("inc");
        let writes_before = f.store.increments();

        for _ in 0..5 {
            f.counters.record_view(&main_page(6));
        }
        f.counters.flush();

        assert_eq!(f.store.increments(), writes_before);
        assert_eq!(f.counters.get_page_view_count(&main_page(6)), Some(30));
        assert_eq!(f.counters.get_site_total_views(), Some(30));
    }

    #[test]
    fn sampling_conserves_views() {
        let frequency = 4;
        let f = fixture(CountersConfig {
            update_frequency: frequency,
            ..CountersConfig::default()
        });
        let k = 6;
        for _ in 0..(k * frequency) {
            f.counters.record_view(&main_page(11));
        }
        // An incomplete batch is not persisted yet.
        for _ in 0..(frequency - 1) {
            f.counters.record_view(&main_page(11));
        }
        f.counters.flush();

        assert_eq!(
            f.store.get_count(11).expect("get"),
            Some(u64::from(k * frequency))
        );
        assert_eq!(f.counters.deferred_stats().applied, u64::from(k));
    }

    #[test]
    fn concurrent_views_are_all_counted() {
        let f = fixture(CountersConfig::default());
        let counters = Arc::new(f.counters);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..125 {
                        counters.record_view(&main_page(2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        counters.flush();
        assert_eq!(f.store.get_count(2).expect("get"), Some(1000));
    }

    #[test]
    fn site_total_is_memoised_once_above_one() {
        let f = fixture(CountersConfig::default());
        f.store.increment_count(1, 10).expect("inc");
        f.store.increment_count(2, 20).expect("inc");

        assert_eq!(f.counters.get_site_total_views(), Some(30));
        assert_eq!(
            f.cache.ttl_remaining("sitestats:total"),
            Some(Duration::from_secs(60))
        );

        f.store.increment_count(3, 70).expect("inc");
        f.cache.delete("sitestats:total");
        assert_eq!(f.counters.get_site_total_views(), Some(30));
        assert_eq!(f.store.sum_reads(), 1);
    }

    #[test]
    fn site_total_uses_shared_cache_on_fresh_instance() {
        let f = fixture(CountersConfig::default());
        f.cache.put("sitestats:total", 5_000, Duration::from_secs(60));
        assert_eq!(f.counters.get_site_total_views(), Some(5_000));
        assert_eq!(f.store.sum_reads(), 0);
    }

    #[test]
    fn small_site_total_keeps_reading_through() {
        let f = fixture(CountersConfig::default());
        assert_eq!(f.counters.get_site_total_views(), Some(0));
        f.store.increment_count(1, 1).expect("inc");
        assert_eq!(f.counters.get_site_total_views(), Some(1));
        f.store.increment_count(1, 1).expect("inc");
        assert_eq!(f.counters.get_site_total_views(), Some(2));
        assert_eq!(f.store.sum_reads(), 3);
        assert_eq!(f.counters.get_site_total_views(), Some(2));
        assert_eq!(f.store.sum_reads(), 3);
    }

    #[test]
    fn top_pages_respects_limit_and_namespaces() {
        let f = fixture(CountersConfig {
            content_namespaces: vec![0, 3000],
            ..CountersConfig::default()
        });
        let pages = [
            (1, 0, "A", 5),
            (2, 0, "B", 9),
            (3, 0, "C", 2),
            (4, 3000, "Lore", 7),
            (5, 2, "User:X", 50),
        ];
        for (id, namespace, title, hits) in pages {
            f.store
                .upsert_page(&PageRecord {
                    page_id: id,
                    namespace,
                    title: title.to_string(),
                    is_redirect: false,
                    length: 1,
                })
                .expect("page");
            f.store.increment_count(id, hits).expect("inc");
        }

        let titles: Vec<String> = f
            .counters
            .list_top_pages(3)
            .into_iter()
            .map(|row| row.title)
            .collect();
        assert_eq!(titles, vec!["B", "Lore", "A"]);
        assert!(f.counters.list_top_pages(0).is_empty());
        assert!(f.counters.list_top_pages(-5).is_empty());
    }

    #[test]
    fn first_view_reads_through_until_count_exceeds_one() {
        let f = fixture(CountersConfig::default());
        let page = main_page(42);

        f.counters.record_view(&page);
        f.counters.flush();
        assert_eq!(f.store.get_count(42).expect("get"), Some(1));
        let reads = f.store.count_reads();

        // A count of 1 is never trusted from the cache, so each read confirms it.
        assert_eq!(f.counters.get_page_view_count(&page), Some(1));
        assert_eq!(f.store.count_reads(), reads + 1);
        assert_eq!(
            f.cache.ttl_remaining("viewcount:42"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(f.counters.get_page_view_count(&page), Some(1));
        assert_eq!(f.store.count_reads(), reads + 2);

        // Once the count moves past 1 the cached value is served directly.
        f.counters.record_view(&page);
        f.counters.flush();
        assert_eq!(f.counters.get_page_view_count(&page), Some(2));
        assert_eq!(f.counters.get_page_view_count(&page), Some(2));
        assert_eq!(f.store.count_reads(), reads + 3);
    }

    #[test]
    fn readers_and_recorders_work_through_trait_objects() {
        let f = fixture(CountersConfig::default());
        let counters: Arc<HitCounters> = Arc::new(f.counters);
        let recorder: Arc<dyn ViewRecorder> = counters.clone();
        let reader: Arc<dyn CounterReader> = counters.clone();

        recorder.record_view(&main_page(9));
        recorder.record_view(&main_page(9));
        counters.flush();
        assert_eq!(reader.page_view_count(&main_page(9)), Some(2));
        assert_eq!(reader.site_total_views(), Some(2));
    }

    #[test]
    fn write_during_read_through_is_not_overwritten_by_stale_count() {
        let store = Arc::new(GatedStore::default());
        store.inner.increment_count(6, 300).expect("inc");
        let cache = Arc::new(MemoryCache::new());
        let counters = Arc::new(
            HitCounters::new(store.clone(), cache.clone(), CountersConfig::default())
                .expect("counters"),
        );

        let (parked, release) = store.pause("get_count");
        let reader = {
            let counters = Arc::clone(&counters);
            thread::spawn(move || counters.get_page_view_count(&main_page(6)))
        };
        parked.recv().expect("reader parked");

        counters.record_view(&main_page(6));
        counters.flush();
        release.send(()).expect("release");

        assert_eq!(reader.join().expect("join"), Some(300));
        assert_eq!(cache.get("viewcount:6"), None);
        assert_eq!(counters.get_page_view_count(&main_page(6)), Some(301));
        assert_eq!(cache.get("viewcount:6"), Some(301));
    }

    #[test]
    fn site_total_readers_do_not_wait_on_an_inflight_sum() {
        let store = Arc::new(GatedStore::default());
        store.inner.increment_count(1, 10).expect("inc");
        store.inner.increment_count(2, 20).expect("inc");
        let cache = Arc::new(MemoryCache::new());
        let counters = Arc::new(
            HitCounters::new(store.clone(), cache.clone(), CountersConfig::default())
                .expect("counters"),
        );

        let (parked, release) = store.pause("sum_all_counts");
        let slow = {
            let counters = Arc::clone(&counters);
            thread::spawn(move || counters.get_site_total_views())
        };
        parked.recv().expect("sum parked");

        cache.put("sitestats:total", 5_000, Duration::from_secs(60));
        assert_eq!(counters.get_site_total_views(), Some(5_000));

        release.send(()).expect("release");
        assert_eq!(slow.join().expect("join"), Some(30));
    }
}
