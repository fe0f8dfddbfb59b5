use serde::Serialize;
use thiserror::Error;

pub type PageId = u64;

/// Namespaces below zero (Special:, Media:) never own stored pages.
pub const FIRST_REAL_NAMESPACE: i32 = 0;

/// Largest count a backend holds; increments past it saturate.
pub const MAX_COUNT: u64 = i64::MAX as u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable during {operation}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("page id {0} cannot be stored")]
    InvalidPageId(PageId),
    #[error("counter store offline during {operation}")]
    Offline { operation: &'static str },
    #[error("stored counter for page {page_id} is out of range: {value}")]
    OutOfRange { page_id: PageId, value: i64 },
}

impl StoreError {
    pub fn unavailable<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |source| Self::Unavailable {
            operation,
            source: Box::new(source),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The page handle callers pass to the counter service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub id: PageId,
    pub namespace: i32,
    pub is_redirect: bool,
}

impl PageRef {
    pub fn new(id: PageId, namespace: i32) -> Self {
        Self {
            id,
            namespace,
            is_redirect: false,
        }
    }

    pub fn redirect(mut self, is_redirect: bool) -> Self {
        self.is_redirect = is_redirect;
        self
    }

    /// Special pages, pages without an id and redirects never carry a counter.
    pub fn is_countable(&self) -> bool {
        self.id != 0 && self.namespace >= FIRST_REAL_NAMESPACE && !self.is_redirect
    }
}

/// Host page metadata mirrored next to the counters for the top-pages join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub page_id: PageId,
    pub namespace: i32,
    pub title: String,
    pub is_redirect: bool,
    pub length: u64,
}

impl PageRecord {
    pub fn page_ref(&self) -> PageRef {
        PageRef {
            id: self.page_id,
            namespace: self.namespace,
            is_redirect: self.is_redirect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopPage {
    pub page_id: PageId,
    pub namespace: i32,
    pub title: String,
    pub count: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopPagesQuery {
    pub limit: usize,
    pub exclude_redirects: bool,
    pub namespaces: Vec<i32>,
}

impl TopPagesQuery {
    pub fn new(limit: usize, namespaces: &[i32]) -> Self {
        Self {
            limit,
            exclude_redirects: true,
            namespaces: namespaces.to_vec(),
        }
    }
}

/// Durable view counters.
///
/// `increment_count` is the only path that changes a count and must be an
/// atomic add: concurrent increments of the same page are all reflected.
pub trait CounterStore: Send + Sync {
    /// Current count, or `None` when the page has no counter row yet.
    fn get_count(&self, page_id: PageId) -> StoreResult<Option<u64>>;

    /// Adds `delta`, creating the row with `count = delta` when absent. Returns the new count.
    fn increment_count(&self, page_id: PageId, delta: u64) -> StoreResult<u64>;

    fn sum_all_counts(&self) -> StoreResult<u64>;

    /// Most viewed pages, count descending then page id ascending.
    fn list_top_pages(&self, query: &TopPagesQuery) -> StoreResult<Vec<TopPage>>;

    fn upsert_page(&self, page: &PageRecord) -> StoreResult<()>;

    fn page(&self, page_id: PageId) -> StoreResult<Option<PageRecord>>;
}
