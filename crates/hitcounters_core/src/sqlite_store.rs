use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

use crate::migrate::{current_version, migrate_connection, pending_for_connection};
use crate::runtime::{MIGRATIONS_POLICY_MESSAGE, ResolvedPaths};
use crate::store::{
    CounterStore, MAX_COUNT, PageId, PageRecord, StoreError, StoreResult, TopPage,
    TopPagesQuery,
};

const MAX_COUNT_SQL: i64 = i64::MAX;
// Below this the float total is far enough from i64::MAX for SUM() to be safe.
const EXACT_SUM_LIMIT: f64 = 9.0e18;

/// [`CounterStore`] over a single SQLite connection.
///
/// Statements run one at a time behind the mutex; the increment itself is a
/// single upsert so it stays atomic even with other processes on the same file.
pub struct SqliteCounterStore {
    connection: Mutex<Connection>,
}

impl SqliteCounterStore {
    /// Open a migrated database. Fails when migrations are pending.
    pub fn open(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            bail!(
                "counter database {} does not exist. {MIGRATIONS_POLICY_MESSAGE}",
                db_path.display()
            );
        }
        let connection = open_connection(db_path)?;
        let pending = pending_for_connection(&connection)?;
        if pending > 0 {
            bail!("{pending} schema migration(s) pending. {MIGRATIONS_POLICY_MESSAGE}");
        }
        Ok(Self::from_connection(connection))
    }

    /// Fresh private database with the schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        migrate_connection(&connection)?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }
}

impl CounterStore for SqliteCounterStore {
    fn get_count(&self, page_id: PageId) -> StoreResult<Option<u64>> {
        let key = page_key(page_id)?;
        let connection = self.connection.lock();
        let value: Option<i64> = connection
            .query_row(
                "SELECT page_counter FROM hit_counter WHERE page_id = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::unavailable("get_count"))?;
        value.map(|value| to_count(page_id, value)).transpose()
    }

    fn increment_count(&self, page_id: PageId, delta: u64) -> StoreResult<u64> {
        if delta == 0 {
            return Ok(self.get_count(page_id)?.unwrap_or(0));
        }
        let key = page_key(page_id)?;
        let delta = i64::try_from(delta).unwrap_or(i64::MAX);
        let connection = self.connection.lock();
        let value: i64 = connection
            .query_row(
                "INSERT INTO hit_counter (page_id, page_counter) VALUES (?1, ?2)
                 ON CONFLICT(page_id) DO UPDATE
                 SET page_counter = CASE
                     WHEN page_counter > ?3 - excluded.page_counter THEN ?3
                     ELSE page_counter + excluded.page_counter
                 END
                 RETURNING page_counter",
                params![key, delta, MAX_COUNT_SQL],
                |row| row.get(0),
            )
            .map_err(StoreError::unavailable("increment_count"))?;
        debug!(page_id, delta, count = value, "incremented counter");
        to_count(page_id, value)
    }

    fn sum_all_counts(&self) -> StoreResult<u64> {
        let connection = self.connection.lock();
        // SUM() fails on integer overflow while TOTAL() is a float that never does.
        let approximate: f64 = connection
            .query_row("SELECT TOTAL(page_counter) FROM hit_counter", [], |row| {
                row.get(0)
            })
            .map_err(StoreError::unavailable("sum_all_counts"))?;
        if approximate < EXACT_SUM_LIMIT {
            let total: i64 = connection
                .query_row(
                    "SELECT COALESCE(SUM(page_counter), 0) FROM hit_counter",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::unavailable("sum_all_counts"))?;
            return to_count(0, total);
        }

        let mut statement = connection
            .prepare("SELECT page_counter FROM hit_counter")
            .map_err(StoreError::unavailable("sum_all_counts"))?;
        let counts = statement
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(StoreError::unavailable("sum_all_counts"))?;
        let mut total = 0u64;
        for count in counts {
            let count = count.map_err(StoreError::unavailable("sum_all_counts"))?;
            total = total.saturating_add(to_count(0, count)?);
        }
        Ok(total.min(MAX_COUNT))
    }

    fn list_top_pages(&self, query: &TopPagesQuery) -> StoreResult<Vec<TopPage>> {
        if query.limit == 0 || query.namespaces.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..query.namespaces.len())
            .map(|index| format!("?{}", index + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT h.page_id, p.page_namespace, p.page_title, h.page_counter, p.page_len
             FROM hit_counter h
             INNER JOIN page p ON p.page_id = h.page_id
             WHERE (?1 = 0 OR p.page_is_redirect = 0)
               AND p.page_namespace IN ({placeholders})
             ORDER BY h.page_counter DESC, h.page_id ASC
             LIMIT ?2"
        );

        let mut bindings = Vec::with_capacity(query.namespaces.len() + 2);
        bindings.push(i64::from(query.exclude_redirects));
        bindings.push(i64::try_from(query.limit).unwrap_or(i64::MAX));
        bindings.extend(query.namespaces.iter().map(|ns| i64::from(*ns)));

        let connection = self.connection.lock();
        let mut statement = connection
            .prepare(&sql)
            .map_err(StoreError::unavailable("list_top_pages"))?;
        let rows = statement
            .query_map(params_from_iter(bindings), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(StoreError::unavailable("list_top_pages"))?;

        let mut out = Vec::new();
        for row in rows {
            let (page_id, namespace, title, count, length) =
                row.map_err(StoreError::unavailable("list_top_pages"))?;
            let page_id = PageId::try_from(page_id).unwrap_or(0);
            out.push(TopPage {
                page_id,
                namespace,
                title,
                count: to_count(page_id, count)?,
                length: u64::try_from(length).unwrap_or(0),
            });
        }
        Ok(out)
    }

    fn upsert_page(&self, page: &PageRecord) -> StoreResult<()> {
        let key = page_key(page.page_id)?;
        let connection = self.connection.lock();
        connection
            .execute(
                "INSERT INTO page (page_id, page_namespace, page_title, page_is_redirect, page_len)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(page_id) DO UPDATE SET
                     page_namespace = excluded.page_namespace,
                     page_title = excluded.page_title,
                     page_is_redirect = excluded.page_is_redirect,
                     page_len = excluded.page_len",
                params![
                    key,
                    page.namespace,
                    page.title,
                    i64::from(page.is_redirect),
                    i64::try_from(page.length).unwrap_or(i64::MAX),
                ],
            )
            .map_err(StoreError::unavailable("upsert_page"))?;
        Ok(())
    }

    fn page(&self, page_id: PageId) -> StoreResult<Option<PageRecord>> {
        let key = page_key(page_id)?;
        let connection = self.connection.lock();
        connection
            .query_row(
                "SELECT page_namespace, page_title, page_is_redirect, page_len
                 FROM page WHERE page_id = ?1",
                [key],
                |row| {
                    Ok(PageRecord {
                        page_id,
                        namespace: row.get(0)?,
                        title: row.get(1)?,
                        is_redirect: row.get::<_, i64>(2)? != 0,
                        length: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                    })
                },
            )
            .optional()
            .map_err(StoreError::unavailable("page"))
    }
}

/// Row counts of an existing counter database, for `db stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCounterStats {
    pub schema_version: u32,
    pub counter_rows: usize,
    pub page_rows: usize,
    pub total_views: u64,
}

/// `None` when the database or its tables do not exist yet.
pub fn load_stored_counter_stats(paths: &ResolvedPaths) -> Result<Option<StoredCounterStats>> {
    if !paths.db_path.exists() {
        return Ok(None);
    }

    let connection = open_connection(&paths.db_path)?;
    if !table_exists(&connection, "hit_counter")? || !table_exists(&connection, "page")? {
        return Ok(None);
    }

    let schema_version = current_version(&connection)?;
    let counter_rows = count_query(&connection, "SELECT COUNT(*) FROM hit_counter")
        .context("failed to count counter rows")?;
    let page_rows = count_query(&connection, "SELECT COUNT(*) FROM page")
        .context("failed to count page rows")?;
    let total_views: i64 = connection
        .query_row(
            "SELECT COALESCE(SUM(page_counter), 0) FROM hit_counter",
            [],
            |row| row.get(0),
        )
        .context("failed to sum counters")?;

    Ok(Some(StoredCounterStats {
        schema_version,
        counter_rows,
        page_rows,
        total_views: u64::try_from(total_views).context("negative view total")?,
    }))
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

fn page_key(page_id: PageId) -> StoreResult<i64> {
    i64::try_from(page_id).map_err(|_| StoreError::InvalidPageId(page_id))
}

fn to_count(page_id: PageId, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange { page_id, value })
}
