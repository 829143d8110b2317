// =============================================================================
// Generic disk cache — time-indexed append-log over SQLite
// =============================================================================
//
// One table per store: cache(timestamp, type, data) where data is opaque
// bytes. Appends accumulate inside an open transaction; a commit runs at most
// once per second and expires rows older than the TTL before committing.
//
// Opening the same store name twice returns the same handle. The store is
// safe for concurrent appends and queries: a single internal lock serialises
// access to the connection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, error, info};

/// Minimum interval between transaction commits.
const COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// SQLite busy timeout applied to every connection.
const BUSY_TIMEOUT_MS: u64 = 3000;

static OPEN_CACHES: Mutex<Option<HashMap<String, Arc<GenericCache>>>> = Mutex::new(None);

// ---------------------------------------------------------------------------
// GenericCache
// ---------------------------------------------------------------------------

struct CacheInner {
    conn: Connection,
    /// True while an uncommitted append transaction is open.
    tx_open: bool,
    last_commit: Instant,
    item_count: u64,
}

pub struct GenericCache {
    name: String,
    ttl_secs: i64,
    inner: Mutex<CacheInner>,
}

impl GenericCache {
    /// Open (or reuse) the named cache store backed by `./{name}.sqlite`.
    /// If the store is already open, the existing handle (and its TTL) is
    /// returned.
    pub fn open(name: &str, ttl_secs: i64) -> Result<Arc<GenericCache>> {
        let mut map = OPEN_CACHES.lock();
        let map = map.get_or_insert_with(HashMap::new);
        if let Some(cache) = map.get(name) {
            return Ok(cache.clone());
        }

        let filename = format!("./{name}.sqlite");
        if std::path::Path::new(&filename).exists() {
            info!(file = %filename, "opening cache database");
        } else {
            info!(file = %filename, "creating cache database");
        }

        let cache = Arc::new(Self::open_path(name, &filename, ttl_secs)?);
        map.insert(name.to_string(), cache.clone());
        Ok(cache)
    }

    /// Open a cache at an explicit path, bypassing the named registry.
    pub fn open_path(name: &str, path: &str, ttl_secs: i64) -> Result<GenericCache> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache database {path}"))?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .context("failed to set busy timeout")?;

        let cache = GenericCache {
            name: name.to_string(),
            ttl_secs,
            inner: Mutex::new(CacheInner {
                conn,
                tx_open: false,
                last_commit: Instant::now(),
                item_count: 0,
            }),
        };
        cache.migrate()?;
        Ok(cache)
    }

    /// Append one item. The row lands inside an implicit transaction that is
    /// committed at most once per second; a commit also expires rows older
    /// than the TTL.
    ///
    /// Failures never propagate: a failed insert rolls the batch back and the
    /// next append starts fresh.
    pub fn add_item(&self, timestamp_secs: i64, item_type: &str, body: &[u8]) {
        let mut inner = self.inner.lock();

        if !inner.tx_open {
            if let Err(e) = inner.conn.execute_batch("BEGIN") {
                error!(cache = %self.name, error = %e, "failed to begin transaction");
                return;
            }
            inner.tx_open = true;
        }

        if let Err(e) = inner.conn.execute(
            "insert into cache (timestamp, type, data) values (?1, ?2, ?3)",
            params![timestamp_secs, item_type, body],
        ) {
            error!(cache = %self.name, error = %e, "failed to execute statement");
            if let Err(e) = inner.conn.execute_batch("ROLLBACK") {
                error!(cache = %self.name, error = %e, "rollback failed");
            }
            inner.tx_open = false;
            inner.item_count = 0;
            return;
        }
        inner.item_count += 1;

        if inner.last_commit.elapsed() > COMMIT_INTERVAL {
            let start = Instant::now();
            let deleted = self.expire_items(&inner.conn);

            if let Err(e) = inner.conn.execute_batch("COMMIT") {
                error!(cache = %self.name, error = %e, "failed to commit transaction");
                inner.tx_open = false;
                return;
            }
            debug!(
                cache = %self.name,
                items = inner.item_count,
                deleted,
                duration_ms = start.elapsed().as_millis() as u64,
                "committed cache batch"
            );
            inner.tx_open = false;
            inner.item_count = 0;
            inner.last_commit = Instant::now();
        }
    }

    /// Commit any pending batch immediately. Used at shutdown and by tests.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        if inner.tx_open {
            if let Err(e) = inner.conn.execute_batch("COMMIT") {
                error!(cache = %self.name, error = %e, "failed to commit on flush");
            }
            inner.tx_open = false;
            inner.item_count = 0;
            inner.last_commit = Instant::now();
        }
    }

    /// Rows of the given type younger than `seconds`, ascending by timestamp.
    pub fn query_age_less_than(&self, item_type: &str, seconds: i64) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        let age = chrono::Utc::now().timestamp() - seconds;

        let mut stmt = inner
            .conn
            .prepare("select data from cache where timestamp > ?1 and type = ?2 order by timestamp")
            .context("failed to prepare cache query")?;

        let rows = stmt
            .query_map(params![age, item_type], |row| row.get::<_, Vec<u8>>(0))
            .context("failed to query cache")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read cache row")?);
        }
        Ok(out)
    }

    fn expire_items(&self, conn: &Connection) -> i64 {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl_secs;
        match conn.execute("delete from cache where timestamp < ?1", params![cutoff]) {
            Ok(n) => n as i64,
            Err(e) => {
                error!(cache = %self.name, error = %e, "failed to purge expired items");
                0
            }
        }
    }

    // -----------------------------------------------------------------------
    // Schema migration
    // -----------------------------------------------------------------------

    fn migrate(&self) -> Result<()> {
        let inner = self.inner.lock();
        let conn = &inner.conn;

        conn.execute_batch("BEGIN")
            .context("failed to begin migration transaction")?;

        let version: i64 = match conn
            .query_row("select max(version) from schema", [], |row| {
                row.get::<_, Option<i64>>(0)
            }) {
            Ok(Some(v)) => {
                debug!(cache = %self.name, version = v, "found cache database version");
                v
            }
            Ok(None) => -1,
            Err(_) => {
                info!(cache = %self.name, "initializing cache database");
                conn.execute_batch(
                    "create table schema (version integer not null primary key, \
                     timestamp timestamp)",
                )
                .map_err(|e| {
                    let _ = conn.execute_batch("ROLLBACK");
                    anyhow::anyhow!("failed to create schema table: {e}")
                })?;
                Self::increment_version(conn, 0).map_err(|e| {
                    let _ = conn.execute_batch("ROLLBACK");
                    anyhow::anyhow!("failed to insert into schema table: {e}")
                })?;
                0
            }
        };

        if version < 1 {
            info!(cache = %self.name, "migrating cache database to v1");
            conn.execute_batch(
                "create table cache (timestamp integer, type string, data blob); \
                 create index cache_index on cache (timestamp, type);",
            )
            .map_err(|e| {
                let _ = conn.execute_batch("ROLLBACK");
                anyhow::anyhow!("failed to apply v1 migration: {e}")
            })?;
            Self::increment_version(conn, 1).map_err(|e| {
                let _ = conn.execute_batch("ROLLBACK");
                anyhow::anyhow!("failed to record v1 migration: {e}")
            })?;
        }

        conn.execute_batch("COMMIT")
            .context("failed to commit migration")?;
        Ok(())
    }

    fn increment_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
        conn.execute(
            "insert into schema values (?1, datetime('now'))",
            params![version],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(ttl_secs: i64) -> (tempfile::TempDir, GenericCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test-cache.sqlite");
        let cache =
            GenericCache::open_path("test-cache", path.to_str().unwrap(), ttl_secs).unwrap();
        (dir, cache)
    }

    #[test]
    fn append_then_query_roundtrip_in_order() {
        let (_dir, cache) = temp_cache(7200);
        let now = chrono::Utc::now().timestamp();

        cache.add_item(now - 30, "trade", b"first");
        cache.add_item(now - 20, "trade", b"second");
        cache.add_item(now - 10, "trade", b"third");
        cache.add_item(now - 20, "ticker", b"other-type");
        cache.flush();

        let rows = cache.query_age_less_than("trade", 60).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], b"first");
        assert_eq!(rows[1], b"second");
        assert_eq!(rows[2], b"third");
    }

    #[test]
    fn query_excludes_rows_older_than_window() {
        let (_dir, cache) = temp_cache(7200);
        let now = chrono::Utc::now().timestamp();

        cache.add_item(now - 120, "ticker", b"old");
        cache.add_item(now - 5, "ticker", b"fresh");
        cache.flush();

        let rows = cache.query_age_less_than("ticker", 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], b"fresh");
    }

    #[test]
    fn expired_rows_are_purged_on_commit() {
        let (_dir, cache) = temp_cache(1);
        let now = chrono::Utc::now().timestamp();

        cache.add_item(now - 600, "trade", b"stale");
        cache.flush();

        // Force a timed commit so the expiry pass runs.
        {
            let mut inner = cache.inner.lock();
            inner.last_commit = Instant::now() - Duration::from_secs(2);
        }
        cache.add_item(now, "trade", b"live");

        let rows = cache.query_age_less_than("trade", 3600).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], b"live");
    }

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("migrate.sqlite");
        let path = path.to_str().unwrap();

        {
            let cache = GenericCache::open_path("m", path, 10).unwrap();
            cache.add_item(chrono::Utc::now().timestamp(), "trade", b"x");
            cache.flush();
        }
        // Reopen over the same file: schema already at v1.
        let cache = GenericCache::open_path("m", path, 10).unwrap();
        let rows = cache.query_age_less_than("trade", 60).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
