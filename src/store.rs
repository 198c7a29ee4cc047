use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::events::MetricsEvent;

/// Current on-disk schema version this build knows how to read and write.
/// Bump alongside an entry in `MIGRATIONS` when the row shape changes.
const SCHEMA_VERSION: i64 = 2;

/// The filesystem facts a thumbnail record is validated against: a stored
/// record is only usable if both match the live file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ThumbnailRecord {
    pub png_bytes: Vec<u8>,
    pub orig_width: u32,
    pub orig_height: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
}

/// A single `get_batch` lookup item: the key plus the stat/box it must match.
#[derive(Debug, Clone)]
pub struct BatchLookup {
    pub path: PathBuf,
    pub stat: FileStat,
    pub requested_box: (u32, u32),
}

fn apply_connection_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=-65536;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout=5000;",
    )
}

fn db_pool_size() -> u32 {
    if let Ok(raw) = std::env::var("PIXCORE_DB_POOL_SIZE") {
        if let Ok(parsed) = raw.parse::<u32>() {
            return parsed.clamp(1, 32);
        }
    }
    let cpu_count = std::thread::available_parallelism()
        .map(|count| count.get() as u32)
        .unwrap_or(4);
    cpu_count.clamp(2, 8)
}

/// Persistent key (path, mtime, size) -> PNG thumbnail bytes mapping backed
/// by a pooled, single-file SQLite database. One instance owns one database
/// file; concurrent multi-process writers are not supported — this is a
/// documented precondition on `open`, not an oversight.
pub struct ThumbnailStore {
    pool: Pool<SqliteConnectionManager>,
    retry_max: u32,
    retry_base: Duration,
    metrics_tx: Sender<MetricsEvent>,
    metrics_rx: Receiver<MetricsEvent>,
}

impl ThumbnailStore {
    pub fn open(db_path: &Path, retry_max: u32, retry_base_ms: u64) -> Result<Self, StoreError> {
        let manager =
            SqliteConnectionManager::file(db_path).with_init(|conn| apply_connection_pragmas(conn));
        let pool = Pool::builder()
            .max_size(db_pool_size())
            .build(manager)
            .map_err(StoreError::from)?;
        let (metrics_tx, metrics_rx) = unbounded();

        let store = ThumbnailStore {
            pool,
            retry_max: retry_max.max(1),
            retry_base: Duration::from_millis(retry_base_ms.max(1)),
            metrics_tx,
            metrics_rx,
        };
        store.init_schema()?;
        store.reconcile_startup()?;
        mark_hidden_best_effort(db_path);
        Ok(store)
    }

    /// Drains every `(operation, duration, retries)` / migration metric
    /// recorded since the last call, without blocking.
    pub fn poll_metrics(&self) -> Vec<MetricsEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.metrics_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn emit_metric(&self, event: MetricsEvent) {
        let _ = self.metrics_tx.send(event);
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(StoreError::from)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|source| StoreError::WriteFailed {
            path: PathBuf::new(),
            source,
        })?;

        let current_version = read_user_version(&conn)?;
        if current_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current_version,
                supported: SCHEMA_VERSION,
            });
        }

        if current_version == 0 {
            create_v2_schema(&conn)?;
            write_user_version(&conn, SCHEMA_VERSION)?;
        } else if current_version < SCHEMA_VERSION {
            let start = Instant::now();
            let result = run_migrations(&conn, current_version, SCHEMA_VERSION);
            self.emit_metric(MetricsEvent::Migration {
                from_version: current_version,
                to_version: SCHEMA_VERSION,
                duration_ms: start.elapsed().as_millis() as u64,
                outcome: if result.is_ok() { "ok" } else { "failed" },
            });
            result?;
        }

        Ok(())
    }

    /// Drops rows that are structurally broken (zero-length thumbnail bytes
    /// left behind by a crash mid-write), so the store self-heals on the
    /// next open rather than serving a record that will always miss its
    /// stat check anyway.
    fn reconcile_startup(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM thumbnails WHERE length(png_bytes) = 0", [])
            .map_err(|source| StoreError::WriteFailed {
                path: PathBuf::new(),
                source,
            })?;
        if removed > 0 {
            log::info!("reconcile_startup removed {removed} zero-byte thumbnail rows");
        }
        Ok(())
    }

    /// Returns a cached thumbnail iff it matches `stat` exactly and its
    /// stored box is adequate (>=) on both axes for `requested_box`.
    pub fn get(
        &self,
        path: &Path,
        stat: FileStat,
        requested_box: (u32, u32),
    ) -> Result<Option<ThumbnailRecord>, StoreError> {
        let conn = self.conn()?;
        self.with_retry("get", || {
            let row = conn
                .query_row(
                    "SELECT mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes
                     FROM thumbnails WHERE path = ?1",
                    params![path_key(path)],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, u32>(4)?,
                            row.get::<_, u32>(5)?,
                            row.get::<_, Vec<u8>>(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(|source| StoreError::ReadFailed { source })?;

            let Some((mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes)) = row else {
                return Ok(None);
            };
            if mtime != stat.mtime || size != stat.size {
                return Ok(None);
            }
            if thumb_w < requested_box.0 || thumb_h < requested_box.1 {
                return Ok(None);
            }
            Ok(Some(ThumbnailRecord {
                png_bytes,
                orig_width: orig_w,
                orig_height: orig_h,
                thumb_width: thumb_w,
                thumb_height: thumb_h,
            }))
        })
    }

    /// Resolves many lookups in a single query, preserving input order.
    /// Never issues one query per item.
    pub fn get_batch(
        &self,
        items: &[BatchLookup],
    ) -> Result<Vec<Option<ThumbnailRecord>>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        self.with_retry("get_batch", || {
            let keys: Vec<String> = items.iter().map(|item| path_key(&item.path)).collect();
            let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT path, mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes
                 FROM thumbnails WHERE path IN ({placeholders})"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|source| StoreError::ReadFailed { source })?;
            let rows = stmt
                .query_map(params_from_iter(keys.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                })
                .map_err(|source| StoreError::ReadFailed { source })?;

            let mut by_key = std::collections::HashMap::new();
            for row in rows {
                let (key, mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes) =
                    row.map_err(|source| StoreError::ReadFailed { source })?;
                by_key.insert(key, (mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes));
            }

            let mut results = Vec::with_capacity(items.len());
            for item in items {
                let key = path_key(&item.path);
                let record = by_key.get(&key).and_then(
                    |(mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes)| {
                        if *mtime != item.stat.mtime || *size != item.stat.size {
                            return None;
                        }
                        if *thumb_w < item.requested_box.0 || *thumb_h < item.requested_box.1 {
                            return None;
                        }
                        Some(ThumbnailRecord {
                            png_bytes: png_bytes.clone(),
                            orig_width: *orig_w,
                            orig_height: *orig_h,
                            thumb_width: *thumb_w,
                            thumb_height: *thumb_h,
                        })
                    },
                );
                results.push(record);
            }
            Ok(results)
        })
    }

    /// Writes or replaces the thumbnail record for `path`.
    pub fn upsert(
        &self,
        path: &Path,
        stat: FileStat,
        orig_dims: (u32, u32),
        thumb_dims: (u32, u32),
        png_bytes: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        self.with_retry("upsert", || {
            conn.execute(
                "INSERT INTO thumbnails
                    (path, mtime, size, orig_w, orig_h, thumb_w, thumb_h, png_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%s','now'))
                 ON CONFLICT(path) DO UPDATE SET
                    mtime = excluded.mtime,
                    size = excluded.size,
                    orig_w = excluded.orig_w,
                    orig_h = excluded.orig_h,
                    thumb_w = excluded.thumb_w,
                    thumb_h = excluded.thumb_h,
                    png_bytes = excluded.png_bytes,
                    created_at = excluded.created_at",
                params![
                    path_key(path),
                    stat.mtime,
                    stat.size,
                    orig_dims.0,
                    orig_dims.1,
                    thumb_dims.0,
                    thumb_dims.1,
                    png_bytes,
                ],
            )
            .map_err(|source| StoreError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(())
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let start = Instant::now();
        let conn = self.conn()?;
        let result = conn
            .query_row("SELECT COUNT(*) FROM thumbnails", [], |row| row.get(0))
            .map_err(|source| StoreError::ReadFailed { source });
        self.emit_metric(MetricsEvent::StoreOperation {
            operation: "count",
            duration_ms: start.elapsed().as_millis() as u64,
            retries: 0,
        });
        result
    }

    /// Deletes records whose `created_at` predates `days` ago.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let start = Instant::now();
        let conn = self.conn()?;
        let cutoff_seconds = days as i64 * 86_400;
        let result = conn
            .execute(
                "DELETE FROM thumbnails WHERE created_at < (strftime('%s','now') - ?1)",
                params![cutoff_seconds],
            )
            .map_err(|source| StoreError::WriteFailed {
                path: PathBuf::new(),
                source,
            });
        self.emit_metric(MetricsEvent::StoreOperation {
            operation: "cleanup_older_than",
            duration_ms: start.elapsed().as_millis() as u64,
            retries: 0,
        });
        result
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        let conn = self.conn()?;
        let result = conn.execute_batch("VACUUM;").map_err(|source| StoreError::WriteFailed {
            path: PathBuf::new(),
            source,
        });
        self.emit_metric(MetricsEvent::StoreOperation {
            operation: "vacuum",
            duration_ms: start.elapsed().as_millis() as u64,
            retries: 0,
        });
        result
    }

    /// Read-only adapter for external consumers (the Folder Model / Batch
    /// Thumbnail Loader) that only need the encoded bytes, without exposing
    /// `ThumbnailRecord`'s row-level shape.
    pub fn get_bytes(
        &self,
        path: &Path,
        stat: FileStat,
        requested_box: (u32, u32),
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(path, stat, requested_box)?.map(|record| record.png_bytes))
    }

    fn with_retry<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => {
                    self.emit_metric(MetricsEvent::StoreOperation {
                        operation,
                        duration_ms: start.elapsed().as_millis() as u64,
                        retries: attempt,
                    });
                    return Ok(value);
                }
                Err(error) if attempt + 1 < self.retry_max && is_transient(&error) => {
                    let backoff = self.retry_base * 2u32.pow(attempt);
                    log::warn!("thumbnail store operation retrying after transient error: {error}");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(error) => {
                    self.emit_metric(MetricsEvent::StoreOperation {
                        operation,
                        duration_ms: start.elapsed().as_millis() as u64,
                        retries: attempt,
                    });
                    return Err(error);
                }
            }
        }
    }
}

fn is_transient(error: &StoreError) -> bool {
    matches!(
        error,
        StoreError::WriteFailed {
            source: rusqlite::Error::SqliteFailure(sqlite_error, _),
            ..
        } | StoreError::ReadFailed {
            source: rusqlite::Error::SqliteFailure(sqlite_error, _),
        } if sqlite_error.code == rusqlite::ErrorCode::DatabaseBusy
            || sqlite_error.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn read_user_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'user_version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|source| StoreError::ReadFailed { source })?
    .map(|value| value.parse::<i64>().unwrap_or(0))
    .map(Ok)
    .unwrap_or(Ok(0))
}

fn write_user_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES ('user_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )
    .map_err(|source| StoreError::WriteFailed {
        path: PathBuf::new(),
        source,
    })?;
    Ok(())
}

fn create_v2_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS thumbnails (
            path TEXT PRIMARY KEY,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            orig_w INTEGER NOT NULL,
            orig_h INTEGER NOT NULL,
            thumb_w INTEGER NOT NULL,
            thumb_h INTEGER NOT NULL,
            png_bytes BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_thumbnails_created_at ON thumbnails(created_at);",
    )
    .map_err(|source| StoreError::WriteFailed {
        path: PathBuf::new(),
        source,
    })
}

/// Runs ordered, forward-only migrations from `from` to `to`, each wrapped
/// in its own transaction so a failure partway through leaves the database
/// at its previous version rather than a half-migrated one.
fn run_migrations(conn: &Connection, from: i64, to: i64) -> Result<(), StoreError> {
    let mut version = from;
    while version < to {
        let next = version + 1;
        let tx = conn.unchecked_transaction().map_err(|source| StoreError::WriteFailed {
            path: PathBuf::new(),
            source,
        })?;
        let outcome = apply_migration(&tx, version, next);
        match outcome {
            Ok(()) => {
                tx.commit().map_err(|source| StoreError::WriteFailed {
                    path: PathBuf::new(),
                    source,
                })?;
                append_migration_audit(conn, version, next, "ok");
                log::info!("migrated thumbnail store schema {version} -> {next}");
            }
            Err(error) => {
                append_migration_audit(conn, version, next, "failed");
                return Err(error);
            }
        }
        version = next;
    }
    write_user_version(conn, to)
}

fn apply_migration(tx: &Connection, from: i64, to: i64) -> Result<(), StoreError> {
    match (from, to) {
        (1, 2) => {
            // v1 stored thumbnails without explicit orig/thumb dimension
            // columns; v2 adds them with a zero default for pre-existing
            // rows, which naturally fail the box-adequacy check on read and
            // get regenerated.
            tx.execute_batch(
                "ALTER TABLE thumbnails ADD COLUMN orig_w INTEGER NOT NULL DEFAULT 0;
                 ALTER TABLE thumbnails ADD COLUMN orig_h INTEGER NOT NULL DEFAULT 0;
                 ALTER TABLE thumbnails ADD COLUMN thumb_w INTEGER NOT NULL DEFAULT 0;
                 ALTER TABLE thumbnails ADD COLUMN thumb_h INTEGER NOT NULL DEFAULT 0;",
            )
            .map_err(|source| StoreError::WriteFailed {
                path: PathBuf::new(),
                source,
            })
        }
        _ => Err(StoreError::CorruptDb(format!(
            "no migration registered from version {from} to {to}"
        ))),
    }
}

fn append_migration_audit(conn: &Connection, from: i64, to: i64, outcome: &str) {
    let entry = serde_json::json!({
        "from": from,
        "to": to,
        "at": chrono::Utc::now().to_rfc3339(),
        "outcome": outcome,
    });
    let existing = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'migration_log'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .ok()
        .flatten();
    let mut log: Vec<serde_json::Value> = existing
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();
    log.push(entry);
    let serialized = serde_json::to_string(&log).unwrap_or_default();
    let _ = conn.execute(
        "INSERT INTO meta(key, value) VALUES ('migration_log', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![serialized],
    );
}

#[cfg(unix)]
fn mark_hidden_best_effort(_db_path: &Path) {
    // Dotfile-based hiding is the caller's responsibility on unix (the
    // filename convention, not a file attribute); nothing to do here.
}

#[cfg(windows)]
fn mark_hidden_best_effort(db_path: &Path) {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    if let Ok(metadata) = std::fs::metadata(db_path) {
        let mut attributes = metadata.file_attributes();
        attributes |= FILE_ATTRIBUTE_HIDDEN;
        // Best effort: failures to hide the file are non-fatal.
        let _ = set_file_attributes(db_path, attributes);
    }
}

#[cfg(windows)]
fn set_file_attributes(_path: &Path, _attributes: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, ThumbnailStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("thumbs.db");
        let store = ThumbnailStore::open(&db_path, 3, 5).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_then_get_round_trips_when_box_is_adequate() {
        let (_dir, store) = open_tmp();
        let path = PathBuf::from("/photos/a.jpg");
        let stat = FileStat { mtime: 100, size: 200 };
        store
            .upsert(&path, stat, (4000, 3000), (400, 300), b"pngdata")
            .unwrap();

        let hit = store.get(&path, stat, (400, 300)).unwrap();
        assert!(hit.is_some());
        let hit = hit.unwrap();
        assert_eq!(hit.png_bytes, b"pngdata");

        // A larger requested box than what is stored is a miss.
        let miss = store.get(&path, stat, (800, 600)).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn mtime_mismatch_is_a_miss() {
        let (_dir, store) = open_tmp();
        let path = PathBuf::from("/photos/b.jpg");
        let original_stat = FileStat { mtime: 100, size: 200 };
        store
            .upsert(&path, original_stat, (100, 100), (100, 100), b"bytes")
            .unwrap();

        let changed_stat = FileStat { mtime: 101, size: 200 };
        let miss = store.get(&path, changed_stat, (100, 100)).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn get_batch_preserves_order_and_reports_misses() {
        let (_dir, store) = open_tmp();
        let stat = FileStat { mtime: 1, size: 2 };
        let hit_path = PathBuf::from("/x/hit.jpg");
        let miss_path = PathBuf::from("/x/miss.jpg");
        store
            .upsert(&hit_path, stat, (10, 10), (10, 10), b"data")
            .unwrap();

        let results = store
            .get_batch(&[
                BatchLookup { path: hit_path.clone(), stat, requested_box: (10, 10) },
                BatchLookup { path: miss_path.clone(), stat, requested_box: (10, 10) },
            ])
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn count_reflects_upserts() {
        let (_dir, store) = open_tmp();
        assert_eq!(store.count().unwrap(), 0);
        let stat = FileStat { mtime: 1, size: 1 };
        store
            .upsert(&PathBuf::from("/a"), stat, (1, 1), (1, 1), b"x")
            .unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn opening_a_schema_newer_than_supported_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("future.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                 INSERT INTO meta(key, value) VALUES ('user_version', '99');",
            )
            .unwrap();
        }
        let err = ThumbnailStore::open(&db_path, 1, 1).unwrap_err();
        assert!(matches!(err, StoreError::SchemaTooNew { .. }));
    }

    fn seed_v1_schema(db_path: &Path, rows: i64) {
        let conn = Connection::open(db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO meta(key, value) VALUES ('user_version', '1');
             CREATE TABLE thumbnails (
                path TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL,
                png_bytes BLOB NOT NULL,
                created_at INTEGER NOT NULL
             );",
        )
        .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO thumbnails(path, mtime, size, png_bytes, created_at)
                 VALUES (?1, 0, 0, ?2, 0)",
                params![format!("/photos/{i}.jpg"), b"pngdata".to_vec()],
            )
            .unwrap();
        }
    }

    #[test]
    fn opening_a_v1_database_migrates_existing_rows_to_v2() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("v1.db");
        seed_v1_schema(&db_path, 100);

        let store = ThumbnailStore::open(&db_path, 1, 1).unwrap();
        assert_eq!(store.count().unwrap(), 100);

        let conn = Connection::open(&db_path).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'user_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());

        let (orig_w, thumb_w): (i64, i64) = conn
            .query_row(
                "SELECT orig_w, thumb_w FROM thumbnails WHERE path = '/photos/0.jpg'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(orig_w, 0);
        assert_eq!(thumb_w, 0);
    }

    #[test]
    fn a_failed_migration_leaves_the_database_at_its_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("interrupted.db");
        seed_v1_schema(&db_path, 5);
        {
            // Pre-add one of the v1->v2 migration's own target columns so its
            // ALTER TABLE fails with a duplicate-column error partway through,
            // simulating an interrupted migration.
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch("ALTER TABLE thumbnails ADD COLUMN orig_w INTEGER NOT NULL DEFAULT 0;")
                .unwrap();
        }

        let err = ThumbnailStore::open(&db_path, 1, 1).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { .. }));

        let conn = Connection::open(&db_path).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'user_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "1");
    }
}
