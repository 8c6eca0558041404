//! SQLite persistence for runs and their location samples.
//!
//! The table layout (`run._id`, `location.run_id`) is the long-standing one, so
//! existing `runs.sqlite` files open unchanged. Schema version lives in
//! `PRAGMA user_version`; there are no forward migrations yet.
//!
//! Every operation opens its own connection, which keeps `RunStore` trivially
//! shareable across threads. Writes are serialized by SQLite itself.

use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};
use crate::run::{LocationSample, Run};

pub const SCHEMA_VERSION: i64 = 1;

const DEFAULT_PAGE_SIZE: usize = 64;
const BUSY_TIMEOUT_MS: i64 = 5000;

const LOCATION_COLUMNS: &str = "timestamp, latitude, longitude, altitude, provider, run_id";

#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists the run's start date and returns the newly assigned id.
    pub fn insert_run(&self, run: &Run) -> Result<i64> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO run (start_date) VALUES (?1)",
                params![run.start_date],
            )
            .map_err(|err| TrackerError::store("Failed to insert run", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Persists a sample under `run_id` and returns its row id.
    ///
    /// The run is not checked for existence; only the session manager writes
    /// samples and it only does so for the current run.
    pub fn insert_location(&self, run_id: i64, sample: &LocationSample) -> Result<i64> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO location (timestamp, latitude, longitude, altitude, provider, run_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sample.timestamp,
                    sample.latitude,
                    sample.longitude,
                    sample.altitude,
                    sample.provider,
                    run_id
                ],
            )
            .map_err(|err| TrackerError::store("Failed to insert location", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// All runs, oldest start date first. Rows are fetched page by page as the
    /// cursor is consumed.
    pub fn query_runs(&self) -> RunCursor<'_> {
        RunCursor::new(self, DEFAULT_PAGE_SIZE)
    }

    pub fn query_runs_with_page_size(&self, page_size: usize) -> RunCursor<'_> {
        RunCursor::new(self, page_size.max(1))
    }

    pub fn query_run(&self, id: i64) -> Result<Option<Run>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT _id, start_date FROM run WHERE _id = ?1 LIMIT 1",
                params![id],
                run_from_row,
            )
            .optional()
            .map_err(|err| TrackerError::store("Failed to query run", err))
        })
    }

    /// The sample with the greatest timestamp recorded for `run_id`.
    pub fn query_last_location_for_run(&self, run_id: i64) -> Result<Option<LocationSample>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {LOCATION_COLUMNS} FROM location WHERE run_id = ?1 \
                     ORDER BY timestamp DESC LIMIT 1"
                ),
                params![run_id],
                location_from_row,
            )
            .optional()
            .map_err(|err| TrackerError::store("Failed to query last location", err))
        })
    }

    /// Number of stored samples, for one run or overall.
    pub fn count_locations(&self, run_id: Option<i64>) -> Result<u64> {
        self.with_connection(|conn| {
            let count = match run_id {
                Some(run_id) => conn.query_row(
                    "SELECT COUNT(*) FROM location WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get::<_, i64>(0),
                ),
                None => conn.query_row("SELECT COUNT(*) FROM location", [], |row| {
                    row.get::<_, i64>(0)
                }),
            }
            .map_err(|err| TrackerError::store("Failed to count locations", err))?;
            Ok(count.max(0) as u64)
        })
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.with_connection(|conn| read_user_version(conn))
    }

    fn fetch_runs_page(&self, after: Option<(i64, i64)>, limit: usize) -> Result<Vec<Run>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let (sql, bound) = match after {
            Some((start_date, id)) => (
                "SELECT _id, start_date FROM run \
                 WHERE start_date > ?1 OR (start_date = ?1 AND _id > ?2) \
                 ORDER BY start_date ASC, _id ASC LIMIT ?3",
                vec![start_date, id, limit],
            ),
            None => (
                "SELECT _id, start_date FROM run \
                 ORDER BY start_date ASC, _id ASC LIMIT ?1",
                vec![limit],
            ),
        };

        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| TrackerError::store("Failed to prepare runs query", err))?;
            let rows = stmt
                .query_map(params_from_iter(bound), run_from_row)
                .map_err(|err| TrackerError::store("Failed to query runs", err))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|err| TrackerError::store("Failed to decode run row", err))
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            let version = read_user_version(conn)?;
            if version > SCHEMA_VERSION {
                return Err(TrackerError::UnsupportedSchemaVersion {
                    found: version,
                    supported: SCHEMA_VERSION,
                });
            }
            if version == SCHEMA_VERSION {
                return Ok(());
            }

            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS run (
                    _id integer primary key autoincrement,
                    start_date integer
                 );
                 CREATE TABLE IF NOT EXISTS location (
                    timestamp integer,
                    latitude real,
                    longitude real,
                    altitude real,
                    provider varchar(100),
                    run_id integer references run(_id)
                 );
                 PRAGMA user_version = 1;
                 COMMIT;",
            )
            .map_err(|err| TrackerError::store("Failed to initialize schema", err))?;
            tracing::debug!(path = %self.path.display(), "Run store schema created");
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.connect()?;
        op(&mut conn)
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| TrackerError::io("Failed to create run store dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| TrackerError::store("Failed to open run store", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| TrackerError::store("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| TrackerError::store("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|err| TrackerError::store("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

fn read_user_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map_err(|err| TrackerError::store("Failed to read schema version", err))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        start_date: row.get(1)?,
    })
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<LocationSample> {
    Ok(LocationSample {
        timestamp: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        altitude: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
        provider: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        run_id: row.get(5)?,
    })
}

/// Lazy, restartable sequence of runs ordered by start date.
///
/// Rows are pulled from the store a page at a time and handed out as plain
/// `Run` values. Call [`RunCursor::close`] when done; dropping the cursor
/// releases it too. A read failure is yielded once, then the cursor ends.
#[derive(Debug)]
pub struct RunCursor<'a> {
    store: &'a RunStore,
    page_size: usize,
    buffer: VecDeque<Run>,
    last_key: Option<(i64, i64)>,
    exhausted: bool,
    closed: bool,
}

impl<'a> RunCursor<'a> {
    fn new(store: &'a RunStore, page_size: usize) -> Self {
        Self {
            store,
            page_size,
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
            closed: false,
        }
    }

    /// Rewinds to the first run, picking up rows inserted since the last pass.
    pub fn requery(&mut self) {
        self.buffer.clear();
        self.last_key = None;
        self.exhausted = false;
        self.closed = false;
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn fill(&mut self) -> Result<()> {
        let page = self.store.fetch_runs_page(self.last_key, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_key = Some((last.start_date, last.id));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for RunCursor<'_> {
    type Item = Result<Run>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl Drop for RunCursor<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, RunStore) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = RunStore::open(temp_dir.path().join("runs.sqlite")).expect("store init");
        (temp_dir, store)
    }

    fn sample(lat: f64, lon: f64, timestamp: i64) -> LocationSample {
        LocationSample::new(lat, lon, 10.0, timestamp, "gps")
    }

    #[test]
    fn schema_matches_legacy_layout() {
        let (_dir, store) = open_store();
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);

        let columns = store
            .with_connection(|conn| {
                let mut names = Vec::new();
                for table in ["run", "location"] {
                    let mut stmt = conn
                        .prepare(&format!("PRAGMA table_info({table})"))
                        .map_err(|err| TrackerError::store("table_info", err))?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(1))
                        .map_err(|err| TrackerError::store("table_info rows", err))?;
                    for row in rows {
                        let column = row.map_err(|err| TrackerError::store("column", err))?;
                        names.push(format!("{table}.{column}"));
                    }
                }
                Ok(names)
            })
            .expect("columns");

        assert_eq!(
            columns,
            vec![
                "run._id",
                "run.start_date",
                "location.timestamp",
                "location.latitude",
                "location.longitude",
                "location.altitude",
                "location.provider",
                "location.run_id",
            ]
        );
    }

    #[test]
    fn reopening_keeps_data() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.sqlite");
        let id = RunStore::open(&path)
            .expect("store init")
            .insert_run(&Run::with_start_date(1_000))
            .expect("insert run");

        let reopened = RunStore::open(&path).expect("reopen");
        let run = reopened.query_run(id).expect("query").expect("run exists");
        assert_eq!(run.start_date, 1_000);
    }

    #[test]
    fn refuses_newer_schema_version() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.sqlite");
        let conn = Connection::open(&path).expect("open raw");
        conn.pragma_update(None, "user_version", 2).expect("bump version");
        drop(conn);

        match RunStore::open(&path) {
            Err(TrackerError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 2);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected schema version error, got {other:?}"),
        }
    }

    #[test]
    fn inserts_assign_increasing_ids() {
        let (_dir, store) = open_store();
        let first = store.insert_run(&Run::with_start_date(1)).expect("insert");
        let second = store.insert_run(&Run::with_start_date(2)).expect("insert");
        assert!(first >= 1);
        assert!(second > first);
    }

    #[test]
    fn missing_run_is_none() {
        let (_dir, store) = open_store();
        assert!(store.query_run(42).expect("query").is_none());
        assert!(store
            .query_last_location_for_run(42)
            .expect("query")
            .is_none());
    }

    #[test]
    fn last_location_is_latest_by_timestamp_not_insert_order() {
        let (_dir, store) = open_store();
        let run_id = store.insert_run(&Run::with_start_date(0)).expect("insert");

        store.insert_location(run_id, &sample(1.0, 1.0, 500)).expect("insert");
        store.insert_location(run_id, &sample(2.0, 2.0, 900)).expect("insert");
        store.insert_location(run_id, &sample(3.0, 3.0, 700)).expect("insert");

        let last = store
            .query_last_location_for_run(run_id)
            .expect("query")
            .expect("location");
        assert_eq!(last.timestamp, 900);
        assert_eq!(last.latitude, 2.0);
        assert_eq!(last.provider, "gps");
        assert_eq!(last.run_id, Some(run_id));
    }

    #[test]
    fn locations_are_scoped_to_their_run() {
        let (_dir, store) = open_store();
        let a = store.insert_run(&Run::with_start_date(0)).expect("insert");
        let b = store.insert_run(&Run::with_start_date(1)).expect("insert");

        store.insert_location(a, &sample(1.0, 1.0, 100)).expect("insert");
        store.insert_location(b, &sample(9.0, 9.0, 200)).expect("insert");

        let last_a = store.query_last_location_for_run(a).expect("query").expect("a");
        assert_eq!(last_a.latitude, 1.0);
        assert_eq!(store.count_locations(Some(a)).expect("count"), 1);
        assert_eq!(store.count_locations(None).expect("count"), 2);
    }

    #[test]
    fn insert_location_does_not_require_existing_run() {
        let (_dir, store) = open_store();
        store.insert_location(77, &sample(0.0, 0.0, 1)).expect("insert");
        assert_eq!(store.count_locations(Some(77)).expect("count"), 1);
    }

    #[test]
    fn cursor_orders_by_start_date_across_pages() {
        let (_dir, store) = open_store();
        for start in [50, 10, 40, 10, 30, 20, 60] {
            store.insert_run(&Run::with_start_date(start)).expect("insert");
        }

        let runs: Vec<Run> = store
            .query_runs_with_page_size(2)
            .collect::<Result<_>>()
            .expect("runs");

        let starts: Vec<i64> = runs.iter().map(|run| run.start_date).collect();
        assert_eq!(starts, vec![10, 10, 20, 30, 40, 50, 60]);
        assert!(runs[0].id < runs[1].id);
    }

    #[test]
    fn cursor_pages_through_ties_on_start_date() {
        let (_dir, store) = open_store();
        let mut ids = Vec::new();
        for start in [10, 20, 20, 20, 30] {
            ids.push(store.insert_run(&Run::with_start_date(start)).expect("insert"));
        }

        let listed: Vec<i64> = store
            .query_runs_with_page_size(2)
            .map(|run| run.map(|run| run.id))
            .collect::<Result<_>>()
            .expect("runs");
        assert_eq!(listed, ids);
    }

    #[test]
    fn cursor_requery_restarts_and_sees_new_rows() {
        let (_dir, store) = open_store();
        store.insert_run(&Run::with_start_date(1)).expect("insert");

        let mut cursor = store.query_runs();
        assert_eq!(cursor.by_ref().count(), 1);
        assert!(cursor.next().is_none());

        store.insert_run(&Run::with_start_date(2)).expect("insert");
        cursor.requery();
        let starts: Vec<i64> = cursor.by_ref().map(|run| run.expect("run").start_date).collect();
        assert_eq!(starts, vec![1, 2]);

        cursor.close();
        assert!(cursor.is_closed());
        assert!(cursor.next().is_none());
    }
}
