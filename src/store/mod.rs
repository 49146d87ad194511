//! ==============================================================================
//! store - durable append-only readings log
//! ==============================================================================
//!
//! purpose:
//!     persists accepted readings in sqlite and mirrors each one as a json line
//!     in a plain-text trace file for out-of-band recovery.
//!
//! threading:
//!     rusqlite connections are blocking and !Sync, so one worker thread owns
//!     the connection. async callers ship closures to it over a channel and
//!     await a oneshot reply. since every statement runs on that one thread,
//!     id assignment is serialized for free.
//!
//! ==============================================================================

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use rusqlite::{params, types::Value, Connection};
use tokio::sync::oneshot;

use crate::domain::{NewReading, Reading};
use crate::error::StorageError;

/// bumped whenever schema_v1.sql stops being the whole schema
const SCHEMA_VERSION: i32 = 1;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// the thread that owns the connection and the queue feeding it.
/// dropping it closes the queue, lets queued jobs finish, then joins.
struct Worker {
    queue: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(mut conn: Connection) -> Result<Self> {
        let (queue, jobs) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("alco-relay-db".into())
            .spawn(move || {
                for job in jobs {
                    job(&mut conn);
                }
                debug!("[STORE] Job queue closed, worker exiting");
            })
            .context("failed to spawn database worker thread")?;

        Ok(Self {
            queue: Some(queue),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> bool {
        match &self.queue {
            Some(queue) => queue.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.queue.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[STORE] Database worker panicked");
            }
        }
    }
}

/// refuses files stamped by a newer relay. the table itself uses
/// IF NOT EXISTS, so a database left by the old server opens untouched.
fn ensure_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version")?;

    if version > SCHEMA_VERSION {
        bail!("database schema version {version} is newer than supported version {SCHEMA_VERSION}");
    }

    conn.execute_batch(include_str!("schema_v1.sql"))
        .context("failed to create readings table")?;

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("failed to stamp user_version")?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct ReadingStore {
    worker: Arc<Worker>,
    db_path: Arc<PathBuf>,
    trace_path: Arc<PathBuf>,
}

impl ReadingStore {
    /// open (or create) the database and hand it to the worker thread
    pub fn open(db_path: PathBuf, trace_path: PathBuf) -> Result<Self, StorageError> {
        Self::open_inner(db_path, trace_path)
            .map_err(|e| StorageError::Unavailable(format!("{e:#}")))
    }

    fn open_inner(db_path: PathBuf, trace_path: PathBuf) -> Result<Self> {
        for path in [&db_path, &trace_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!("[STORE] WAL mode unavailable, using default journal: {err}");
        }
        ensure_schema(&conn)?;

        let worker = Worker::spawn(conn)?;
        info!("[STORE] Database ready at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(worker),
            db_path: Arc::new(db_path),
            trace_path: Arc::new(trace_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn trace_path(&self) -> &Path {
        self.trace_path.as_path()
    }

    /// run `task` on the worker thread.
    /// the outer error means the worker is gone, the inner one is the task's own.
    pub(crate) async fn execute<F, T>(&self, task: F) -> Result<Result<T>, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: Job = Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                debug!("[STORE] Caller went away before the result was ready");
            }
        });
        if !self.worker.submit(job) {
            return Err(StorageError::Unavailable("database worker is gone".into()));
        }

        reply_rx
            .await
            .map_err(|_| StorageError::Unavailable("database worker dropped the job".into()))
    }

    /// persist a reading, returning it with its new identity.
    /// the trace line is best-effort and never fails the append.
    pub async fn append(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let trace_path = self.trace_path.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO readings (timestamp, alcohol, alcohol_mg_l, user, observaciones, sensor_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    reading.timestamp,
                    reading.alcohol,
                    reading.alcohol_mg_l,
                    reading.user,
                    reading.observaciones,
                    reading.sensor_value,
                ],
            )
            .context("failed to insert reading")?;

            let entry = reading.with_id(conn.last_insert_rowid());

            if let Err(err) = append_trace(&trace_path, &entry) {
                warn!(
                    "[STORE] Trace write failed for reading {} ({}): {err:#}",
                    entry.id,
                    trace_path.display()
                );
            }

            Ok(entry)
        })
        .await?
        .map_err(|e| StorageError::Write(format!("{e:#}")))
    }

    /// at most `limit` readings, most recent first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Reading>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, alcohol, alcohol_mg_l, user, observaciones, sensor_value
                 FROM readings
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;

            // legacy rows from the old server may hold NULLs, or values
            // of the wrong storage class, in any column
            let rows = stmt.query_map(params![limit], |row| {
                Ok(Reading {
                    id: row.get(0)?,
                    timestamp: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    alcohol: real(row.get(2)?).unwrap_or(0.0),
                    alcohol_mg_l: real(row.get(3)?),
                    user: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    observaciones: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    sensor_value: integer(row.get(6)?),
                })
            })?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read reading row")
        })
        .await?
        .map_err(|e| StorageError::Query(format!("{e:#}")))
    }
}

fn real(value: Value) -> Option<f64> {
    match value {
        Value::Real(v) => Some(v),
        Value::Integer(v) => Some(v as f64),
        Value::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn integer(value: Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(v),
        Value::Real(v) => Some(v.round() as i64),
        Value::Text(t) => {
            let t = t.trim();
            t.parse().ok().or_else(|| t.parse::<f64>().ok().map(|v| v.round() as i64))
        }
        _ => None,
    }
}

fn append_trace(path: &Path, entry: &Reading) -> Result<()> {
    let line = serde_json::to_string(entry).context("failed to serialize trace entry")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("failed to open trace file")?;
    writeln!(file, "{line}").context("failed to write trace line")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::now_iso;
    use tempfile::tempdir;

    fn sample(alcohol: f64) -> NewReading {
        NewReading {
            timestamp: now_iso(),
            alcohol,
            alcohol_mg_l: None,
            user: "ESP32".into(),
            observaciones: String::new(),
            sensor_value: Some(512),
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_without_gaps() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(store.append(sample(i as f64)).await.unwrap().id);
        }
        for pair in ids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_get_unique_ids() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append(sample(i as f64)).await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort();
        let expected: Vec<i64> = (1..=32).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_list_recent_orders_and_bounds() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();

        assert!(store.list_recent(10).await.unwrap().is_empty());

        for i in 0..5 {
            store.append(sample(i as f64)).await.unwrap();
        }

        let recent = store.list_recent(3).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(recent[0].alcohol, 4.0);
        assert_eq!(recent[0].alcohol_mg_l, None);
        assert_eq!(recent[0].sensor_value, Some(512));

        assert!(store.list_recent(0).await.unwrap().is_empty());
        assert_eq!(store.list_recent(100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_trace_gets_one_line_per_append() {
        let dir = tempdir().unwrap();
        let trace = dir.path().join("trace").join("r.txt");
        let store = ReadingStore::open(dir.path().join("r.db"), trace.clone()).unwrap();

        store.append(sample(1.0)).await.unwrap();
        store.append(sample(2.0)).await.unwrap();

        let content = std::fs::read_to_string(&trace).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Reading = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.alcohol, 2.0);
    }

    #[tokio::test]
    async fn test_trace_failure_does_not_fail_append() {
        let dir = tempdir().unwrap();
        // a directory cannot be opened for appending
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().to_path_buf()).unwrap();

        let reading = store.append(sample(3.0)).await.unwrap();
        assert_eq!(reading.id, 1);
        assert_eq!(store.list_recent(1).await.unwrap(), vec![reading]);
    }

    #[tokio::test]
    async fn test_write_failure_is_storage_error() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();

        store
            .execute(|conn| Ok(conn.execute_batch("DROP TABLE readings")?))
            .await
            .unwrap()
            .unwrap();

        let err = store.append(sample(1.0)).await.unwrap_err();
        assert!(matches!(err, StorageError::Write(_)));
        assert!(!dir.path().join("r.txt").exists());
    }

    #[tokio::test]
    async fn test_legacy_rows_with_odd_values_still_list() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path().join("r.db"), dir.path().join("r.txt")).unwrap();

        store
            .execute(|conn| {
                conn.execute_batch(
                    "INSERT INTO readings (timestamp, alcohol, alcohol_mg_l, user, observaciones, sensor_value)
                     VALUES ('2024-03-01T10:00:00.000Z', 4, 'n/a', 'ESP32', '', 512.7);
                     INSERT INTO readings (timestamp, alcohol, alcohol_mg_l, user, observaciones, sensor_value)
                     VALUES ('2024-03-01T10:00:01.000Z', 2.5, NULL, 'ESP32', '', '300');",
                )?;
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();

        let rows = store.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sensor_value, Some(300));
        assert_eq!(rows[1].alcohol, 4.0);
        assert_eq!(rows[1].alcohol_mg_l, None);
        assert_eq!(rows[1].sensor_value, Some(513));
    }

    #[test]
    fn test_schema_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO readings (timestamp, alcohol, user) VALUES ('t', 1.0, 'ESP32')",
        )
        .unwrap();
        ensure_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("r.db");
        {
            let conn = Connection::open(&db).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }
        let err = ReadingStore::open(db, dir.path().join("r.txt")).err().unwrap();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_reopen_keeps_readings() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("r.db");
        {
            let store = ReadingStore::open(db.clone(), dir.path().join("r.txt")).unwrap();
            store.append(sample(9.5)).await.unwrap();
        }
        let store = ReadingStore::open(db, dir.path().join("r.txt")).unwrap();
        let next = store.append(sample(1.0)).await.unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(store.list_recent(2).await.unwrap()[1].alcohol, 9.5);
    }
}
