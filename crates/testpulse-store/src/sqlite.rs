//! SQLite reference backend.
//!
//! One connection behind a `tokio::sync::Mutex`; WAL journaling and
//! `PRAGMA foreign_keys = ON` so inserts against deleted parents surface
//! as structured constraint failures instead of silent orphan rows. All
//! timestamps are stored as RFC 3339 text.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use testpulse_types::{
    CheckpointDetail, CheckpointInfo, CheckpointResult, LoadQueueResult, Message, Run, RunPatch,
    StatisticDefinition, StatisticSample, TestcasePatch, TestcaseResult,
};

use crate::batch::{CheckpointAggregate, CheckpointRow, WriteBatch};
use crate::error::{StoreError, StoreResult};
use crate::gateway::{NewLoadQueue, NewRun, PersistenceGateway};
use async_trait::async_trait;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    os          TEXT NOT NULL DEFAULT '',
    product     TEXT NOT NULL DEFAULT '',
    version     TEXT NOT NULL DEFAULT '',
    build       TEXT NOT NULL DEFAULT '',
    host        TEXT NOT NULL DEFAULT '',
    user_note   TEXT NOT NULL DEFAULT '',
    started_at  TEXT NOT NULL,
    ended_at    TEXT
);
CREATE TABLE IF NOT EXISTS run_metainfo (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id  INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS suites (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    package     TEXT NOT NULL DEFAULT '',
    user_note   TEXT NOT NULL DEFAULT '',
    started_at  TEXT NOT NULL,
    ended_at    TEXT
);
CREATE TABLE IF NOT EXISTS testcases (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id             INTEGER NOT NULL REFERENCES suites(id) ON DELETE CASCADE,
    scenario_name        TEXT NOT NULL DEFAULT '',
    scenario_description TEXT NOT NULL DEFAULT '',
    name                 TEXT NOT NULL,
    user_note            TEXT NOT NULL DEFAULT '',
    result               INTEGER NOT NULL,
    started_at           TEXT NOT NULL,
    ended_at             TEXT
);
CREATE TABLE IF NOT EXISTS scenario_metainfo (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS testcase_metainfo (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS load_queues (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id       INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    name              TEXT NOT NULL,
    thread_count      INTEGER NOT NULL DEFAULT 0,
    threading_pattern TEXT NOT NULL DEFAULT '',
    host              TEXT NOT NULL DEFAULT '',
    result            INTEGER NOT NULL DEFAULT 4,
    started_at        TEXT NOT NULL,
    ended_at          TEXT
);
CREATE TABLE IF NOT EXISTS checkpoint_summaries (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    load_queue_id        INTEGER NOT NULL REFERENCES load_queues(id) ON DELETE CASCADE,
    name                 TEXT NOT NULL,
    transfer_unit        TEXT NOT NULL DEFAULT '',
    num_passed           INTEGER NOT NULL DEFAULT 0,
    num_failed           INTEGER NOT NULL DEFAULT 0,
    min_response_time_ms INTEGER NOT NULL DEFAULT 0,
    avg_response_time_ms REAL NOT NULL DEFAULT 0,
    max_response_time_ms INTEGER NOT NULL DEFAULT 0,
    min_transfer_rate    REAL NOT NULL DEFAULT 0,
    avg_transfer_rate    REAL NOT NULL DEFAULT 0,
    max_transfer_rate    REAL NOT NULL DEFAULT 0,
    UNIQUE (load_queue_id, name)
);
CREATE TABLE IF NOT EXISTS checkpoints (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    summary_id       INTEGER NOT NULL REFERENCES checkpoint_summaries(id) ON DELETE CASCADE,
    name             TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL DEFAULT 0,
    transfer_size    INTEGER NOT NULL DEFAULT 0,
    transfer_unit    TEXT NOT NULL DEFAULT '',
    result           INTEGER NOT NULL,
    ended_at         TEXT
);
CREATE TABLE IF NOT EXISTS run_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    text        TEXT NOT NULL,
    level       INTEGER NOT NULL,
    escape_html INTEGER NOT NULL DEFAULT 0,
    machine     TEXT NOT NULL DEFAULT '',
    thread      TEXT NOT NULL DEFAULT '',
    logged_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS suite_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id    INTEGER NOT NULL REFERENCES suites(id) ON DELETE CASCADE,
    text        TEXT NOT NULL,
    level       INTEGER NOT NULL,
    escape_html INTEGER NOT NULL DEFAULT 0,
    machine     TEXT NOT NULL DEFAULT '',
    thread      TEXT NOT NULL DEFAULT '',
    logged_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS testcase_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    text        TEXT NOT NULL,
    level       INTEGER NOT NULL,
    escape_html INTEGER NOT NULL DEFAULT 0,
    machine     TEXT NOT NULL DEFAULT '',
    thread      TEXT NOT NULL DEFAULT '',
    logged_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS statistic_definitions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    parent_name   TEXT NOT NULL DEFAULT '',
    internal_name TEXT NOT NULL DEFAULT '',
    unit          TEXT NOT NULL DEFAULT '',
    params        TEXT NOT NULL DEFAULT '',
    UNIQUE (name, parent_name, internal_name, unit, params)
);
CREATE TABLE IF NOT EXISTS statistics (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    testcase_id   INTEGER NOT NULL REFERENCES testcases(id) ON DELETE CASCADE,
    definition_id INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    machine       TEXT NOT NULL DEFAULT '',
    value         REAL NOT NULL,
    sampled_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS machine_info (
    machine    TEXT PRIMARY KEY,
    info       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed [`PersistenceGateway`].
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn =
        Connection::open(path).map_err(|e| StoreError::Connection(e.to_string()))?;
    conn.execute_batch(
        "PRAGMA journal_mode  = WAL;
         PRAGMA synchronous   = NORMAL;
         PRAGMA temp_store    = MEMORY;
         PRAGMA foreign_keys  = ON;",
    )
    .map_err(|e| StoreError::Connection(e.to_string()))?;
    Ok(conn)
}

/// Map a rusqlite error, attributing foreign-key failures to the parent
/// entity the statement referenced.
fn map_err(err: rusqlite::Error, entity: &'static str, id: i64) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound { entity, id },
        rusqlite::Error::SqliteFailure(e, msg) => {
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                StoreError::MissingParent { entity, id }
            } else if e.code == rusqlite::ErrorCode::ConstraintViolation {
                StoreError::Constraint(msg.unwrap_or_else(|| e.to_string()))
            } else if matches!(
                e.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
            ) {
                StoreError::Connection(msg.unwrap_or_else(|| e.to_string()))
            } else {
                StoreError::Backend(msg.unwrap_or_else(|| e.to_string()))
            }
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn parse_ts(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp in store: {e}")))
}

fn message_params(message: &Message) -> (String, i64, i64) {
    (
        message.timestamp.to_rfc3339(),
        message.level.as_i64(),
        i64::from(message.escape_html),
    )
}

impl SqliteGateway {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        let conn = open_connection(&db_path)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    /// Ensure the `(load queue, name)` summary row exists, returning its id.
    fn ensure_summary(
        conn: &Connection,
        load_queue_id: i64,
        name: &str,
        transfer_unit: &str,
    ) -> StoreResult<i64> {
        conn.execute(
            "INSERT INTO checkpoint_summaries (load_queue_id, name, transfer_unit)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (load_queue_id, name) DO NOTHING",
            params![load_queue_id, name, transfer_unit],
        )
        .map_err(|e| map_err(e, "load queue", load_queue_id))?;
        conn.query_row(
            "SELECT id FROM checkpoint_summaries WHERE load_queue_id = ?1 AND name = ?2",
            params![load_queue_id, name],
            |row| row.get(0),
        )
        .map_err(|e| map_err(e, "load queue", load_queue_id))
    }

    /// Fold an aggregate into a summary row (read-modify-write; callers
    /// hold the connection lock, and batched paths run in a transaction).
    fn merge_summary(conn: &Connection, agg: &CheckpointAggregate) -> StoreResult<()> {
        let summary_id =
            Self::ensure_summary(conn, agg.load_queue_id, &agg.name, &agg.transfer_unit)?;

        let (passed, min_rt, avg_rt, max_rt, min_tr, avg_tr, max_tr): (
            i64,
            i64,
            f64,
            i64,
            f64,
            f64,
            f64,
        ) = conn
            .query_row(
                "SELECT num_passed, min_response_time_ms, avg_response_time_ms,
                        max_response_time_ms, min_transfer_rate, avg_transfer_rate,
                        max_transfer_rate
                 FROM checkpoint_summaries WHERE id = ?1",
                params![summary_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .map_err(|e| map_err(e, "checkpoint summary", summary_id))?;

        let total_passed = passed + agg.num_passed;
        let (new_min_rt, new_max_rt, new_avg_rt, new_min_tr, new_max_tr, new_avg_tr) =
            if agg.num_passed == 0 {
                (min_rt, max_rt, avg_rt, min_tr, max_tr, avg_tr)
            } else if passed == 0 {
                (
                    agg.min_response_for_store(),
                    agg.max_response_time_ms,
                    agg.avg_response_time_ms(),
                    agg.min_rate_for_store(),
                    agg.max_transfer_rate,
                    agg.avg_transfer_rate(),
                )
            } else {
                (
                    min_rt.min(agg.min_response_for_store()),
                    max_rt.max(agg.max_response_time_ms),
                    (avg_rt * passed as f64 + agg.avg_response_time_ms() * agg.num_passed as f64)
                        / total_passed as f64,
                    min_tr.min(agg.min_rate_for_store()),
                    max_tr.max(agg.max_transfer_rate),
                    (avg_tr * passed as f64 + agg.avg_transfer_rate() * agg.num_passed as f64)
                        / total_passed as f64,
                )
            };

        conn.execute(
            "UPDATE checkpoint_summaries
             SET num_passed = ?1, num_failed = num_failed + ?2,
                 min_response_time_ms = ?3, avg_response_time_ms = ?4,
                 max_response_time_ms = ?5, min_transfer_rate = ?6,
                 avg_transfer_rate = ?7, max_transfer_rate = ?8
             WHERE id = ?9",
            params![
                total_passed,
                agg.num_failed,
                new_min_rt,
                new_avg_rt,
                new_max_rt,
                new_min_tr,
                new_avg_tr,
                new_max_tr,
                summary_id
            ],
        )
        .map_err(|e| map_err(e, "checkpoint summary", summary_id))?;
        Ok(())
    }

    fn insert_checkpoint_inner(
        conn: &Connection,
        row: &CheckpointRow,
        detail: CheckpointDetail,
    ) -> StoreResult<()> {
        let rate = if row.response_time_ms > 0 {
            row.transfer_size as f64 * 1000.0 / row.response_time_ms as f64
        } else {
            0.0
        };
        let mut agg = CheckpointAggregate::new(row.load_queue_id, &row.name, &row.transfer_unit);
        agg.record(row.result, row.response_time_ms, rate);
        Self::merge_summary(conn, &agg)?;

        if detail == CheckpointDetail::Full {
            let summary_id =
                Self::ensure_summary(conn, row.load_queue_id, &row.name, &row.transfer_unit)?;
            conn.execute(
                "INSERT INTO checkpoints
                     (summary_id, name, response_time_ms, transfer_size, transfer_unit,
                      result, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    summary_id,
                    row.name,
                    row.response_time_ms,
                    row.transfer_size,
                    row.transfer_unit,
                    row.result.as_i64(),
                    row.ended_at.to_rfc3339()
                ],
            )
            .map_err(|e| map_err(e, "load queue", row.load_queue_id))?;
        }
        Ok(())
    }

    fn insert_message_inner(
        conn: &Connection,
        table: &str,
        owner_column: &str,
        owner_entity: &'static str,
        owner_id: i64,
        message: &Message,
    ) -> StoreResult<()> {
        let (ts, level, escape) = message_params(message);
        conn.execute(
            &format!(
                "INSERT INTO {table} ({owner_column}, text, level, escape_html, machine,
                                      thread, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                owner_id,
                message.text,
                level,
                escape,
                message.machine,
                message.thread_name,
                ts
            ],
        )
        .map_err(|e| map_err(e, owner_entity, owner_id))?;
        Ok(())
    }

    fn insert_statistics_inner(
        conn: &Connection,
        testcase_id: i64,
        kind: &str,
        sample: &StatisticSample,
    ) -> StoreResult<()> {
        let ts = sample.timestamp.to_rfc3339();
        for (def_id, value) in sample.definition_ids.iter().zip(sample.values.iter()) {
            conn.execute(
                "INSERT INTO statistics
                     (testcase_id, definition_id, kind, machine, value, sampled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![testcase_id, def_id, kind, sample.machine, value, ts],
            )
            .map_err(|e| map_err(e, "testcase", testcase_id))?;
        }
        Ok(())
    }

    /// Drop and reopen the connection after a failed batch, so a wedged
    /// transaction or dead handle cannot poison later writes.
    async fn refresh_connection(&self) {
        match open_connection(&self.db_path) {
            Ok(fresh) => {
                let mut conn = self.conn.lock().await;
                *conn = fresh;
                debug!("sqlite connection reopened after batch failure");
            }
            Err(e) => warn!(error = %e, "could not reopen sqlite connection"),
        }
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn run_sanity_check(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let now = Utc::now();
        let ts = now.to_rfc3339();

        tx.execute(
            "INSERT INTO runs (name, os, product, version, build, host, started_at)
             VALUES ('sanity', '', '', '', '', '', ?1)",
            params![ts],
        )
        .map_err(|e| map_err(e, "run", 0))?;
        let run_id = tx.last_insert_rowid();

        let probe = Message {
            text: "sanity probe".into(),
            level: testpulse_types::MessageLevel::System,
            escape_html: false,
            machine: "".into(),
            thread_name: "sanity".into(),
            timestamp: now,
        };
        Self::insert_message_inner(&tx, "run_messages", "run_id", "run", run_id, &probe)?;
        tx.execute(
            "INSERT INTO run_metainfo (run_id, key, value) VALUES (?1, 'probe', 'probe')",
            params![run_id],
        )
        .map_err(|e| map_err(e, "run", run_id))?;

        tx.execute(
            "INSERT INTO suites (run_id, name, package, started_at) VALUES (?1, 'sanity', '', ?2)",
            params![run_id, ts],
        )
        .map_err(|e| map_err(e, "run", run_id))?;
        let suite_id = tx.last_insert_rowid();
        Self::insert_message_inner(&tx, "suite_messages", "suite_id", "suite", suite_id, &probe)?;

        tx.execute(
            "INSERT INTO testcases (suite_id, name, result, started_at)
             VALUES (?1, 'sanity', ?2, ?3)",
            params![suite_id, TestcaseResult::Running.as_i64(), ts],
        )
        .map_err(|e| map_err(e, "suite", suite_id))?;
        let testcase_id = tx.last_insert_rowid();
        Self::insert_message_inner(
            &tx,
            "testcase_messages",
            "testcase_id",
            "testcase",
            testcase_id,
            &probe,
        )?;
        tx.execute(
            "INSERT INTO scenario_metainfo (testcase_id, key, value) VALUES (?1, 'probe', 'probe')",
            params![testcase_id],
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))?;

        tx.execute(
            "INSERT INTO load_queues (testcase_id, name, started_at) VALUES (?1, 'sanity', ?2)",
            params![testcase_id, ts],
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))?;
        let queue_id = tx.last_insert_rowid();

        let row = CheckpointRow {
            load_queue_id: queue_id,
            name: "sanity".into(),
            response_time_ms: 1,
            transfer_size: 0,
            transfer_unit: String::new(),
            result: CheckpointResult::Passed,
            ended_at: now,
        };
        Self::insert_checkpoint_inner(&tx, &row, CheckpointDetail::Full)?;

        tx.execute(
            "INSERT INTO statistic_definitions (name) VALUES ('sanity')",
            [],
        )
        .map_err(|e| map_err(e, "statistic definition", 0))?;
        let def_id = tx.last_insert_rowid();
        let sample = StatisticSample {
            machine: String::new(),
            definition_ids: vec![def_id],
            values: vec![0.0],
            timestamp: now,
        };
        Self::insert_statistics_inner(&tx, testcase_id, "system", &sample)?;

        tx.rollback()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!("store sanity check passed");
        Ok(())
    }

    async fn start_run(&self, run: &NewRun, timestamp: DateTime<Utc>) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (name, os, product, version, build, host, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.name,
                run.os,
                run.product,
                run.version,
                run.build,
                run.host,
                timestamp.to_rfc3339()
            ],
        )
        .map_err(|e| map_err(e, "run", 0))?;
        Ok(conn.last_insert_rowid())
    }

    async fn end_run(&self, run_id: i64, timestamp: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE runs SET ended_at = ?1 WHERE id = ?2",
                params![timestamp.to_rfc3339(), run_id],
            )
            .map_err(|e| map_err(e, "run", run_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "run",
                id: run_id,
            });
        }
        Ok(())
    }

    async fn update_run(&self, run_id: i64, patch: &RunPatch) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE runs SET
                     name      = COALESCE(?1, name),
                     os        = COALESCE(?2, os),
                     product   = COALESCE(?3, product),
                     version   = COALESCE(?4, version),
                     build     = COALESCE(?5, build),
                     host      = COALESCE(?6, host),
                     user_note = COALESCE(?7, user_note)
                 WHERE id = ?8",
                params![
                    patch.name,
                    patch.os,
                    patch.product,
                    patch.version,
                    patch.build,
                    patch.host,
                    patch.user_note,
                    run_id
                ],
            )
            .map_err(|e| map_err(e, "run", run_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "run",
                id: run_id,
            });
        }
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> StoreResult<Run> {
        let conn = self.conn.lock().await;
        let (id, name, os, product, version, build, host, user_note, started, ended): (
            i64,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            Option<String>,
        ) = conn
            .query_row(
                "SELECT id, name, os, product, version, build, host, user_note,
                        started_at, ended_at
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .map_err(|e| map_err(e, "run", run_id))?;
        Ok(Run {
            id,
            name,
            os,
            product,
            version,
            build,
            host,
            user_note,
            started_at: parse_ts(&started)?,
            ended_at: ended.as_deref().map(parse_ts).transpose()?,
        })
    }

    async fn add_run_metainfo(&self, run_id: i64, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_metainfo (run_id, key, value) VALUES (?1, ?2, ?3)",
            params![run_id, key, value],
        )
        .map_err(|e| map_err(e, "run", run_id))?;
        Ok(())
    }

    async fn start_suite(
        &self,
        run_id: i64,
        name: &str,
        package: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO suites (run_id, name, package, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, name, package, timestamp.to_rfc3339()],
        )
        .map_err(|e| map_err(e, "run", run_id))?;
        Ok(conn.last_insert_rowid())
    }

    async fn end_suite(&self, suite_id: i64, timestamp: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE suites SET ended_at = ?1 WHERE id = ?2",
                params![timestamp.to_rfc3339(), suite_id],
            )
            .map_err(|e| map_err(e, "suite", suite_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "suite",
                id: suite_id,
            });
        }
        Ok(())
    }

    async fn update_suite(
        &self,
        suite_id: i64,
        name: Option<&str>,
        user_note: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE suites SET
                     name      = COALESCE(?1, name),
                     user_note = COALESCE(?2, user_note)
                 WHERE id = ?3",
                params![name, user_note, suite_id],
            )
            .map_err(|e| map_err(e, "suite", suite_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "suite",
                id: suite_id,
            });
        }
        Ok(())
    }

    async fn start_testcase(
        &self,
        suite_id: i64,
        scenario_name: &str,
        scenario_description: &str,
        name: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO testcases
                 (suite_id, scenario_name, scenario_description, name, result, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                suite_id,
                scenario_name,
                scenario_description,
                name,
                TestcaseResult::Running.as_i64(),
                timestamp.to_rfc3339()
            ],
        )
        .map_err(|e| map_err(e, "suite", suite_id))?;
        Ok(conn.last_insert_rowid())
    }

    async fn end_testcase(
        &self,
        testcase_id: i64,
        result: TestcaseResult,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE testcases SET result = ?1, ended_at = ?2 WHERE id = ?3",
                params![result.as_i64(), timestamp.to_rfc3339(), testcase_id],
            )
            .map_err(|e| map_err(e, "testcase", testcase_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "testcase",
                id: testcase_id,
            });
        }
        Ok(())
    }

    async fn update_testcase(
        &self,
        testcase_id: i64,
        patch: &TestcasePatch,
        _timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE testcases SET
                     scenario_name        = COALESCE(?1, scenario_name),
                     scenario_description = COALESCE(?2, scenario_description),
                     name                 = COALESCE(?3, name),
                     user_note            = COALESCE(?4, user_note)
                 WHERE id = ?5",
                params![
                    patch.scenario_name,
                    patch.scenario_description,
                    patch.name,
                    patch.user_note,
                    testcase_id
                ],
            )
            .map_err(|e| map_err(e, "testcase", testcase_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "testcase",
                id: testcase_id,
            });
        }
        Ok(())
    }

    async fn delete_testcase(&self, testcase_id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM testcases WHERE id = ?1", params![testcase_id])
            .map_err(|e| map_err(e, "testcase", testcase_id))?;
        Ok(())
    }

    async fn add_scenario_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scenario_metainfo (testcase_id, key, value) VALUES (?1, ?2, ?3)",
            params![testcase_id, key, value],
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))?;
        Ok(())
    }

    async fn clear_scenario_metainfo(&self, testcase_id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM scenario_metainfo WHERE testcase_id = ?1",
            params![testcase_id],
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))?;
        Ok(())
    }

    async fn add_testcase_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO testcase_metainfo (testcase_id, key, value) VALUES (?1, ?2, ?3)",
            params![testcase_id, key, value],
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))?;
        Ok(())
    }

    async fn start_load_queue(
        &self,
        queue: &NewLoadQueue,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO load_queues
                 (testcase_id, name, thread_count, threading_pattern, host, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                queue.testcase_id,
                queue.name,
                queue.thread_count,
                queue.threading_pattern,
                queue.host,
                timestamp.to_rfc3339()
            ],
        )
        .map_err(|e| map_err(e, "testcase", queue.testcase_id))?;
        Ok(conn.last_insert_rowid())
    }

    async fn end_load_queue(
        &self,
        load_queue_id: i64,
        result: LoadQueueResult,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE load_queues SET result = ?1, ended_at = ?2 WHERE id = ?3",
                params![result.as_i64(), timestamp.to_rfc3339(), load_queue_id],
            )
            .map_err(|e| map_err(e, "load queue", load_queue_id))?;
        if affected == 0 {
            return Err(StoreError::MissingParent {
                entity: "load queue",
                id: load_queue_id,
            });
        }
        Ok(())
    }

    async fn start_checkpoint(
        &self,
        load_queue_id: i64,
        name: &str,
        transfer_unit: &str,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<CheckpointInfo> {
        let conn = self.conn.lock().await;
        let summary_id = Self::ensure_summary(&conn, load_queue_id, name, transfer_unit)?;
        let checkpoint_id = if detail == CheckpointDetail::Full {
            conn.execute(
                "INSERT INTO checkpoints (summary_id, name, transfer_unit, result)
                 VALUES (?1, ?2, ?3, ?4)",
                params![summary_id, name, transfer_unit, CheckpointResult::Running.as_i64()],
            )
            .map_err(|e| map_err(e, "load queue", load_queue_id))?;
            conn.last_insert_rowid()
        } else {
            0
        };
        Ok(CheckpointInfo {
            name: name.to_owned(),
            summary_id,
            checkpoint_id,
            started_at: timestamp,
        })
    }

    async fn end_checkpoint(
        &self,
        info: &CheckpointInfo,
        response_time_ms: i64,
        transfer_size: i64,
        result: CheckpointResult,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let (load_queue_id, transfer_unit): (i64, String) = conn
            .query_row(
                "SELECT load_queue_id, transfer_unit FROM checkpoint_summaries WHERE id = ?1",
                params![info.summary_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| map_err(e, "checkpoint summary", info.summary_id))?;

        let rate = if response_time_ms > 0 {
            transfer_size as f64 * 1000.0 / response_time_ms as f64
        } else {
            0.0
        };
        let mut agg = CheckpointAggregate::new(load_queue_id, &info.name, &transfer_unit);
        agg.record(result, response_time_ms, rate);
        Self::merge_summary(&conn, &agg)?;

        if detail == CheckpointDetail::Full && info.checkpoint_id != 0 {
            conn.execute(
                "UPDATE checkpoints
                 SET response_time_ms = ?1, transfer_size = ?2, result = ?3, ended_at = ?4
                 WHERE id = ?5",
                params![
                    response_time_ms,
                    transfer_size,
                    result.as_i64(),
                    timestamp.to_rfc3339(),
                    info.checkpoint_id
                ],
            )
            .map_err(|e| map_err(e, "checkpoint summary", info.summary_id))?;
        }
        Ok(())
    }

    async fn insert_checkpoint(
        &self,
        row: &CheckpointRow,
        detail: CheckpointDetail,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_checkpoint_inner(&conn, row, detail)
    }

    async fn update_checkpoint_summaries(
        &self,
        aggregates: &[CheckpointAggregate],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        for agg in aggregates {
            Self::merge_summary(&tx, agg)?;
        }
        tx.commit().map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn insert_run_message(&self, run_id: i64, message: &Message) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_message_inner(&conn, "run_messages", "run_id", "run", run_id, message)
    }

    async fn insert_suite_message(&self, suite_id: i64, message: &Message) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_message_inner(&conn, "suite_messages", "suite_id", "suite", suite_id, message)
    }

    async fn insert_testcase_message(
        &self,
        testcase_id: i64,
        message: &Message,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_message_inner(
            &conn,
            "testcase_messages",
            "testcase_id",
            "testcase",
            testcase_id,
            message,
        )
    }

    async fn register_statistic_definition(&self, def: &StatisticDefinition) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO statistic_definitions (name, parent_name, internal_name, unit, params)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (name, parent_name, internal_name, unit, params) DO NOTHING",
            params![def.name, def.parent_name, def.internal_name, def.unit, def.params],
        )
        .map_err(|e| map_err(e, "statistic definition", 0))?;
        conn.query_row(
            "SELECT id FROM statistic_definitions
             WHERE name = ?1 AND parent_name = ?2 AND internal_name = ?3
               AND unit = ?4 AND params = ?5",
            params![def.name, def.parent_name, def.internal_name, def.unit, def.params],
            |row| row.get(0),
        )
        .map_err(|e| map_err(e, "statistic definition", 0))
    }

    async fn insert_system_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_statistics_inner(&conn, testcase_id, "system", sample)
    }

    async fn insert_user_activity_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        Self::insert_statistics_inner(&conn, testcase_id, "user_activity", sample)
    }

    async fn update_machine_info(&self, machine: &str, info: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO machine_info (machine, info, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (machine) DO UPDATE SET info = excluded.info,
                                                 updated_at = excluded.updated_at",
            params![machine, info, Utc::now().to_rfc3339()],
        )
        .map_err(|e| map_err(e, "machine", 0))?;
        Ok(())
    }

    async fn is_run_present(&self, run_id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
            params![run_id],
            |row| row.get(0),
        )
        .map_err(|e| map_err(e, "run", run_id))
    }

    async fn is_suite_present(&self, suite_id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM suites WHERE id = ?1)",
            params![suite_id],
            |row| row.get(0),
        )
        .map_err(|e| map_err(e, "suite", suite_id))
    }

    async fn is_testcase_present(&self, testcase_id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM testcases WHERE id = ?1)",
            params![testcase_id],
            |row| row.get(0),
        )
        .map_err(|e| map_err(e, "testcase", testcase_id))
    }

    async fn flush_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        let result = {
            let mut conn = self.conn.lock().await;
            let tx = match conn.transaction() {
                Ok(tx) => tx,
                Err(e) => return Err(StoreError::Connection(e.to_string())),
            };
            let write_all = || -> StoreResult<()> {
                for (run_id, msg) in &batch.run_messages {
                    Self::insert_message_inner(&tx, "run_messages", "run_id", "run", *run_id, msg)?;
                }
                for (suite_id, msg) in &batch.suite_messages {
                    Self::insert_message_inner(
                        &tx,
                        "suite_messages",
                        "suite_id",
                        "suite",
                        *suite_id,
                        msg,
                    )?;
                }
                for (testcase_id, msg) in &batch.testcase_messages {
                    Self::insert_message_inner(
                        &tx,
                        "testcase_messages",
                        "testcase_id",
                        "testcase",
                        *testcase_id,
                        msg,
                    )?;
                }
                for row in &batch.checkpoints {
                    Self::insert_checkpoint_inner(&tx, row, CheckpointDetail::Full)?;
                }
                Ok(())
            };
            match write_all() {
                Ok(()) => tx.commit().map_err(|e| StoreError::Backend(e.to_string())),
                Err(e) => Err(e), // tx drops here, rolling back
            }
        };
        if result.is_err() {
            self.refresh_connection().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use testpulse_types::MessageLevel;

    async fn temp_gateway() -> (TempDir, SqliteGateway) {
        let tmp = TempDir::new().unwrap();
        let gw = SqliteGateway::open(tmp.path().join("testpulse.db"))
            .await
            .unwrap();
        (tmp, gw)
    }

    fn msg(text: &str) -> Message {
        Message {
            text: text.into(),
            level: MessageLevel::Info,
            escape_html: false,
            machine: "m1".into(),
            thread_name: "main".into(),
            timestamp: Utc::now(),
        }
    }

    fn new_run() -> NewRun {
        NewRun {
            name: "nightly".into(),
            os: "linux".into(),
            product: "gw".into(),
            version: "1.0".into(),
            build: "42".into(),
            host: "exec".into(),
        }
    }

    async fn full_hierarchy(gw: &SqliteGateway) -> (i64, i64, i64, i64) {
        let now = Utc::now();
        let run_id = gw.start_run(&new_run(), now).await.unwrap();
        let suite_id = gw.start_suite(run_id, "auth", "com.example", now).await.unwrap();
        let tc_id = gw
            .start_testcase(suite_id, "login", "", "login_ok", now)
            .await
            .unwrap();
        let queue_id = gw
            .start_load_queue(
                &NewLoadQueue {
                    testcase_id: tc_id,
                    name: "q1".into(),
                    thread_count: 4,
                    threading_pattern: "all-at-once".into(),
                    host: "agent".into(),
                },
                now,
            )
            .await
            .unwrap();
        (run_id, suite_id, tc_id, queue_id)
    }

    #[tokio::test]
    async fn sanity_check_leaves_no_rows() {
        let (_tmp, gw) = temp_gateway().await;
        gw.run_sanity_check().await.unwrap();
        let conn = gw.conn.lock().await;
        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn run_lifecycle_roundtrip() {
        let (_tmp, gw) = temp_gateway().await;
        let now = Utc::now();
        let run_id = gw.start_run(&new_run(), now).await.unwrap();
        assert!(gw.is_run_present(run_id).await.unwrap());

        gw.update_run(
            run_id,
            &RunPatch {
                user_note: Some("rerun".into()),
                ..RunPatch::default()
            },
        )
        .await
        .unwrap();
        gw.end_run(run_id, Utc::now()).await.unwrap();

        let run = gw.get_run(run_id).await.unwrap();
        assert_eq!(run.name, "nightly");
        assert_eq!(run.user_note, "rerun");
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn message_against_deleted_testcase_is_missing_parent() {
        let (_tmp, gw) = temp_gateway().await;
        let (_, _, tc_id, _) = full_hierarchy(&gw).await;
        gw.delete_testcase(tc_id).await.unwrap();
        assert!(!gw.is_testcase_present(tc_id).await.unwrap());

        let err = gw.insert_testcase_message(tc_id, &msg("late")).await.unwrap_err();
        assert!(err.is_missing_parent(), "got {err:?}");
    }

    #[tokio::test]
    async fn deleting_testcase_cascades_to_children() {
        let (_tmp, gw) = temp_gateway().await;
        let (_, _, tc_id, queue_id) = full_hierarchy(&gw).await;
        gw.insert_checkpoint(
            &CheckpointRow {
                load_queue_id: queue_id,
                name: "cp".into(),
                response_time_ms: 5,
                transfer_size: 10,
                transfer_unit: "KB".into(),
                result: CheckpointResult::Passed,
                ended_at: Utc::now(),
            },
            CheckpointDetail::Full,
        )
        .await
        .unwrap();

        gw.delete_testcase(tc_id).await.unwrap();
        let conn = gw.conn.lock().await;
        let checkpoints: i64 = conn
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))
            .unwrap();
        assert_eq!(checkpoints, 0);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_everything() {
        let (_tmp, gw) = temp_gateway().await;
        let (run_id, _, _, _) = full_hierarchy(&gw).await;

        let batch = WriteBatch {
            run_messages: vec![(run_id, msg("ok"))],
            testcase_messages: vec![(999_999, msg("orphan"))],
            ..WriteBatch::default()
        };
        let err = gw.flush_batch(batch).await.unwrap_err();
        assert!(err.is_missing_parent());

        let conn = gw.conn.lock().await;
        let run_msgs: i64 = conn
            .query_row("SELECT COUNT(*) FROM run_messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(run_msgs, 0, "good rows of a failed batch must not land");
    }

    #[tokio::test]
    async fn checkpoint_pair_updates_summary() {
        let (_tmp, gw) = temp_gateway().await;
        let (_, _, _, queue_id) = full_hierarchy(&gw).await;
        let started = Utc::now();
        let info = gw
            .start_checkpoint(queue_id, "login", "KB", CheckpointDetail::Full, started)
            .await
            .unwrap();
        assert!(info.checkpoint_id > 0);

        gw.end_checkpoint(&info, 40, 80, CheckpointResult::Passed, CheckpointDetail::Full, Utc::now())
            .await
            .unwrap();

        let conn = gw.conn.lock().await;
        let (passed, min_rt): (i64, i64) = conn
            .query_row(
                "SELECT num_passed, min_response_time_ms FROM checkpoint_summaries
                 WHERE id = ?1",
                params![info.summary_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(passed, 1);
        assert_eq!(min_rt, 40);
    }

    #[tokio::test]
    async fn short_detail_skips_checkpoint_rows() {
        let (_tmp, gw) = temp_gateway().await;
        let (_, _, _, queue_id) = full_hierarchy(&gw).await;
        let info = gw
            .start_checkpoint(queue_id, "login", "", CheckpointDetail::Short, Utc::now())
            .await
            .unwrap();
        assert_eq!(info.checkpoint_id, 0);
        gw.end_checkpoint(&info, 7, 0, CheckpointResult::Passed, CheckpointDetail::Short, Utc::now())
            .await
            .unwrap();

        let conn = gw.conn.lock().await;
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn summary_merge_accumulates_across_flushes() {
        let (_tmp, gw) = temp_gateway().await;
        let (_, _, _, queue_id) = full_hierarchy(&gw).await;

        let mut first = CheckpointAggregate::new(queue_id, "cp", "KB");
        first.record(CheckpointResult::Passed, 10, 100.0);
        first.record(CheckpointResult::Passed, 20, 200.0);
        gw.update_checkpoint_summaries(std::slice::from_ref(&first))
            .await
            .unwrap();

        let mut second = CheckpointAggregate::new(queue_id, "cp", "KB");
        second.record(CheckpointResult::Passed, 40, 400.0);
        second.record(CheckpointResult::Failed, 1, 0.0);
        gw.update_checkpoint_summaries(std::slice::from_ref(&second))
            .await
            .unwrap();

        let conn = gw.conn.lock().await;
        let (passed, failed, min_rt, avg_rt, max_rt): (i64, i64, i64, f64, i64) = conn
            .query_row(
                "SELECT num_passed, num_failed, min_response_time_ms,
                        avg_response_time_ms, max_response_time_ms
                 FROM checkpoint_summaries WHERE load_queue_id = ?1 AND name = 'cp'",
                params![queue_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!((passed, failed), (3, 1));
        assert_eq!((min_rt, max_rt), (10, 40));
        assert!((avg_rt - 70.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn machine_info_upserts_by_machine() {
        let (_tmp, gw) = temp_gateway().await;
        gw.update_machine_info("agent-01", "{\"cpus\":4}").await.unwrap();
        gw.update_machine_info("agent-01", "{\"cpus\":8}").await.unwrap();

        let conn = gw.conn.lock().await;
        let (rows, info): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(info) FROM machine_info WHERE machine = 'agent-01'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(info, "{\"cpus\":8}");
    }

    #[tokio::test]
    async fn statistic_definition_registration_is_idempotent() {
        let (_tmp, gw) = temp_gateway().await;
        let def = StatisticDefinition {
            name: "cpu".into(),
            parent_name: "".into(),
            internal_name: "cpu_total".into(),
            unit: "%".into(),
            params: "".into(),
        };
        let first = gw.register_statistic_definition(&def).await.unwrap();
        let second = gw.register_statistic_definition(&def).await.unwrap();
        assert_eq!(first, second);
    }
}
