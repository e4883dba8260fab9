use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use weft_core::{
    NodeResult, Result, Run, RunId, RunSink, RunStatus, RunSummary, TransformRecord, WeftError,
};

use crate::{db_err, open_connection};

/// Append-only run history in SQLite.
///
/// One row per run, one row per node result (unique per run and node) and
/// one row per transform record. Rows are read back in insertion order.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                 id TEXT PRIMARY KEY,
                 chain_id TEXT,
                 chain_json TEXT NOT NULL,
                 catalog_version TEXT NOT NULL,
                 status TEXT NOT NULL,
                 total_cost REAL NOT NULL DEFAULT 0,
                 started_at TEXT NOT NULL,
                 completed_at TEXT,
                 error_json TEXT
             );

             CREATE TABLE IF NOT EXISTS node_results (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL REFERENCES runs(id),
                 node_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 result_json TEXT NOT NULL,
                 UNIQUE(run_id, node_id)
             );

             CREATE TABLE IF NOT EXISTS transform_records (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL REFERENCES runs(id),
                 edge_id TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 method TEXT NOT NULL,
                 record_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at DESC);
             CREATE INDEX IF NOT EXISTS idx_transforms_run ON transform_records(run_id, seq);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WeftError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_status(s: &str) -> Result<RunStatus> {
    RunStatus::parse(s).ok_or_else(|| WeftError::Database(format!("bad run status '{}'", s)))
}

/// Reject writes to runs that do not exist or are already terminal.
fn ensure_open(conn: &Connection, run_id: &str) -> Result<()> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match status {
        None => Err(WeftError::RunNotFound(run_id.to_string())),
        Some(s) if parse_status(&s)?.is_terminal() => Err(WeftError::RunSealed(run_id.to_string())),
        Some(_) => Ok(()),
    }
}

impl RunSink for SqliteRunStore {
    fn begin_run(&self, run: Run) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let chain_json = serde_json::to_string(&run.chain)?;
            let conn = self.lock()?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT status FROM runs WHERE id = ?1",
                    params![run.id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(status) = existing {
                if parse_status(&status)?.is_terminal() {
                    return Err(WeftError::RunSealed(run.id.to_string()));
                }
                for table in ["node_results", "transform_records", "runs"] {
                    let column = if table == "runs" { "id" } else { "run_id" };
                    conn.execute(
                        &format!("DELETE FROM {} WHERE {} = ?1", table, column),
                        params![run.id.as_str()],
                    )
                    .map_err(db_err)?;
                }
            }

            conn.execute(
                "INSERT INTO runs (id, chain_id, chain_json, catalog_version, status, total_cost, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    run.id.as_str(),
                    run.chain.id,
                    chain_json,
                    run.catalog_version,
                    run.status.as_str(),
                    timestamp(&run.started_at),
                ],
            )
            .map_err(db_err)?;
            debug!(run_id = %run.id, "Run row created");
            Ok(())
        })
    }

    fn record_transform(&self, record: TransformRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let record_json = serde_json::to_string(&record)?;
            let conn = self.lock()?;
            ensure_open(&conn, record.run_id.as_str())?;
            conn.execute(
                "INSERT INTO transform_records (run_id, edge_id, node_id, method, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.run_id.as_str(),
                    record.edge_id,
                    record.node_id,
                    record.method.as_str(),
                    record_json,
                ],
            )
            .map_err(db_err)?;
            conn.execute(
                "UPDATE runs SET total_cost = total_cost + ?1 WHERE id = ?2",
                params![record.cost, record.run_id.as_str()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn record_node(&self, run_id: RunId, result: NodeResult) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let result_json = serde_json::to_string(&result)?;
            let status = match result.status {
                weft_core::NodeStatus::Succeeded => "succeeded",
                weft_core::NodeStatus::Failed => "failed",
            };
            let conn = self.lock()?;
            ensure_open(&conn, run_id.as_str())?;
            conn.execute(
                "INSERT INTO node_results (run_id, node_id, status, result_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id.as_str(), result.node_id, status, result_json],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == ErrorCode::ConstraintViolation =>
                {
                    WeftError::DuplicateNodeResult {
                        run_id: run_id.to_string(),
                        node_id: result.node_id.clone(),
                    }
                }
                other => db_err(other),
            })?;
            conn.execute(
                "UPDATE runs SET total_cost = total_cost + ?1 WHERE id = ?2",
                params![result.cost, run_id.as_str()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn finish_run(&self, run: Run) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let error_json = run.error.as_ref().map(serde_json::to_string).transpose()?;
            let conn = self.lock()?;
            ensure_open(&conn, run.id.as_str())?;
            conn.execute(
                "UPDATE runs SET status = ?1, completed_at = ?2, error_json = ?3 WHERE id = ?4",
                params![
                    run.status.as_str(),
                    run.completed_at.as_ref().map(timestamp),
                    error_json,
                    run.id.as_str(),
                ],
            )
            .map_err(db_err)?;
            debug!(run_id = %run.id, status = %run.status, "Run sealed");
            Ok(())
        })
    }

    fn load_run(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let header = conn
                .query_row(
                    "SELECT chain_json, catalog_version, status, total_cost, started_at, completed_at, error_json
                     FROM runs WHERE id = ?1",
                    params![run_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            let Some((chain_json, catalog_version, status, total_cost, started_at, completed_at, error_json)) =
                header
            else {
                return Ok(None);
            };

            let node_results = {
                let mut stmt = conn
                    .prepare("SELECT result_json FROM node_results WHERE run_id = ?1 ORDER BY seq")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![run_id.as_str()], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                let mut results = Vec::new();
                for row in rows {
                    results.push(serde_json::from_str::<NodeResult>(&row.map_err(db_err)?)?);
                }
                results
            };

            let transforms = {
                let mut stmt = conn
                    .prepare("SELECT record_json FROM transform_records WHERE run_id = ?1 ORDER BY seq")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![run_id.as_str()], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(serde_json::from_str::<TransformRecord>(&row.map_err(db_err)?)?);
                }
                records
            };

            Ok(Some(Run {
                id: run_id,
                chain: serde_json::from_str(&chain_json)?,
                catalog_version,
                status: parse_status(&status)?,
                node_results,
                transforms,
                total_cost,
                started_at: parse_timestamp(&started_at)?,
                completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
                error: error_json.as_deref().map(serde_json::from_str).transpose()?,
            }))
        })
    }

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT r.id, r.chain_id, r.status, r.total_cost, r.started_at, r.completed_at, r.error_json,
                            (SELECT COUNT(*) FROM node_results n WHERE n.run_id = r.id)
                     FROM runs r
                     ORDER BY r.started_at DESC, r.rowid DESC
                     LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })
                .map_err(db_err)?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, chain_id, status, total_cost, started_at, completed_at, error_json, count) =
                    row.map_err(db_err)?;
                summaries.push(RunSummary {
                    id: RunId::from_str(&id),
                    chain_id,
                    status: parse_status(&status)?,
                    total_cost,
                    nodes_recorded: count as usize,
                    started_at: parse_timestamp(&started_at)?,
                    completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
                    error: error_json.as_deref().map(serde_json::from_str).transpose()?,
                });
            }
            Ok(summaries)
        })
    }
}
