use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};

use super::{Record, SystemStats};
use crate::inference::InferenceResult;
use crate::DeploymentId;

/// Append-only persistence for sink records.
pub trait ResultStore: Send {
    fn append(&mut self, records: &[Record]) -> Result<()>;

    /// Timestamp of the newest persisted inference result.
    fn last_inference_timestamp(&self) -> Result<Option<u64>>;

    /// Inference results with `timestamp_ms > since_ms`, oldest first.
    fn inferences_since(&self, since_ms: u64) -> Result<Vec<InferenceResult>>;

    fn event_count(&self) -> Result<usize>;
}

pub struct SqliteResultStore {
    conn: Connection,
}

impl SqliteResultStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              event TEXT NOT NULL,
              load_avg REAL,
              mem_percent REAL,
              swap_percent REAL
            );

            CREATE TABLE IF NOT EXISTS inference_results (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              deployment_id INTEGER NOT NULL,
              class TEXT NOT NULL,
              confidence REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_ts ON inference_results(timestamp_ms);
            "#,
        )?;
        Ok(())
    }
}

fn to_sql_ts(timestamp_ms: u64) -> Result<i64> {
    i64::try_from(timestamp_ms).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

impl ResultStore for SqliteResultStore {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for record in records {
            match record {
                Record::Event {
                    timestamp_ms,
                    event,
                    stats,
                } => {
                    tx.execute(
                        r#"
                        INSERT INTO node_events(timestamp_ms, event, load_avg, mem_percent, swap_percent)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                        params![
                            to_sql_ts(*timestamp_ms)?,
                            event,
                            stats.load_avg,
                            stats.mem_percent,
                            stats.swap_percent
                        ],
                    )?;
                }
                Record::Inference(result) => {
                    let deployment_id = i64::try_from(result.deployment.0)
                        .map_err(|_| anyhow!("deployment id exceeds i64 range"))?;
                    tx.execute(
                        r#"
                        INSERT INTO inference_results(timestamp_ms, deployment_id, class, confidence)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                        params![
                            to_sql_ts(result.timestamp_ms)?,
                            deployment_id,
                            result.class,
                            result.confidence
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn last_inference_timestamp(&self) -> Result<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT MAX(timestamp_ms) FROM inference_results")?;
        let latest: Option<i64> = stmt.query_row([], |row| row.get(0))?;
        Ok(latest.map(|ts| ts.max(0) as u64))
    }

    fn inferences_since(&self, since_ms: u64) -> Result<Vec<InferenceResult>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp_ms, deployment_id, class, confidence
            FROM inference_results
            WHERE timestamp_ms > ?1
            ORDER BY timestamp_ms ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![to_sql_ts(since_ms)?], |row| {
            let timestamp: i64 = row.get(0)?;
            let deployment: i64 = row.get(1)?;
            Ok(InferenceResult {
                timestamp_ms: timestamp.max(0) as u64,
                deployment: DeploymentId(deployment.max(0) as u64),
                class: row.get(2)?,
                confidence: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn event_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM node_events", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

/// Store kept in memory; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryResultStore {
    events: Vec<(u64, String, SystemStats)>,
    inferences: Vec<InferenceResult>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|(_, event, _)| event.as_str())
    }
}

impl ResultStore for InMemoryResultStore {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        for record in records {
            match record {
                Record::Event {
                    timestamp_ms,
                    event,
                    stats,
                } => self.events.push((*timestamp_ms, event.clone(), stats.clone())),
                Record::Inference(result) => self.inferences.push(result.clone()),
            }
        }
        Ok(())
    }

    fn last_inference_timestamp(&self) -> Result<Option<u64>> {
        Ok(self.inferences.iter().map(|r| r.timestamp_ms).max())
    }

    fn inferences_since(&self, since_ms: u64) -> Result<Vec<InferenceResult>> {
        let mut out: Vec<InferenceResult> = self
            .inferences
            .iter()
            .filter(|r| r.timestamp_ms > since_ms)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp_ms);
        Ok(out)
    }

    fn event_count(&self) -> Result<usize> {
        Ok(self.events.len())
    }
}
