//! Metric sinks and ROC artifacts.
//!
//! A metric is a named scalar; each sink numbers the records of one name
//! 0, 1, 2, ... in arrival order.

use chrono::Utc;
use facetrain_core::evaluator::RocPoint;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for scalar training metrics.
pub trait MetricSink {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError>;
}

fn next_step(steps: &mut HashMap<String, u64>, name: &str) -> u64 {
    let slot = steps.entry(name.to_string()).or_insert(0);
    let step = *slot;
    *slot += 1;
    step
}

// --- SQLite ---

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    name TEXT NOT NULL,
    step INTEGER NOT NULL,
    value REAL NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_name_step ON metrics(name, step);
";

/// Appends `(name, step, value, recorded_at)` rows to a SQLite file.
///
/// Reopening an existing file continues every name's step counter after its
/// highest stored step, so a resumed run extends the same series.
pub struct SqliteSink {
    conn: Connection,
    steps: HashMap<String, u64>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, MetricError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, MetricError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MetricError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let steps = {
            let mut stmt = conn.prepare("SELECT name, MAX(step) FROM metrics GROUP BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut steps = HashMap::new();
            for row in rows {
                let (name, max) = row?;
                steps.insert(name, max as u64 + 1);
            }
            steps
        };
        Ok(Self { conn, steps })
    }

    /// `(step, value)` pairs of one metric, by step.
    pub fn series(&self, name: &str) -> Result<Vec<(u64, f64)>, MetricError> {
        let mut stmt = self
            .conn
            .prepare("SELECT step, value FROM metrics WHERE name = ?1 ORDER BY step")?;
        let rows = stmt.query_map([name], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl MetricSink for SqliteSink {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        let step = next_step(&mut self.steps, name);
        self.conn.execute(
            "INSERT INTO metrics (name, step, value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, step as i64, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Logs every record at debug level.
#[derive(Debug, Default)]
pub struct TracingSink {
    steps: HashMap<String, u64>,
}

impl MetricSink for TracingSink {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        let step = next_step(&mut self.steps, name);
        tracing::debug!(metric = name, step, value, "metric");
        Ok(())
    }
}

/// Keeps records in memory, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<(String, f64)>,
}

impl MemorySink {
    pub fn records(&self) -> &[(String, f64)] {
        &self.records
    }

    /// Values of one metric, in arrival order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(n, _)| n == name)
            .map(|&(_, v)| v)
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        self.records.push((name.to_string(), value));
        Ok(())
    }
}

/// Forwards each record to every inner sink.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn MetricSink + Send>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricSink for Fanout {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        for sink in &mut self.sinks {
            sink.record(name, value)?;
        }
        Ok(())
    }
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        (**self).record(name, value)
    }
}

/// Write ROC points as a pretty JSON array.
pub fn write_roc(path: &Path, points: &[RocPoint]) -> Result<(), MetricError> {
    let json = serde_json::to_string_pretty(points)?;
    std::fs::write(path, json).map_err(|source| MetricError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), points = points.len(), "ROC points written");
    Ok(())
}
