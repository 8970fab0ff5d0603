use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    Environment, Flavor, FlavorSummary, Metadata, MetricsSummary, RunDetails, RunStatus,
    StoredMetric, TestRunMetrics,
};
use crate::config::ROLLING_WINDOW;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, test_id, test_name, suite_name, timestamp, environment, status,
    duration_ms, retry_count, details, metadata, created_at";

/// SQLite-backed store with one table per flavor.
///
/// Inserts go through a single writer connection. Reads open their own
/// read-only connection so listing and summaries never queue behind writes.
pub struct MetricsDb {
    writer: Mutex<Connection>,
    db_path: PathBuf,
}

impl MetricsDb {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            writer: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        db.init_schema()?;
        info!("Opened metrics database at {:?}", db_path);
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-insert leaves nothing half-written, so the connection
        // is still usable after poisoning.
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.writer();
        for flavor in [Flavor::Api, Flavor::E2e] {
            conn.execute_batch(&schema_sql(flavor.table()))?;
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist one record, assigning its row id and creation time.
    pub fn save<D: RunDetails>(&self, record: &TestRunMetrics<D>) -> anyhow::Result<StoredMetric<D>> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let mut record = record.clone();
        record.status = D::normalize_status(record.status);

        // Non-finite floats serialize as `null`; refuse rows `list` could not decode.
        let details = serde_json::to_string(&record.details)?;
        serde_json::from_str::<D>(&details).with_context(|| {
            format!(
                "{} metrics for {} contain a non-finite number",
                D::FLAVOR.label(),
                record.test_name
            )
        })?;
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let table = D::FLAVOR.table();

        let conn = self.writer();
        conn.execute(
            &format!(
                "INSERT INTO {table} ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                id,
                record.test_id,
                record.test_name,
                record.suite_name,
                sortable_timestamp(&record.timestamp),
                record.environment.as_str(),
                record.status.as_str(),
                i64::try_from(record.duration)?,
                i64::try_from(record.retry_count)?,
                details,
                metadata,
                sortable_timestamp(&created_at),
            ],
        )?;
        drop(conn);

        debug!(
            "{} metrics saved: {} ({})",
            D::FLAVOR.label(),
            record.test_name,
            id
        );
        Ok(StoredMetric {
            id,
            record,
            created_at,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// One page of records, newest client timestamp first.
    pub fn list<D: RunDetails>(&self, limit: u32, offset: u64) -> anyhow::Result<Vec<StoredMetric<D>>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {}
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1 OFFSET ?2",
            D::FLAVOR.table()
        ))?;
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![i64::from(limit), offset], RawRow::from_row)?;

        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?.into_stored()?);
        }
        Ok(metrics)
    }

    pub fn flavor_summary(&self, flavor: Flavor) -> anyhow::Result<FlavorSummary> {
        let mut conn = self.reader()?;
        // One read transaction so the count and the sample see the same snapshot.
        let tx = conn.transaction()?;
        let count: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", flavor.table()),
            [],
            |row| row.get(0),
        )?;
        let sample = {
            let mut stmt = tx.prepare(&format!(
                "SELECT status FROM {}
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?1",
                flavor.table()
            ))?;
            let statuses = stmt.query_map(params![ROLLING_WINDOW as i64], |row| {
                row.get::<_, String>(0)
            })?;
            statuses
                .map(|status| status.map(RunStatus::from))
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        Ok(FlavorSummary {
            count: u64::try_from(count).unwrap_or(0),
            rolling_pass_rate: rolling_pass_rate(&sample),
        })
    }

    pub fn summary(&self) -> anyhow::Result<MetricsSummary> {
        let api = self.flavor_summary(Flavor::Api)?;
        let e2e = self.flavor_summary(Flavor::E2e)?;
        Ok(MetricsSummary {
            total_api_metrics: api.count,
            total_e2e_metrics: e2e.count,
            latest_api_pass_rate: api.rolling_pass_rate,
            latest_e2e_pass_rate: e2e.rolling_pass_rate,
            last_updated: Utc::now(),
        })
    }
}

/// Percentage of `passed` runs in the sample, rounded; 0 for an empty sample.
pub fn rolling_pass_rate(sample: &[RunStatus]) -> u32 {
    if sample.is_empty() {
        return 0;
    }
    let passed = sample.iter().filter(|s| **s == RunStatus::Passed).count();
    ((passed as f64 / sample.len() as f64) * 100.0).round() as u32
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn sortable_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn schema_sql(table: &str) -> String {
    format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            test_name TEXT NOT NULL,
            suite_name TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            environment TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            details TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_{table}_test_id ON {table}(test_id);
        CREATE INDEX IF NOT EXISTS idx_{table}_name_created ON {table}(test_name, created_at);
        CREATE INDEX IF NOT EXISTS idx_{table}_status_created ON {table}(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_{table}_environment ON {table}(environment);
        CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
    "
    )
}

struct RawRow {
    id: String,
    test_id: String,
    test_name: String,
    suite_name: String,
    timestamp: String,
    environment: String,
    status: String,
    duration_ms: i64,
    retry_count: i64,
    details: String,
    metadata: Option<String>,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            test_id: row.get(1)?,
            test_name: row.get(2)?,
            suite_name: row.get(3)?,
            timestamp: row.get(4)?,
            environment: row.get(5)?,
            status: row.get(6)?,
            duration_ms: row.get(7)?,
            retry_count: row.get(8)?,
            details: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_stored<D: RunDetails>(self) -> anyhow::Result<StoredMetric<D>> {
        let details: D = serde_json::from_str(&self.details)?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<Metadata>)
            .transpose()?;

        Ok(StoredMetric {
            id: self.id,
            record: TestRunMetrics {
                test_id: self.test_id,
                test_name: self.test_name,
                suite_name: self.suite_name,
                timestamp: parse_timestamp(&self.timestamp)?,
                environment: Environment::from(self.environment),
                status: RunStatus::from(self.status),
                duration: u64::try_from(self.duration_ms).unwrap_or(0),
                retry_count: u64::try_from(self.retry_count).unwrap_or(0),
                details,
                metadata,
            },
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
