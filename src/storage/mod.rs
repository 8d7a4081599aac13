//! SQLite storage layer -- a small key/value store with categories, tags and
//! expiry, used to persist run results.

pub mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scheduler::RunResult;
use crate::stages::ExecutionStatus;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

pub const TEST_RESULT_CATEGORY: &str = "test_result";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory pool (each in-memory connection is its own database).
pub fn open_memory_pool() -> Result<Pool> {
    let pool = R2D2Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in store: {}", raw))?
        .with_timezone(&Utc))
}

/// A record to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub category: String,
    pub priority: i64,
    pub tags: Vec<String>,
    /// Records past their TTL are invisible to queries and removed by
    /// [`ResultStore::purge_expired`].
    pub ttl: Option<Duration>,
}

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub category: String,
    pub priority: i64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Query criteria; every set field must match. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub key: Option<String>,
    pub category: Option<String>,
    /// All of these tags must be present.
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The persistence collaborator used by the framework. Blocking; async callers
/// go through `spawn_blocking`.
pub trait ResultStore: Send + Sync {
    /// Insert or replace the record stored under `record.key`.
    fn store(&self, record: StoreRecord) -> Result<()>;
    fn query(&self, filter: &QueryFilter) -> Result<Vec<StoredRecord>>;
    /// Returns whether a record was removed.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Remove expired records, returning how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// [`ResultStore`] backed by the pooled SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_pool()?))
    }
}

impl ResultStore for SqliteStore {
    fn store(&self, record: StoreRecord) -> Result<()> {
        let conn = self.pool.get()?;
        let now = Utc::now();
        let expires_at = match record.ttl {
            Some(ttl) => Some(timestamp(now + chrono::Duration::from_std(ttl)?)),
            None => None,
        };
        conn.execute(
            "INSERT INTO records (key, category, priority, tags_json, value_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                category = excluded.category,
                priority = excluded.priority,
                tags_json = excluded.tags_json,
                value_json = excluded.value_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            params![
                record.key,
                record.category,
                record.priority,
                serde_json::to_string(&record.tags)?,
                serde_json::to_string(&record.value)?,
                timestamp(now),
                expires_at,
            ],
        )?;
        debug!(key = %record.key, category = %record.category, "stored record");
        Ok(())
    }

    fn query(&self, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT key, category, priority, tags_json, value_json, created_at, expires_at
             FROM records
             WHERE (?1 IS NULL OR key = ?1)
               AND (?2 IS NULL OR category = ?2)
               AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(
            params![filter.key, filter.category, timestamp(Utc::now())],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (key, category, priority, tags_json, value_json, created_at, expires_at) = row?;
            let tags: Vec<String> = serde_json::from_str(&tags_json)
                .with_context(|| format!("bad tags for record {}", key))?;
            if !filter.tags.iter().all(|t| tags.contains(t)) {
                continue;
            }
            records.push(StoredRecord {
                value: serde_json::from_str(&value_json)
                    .with_context(|| format!("bad value for record {}", key))?,
                key,
                category,
                priority,
                tags,
                created_at: parse_timestamp(&created_at)?,
                expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
            });
            if filter.limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
        }
        Ok(records)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![timestamp(Utc::now())],
        )?;
        Ok(removed)
    }
}

pub fn run_key(run_id: &str) -> String {
    format!("{}:{}", TEST_RESULT_CATEGORY, run_id)
}

/// Store record for a finalized run: keyed by run id, tagged with the result
/// category, overall status and run kind.
pub fn run_record(run: &RunResult, retention: Duration) -> Result<StoreRecord> {
    Ok(StoreRecord {
        key: run_key(&run.run_id),
        value: serde_json::to_value(run).context("failed to serialize run result")?,
        category: TEST_RESULT_CATEGORY.to_string(),
        priority: if run.status.is_success() { 0 } else { 1 },
        tags: vec![
            TEST_RESULT_CATEGORY.to_string(),
            run.status.as_str().to_string(),
            run.kind.as_str().to_string(),
        ],
        ttl: Some(retention),
    })
}

/// Persisted runs, newest first.
pub fn load_runs(
    store: &dyn ResultStore,
    limit: usize,
    status: Option<ExecutionStatus>,
) -> Result<Vec<RunResult>> {
    let mut filter = QueryFilter::default()
        .category(TEST_RESULT_CATEGORY)
        .limit(limit);
    if let Some(status) = status {
        filter = filter.tag(status.as_str());
    }
    let mut runs = Vec::new();
    for record in store.query(&filter)? {
        match serde_json::from_value::<RunResult>(record.value) {
            Ok(run) => runs.push(run),
            Err(e) => warn!(key = %record.key, error = %e, "skipping undecodable run record"),
        }
    }
    Ok(runs)
}

/// A single persisted run by id.
pub fn load_run(store: &dyn ResultStore, run_id: &str) -> Result<Option<RunResult>> {
    let filter = QueryFilter::default().key(run_key(run_id)).limit(1);
    store
        .query(&filter)?
        .into_iter()
        .next()
        .map(|record| serde_json::from_value(record.value).context("failed to decode run result"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{RunConfiguration, RunKind};
    use crate::stages::{StageKind, StageResult};

    fn record(key: &str, tags: &[&str], ttl: Option<Duration>) -> StoreRecord {
        StoreRecord {
            key: key.to_string(),
            value: serde_json::json!({ "key": key }),
            category: "test_result".to_string(),
            priority: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ttl,
        }
    }

    #[test]
    fn test_store_query_delete() {
        let store = SqliteStore::in_memory().unwrap();
        store.store(record("a", &["test_result", "passed"], None)).unwrap();
        store.store(record("b", &["test_result", "failed"], None)).unwrap();

        let all = store.query(&QueryFilter::default().category("test_result")).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "b");

        let failed = store.query(&QueryFilter::default().tag("failed")).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].value["key"], "b");

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.query(&QueryFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_store_replaces_existing_key() {
        let store = SqliteStore::in_memory().unwrap();
        store.store(record("a", &["old"], None)).unwrap();
        store.store(record("a", &["new"], None)).unwrap();
        let rows = store.query(&QueryFilter::default().key("a")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tags, vec!["new".to_string()]);
    }

    #[test]
    fn test_expired_records_hidden_and_purged() {
        let store = SqliteStore::in_memory().unwrap();
        store.store(record("gone", &[], Some(Duration::ZERO))).unwrap();
        store.store(record("kept", &[], Some(Duration::from_secs(3600)))).unwrap();

        let visible = store.query(&QueryFilter::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].key, "kept");
        assert!(visible[0].expires_at.is_some());

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_run_round_trip_through_store() {
        let store = SqliteStore::in_memory().unwrap();
        let mut run = RunResult::begin("abc", RunKind::Comprehensive, Some("todo".into()), RunConfiguration::default());
        let mut cli = StageResult::begin(StageKind::Cli);
        cli.passed = 5;
        run.finalize(vec![cli.finish()]);

        let rec = run_record(&run, Duration::from_secs(60)).unwrap();
        assert_eq!(rec.key, "test_result:abc");
        assert_eq!(rec.tags, vec!["test_result", "passed", "comprehensive"]);
        store.store(rec).unwrap();

        let loaded = load_runs(&store, 10, Some(ExecutionStatus::Passed)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id, "abc");
        assert_eq!(loaded[0].counts.passed, 5);
        assert_eq!(loaded[0].stages[0].stage, StageKind::Cli);
        assert!(load_runs(&store, 10, Some(ExecutionStatus::Failed)).unwrap().is_empty());
        assert_eq!(load_run(&store, "abc").unwrap().map(|r| r.project_id), Some(Some("todo".to_string())));
        assert!(load_run(&store, "zzz").unwrap().is_none());
    }

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("autobuild.db");
        let pool = open_pool(&path).unwrap();
        assert!(path.exists());
        let count: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
