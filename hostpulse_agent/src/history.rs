//! Metric history: durable SQLite log with pre-aggregated buckets, plus a
//! bounded in-memory ring used as a fallback when the durable store has no
//! rows for a requested range. Telemetry loss is preferred over blocking the
//! push path, so every durable write is best-effort.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

const RING_CAP: usize = 10_000;
const DB_FILE: &str = "metrics.db";

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS metrics (
  ts INTEGER NOT NULL,
  cpu REAL NULL,
  mem_total INTEGER NULL,
  mem_used INTEGER NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(ts);

CREATE TABLE IF NOT EXISTS metrics_10s (
  ts INTEGER NOT NULL PRIMARY KEY, -- bucket end timestamp (ms)
  cpu REAL NULL,
  mem_total INTEGER NULL,
  mem_used INTEGER NULL
);

CREATE TABLE IF NOT EXISTS metrics_1m (
  ts INTEGER NOT NULL PRIMARY KEY, -- bucket end timestamp (ms)
  cpu REAL NULL,
  mem_total INTEGER NULL,
  mem_used INTEGER NULL
);
";

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub ts: i64,
    pub cpu: Option<f64>,
    pub mem_total: Option<i64>,
    pub mem_used: Option<i64>,
}

/// Bucket-end alignment: the bucket key is the next multiple of `bucket_ms`
/// at or after `ts`.
pub fn bucket_end(ts: i64, bucket_ms: i64) -> i64 {
    ((ts - 1) / bucket_ms + 1) * bucket_ms
}

/// Bucket granularity for a named aggregation level, if recognized.
pub fn agg_bucket_ms(agg: &str) -> Option<i64> {
    match agg {
        "10s" => Some(10_000),
        "1m" => Some(60_000),
        _ => None,
    }
}

/// Last-value-wins downsample: one representative row per bucket, keyed and
/// timestamped by the bucket end.
pub fn downsample(rows: &[HistoryRecord], bucket_ms: i64) -> Vec<HistoryRecord> {
    let mut buckets: BTreeMap<i64, HistoryRecord> = BTreeMap::new();
    for r in rows {
        let key = bucket_end(r.ts, bucket_ms);
        let mut rep = r.clone();
        rep.ts = key;
        buckets.insert(key, rep);
    }
    buckets.into_values().collect()
}

pub struct HistoryStore {
    db_path: Option<PathBuf>,
    ring: Mutex<VecDeque<HistoryRecord>>,
}

impl HistoryStore {
    /// Open the store under `dir` (creating it and the schema); `None` keeps
    /// only the in-memory ring.
    pub fn open(dir: Option<&Path>) -> Result<Arc<Self>> {
        let db_path = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create history dir {}", dir.display()))?;
                let path = dir.join(DB_FILE);
                let conn = Connection::open(&path)
                    .with_context(|| format!("open {}", path.display()))?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                conn.execute_batch(SCHEMA)?;
                info!(path = %path.display(), "history store initialized");
                Some(path)
            }
            None => {
                info!("history store running ring-only (no durable path)");
                None
            }
        };
        Ok(Arc::new(Self {
            db_path,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAP)),
        }))
    }

    fn connect(&self) -> Option<rusqlite::Result<Connection>> {
        self.db_path.as_ref().map(|p| Connection::open(p))
    }

    /// Append to the ring and fire-and-forget the durable write. Never fails;
    /// persistence errors are logged and swallowed.
    pub fn append(self: &Arc<Self>, rec: HistoryRecord) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == RING_CAP {
                ring.pop_front();
            }
            ring.push_back(rec.clone());
        }
        if self.db_path.is_none() {
            return;
        }
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.append_durable(&rec) {
                warn!("history append failed (ignored): {e:#}");
            }
        });
    }

    /// Raw insert plus last-value-wins upserts into the aggregation tables.
    pub fn append_durable(&self, rec: &HistoryRecord) -> Result<()> {
        let Some(conn) = self.connect() else {
            return Ok(());
        };
        let conn = conn?;
        conn.execute(
            "INSERT INTO metrics(ts, cpu, mem_total, mem_used) VALUES (?1, ?2, ?3, ?4)",
            params![rec.ts, rec.cpu, rec.mem_total, rec.mem_used],
        )?;
        for (table, bucket_ms) in [("metrics_10s", 10_000), ("metrics_1m", 60_000)] {
            let ts = bucket_end(rec.ts, bucket_ms);
            conn.execute(
                &format!(
                    "INSERT INTO {table}(ts, cpu, mem_total, mem_used) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(ts) DO UPDATE SET cpu=excluded.cpu, \
                     mem_total=excluded.mem_total, mem_used=excluded.mem_used"
                ),
                params![ts, rec.cpu, rec.mem_total, rec.mem_used],
            )?;
        }
        Ok(())
    }

    /// Raw rows in `[from_ts, to_ts]`, ts-ascending. Read failures degrade to
    /// an empty result (the caller falls back to the ring).
    pub fn query_raw(&self, from_ts: i64, to_ts: i64) -> Vec<HistoryRecord> {
        self.query_table("metrics", from_ts, to_ts)
    }

    /// Pre-aggregated rows; an unknown `agg` level falls back to raw rows.
    pub fn query_agg(&self, agg: &str, from_ts: i64, to_ts: i64) -> Vec<HistoryRecord> {
        let table = match agg {
            "10s" => "metrics_10s",
            "1m" => "metrics_1m",
            _ => return self.query_raw(from_ts, to_ts),
        };
        self.query_table(table, from_ts, to_ts)
    }

    fn query_table(&self, table: &str, from_ts: i64, to_ts: i64) -> Vec<HistoryRecord> {
        let Some(conn) = self.connect() else {
            return Vec::new();
        };
        let run = || -> Result<Vec<HistoryRecord>> {
            let conn = conn?;
            let mut stmt = conn.prepare(&format!(
                "SELECT ts, cpu, mem_total, mem_used FROM {table} \
                 WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC"
            ))?;
            let rows = stmt.query_map(params![from_ts, to_ts], |row| {
                Ok(HistoryRecord {
                    ts: row.get(0)?,
                    cpu: row.get(1)?,
                    mem_total: row.get(2)?,
                    mem_used: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        };
        match run() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("history query failed ({table}): {e:#}");
                Vec::new()
            }
        }
    }

    /// Recent rows from the in-memory ring within `[from_ts, to_ts]`.
    pub fn ring_slice(&self, from_ts: i64, to_ts: i64) -> Vec<HistoryRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .filter(|r| r.ts >= from_ts && r.ts <= to_ts)
            .cloned()
            .collect()
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Test hook: drop ring contents.
    pub fn reset_ring(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.clear();
        debug!("history ring reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ts: i64, cpu: f64) -> HistoryRecord {
        HistoryRecord {
            ts,
            cpu: Some(cpu),
            mem_total: Some(16_000),
            mem_used: Some(8_000),
        }
    }

    fn durable_store() -> (tempfile::TempDir, Arc<HistoryStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(Some(dir.path())).expect("open");
        (dir, store)
    }

    #[test]
    fn bucket_end_alignment() {
        assert_eq!(bucket_end(1, 10_000), 10_000);
        assert_eq!(bucket_end(9_999, 10_000), 10_000);
        assert_eq!(bucket_end(10_000, 10_000), 10_000);
        assert_eq!(bucket_end(10_001, 10_000), 20_000);
    }

    #[test]
    fn append_query_round_trip() {
        let (_dir, store) = durable_store();
        let r = rec(1_000, 42.5);
        store.append_durable(&r).unwrap();
        let rows = store.query_raw(1_000, 1_000);
        assert_eq!(rows, vec![r]);
    }

    #[test]
    fn agg_tables_are_last_value_wins() {
        let (_dir, store) = durable_store();
        // Two samples in the same 10s bucket; the second must win.
        store.append_durable(&rec(3_000, 10.0)).unwrap();
        store.append_durable(&rec(7_000, 20.0)).unwrap();
        let rows = store.query_agg("10s", 0, 20_000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 10_000);
        assert_eq!(rows[0].cpu, Some(20.0));
        // Raw table keeps both.
        assert_eq!(store.query_raw(0, 20_000).len(), 2);
    }

    #[test]
    fn unknown_agg_falls_back_to_raw() {
        let (_dir, store) = durable_store();
        store.append_durable(&rec(1_500, 5.0)).unwrap();
        let rows = store.query_agg("5s", 0, 2_000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 1_500);
    }

    #[test]
    fn downsample_is_idempotent_and_keeps_last() {
        let rows = vec![rec(1_100, 1.0), rec(1_900, 2.0), rec(2_500, 3.0)];
        let a = downsample(&rows, 1_000);
        let b = downsample(&rows, 1_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].ts, 2_000);
        assert_eq!(a[0].cpu, Some(2.0));
        assert_eq!(a[1].ts, 3_000);
        assert_eq!(a[1].cpu, Some(3.0));
    }

    #[tokio::test]
    async fn ring_only_store_round_trips() {
        let store = HistoryStore::open(None).expect("open");
        store.append(rec(100, 1.0));
        store.append(rec(200, 2.0));
        assert!(store.query_raw(0, 1_000).is_empty());
        let slice = store.ring_slice(150, 1_000);
        assert_eq!(slice.len(), 1);
        assert_eq!(slice[0].ts, 200);
        store.reset_ring();
        assert_eq!(store.ring_len(), 0);
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let store = HistoryStore::open(None).expect("open");
        for i in 0..(RING_CAP as i64 + 10) {
            store.append(rec(i, 0.0));
        }
        assert_eq!(store.ring_len(), RING_CAP);
        // Oldest rows were evicted first.
        assert!(store.ring_slice(0, 9).is_empty());
    }
}
