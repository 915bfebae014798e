use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::detect::{round3, Detection};
use crate::error::StoreError;
use crate::stats::{ClassMetrics, ClassStatistics};

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Durable record of accepted detections.
///
/// Implementations serialize writers internally so one store can be shared by the
/// capture loop and upload callers.
pub trait DetectionStore: Send + Sync {
    /// Persist one frame's detections as a single atomic batch.
    fn record(&self, detections: &[Detection]) -> Result<(), StoreError>;

    /// Per-class count and mean confidence for rows at or after `cutoff`,
    /// ordered by count descending then class name, capped to `top_n`.
    fn statistics_since(
        &self,
        cutoff: DateTime<Utc>,
        top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError>;

    /// Lifetime count/avg/max/min per class, ordered like `statistics_since`.
    fn class_metrics(&self) -> Result<Vec<ClassMetrics>, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;

    /// Delete every row.
    fn clear(&self) -> Result<(), StoreError>;

    /// Statistics over the trailing `window_minutes` relative to now.
    fn statistics(
        &self,
        window_minutes: u32,
        top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::minutes(i64::from(window_minutes));
        self.statistics_since(cutoff, top_n)
    }
}

pub struct SqliteDetectionStore {
    conn: Mutex<Connection>,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp INTEGER NOT NULL,
              class_name TEXT NOT NULL,
              confidence REAL NOT NULL,
              source TEXT NOT NULL,
              bbox TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn record(&self, detections: &[Detection]) -> Result<(), StoreError> {
        if detections.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO detections(timestamp, class_name, confidence, source, bbox)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for det in detections {
                let bbox = serde_json::to_string(&det.bbox)?;
                stmt.execute(params![
                    det.timestamp.timestamp(),
                    det.class_name,
                    f64::from(det.confidence),
                    det.source,
                    bbox
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn statistics_since(
        &self,
        cutoff: DateTime<Utc>,
        top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT class_name, COUNT(*) AS n, AVG(confidence)
            FROM detections
            WHERE timestamp >= ?1
            GROUP BY class_name
            ORDER BY n DESC, class_name ASC
            LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(top_n).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![cutoff.timestamp(), limit], |row| {
            Ok(ClassStatistics {
                class_name: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                avg_confidence: round3(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn class_metrics(&self) -> Result<Vec<ClassMetrics>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT class_name, COUNT(*) AS n, AVG(confidence), MAX(confidence), MIN(confidence)
            FROM detections
            GROUP BY class_name
            ORDER BY n DESC, class_name ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClassMetrics {
                class_name: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                avg_confidence: round3(row.get(2)?),
                max_confidence: round3(row.get(3)?),
                min_confidence: round3(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM detections", [])?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct InMemoryRow {
    timestamp: i64,
    class_name: String,
    confidence: f64,
}

/// Volatile store for tests and the batch CLI.
#[derive(Debug, Default)]
pub struct InMemoryDetectionStore {
    rows: Mutex<Vec<InMemoryRow>>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<InMemoryRow>>, StoreError> {
        self.rows.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// `(class, count, sum, max, min)` folded over rows, sorted like the SQL queries.
fn group_rows<'a>(rows: impl Iterator<Item = &'a InMemoryRow>) -> Vec<(String, u64, f64, f64, f64)> {
    let mut groups: HashMap<&str, (u64, f64, f64, f64)> = HashMap::new();
    for row in rows {
        let entry = groups
            .entry(row.class_name.as_str())
            .or_insert((0, 0.0, f64::MIN, f64::MAX));
        entry.0 += 1;
        entry.1 += row.confidence;
        entry.2 = entry.2.max(row.confidence);
        entry.3 = entry.3.min(row.confidence);
    }
    let mut out: Vec<_> = groups
        .into_iter()
        .map(|(class, (n, sum, max, min))| (class.to_string(), n, sum, max, min))
        .collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

impl DetectionStore for InMemoryDetectionStore {
    fn record(&self, detections: &[Detection]) -> Result<(), StoreError> {
        let mut rows = self.lock()?;
        rows.extend(detections.iter().map(|det| InMemoryRow {
            timestamp: det.timestamp.timestamp(),
            class_name: det.class_name.clone(),
            confidence: f64::from(det.confidence),
        }));
        Ok(())
    }

    fn statistics_since(
        &self,
        cutoff: DateTime<Utc>,
        top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        let rows = self.lock()?;
        let cutoff = cutoff.timestamp();
        Ok(group_rows(rows.iter().filter(|row| row.timestamp >= cutoff))
            .into_iter()
            .take(top_n)
            .map(|(class_name, count, sum, _, _)| ClassStatistics {
                class_name,
                count,
                avg_confidence: round3(sum / count as f64),
            })
            .collect())
    }

    fn class_metrics(&self) -> Result<Vec<ClassMetrics>, StoreError> {
        let rows = self.lock()?;
        Ok(group_rows(rows.iter())
            .into_iter()
            .map(|(class_name, count, sum, max, min)| ClassMetrics {
                class_name,
                count,
                avg_confidence: round3(sum / count as f64),
                max_confidence: round3(max),
                min_confidence: round3(min),
            })
            .collect())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.len() as u64)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::sync::Arc;

    fn det(class: &str, confidence: f32, at: DateTime<Utc>) -> Detection {
        Detection {
            class_name: class.into(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            timestamp: at,
            source: "webcam".into(),
        }
    }

    fn stores() -> Vec<Box<dyn DetectionStore>> {
        vec![
            Box::new(SqliteDetectionStore::open_in_memory().unwrap()),
            Box::new(InMemoryDetectionStore::new()),
        ]
    }

    #[test]
    fn record_then_statistics_reports_counts_and_means() {
        let now = Utc::now();
        for store in stores() {
            store
                .record(&[det("person", 0.9, now), det("person", 0.8, now), det("car", 0.85, now)])
                .unwrap();
            let stats = store.statistics(10, 5).unwrap();
            assert_eq!(stats.len(), 2);
            assert_eq!(stats[0].class_name, "person");
            assert_eq!(stats[0].count, 2);
            assert!((stats[0].avg_confidence - 0.85).abs() < 1e-3);
            assert_eq!(stats[1].class_name, "car");
            assert_eq!(store.count().unwrap(), 3);
        }
    }

    #[test]
    fn statistics_excludes_rows_outside_the_window() {
        let now = Utc::now();
        let old = now - ChronoDuration::minutes(30);
        for store in stores() {
            store.record(&[det("dog", 0.7, old)]).unwrap();
            store.record(&[det("cat", 0.7, now)]).unwrap();
            let stats = store.statistics(10, 5).unwrap();
            let classes: Vec<&str> = stats.iter().map(|s| s.class_name.as_str()).collect();
            assert_eq!(classes, vec!["cat"]);
        }
    }

    #[test]
    fn statistics_caps_to_top_n_with_name_tiebreak() {
        let now = Utc::now();
        for store in stores() {
            let batch: Vec<Detection> = ["e", "d", "c", "b", "a", "f"]
                .iter()
                .map(|class| det(class, 0.7, now))
                .chain(std::iter::once(det("f", 0.7, now)))
                .collect();
            store.record(&batch).unwrap();
            let stats = store.statistics(10, 3).unwrap();
            let classes: Vec<&str> = stats.iter().map(|s| s.class_name.as_str()).collect();
            assert_eq!(classes, vec!["f", "a", "b"]);
        }
    }

    #[test]
    fn clear_empties_statistics() {
        let now = Utc::now();
        for store in stores() {
            store.record(&[det("person", 0.9, now)]).unwrap();
            store.clear().unwrap();
            assert!(store.statistics(10, 5).unwrap().is_empty());
            assert_eq!(store.count().unwrap(), 0);
        }
    }

    #[test]
    fn metrics_track_min_and_max() {
        let now = Utc::now();
        for store in stores() {
            store
                .record(&[det("knife", 0.55, now), det("knife", 0.95, now)])
                .unwrap();
            let metrics = store.class_metrics().unwrap();
            assert_eq!(metrics[0].count, 2);
            assert_eq!(metrics[0].max_confidence, 0.95);
            assert_eq!(metrics[0].min_confidence, 0.55);
        }
    }

    #[test]
    fn concurrent_writers_lose_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.db");
        let sqlite = SqliteDetectionStore::open(path.to_str().unwrap()).unwrap();
        let shared: Vec<Arc<dyn DetectionStore>> =
            vec![Arc::new(sqlite), Arc::new(InMemoryDetectionStore::new())];

        for store in shared {
            let writers: Vec<_> = (0..8)
                .map(|i| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        let class = if i % 2 == 0 { "person" } else { "car" };
                        for _ in 0..25 {
                            let now = Utc::now();
                            store.record(&[det(class, 0.8, now), det(class, 0.9, now)]).unwrap();
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            assert_eq!(store.count().unwrap(), 8 * 25 * 2);
            let metrics = store.class_metrics().unwrap();
            assert!(metrics.iter().all(|m| m.count == 200));
        }
    }

    #[test]
    fn confidence_is_stored_at_full_precision() {
        let store = SqliteDetectionStore::open_in_memory().unwrap();
        store.record(&[det("person", 0.876_54, Utc::now())]).unwrap();
        let conn = store.lock().unwrap();
        let raw: f64 = conn
            .query_row("SELECT confidence FROM detections", [], |row| row.get(0))
            .unwrap();
        assert!((raw - 0.876_54).abs() < 1e-6);
    }
}
