//! # Session Store
//!
//! SQLite persistence for sessions and their frame and snapshot records.
//!
//! Records are append-only. Deleting a session removes its records through
//! `ON DELETE CASCADE`, which needs `PRAGMA foreign_keys = ON` on every
//! connection.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::SnapshotData;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    deviceId TEXT NOT NULL,
    label TEXT NOT NULL,
    startTime INTEGER NOT NULL,
    endTime INTEGER,
    createdAt INTEGER DEFAULT (strftime('%s', 'now') * 1000)
);

CREATE TABLE IF NOT EXISTS frames (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sessionId TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    fps REAL NOT NULL,
    frameTime REAL NOT NULL,
    jank INTEGER DEFAULT 0,
    FOREIGN KEY (sessionId) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sessionId TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    fps REAL NOT NULL,
    avgFps REAL NOT NULL,
    minFps REAL NOT NULL,
    maxFps REAL NOT NULL,
    cpuUsage REAL NOT NULL,
    gpuUsage REAL NOT NULL,
    memoryUsage REAL NOT NULL,
    temperature REAL NOT NULL,
    power REAL NOT NULL,
    jankCount INTEGER NOT NULL,
    jankRate REAL NOT NULL,
    FOREIGN KEY (sessionId) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_frames_session ON frames(sessionId);
CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots(sessionId);
CREATE INDEX IF NOT EXISTS idx_sessions_device ON sessions(deviceId);
"#;

/// One recording session of one device
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub label: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub fps: f64,
    pub frame_time: f64,
    pub jank: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub snapshot: SnapshotData,
}

/// Aggregates over a session's frames
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub frame_count: i64,
    pub avg_fps: Option<f64>,
    pub min_fps: Option<f64>,
    pub max_fps: Option<f64>,
    pub jank_count: i64,
    pub avg_frame_time: Option<f64>,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Open (and create if needed) the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory or the database cannot be
    /// created, or the schema migration fails
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Session store opened at {}", path.display());
        Ok(store)
    }

    /// In-memory database, gone when dropped
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO sessions (id, deviceId, label, startTime, endTime)
            VALUES (:id, :device_id, :label, :start_time, :end_time)
            "#,
            named_params! {
                ":id": &session.id,
                ":device_id": &session.device_id,
                ":label": &session.label,
                ":start_time": session.start_time,
                ":end_time": session.end_time,
            },
        )?;
        debug!("Created session {} for device {}", session.id, session.device_id);
        Ok(())
    }

    /// Set the end time. Returns `false` if no such session exists.
    pub fn end_session(&self, id: &str, end_time: i64) -> Result<bool> {
        let changed = self
            .conn()
            .execute("UPDATE sessions SET endTime = ?1 WHERE id = ?2", params![end_time, id])?;
        Ok(changed > 0)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let session = self
            .conn()
            .query_row(
                "SELECT id, deviceId, label, startTime, endTime FROM sessions WHERE id = ?1",
                params![id],
                Self::map_session,
            )
            .optional()?;
        Ok(session)
    }

    /// The device's most recently started session that has no end time
    pub fn latest_open_session(&self, device_id: &str) -> Result<Option<Session>> {
        let session = self
            .conn()
            .query_row(
                r#"
                SELECT id, deviceId, label, startTime, endTime FROM sessions
                WHERE deviceId = ?1 AND endTime IS NULL
                ORDER BY startTime DESC LIMIT 1
                "#,
                params![device_id],
                Self::map_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Most recent sessions first
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, deviceId, label, startTime, endTime FROM sessions ORDER BY startTime DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::map_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Delete a session and, by cascade, all of its records
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn add_frame(&self, frame: &FrameRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO frames (sessionId, timestamp, fps, frameTime, jank)
            VALUES (:session_id, :timestamp, :fps, :frame_time, :jank)
            "#,
            named_params! {
                ":session_id": &frame.session_id,
                ":timestamp": frame.timestamp,
                ":fps": frame.fps,
                ":frame_time": frame.frame_time,
                ":jank": frame.jank as i64,
            },
        )?;
        Ok(())
    }

    pub fn add_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let s = &record.snapshot;
        self.conn().execute(
            r#"
            INSERT INTO snapshots (sessionId, timestamp, fps, avgFps, minFps, maxFps,
                cpuUsage, gpuUsage, memoryUsage, temperature, power, jankCount, jankRate)
            VALUES (:session_id, :timestamp, :fps, :avg_fps, :min_fps, :max_fps,
                :cpu_usage, :gpu_usage, :memory_usage, :temperature, :power, :jank_count, :jank_rate)
            "#,
            named_params! {
                ":session_id": &record.session_id,
                ":timestamp": record.timestamp,
                ":fps": s.fps,
                ":avg_fps": s.avg_fps,
                ":min_fps": s.min_fps,
                ":max_fps": s.max_fps,
                ":cpu_usage": s.cpu_usage,
                ":gpu_usage": s.gpu_usage,
                ":memory_usage": s.memory_usage,
                ":temperature": s.temperature,
                ":power": s.power,
                ":jank_count": s.jank_count,
                ":jank_rate": s.jank_rate,
            },
        )?;
        Ok(())
    }

    /// Frames of a session in timestamp order
    pub fn session_frames(&self, session_id: &str) -> Result<Vec<FrameRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sessionId, timestamp, fps, frameTime, jank FROM frames WHERE sessionId = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(FrameRecord {
                session_id: row.get(0)?,
                timestamp: row.get(1)?,
                fps: row.get(2)?,
                frame_time: row.get(3)?,
                jank: row.get::<_, i64>(4)? != 0,
            })
        })?;

        let mut frames = Vec::new();
        for row in rows {
            frames.push(row?);
        }
        Ok(frames)
    }

    /// Snapshots of a session in timestamp order
    pub fn session_snapshots(&self, session_id: &str) -> Result<Vec<SnapshotRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT sessionId, timestamp, fps, avgFps, minFps, maxFps, cpuUsage, gpuUsage,
                memoryUsage, temperature, power, jankCount, jankRate
            FROM snapshots WHERE sessionId = ?1 ORDER BY timestamp ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(SnapshotRecord {
                session_id: row.get(0)?,
                timestamp: row.get(1)?,
                snapshot: SnapshotData {
                    fps: row.get(2)?,
                    avg_fps: row.get(3)?,
                    min_fps: row.get(4)?,
                    max_fps: row.get(5)?,
                    cpu_usage: row.get(6)?,
                    gpu_usage: row.get(7)?,
                    memory_usage: row.get(8)?,
                    temperature: row.get(9)?,
                    power: row.get(10)?,
                    jank_count: row.get(11)?,
                    jank_rate: row.get(12)?,
                },
            })
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    pub fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let stats = self.conn().query_row(
            r#"
            SELECT COUNT(*), AVG(fps), MIN(fps), MAX(fps), COALESCE(SUM(jank), 0), AVG(frameTime)
            FROM frames WHERE sessionId = ?1
            "#,
            params![session_id],
            |row| {
                Ok(SessionStats {
                    frame_count: row.get(0)?,
                    avg_fps: row.get(1)?,
                    min_fps: row.get(2)?,
                    max_fps: row.get(3)?,
                    jank_count: row.get(4)?,
                    avg_frame_time: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Close sessions a previous run left open
    ///
    /// `endTime` becomes the timestamp of the session's last record, or its
    /// start time if it has none, never later than `now`.
    ///
    /// # Returns
    ///
    /// * `Result<usize>` - Number of sessions closed
    pub fn backfill_open_sessions(&self, now: i64) -> Result<usize> {
        let changed = self.conn().execute(
            r#"
            UPDATE sessions SET endTime = MAX(startTime, MIN(:now, MAX(
                COALESCE((SELECT MAX(timestamp) FROM frames WHERE sessionId = sessions.id), startTime),
                COALESCE((SELECT MAX(timestamp) FROM snapshots WHERE sessionId = sessions.id), startTime)
            )))
            WHERE endTime IS NULL
            "#,
            named_params! { ":now": now },
        )?;

        if changed > 0 {
            info!("Closed {} session(s) left open by a previous run", changed);
        }
        Ok(changed)
    }

    fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            device_id: row.get(1)?,
            label: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(id: &str, start: i64) -> Session {
        Session {
            id: id.to_string(),
            device_id: "dev-1".to_string(),
            label: "Racer".to_string(),
            start_time: start,
            end_time: None,
        }
    }

    fn frame(session_id: &str, timestamp: i64, fps: f64, jank: bool) -> FrameRecord {
        FrameRecord {
            session_id: session_id.to_string(),
            timestamp,
            fps,
            frame_time: 1000.0 / fps,
            jank,
        }
    }

    fn snapshot(session_id: &str, timestamp: i64) -> SnapshotRecord {
        SnapshotRecord {
            session_id: session_id.to_string(),
            timestamp,
            snapshot: SnapshotData { fps: 60.0, avg_fps: 59.0, jank_count: 1, ..Default::default() },
        }
    }

    #[test]
    fn test_create_get_end_session() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 100)).unwrap();

        assert_eq!(store.get_session("S1").unwrap().unwrap().end_time, None);
        assert!(store.end_session("S1", 500).unwrap());
        assert_eq!(store.get_session("S1").unwrap().unwrap().end_time, Some(500));

        assert!(store.get_session("missing").unwrap().is_none());
        assert!(!store.end_session("missing", 1).unwrap());
    }

    #[test]
    fn test_latest_open_session() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 100)).unwrap();
        store.create_session(&session("S2", 200)).unwrap();
        store.create_session(&Session { device_id: "dev-2".into(), ..session("S3", 300) }).unwrap();

        assert_eq!(store.latest_open_session("dev-1").unwrap().unwrap().id, "S2");
        store.end_session("S2", 250).unwrap();
        assert_eq!(store.latest_open_session("dev-1").unwrap().unwrap().id, "S1");
        store.end_session("S1", 150).unwrap();
        assert!(store.latest_open_session("dev-1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_session_id_rejected() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 100)).unwrap();
        assert!(store.create_session(&session("S1", 200)).is_err());
    }

    #[test]
    fn test_list_sessions_newest_first() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("old", 100)).unwrap();
        store.create_session(&session("new", 300)).unwrap();
        store.create_session(&session("mid", 200)).unwrap();

        let ids: Vec<String> = store.list_sessions(2).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_records_require_existing_session() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.add_frame(&frame("nope", 1, 60.0, false)).is_err());
    }

    #[test]
    fn test_frames_and_snapshots_in_order() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 0)).unwrap();
        store.add_frame(&frame("S1", 30, 30.0, true)).unwrap();
        store.add_frame(&frame("S1", 10, 60.0, false)).unwrap();
        store.add_snapshot(&snapshot("S1", 20)).unwrap();

        let frames = store.session_frames("S1").unwrap();
        assert_eq!(frames.iter().map(|f| f.timestamp).collect::<Vec<_>>(), vec![10, 30]);
        assert!(frames[1].jank);

        let snapshots = store.session_snapshots("S1").unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].snapshot.avg_fps, 59.0);
        assert_eq!(snapshots[0].snapshot.jank_count, 1);
    }

    #[test]
    fn test_delete_cascades() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 0)).unwrap();
        store.create_session(&session("S2", 0)).unwrap();
        store.add_frame(&frame("S1", 1, 60.0, false)).unwrap();
        store.add_snapshot(&snapshot("S1", 1)).unwrap();
        store.add_frame(&frame("S2", 1, 60.0, false)).unwrap();

        assert!(store.delete_session("S1").unwrap());
        assert!(store.session_frames("S1").unwrap().is_empty());
        assert!(store.session_snapshots("S1").unwrap().is_empty());
        assert_eq!(store.session_frames("S2").unwrap().len(), 1);
        assert!(!store.delete_session("S1").unwrap());
    }

    #[test]
    fn test_session_stats() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 0)).unwrap();
        store.add_frame(&frame("S1", 1, 60.0, false)).unwrap();
        store.add_frame(&frame("S1", 2, 30.0, true)).unwrap();
        store.add_frame(&frame("S1", 3, 45.0, true)).unwrap();

        let stats = store.session_stats("S1").unwrap();
        assert_eq!(stats.frame_count, 3);
        assert_eq!(stats.avg_fps, Some(45.0));
        assert_eq!(stats.min_fps, Some(30.0));
        assert_eq!(stats.max_fps, Some(60.0));
        assert_eq!(stats.jank_count, 2);
    }

    #[test]
    fn test_stats_of_empty_session() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("S1", 0)).unwrap();

        let stats = store.session_stats("S1").unwrap();
        assert_eq!(stats.frame_count, 0);
        assert_eq!(stats.avg_fps, None);
        assert_eq!(stats.jank_count, 0);
    }

    #[test]
    fn test_backfill_open_sessions() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_session(&session("with-records", 100)).unwrap();
        store.add_frame(&frame("with-records", 150, 60.0, false)).unwrap();
        store.add_snapshot(&snapshot("with-records", 180)).unwrap();
        store.create_session(&session("empty", 200)).unwrap();
        store.create_session(&session("closed", 50)).unwrap();
        store.end_session("closed", 60).unwrap();

        assert_eq!(store.backfill_open_sessions(10_000).unwrap(), 2);
        assert_eq!(store.get_session("with-records").unwrap().unwrap().end_time, Some(180));
        assert_eq!(store.get_session("empty").unwrap().unwrap().end_time, Some(200));
        assert_eq!(store.get_session("closed").unwrap().unwrap().end_time, Some(60));

        assert_eq!(store.backfill_open_sessions(10_000).unwrap(), 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("telemetry.sqlite3");

        {
            let store = SessionStore::open(&path).unwrap();
            store.create_session(&session("S1", 1)).unwrap();
            store.add_frame(&frame("S1", 2, 60.0, false)).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        assert_eq!(store.session_frames("S1").unwrap().len(), 1);

        // Cascade still works on a reopened connection
        store.delete_session("S1").unwrap();
        assert!(store.session_frames("S1").unwrap().is_empty());
    }
}
