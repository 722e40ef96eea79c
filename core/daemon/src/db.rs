//! SQLite persistence for mindgate-daemon.
//!
//! This is the single-writer store backing the daemon. Each event or outcome
//! runs its load -> decide -> save cycle inside one immediate transaction
//! (`Db::transaction`), so a kill at any point leaves either the old or the
//! new state on disk, never a mix.

use mindgate_protocol::{Decision, EventEnvelope};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;

use crate::error::StoreError;
use crate::flags::ExpiredQuickTaskFlag;
use crate::timers::AppTimers;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ForegroundRow {
    pub app_id: String,
    pub since: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub stale_flags: u64,
    pub usage_rows: u64,
    pub event_rows: u64,
}

/// Typed access to the store inside an open transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn transaction<T>(
        &self,
        op: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to begin transaction", err))?;
            let value = op(&StoreTx { conn: &tx })?;
            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit transaction", err))?;
            Ok(value)
        })
    }

    /// Deletes expired flags past the stale threshold plus history and event
    /// rows older than the retention horizon.
    ///
    /// Ages are measured against the newest recorded event, the same clock
    /// the evaluator reads, never against the daemon's wall clock. An empty
    /// event log sweeps nothing.
    pub fn sweep(
        &self,
        stale_threshold_ms: i64,
        retention_ms: i64,
    ) -> Result<SweepReport, StoreError> {
        self.transaction(|tx| {
            let Some(now) = tx.latest_event_at()? else {
                return Ok(SweepReport::default());
            };
            let stale_flags =
                tx.delete_flags_expired_before(now.saturating_sub(stale_threshold_ms))?;
            let cutoff = now.saturating_sub(retention_ms);
            let usage_rows = tx.prune_usage_before(cutoff)?;
            let event_rows = tx.prune_events_before(cutoff)?;
            Ok(SweepReport {
                stale_flags,
                usage_rows,
                event_rows,
            })
        })
    }

    pub fn list_flags(&self) -> Result<Vec<ExpiredQuickTaskFlag>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT app_id, expired_at, expired_while_foreground \
                     FROM expired_flags ORDER BY expired_at ASC",
                )
                .map_err(|err| StoreError::sqlite("Failed to prepare flags query", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ExpiredQuickTaskFlag {
                        app_id: row.get(0)?,
                        expired_at: row.get(1)?,
                        expired_while_foreground: row.get(2)?,
                    })
                })
                .map_err(|err| StoreError::sqlite("Failed to query flags", err))?;

            let mut flags = Vec::new();
            for row in rows {
                flags.push(
                    row.map_err(|err| StoreError::sqlite("Failed to decode flag row", err))?,
                );
            }
            Ok(flags)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT UNIQUE,
                    kind TEXT NOT NULL,
                    app_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    decision TEXT
                 );
                 CREATE TABLE IF NOT EXISTS app_timers (
                    app_id TEXT PRIMARY KEY,
                    intention_expires_at INTEGER,
                    quick_task_expires_at INTEGER
                 );
                 CREATE TABLE IF NOT EXISTS quota_usage (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    used_at INTEGER NOT NULL,
                    app_id TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS quota_usage_used_at ON quota_usage (used_at);
                 CREATE TABLE IF NOT EXISTS expired_flags (
                    app_id TEXT PRIMARY KEY,
                    expired_at INTEGER NOT NULL,
                    expired_while_foreground INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS foreground (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    app_id TEXT NOT NULL,
                    since INTEGER NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| StoreError::sqlite("Failed to initialize schema", err))?;
            ensure_events_columns(conn)
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::sqlite("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::sqlite("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| StoreError::sqlite("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::sqlite("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

impl StoreTx<'_> {
    /// The decision answered for an already recorded event id, or `None` if
    /// the id was never seen. Events recorded without a launch answer
    /// `Decision::None`.
    pub fn recorded_decision(&self, event_id: &str) -> Result<Option<Decision>, StoreError> {
        let row: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT decision FROM events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to look up event", err))?;

        match row {
            None => Ok(None),
            Some(None) => Ok(Some(Decision::None)),
            Some(Some(raw)) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| StoreError::CorruptRow {
                    table: "events",
                    details: format!("Failed to decode decision for {}: {}", event_id, err),
                }),
        }
    }

    pub fn record_decision(&self, event_id: &str, decision: &Decision) -> Result<(), StoreError> {
        let raw = serde_json::to_string(decision).map_err(|err| StoreError::CorruptRow {
            table: "events",
            details: format!("Failed to serialize decision: {}", err),
        })?;
        self.conn
            .execute(
                "UPDATE events SET decision = ?2 WHERE event_id = ?1",
                params![event_id, raw],
            )
            .map_err(|err| StoreError::sqlite("Failed to record decision", err))?;
        Ok(())
    }

    pub fn latest_event_at(&self) -> Result<Option<i64>, StoreError> {
        self.conn
            .query_row("SELECT MAX(timestamp) FROM events", [], |row| row.get(0))
            .map_err(|err| StoreError::sqlite("Failed to query latest event", err))
    }

    pub fn insert_event(&self, event: &EventEnvelope) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event).map_err(|err| StoreError::CorruptRow {
            table: "events",
            details: format!("Failed to serialize event payload: {}", err),
        })?;
        self.conn
            .execute(
                "INSERT INTO events (event_id, kind, app_id, timestamp, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    event.event_id,
                    event.kind.as_str(),
                    event.app_id,
                    event.timestamp,
                    payload
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to insert event", err))?;
        Ok(())
    }

    pub fn load_timers(&self, app_id: &str) -> Result<AppTimers, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT app_id, intention_expires_at, quick_task_expires_at \
                 FROM app_timers WHERE app_id = ?1",
                params![app_id],
                |row| {
                    Ok(AppTimers {
                        app_id: row.get(0)?,
                        intention_expires_at: row.get(1)?,
                        quick_task_expires_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to query app timers", err))?;
        Ok(row.unwrap_or_else(|| AppTimers::empty(app_id)))
    }

    /// Upserts the row, or deletes it once both timers are cleared.
    pub fn save_timers(&self, timers: &AppTimers) -> Result<(), StoreError> {
        if timers.is_empty() {
            self.conn
                .execute(
                    "DELETE FROM app_timers WHERE app_id = ?1",
                    params![timers.app_id],
                )
                .map_err(|err| StoreError::sqlite("Failed to delete app timers", err))?;
            return Ok(());
        }

        self.conn
            .execute(
                "INSERT INTO app_timers (app_id, intention_expires_at, quick_task_expires_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(app_id) DO UPDATE SET \
                    intention_expires_at = excluded.intention_expires_at, \
                    quick_task_expires_at = excluded.quick_task_expires_at",
                params![
                    timers.app_id,
                    timers.intention_expires_at,
                    timers.quick_task_expires_at
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to upsert app timers", err))?;
        Ok(())
    }

    pub fn load_flag(&self, app_id: &str) -> Result<Option<ExpiredQuickTaskFlag>, StoreError> {
        self.conn
            .query_row(
                "SELECT app_id, expired_at, expired_while_foreground \
                 FROM expired_flags WHERE app_id = ?1",
                params![app_id],
                |row| {
                    Ok(ExpiredQuickTaskFlag {
                        app_id: row.get(0)?,
                        expired_at: row.get(1)?,
                        expired_while_foreground: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to query expired flag", err))
    }

    /// Inserts the flag unless one already exists. Returns whether it was new.
    pub fn insert_flag(&self, flag: &ExpiredQuickTaskFlag) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO expired_flags (app_id, expired_at, expired_while_foreground) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(app_id) DO NOTHING",
                params![flag.app_id, flag.expired_at, flag.expired_while_foreground],
            )
            .map_err(|err| StoreError::sqlite("Failed to insert expired flag", err))?;
        Ok(inserted > 0)
    }

    pub fn delete_flag(&self, app_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM expired_flags WHERE app_id = ?1",
                params![app_id],
            )
            .map_err(|err| StoreError::sqlite("Failed to delete expired flag", err))?;
        Ok(deleted > 0)
    }

    pub fn delete_flags_expired_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM expired_flags WHERE expired_at < ?1",
                params![cutoff],
            )
            .map_err(|err| StoreError::sqlite("Failed to sweep expired flags", err))?;
        Ok(deleted as u64)
    }

    pub fn usage_history(&self) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT used_at FROM quota_usage ORDER BY used_at ASC, id ASC")
            .map_err(|err| StoreError::sqlite("Failed to prepare usage query", err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(|err| StoreError::sqlite("Failed to query usage history", err))?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row.map_err(|err| StoreError::sqlite("Failed to decode usage row", err))?);
        }
        Ok(history)
    }

    pub fn record_usage(&self, app_id: &str, now: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO quota_usage (used_at, app_id) VALUES (?1, ?2)",
                params![now, app_id],
            )
            .map_err(|err| StoreError::sqlite("Failed to record quota usage", err))?;
        Ok(())
    }

    pub fn prune_usage_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM quota_usage WHERE used_at < ?1",
                params![cutoff],
            )
            .map_err(|err| StoreError::sqlite("Failed to prune quota usage", err))?;
        Ok(deleted as u64)
    }

    pub fn prune_events_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])
            .map_err(|err| StoreError::sqlite("Failed to prune events", err))?;
        Ok(deleted as u64)
    }

    pub fn foreground(&self) -> Result<Option<ForegroundRow>, StoreError> {
        self.conn
            .query_row(
                "SELECT app_id, since FROM foreground WHERE id = 1",
                [],
                |row| {
                    Ok(ForegroundRow {
                        app_id: row.get(0)?,
                        since: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to query foreground app", err))
    }

    pub fn set_foreground(&self, app_id: &str, since: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO foreground (id, app_id, since) VALUES (1, ?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET app_id = excluded.app_id, since = excluded.since",
                params![app_id, since],
            )
            .map_err(|err| StoreError::sqlite("Failed to update foreground app", err))?;
        Ok(())
    }
}

fn ensure_events_columns(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(events)")
        .map_err(|err| StoreError::sqlite("Failed to read events schema", err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|err| StoreError::sqlite("Failed to read events schema rows", err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| StoreError::sqlite("Failed to decode schema row", err))?);
    }

    if !columns.iter().any(|name| name == "decision") {
        conn.execute("ALTER TABLE events ADD COLUMN decision TEXT", [])
            .map_err(|err| StoreError::sqlite("Failed to add decision column", err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindgate_protocol::{EventKind, LaunchReason};

    fn temp_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, db)
    }

    fn event(event_id: Option<&str>, timestamp: i64) -> EventEnvelope {
        EventEnvelope {
            event_id: event_id.map(str::to_string),
            kind: EventKind::ForegroundChanged,
            app_id: "com.example.feed".to_string(),
            timestamp,
            expires_at: None,
        }
    }

    #[test]
    fn timers_survive_reopen() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.db");
        {
            let db = Db::new(path.clone()).expect("db init");
            db.transaction(|tx| {
                let mut timers = tx.load_timers("com.example.feed")?;
                timers.set_quick_task(180_000, 1_000);
                tx.save_timers(&timers)
            })
            .expect("save timers");
        }

        let db = Db::new(path).expect("db reopen");
        let timers = db
            .transaction(|tx| tx.load_timers("com.example.feed"))
            .expect("load timers");
        assert_eq!(timers.quick_task_expires_at, Some(181_000));
        assert!(timers.intention_expires_at.is_none());
    }

    #[test]
    fn cleared_timers_delete_the_row() {
        let (_temp_dir, db) = temp_db();
        db.transaction(|tx| {
            let mut timers = AppTimers::empty("com.example.feed");
            timers.set_intention(1_000, 0);
            tx.save_timers(&timers)?;
            timers.clear_intention();
            tx.save_timers(&timers)
        })
        .expect("save timers");

        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM app_timers", [], |row| row.get(0))
                    .map_err(|err| StoreError::sqlite("count", err))
            })
            .expect("count rows");
        assert_eq!(count, 0);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_temp_dir, db) = temp_db();
        let result: Result<(), StoreError> = db.transaction(|tx| {
            tx.record_usage("com.example.feed", 1_000)?;
            Err(StoreError::CorruptRow {
                table: "quota_usage",
                details: "forced".to_string(),
            })
        });
        assert!(result.is_err());

        let history = db.transaction(|tx| tx.usage_history()).expect("history");
        assert!(history.is_empty());
    }

    #[test]
    fn flag_insert_is_idempotent() {
        let (_temp_dir, db) = temp_db();
        let flag = ExpiredQuickTaskFlag::new("com.example.feed", 181_000, true);
        let (first, second) = db
            .transaction(|tx| Ok((tx.insert_flag(&flag)?, tx.insert_flag(&flag)?)))
            .expect("insert flags");
        assert!(first);
        assert!(!second);
        assert_eq!(db.list_flags().expect("list flags"), vec![flag]);
    }

    #[test]
    fn recorded_event_ids_answer_their_decision() {
        let (_temp_dir, db) = temp_db();
        let launch = Decision::launch("com.example.feed", LaunchReason::ShowQuickTaskDialog);
        db.transaction(|tx| {
            tx.insert_event(&event(Some("evt-1"), 1_000))?;
            tx.record_decision("evt-1", &launch)?;
            tx.insert_event(&event(Some("evt-2"), 1_000))?;
            tx.insert_event(&event(None, 1_000))?;
            tx.insert_event(&event(None, 1_000))
        })
        .expect("insert events");

        let (launched, quiet, unseen) = db
            .transaction(|tx| {
                Ok((
                    tx.recorded_decision("evt-1")?,
                    tx.recorded_decision("evt-2")?,
                    tx.recorded_decision("evt-3")?,
                ))
            })
            .expect("lookup");
        assert_eq!(launched, Some(launch));
        assert_eq!(quiet, Some(Decision::None));
        assert_eq!(unseen, None);
    }

    #[test]
    fn older_events_table_gains_decision_column() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.db");
        {
            let conn = Connection::open(&path).expect("open");
            conn.execute_batch(
                "CREATE TABLE events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT UNIQUE,
                    kind TEXT NOT NULL,
                    app_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    payload TEXT NOT NULL
                 );",
            )
            .expect("legacy schema");
        }

        let db = Db::new(path).expect("db init");
        let decision = db
            .transaction(|tx| {
                tx.insert_event(&event(Some("evt-1"), 1_000))?;
                tx.recorded_decision("evt-1")
            })
            .expect("lookup");
        assert_eq!(decision, Some(Decision::None));
    }

    #[test]
    fn foreground_row_is_singular() {
        let (_temp_dir, db) = temp_db();
        db.transaction(|tx| {
            tx.set_foreground("com.example.feed", 1_000)?;
            tx.set_foreground("com.example.mail", 2_000)
        })
        .expect("set foreground");
        let row = db
            .transaction(|tx| tx.foreground())
            .expect("foreground")
            .expect("row");
        assert_eq!(
            row,
            ForegroundRow {
                app_id: "com.example.mail".to_string(),
                since: 2_000
            }
        );
    }

    #[test]
    fn sweep_removes_only_old_rows() {
        let (_temp_dir, db) = temp_db();
        db.transaction(|tx| {
            tx.insert_flag(&ExpiredQuickTaskFlag::new("old", 0, true))?;
            tx.insert_flag(&ExpiredQuickTaskFlag::new("fresh", 650_000, true))?;
            tx.record_usage("old", 0)?;
            tx.record_usage("fresh", 650_000)?;
            tx.insert_event(&event(Some("evt-old"), 0))?;
            tx.insert_event(&event(Some("evt-now"), 700_000))?;
            Ok(())
        })
        .expect("seed");

        let report = db.sweep(600_000, 600_000).expect("sweep");
        assert_eq!(
            report,
            SweepReport {
                stale_flags: 1,
                usage_rows: 1,
                event_rows: 1
            }
        );
        let flags = db.list_flags().expect("flags");
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].app_id, "fresh");
        let history = db.transaction(|tx| tx.usage_history()).expect("history");
        assert_eq!(history, vec![650_000]);
    }

    #[test]
    fn sweep_ages_rows_against_recorded_events_not_wall_clock() {
        let (_temp_dir, db) = temp_db();
        assert_eq!(
            db.sweep(600_000, 600_000).expect("empty sweep"),
            SweepReport::default()
        );

        // Detector clock far behind the daemon's: everything here is fresh
        // relative to the newest event.
        db.transaction(|tx| {
            tx.insert_flag(&ExpiredQuickTaskFlag::new("com.example.feed", 181_000, true))?;
            tx.record_usage("com.example.feed", 1_000)?;
            tx.insert_event(&event(Some("evt-1"), 181_050))?;
            Ok(())
        })
        .expect("seed");

        let report = db.sweep(600_000, 900_000).expect("sweep");
        assert_eq!(report, SweepReport::default());
        assert_eq!(db.list_flags().expect("flags").len(), 1);
        let history = db.transaction(|tx| tx.usage_history()).expect("history");
        assert_eq!(history, vec![1_000]);
    }
}
