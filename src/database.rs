use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::BanEvent;

/// Append-only store of parsed ban events
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened ban store at {}", path.as_ref().display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                ip TEXT NOT NULL,
                jail TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE (ts, ip, jail)
            );
            CREATE INDEX IF NOT EXISTS idx_bans_ts ON bans(ts);
            "#,
        )?;

        Ok(())
    }

    /// Append events, ignoring ones already stored. Returns how many were new.
    pub fn insert_events(&self, events: &[BanEvent]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = ts_key(Utc::now());

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO bans (ts, ip, jail, recorded_at) VALUES (?, ?, ?, ?)",
            )?;
            for event in events {
                inserted += stmt.execute(params![
                    ts_key(event.timestamp),
                    event.ip.to_string(),
                    event.jail,
                    now
                ])?;
            }
        }
        tx.commit()?;

        debug!("Stored {} of {} events", inserted, events.len());
        Ok(inserted)
    }

    /// Events with `start <= ts < end`, oldest first
    pub fn events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<BanEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, ip, jail FROM bans WHERE ts >= ? AND ts < ? ORDER BY ts, id",
        )?;

        let events = stmt
            .query_map([ts_key(start), ts_key(end)], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Every stored event, oldest first
    pub fn all_events(&self) -> Result<Vec<BanEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT ts, ip, jail FROM bans ORDER BY ts, id")?;

        let events = stmt
            .query_map([], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Timestamps with `start <= ts < end`
    pub fn timestamps_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT ts FROM bans WHERE ts >= ? AND ts < ?")?;

        let timestamps = stmt
            .query_map([ts_key(start), ts_key(end)], |row| parse_col(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(timestamps)
    }

    /// Per-jail counts with `start <= ts < end`, largest first
    pub fn jail_counts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT jail, COUNT(*) AS n FROM bans WHERE ts >= ? AND ts < ?
             GROUP BY jail ORDER BY n DESC, jail",
        )?;

        let rows = stmt
            .query_map([ts_key(start), ts_key(end)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_all(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM bans", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Most recent event, if any
    pub fn latest(&self) -> Result<Option<BanEvent>> {
        let conn = self.conn.lock();
        let event = conn
            .query_row(
                "SELECT ts, ip, jail FROM bans ORDER BY ts DESC, id DESC LIMIT 1",
                [],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Drop events older than `cutoff`
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM bans WHERE ts < ?", [ts_key(cutoff)])?;
        if removed > 0 {
            info!("Pruned {} bans older than {}", removed, cutoff.format("%Y-%m-%d"));
        }
        Ok(removed)
    }
}

// Fixed-width UTC form, so text order matches time order
fn ts_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<BanEvent> {
    Ok(BanEvent {
        timestamp: parse_col(row, 0)?,
        ip: parse_col::<IpAddr>(row, 1)?,
        jail: row.get(2)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(ts: &str, ip: &str, jail: &str) -> BanEvent {
        BanEvent::new(at(ts), ip.parse().unwrap(), jail)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = Database::open_memory().unwrap();
        let events = vec![
            event("2024-03-15T10:00:00Z", "192.0.2.1", "sshd"),
            event("2024-03-15T10:00:00Z", "192.0.2.2", "sshd"),
        ];

        assert_eq!(db.insert_events(&events).unwrap(), 2);
        assert_eq!(db.insert_events(&events).unwrap(), 0);
        assert_eq!(db.count_all().unwrap(), 2);
    }

    #[test]
    fn test_range_is_half_open() {
        let db = Database::open_memory().unwrap();
        db.insert_events(&[
            event("2024-03-01T00:00:00Z", "192.0.2.1", "sshd"),
            event("2024-03-31T23:59:59Z", "192.0.2.2", "sshd"),
            event("2024-04-01T00:00:00Z", "192.0.2.3", "sshd"),
        ])
        .unwrap();

        let events = db
            .events_between(at("2024-03-01T00:00:00Z"), at("2024-04-01T00:00:00Z"))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].ip.to_string(), "192.0.2.1");

        let timestamps = db
            .timestamps_between(at("2024-04-01T00:00:00Z"), at("2024-05-01T00:00:00Z"))
            .unwrap();
        assert_eq!(timestamps, vec![at("2024-04-01T00:00:00Z")]);
    }

    #[test]
    fn test_jail_counts_and_latest() {
        let db = Database::open_memory().unwrap();
        db.insert_events(&[
            event("2024-03-02T00:00:00Z", "192.0.2.1", "sshd"),
            event("2024-03-03T00:00:00Z", "192.0.2.2", "sshd"),
            event("2024-03-04T00:00:00Z", "2001:db8::1", "nginx"),
        ])
        .unwrap();

        let jails = db
            .jail_counts_between(at("2024-03-01T00:00:00Z"), at("2024-04-01T00:00:00Z"))
            .unwrap();
        assert_eq!(jails, vec![("sshd".to_string(), 2), ("nginx".to_string(), 1)]);

        let latest = db.latest().unwrap().unwrap();
        assert_eq!(latest.jail, "nginx");
        assert_eq!(latest.ip.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_prune() {
        let db = Database::open_memory().unwrap();
        db.insert_events(&[
            event("2023-01-01T00:00:00Z", "192.0.2.1", "sshd"),
            event("2024-03-03T00:00:00Z", "192.0.2.2", "sshd"),
        ])
        .unwrap();

        assert_eq!(db.prune_before(at("2024-01-01T00:00:00Z")).unwrap(), 1);
        assert_eq!(db.all_events().unwrap().len(), 1);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bans.db");

        {
            let db = Database::open(&path).unwrap();
            db.insert_events(&[event("2024-03-03T00:00:00Z", "192.0.2.2", "sshd")])
                .unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.count_all().unwrap(), 1);
    }
}
