pub mod schema;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::{
    ActivityEvent, AlertRecord, EmergencyPattern, VulnerabilityType, WatchedAddress,
};

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// Load the full registry of watched addresses.
    pub fn load_watched_addresses(&self) -> Result<Vec<WatchedAddress>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.load_watched_addresses()
    }

    /// Insert or replace one watched address row.
    pub fn upsert_watched_address(&self, addr: &WatchedAddress) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.upsert_watched_address(addr)
    }

    /// Last committed height and tip hash, if any.
    pub fn load_monitor_state(&self) -> Result<Option<(u64, String)>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.load_monitor_state()
    }

    /// Atomically persist a block's events together with the new height/tip.
    /// Re-committing the same block is a no-op for already-present events.
    pub fn commit_block(
        &self,
        height: u64,
        tip_hash: &str,
        events: &[ActivityEvent],
    ) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.commit_block(height, tip_hash, events)
    }

    pub fn event_count(&self) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.event_count()
    }

    /// Most recent committed events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<ActivityEvent>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.recent_events(limit)
    }

    pub fn save_alert_record(&self, record: &AlertRecord) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.save_alert_record(record)
    }

    /// Alert records whose cooldown has not yet expired.
    pub fn load_active_cooldowns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.load_active_cooldowns(now)
    }

    /// Persist a triggered pattern for history/replay.
    pub fn insert_alert(
        &self,
        pattern: &EmergencyPattern,
        delivered: bool,
    ) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insert_alert(pattern, delivered)
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn load_watched_addresses(&self) -> Result<Vec<WatchedAddress>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT address, balance, last_activity, vulnerability_type, risk_score, has_moved
             FROM watched_addresses",
        )?;
        let rows = stmt.query_map([], |row| {
            let vt: String = row.get(3)?;
            let has_moved: i32 = row.get(5)?;
            Ok(WatchedAddress {
                address: row.get(0)?,
                balance: row.get::<_, i64>(1)? as u64,
                last_activity: row.get::<_, Option<i64>>(2)?.map(from_ts),
                vulnerability_type: VulnerabilityType::parse(&vt)
                    .unwrap_or(VulnerabilityType::Dormant),
                risk_score: row.get(4)?,
                has_moved: has_moved != 0,
            })
        })?;
        rows.collect()
    }

    pub fn upsert_watched_address(&self, addr: &WatchedAddress) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO watched_addresses
             (address, balance, last_activity, vulnerability_type, risk_score, has_moved, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            rusqlite::params![
                addr.address,
                addr.balance as i64,
                addr.last_activity.map(ts),
                addr.vulnerability_type.as_str(),
                addr.risk_score,
                addr.has_moved as i32,
            ],
        )?;
        Ok(())
    }

    pub fn load_monitor_state(&self) -> Result<Option<(u64, String)>, rusqlite::Error> {
        let height: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM monitor_state WHERE key = 'last_seen_height'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(height) = height else { return Ok(None) };
        let Ok(height) = height.parse::<u64>() else { return Ok(None) };
        let tip: String = self
            .conn
            .query_row(
                "SELECT value FROM monitor_state WHERE key = 'tip_hash'",
                [],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(String::new()),
                other => Err(other),
            })?;
        Ok(Some((height, tip)))
    }

    pub fn commit_block(
        &self,
        height: u64,
        tip_hash: &str,
        events: &[ActivityEvent],
    ) -> Result<usize, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO activity_events
                 (block_height, address, tx_id, amount, observed_at, dormancy_days, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            )?;
            for event in events {
                inserted += stmt.execute(rusqlite::params![
                    event.block_height as i64,
                    event.address,
                    event.tx_id,
                    event.amount as i64,
                    ts(event.observed_at),
                    event.dormancy_days_at_event,
                ])?;
            }
            let mut state = tx.prepare_cached(
                "INSERT OR REPLACE INTO monitor_state (key, value) VALUES (?1, ?2)",
            )?;
            state.execute(rusqlite::params!["last_seen_height", height.to_string()])?;
            state.execute(rusqlite::params!["tip_hash", tip_hash])?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn event_count(&self) -> Result<usize, rusqlite::Error> {
        self.conn
            .query_row("SELECT COUNT(*) FROM activity_events", [], |row| {
                row.get::<_, i64>(0).map(|c| c as usize)
            })
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<ActivityEvent>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT address, tx_id, block_height, amount, observed_at, dormancy_days
             FROM activity_events ORDER BY block_height DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok(ActivityEvent {
                address: row.get(0)?,
                tx_id: row.get(1)?,
                block_height: row.get::<_, i64>(2)? as u64,
                amount: row.get::<_, i64>(3)? as u64,
                observed_at: from_ts(row.get(4)?),
                dormancy_days_at_event: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn save_alert_record(&self, record: &AlertRecord) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO alert_records (fingerprint, kind, sent_at, cooldown_until)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                record.fingerprint,
                record.kind,
                ts(record.sent_at),
                ts(record.cooldown_until),
            ],
        )?;
        Ok(())
    }

    pub fn load_active_cooldowns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT fingerprint, kind, sent_at, cooldown_until
             FROM alert_records WHERE cooldown_until > ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![ts(now)], |row| {
            Ok(AlertRecord {
                fingerprint: row.get(0)?,
                kind: row.get(1)?,
                sent_at: from_ts(row.get(2)?),
                cooldown_until: from_ts(row.get(3)?),
            })
        })?;
        rows.collect()
    }

    pub fn insert_alert(
        &self,
        pattern: &EmergencyPattern,
        delivered: bool,
    ) -> Result<(), rusqlite::Error> {
        let addresses =
            serde_json::to_string(&pattern.wallet_addresses).unwrap_or_else(|_| "[]".into());
        self.conn.execute(
            "INSERT INTO alerts
             (kind, severity, score, wallet_addresses, total_value, window_start, window_end, delivered, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
            rusqlite::params![
                pattern.kind.as_str(),
                pattern.severity.label(),
                pattern.score,
                addresses,
                pattern.total_value as i64,
                ts(pattern.window_start),
                ts(pattern.window_end),
                delivered as i32,
            ],
        )?;
        Ok(())
    }
}
