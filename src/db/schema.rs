use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS watched_addresses (
            address            TEXT PRIMARY KEY,
            balance            INTEGER NOT NULL DEFAULT 0,
            last_activity      INTEGER, -- unix seconds
            vulnerability_type TEXT NOT NULL,
            risk_score         REAL NOT NULL DEFAULT 0,
            has_moved          INTEGER NOT NULL DEFAULT 0,
            updated_at         TEXT
        );

        CREATE TABLE IF NOT EXISTS activity_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            block_height INTEGER NOT NULL,
            address      TEXT NOT NULL,
            tx_id        TEXT NOT NULL,
            amount       INTEGER NOT NULL,
            observed_at  INTEGER NOT NULL, -- unix seconds
            dormancy_days INTEGER NOT NULL,
            created_at   TEXT NOT NULL,
            UNIQUE (block_height, address, tx_id)
        );

        CREATE TABLE IF NOT EXISTS monitor_state (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_records (
            fingerprint    TEXT PRIMARY KEY,
            kind           TEXT NOT NULL,
            sent_at        INTEGER NOT NULL,
            cooldown_until INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            kind             TEXT NOT NULL,
            severity         TEXT NOT NULL,
            score            REAL NOT NULL,
            wallet_addresses TEXT NOT NULL, -- JSON array
            total_value      INTEGER NOT NULL,
            window_start     INTEGER NOT NULL,
            window_end       INTEGER NOT NULL,
            delivered        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_watched_risk ON watched_addresses(risk_score DESC);
        CREATE INDEX IF NOT EXISTS idx_events_height ON activity_events(block_height);
        CREATE INDEX IF NOT EXISTS idx_events_address ON activity_events(address);
        CREATE INDEX IF NOT EXISTS idx_records_cooldown ON alert_records(cooldown_until);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at DESC);
        ",
    )?;
    Ok(())
}
