use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::config::AlertConfig;
use crate::core::{AlertRecord, EmergencyPattern};
use crate::db::SharedDatabase;
use crate::notifications::{AlertPayload, Notifier};

/// Deduplicates and cools down detected patterns before forwarding them to
/// the notification boundary. Delivery is at-least-once: a failed send never
/// rolls back the persisted record, the alert stays available for replay.
pub struct AlertManager<N> {
    config: AlertConfig,
    db: SharedDatabase,
    notifier: N,
    /// fingerprint → cooldown expiry, mirroring the alert_records table.
    cooldowns: HashMap<String, DateTime<Utc>>,
}

impl<N: Notifier> AlertManager<N> {
    pub fn new(
        config: AlertConfig,
        db: SharedDatabase,
        notifier: N,
    ) -> Result<Self, rusqlite::Error> {
        let active = db.load_active_cooldowns(Utc::now())?;
        let cooldowns: HashMap<String, DateTime<Utc>> = active
            .into_iter()
            .map(|r| (r.fingerprint, r.cooldown_until))
            .collect();
        if !cooldowns.is_empty() {
            info!("Restored {} active alert cooldowns", cooldowns.len());
        }
        Ok(Self { config, db, notifier, cooldowns })
    }

    /// Process one detected pattern. Returns true when the pattern survived
    /// deduplication and was forwarded to the notification boundary.
    pub async fn handle(&mut self, pattern: &EmergencyPattern) -> bool {
        self.handle_at(pattern, Utc::now()).await
    }

    async fn handle_at(&mut self, pattern: &EmergencyPattern, now: DateTime<Utc>) -> bool {
        let fingerprint = fingerprint(pattern, self.config.fingerprint_bucket_minutes);

        if let Some(&until) = self.cooldowns.get(&fingerprint) {
            if until > now {
                debug!(
                    fingerprint = %fingerprint,
                    kind = pattern.kind.as_str(),
                    remaining_secs = (until - now).num_seconds(),
                    "alert suppressed by cooldown"
                );
                return false;
            }
        }

        let record = AlertRecord {
            fingerprint: fingerprint.clone(),
            kind: pattern.kind.as_str().to_string(),
            sent_at: now,
            cooldown_until: now + Duration::minutes(self.config.cooldown_minutes),
        };
        if let Err(e) = self.db.save_alert_record(&record) {
            // Suppression degrades to the in-memory map for this run.
            error!("failed to persist alert record: {e}");
        }
        self.cooldowns.insert(fingerprint, record.cooldown_until);
        self.prune_expired(now);

        warn!(
            kind = pattern.kind.as_str(),
            severity = pattern.severity.label(),
            wallets = pattern.wallet_addresses.len(),
            score = pattern.score,
            "emergency pattern detected"
        );

        let payload = AlertPayload::from_pattern(pattern);
        let delivered = match self.notifier.send(&payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                error!(
                    kind = pattern.kind.as_str(),
                    "notification failed: {e}; alert kept for replay"
                );
                false
            }
        };
        if let Err(e) = self.db.insert_alert(pattern, delivered) {
            error!("failed to persist alert history: {e}");
        }
        true
    }

    fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.cooldowns.retain(|_, &mut until| until > now);
    }
}

/// Stable dedup key over pattern kind, the sorted address set, and the time
/// bucket the pattern's window starts in.
pub fn fingerprint(pattern: &EmergencyPattern, bucket_minutes: i64) -> String {
    let mut addresses = pattern.wallet_addresses.clone();
    addresses.sort();
    let bucket = pattern
        .window_start
        .timestamp()
        .div_euclid(bucket_minutes.max(1) * 60);
    let material = format!("{}\n{}\n{}", pattern.kind.as_str(), addresses.join(","), bucket);
    format!("{:016x}", xxh64(material.as_bytes(), 0))
}
