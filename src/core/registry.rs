use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::{VulnerabilityType, WatchedAddress};
use crate::db::SharedDatabase;

/// In-memory registry of addresses under surveillance, loaded once at startup.
/// Addresses are never removed during a run.
pub struct WatchedAddressRegistry {
    map: HashMap<String, WatchedAddress>,
}

impl WatchedAddressRegistry {
    /// Load all watched addresses from the database into memory.
    pub fn load_from_db(db: &SharedDatabase) -> Result<Self, rusqlite::Error> {
        let addresses = db.load_watched_addresses()?;
        let registry = Self::from_addresses(addresses);
        tracing::info!("Registry loaded {} watched addresses", registry.len());
        Ok(registry)
    }

    pub fn from_addresses(addresses: Vec<WatchedAddress>) -> Self {
        let mut map = HashMap::with_capacity(addresses.len());
        for addr in addresses {
            map.insert(addr.address.clone(), addr);
        }
        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// O(1) membership check, independent of registry size.
    pub fn contains(&self, address: &str) -> bool {
        self.map.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<&WatchedAddress> {
        self.map.get(address)
    }

    /// Record confirmed activity: update last activity and balance, flag the
    /// move, and rescore. Returns the updated entry for persistence.
    pub fn record_activity(
        &mut self,
        address: &str,
        observed_at: DateTime<Utc>,
        balance: Option<u64>,
    ) -> Option<WatchedAddress> {
        let entry = self.map.get_mut(address)?;
        entry.last_activity = Some(observed_at);
        if let Some(balance) = balance {
            entry.balance = balance;
        }
        entry.has_moved = true;
        entry.risk_score = risk_score(entry.balance, 0, entry.vulnerability_type);
        Some(entry.clone())
    }

    /// Highest-risk addresses first; used only to prioritize direct checks,
    /// never by the detectors.
    pub fn top_risk(&self, n: usize) -> Vec<&WatchedAddress> {
        let mut all: Vec<&WatchedAddress> = self.map.values().collect();
        all.sort_by(|a, b| {
            b.risk_score
                .partial_cmp(&a.risk_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(n);
        all
    }
}

/// Composite 0-100 risk score from balance, dormancy, and vulnerability type.
pub fn risk_score(balance: u64, dormancy_days: i64, vulnerability_type: VulnerabilityType) -> f64 {
    let mut score: f64 = 0.0;

    // Balance factor (up to 40 points)
    if balance > 0 {
        let btc = balance as f64 / crate::core::SATS_PER_BTC;
        score += if btc >= 1000.0 {
            40.0
        } else if btc >= 100.0 {
            30.0
        } else if btc >= 10.0 {
            20.0
        } else {
            10.0
        };
    }

    // Dormancy factor (up to 30 points)
    score += if dormancy_days > 3650 {
        30.0
    } else if dormancy_days > 1825 {
        25.0
    } else if dormancy_days > 730 {
        20.0
    } else if dormancy_days > 365 {
        15.0
    } else {
        5.0
    };

    // Vulnerability type factor (up to 30 points)
    score += match vulnerability_type {
        VulnerabilityType::P2pk => 30.0,
        VulnerabilityType::ReusedP2pkh => 20.0,
        VulnerabilityType::Dormant => 10.0,
    };

    score.min(100.0)
}
