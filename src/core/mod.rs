pub mod monitor;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SATS_PER_BTC: f64 = 100_000_000.0;

/// Why an address is considered quantum-vulnerable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VulnerabilityType {
    /// Pay-to-public-key output; the public key is on-chain.
    P2pk,
    /// P2PKH address that has spent before, revealing its public key.
    ReusedP2pkh,
    /// Long-inactive address tracked for dormancy alone.
    Dormant,
}

impl VulnerabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VulnerabilityType::P2pk => "P2PK",
            VulnerabilityType::ReusedP2pkh => "REUSED_P2PKH",
            VulnerabilityType::Dormant => "DORMANT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P2PK" => Some(VulnerabilityType::P2pk),
            "REUSED_P2PKH" => Some(VulnerabilityType::ReusedP2pkh),
            "DORMANT" => Some(VulnerabilityType::Dormant),
            _ => None,
        }
    }
}

/// An address under surveillance, unique by `address`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedAddress {
    pub address: String,
    pub balance: u64, // satoshis
    pub last_activity: Option<DateTime<Utc>>,
    pub vulnerability_type: VulnerabilityType,
    pub risk_score: f64, // 0-100
    pub has_moved: bool,
}

impl WatchedAddress {
    /// Whole days since the last known activity; 0 when unknown.
    pub fn dormancy_days(&self, now: DateTime<Utc>) -> i64 {
        match self.last_activity {
            Some(last) => (now - last).num_days().max(0),
            None => 0,
        }
    }
}

/// One confirmed movement of a watched address, immutable once created.
/// `(block_height, address, tx_id)` is unique in the committed log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub address: String,
    pub tx_id: String,
    pub block_height: u64,
    pub amount: u64, // satoshis moved by this address in this tx
    pub observed_at: DateTime<Utc>,
    pub dormancy_days_at_event: i64,
}

/// The four independent detection signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    DormantSurge,
    CoordinatedMovement,
    ValueConcentration,
    StatisticalAnomaly,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::DormantSurge => "dormant_surge",
            PatternKind::CoordinatedMovement => "coordinated_movement",
            PatternKind::ValueConcentration => "value_concentration",
            PatternKind::StatisticalAnomaly => "statistical_anomaly",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            PatternKind::DormantSurge => "Dormant Wallet Surge",
            PatternKind::CoordinatedMovement => "Coordinated Movement",
            PatternKind::ValueConcentration => "Value Concentration",
            PatternKind::StatisticalAnomaly => "Statistical Anomaly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,      // <40
    Medium,   // ≥40
    High,     // ≥60
    Critical, // ≥80
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Severity::Critical
        } else if score >= 60.0 {
            Severity::High
        } else if score >= 40.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Critical => "🔴",
            Severity::High => "🟠",
            Severity::Medium => "🟡",
            Severity::Low => "⚪",
        }
    }
}

/// A detected emergency pattern, recomputed per detection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyPattern {
    pub kind: PatternKind,
    pub severity: Severity,
    /// Sorted, deduplicated.
    pub wallet_addresses: Vec<String>,
    pub total_value: u64, // satoshis
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub score: f64, // 0-100
}

/// Governs suppression of duplicate patterns until `cooldown_until`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub fingerprint: String,
    pub kind: String,
    pub sent_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

/// Abbreviate an address for log lines.
pub fn short_addr(address: &str) -> &str {
    &address[..10.min(address.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn severity_thresholds() {
        assert_eq!(Severity::from_score(80.0), Severity::Critical);
        assert_eq!(Severity::from_score(79.9), Severity::High);
        assert_eq!(Severity::from_score(60.0), Severity::High);
        assert_eq!(Severity::from_score(40.0), Severity::Medium);
        assert_eq!(Severity::from_score(39.9), Severity::Low);
        assert_eq!(Severity::from_score(0.0), Severity::Low);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn vulnerability_type_roundtrip() {
        for vt in [
            VulnerabilityType::P2pk,
            VulnerabilityType::ReusedP2pkh,
            VulnerabilityType::Dormant,
        ] {
            assert_eq!(VulnerabilityType::parse(vt.as_str()), Some(vt));
        }
        assert_eq!(VulnerabilityType::parse("bogus"), None);
    }

    #[test]
    fn dormancy_days_from_last_activity() {
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 2, 5, 0, 0, 0).unwrap();
        let addr = WatchedAddress {
            address: "1Example".into(),
            balance: 0,
            last_activity: Some(last),
            vulnerability_type: VulnerabilityType::P2pk,
            risk_score: 0.0,
            has_moved: false,
        };
        assert_eq!(addr.dormancy_days(now), 401);
    }

    #[test]
    fn dormancy_days_unknown_activity() {
        let addr = WatchedAddress {
            address: "1Example".into(),
            balance: 0,
            last_activity: None,
            vulnerability_type: VulnerabilityType::Dormant,
            risk_score: 0.0,
            has_moved: false,
        };
        assert_eq!(addr.dormancy_days(Utc::now()), 0);
    }

    #[test]
    fn short_addr_truncates() {
        assert_eq!(short_addr("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"), "1A1zP1eP5Q");
        assert_eq!(short_addr("short"), "short");
    }
}
