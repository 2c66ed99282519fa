pub mod score;

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::core::{ActivityEvent, EmergencyPattern, PatternKind, Severity};
use score::composite_score;

const Z_EPSILON: f64 = 1e-9;

/// Consumes the activity stream and evaluates four independent signals over a
/// bounded sliding window. Detectors are not mutually exclusive; duplicates
/// across cycles are suppressed downstream by the alert manager.
pub struct PatternDetector {
    config: DetectorConfig,
    window: VecDeque<ActivityEvent>,
    /// Per-address recent transaction volumes for the statistical detector.
    volume_history: HashMap<String, VecDeque<u64>>,
}

impl PatternDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            volume_history: HashMap::new(),
        }
    }

    /// Absorb historical events into the window and volume histories without
    /// evaluating the detectors. Used to warm-start after a restart; events
    /// must be in chronological order.
    pub fn preload(&mut self, events: &[ActivityEvent]) {
        for event in events {
            self.window.push_back(event.clone());
            let history = self
                .volume_history
                .entry(event.address.clone())
                .or_default();
            history.push_back(event.amount);
            while history.len() > self.config.stats_window {
                history.pop_front();
            }
        }
        self.prune();
    }

    /// Feed one batch of committed events and collect any triggered patterns.
    pub fn ingest(&mut self, batch: &[ActivityEvent]) -> Vec<EmergencyPattern> {
        if batch.is_empty() {
            return Vec::new();
        }

        // Statistical anomalies compare each event against history that
        // excludes it, so they run before the batch is absorbed.
        let mut patterns = self.detect_statistical_anomalies(batch);

        for event in batch {
            self.window.push_back(event.clone());
        }
        self.prune();

        // Only buckets touched by this batch need re-evaluation.
        let buckets: BTreeSet<i64> = batch
            .iter()
            .map(|e| self.bucket_of(e.observed_at))
            .collect();
        for &bucket in &buckets {
            patterns.extend(self.detect_dormant_surge(bucket));
            patterns.extend(self.detect_coordinated_movement(bucket));
            patterns.extend(self.detect_value_concentration(bucket));
        }

        if !patterns.is_empty() {
            debug!(
                count = patterns.len(),
                window = self.window.len(),
                "patterns triggered"
            );
        }
        patterns
    }

    fn window_secs(&self) -> i64 {
        self.config.activity_window_minutes * 60
    }

    fn bucket_of(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.window_secs())
    }

    fn bucket_bounds(&self, bucket: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = bucket * self.window_secs();
        let end = start + self.window_secs();
        (
            Utc.timestamp_opt(start, 0).single().unwrap_or_default(),
            Utc.timestamp_opt(end, 0).single().unwrap_or_default(),
        )
    }

    fn bucket_events(&self, bucket: i64) -> Vec<&ActivityEvent> {
        self.window
            .iter()
            .filter(|e| self.bucket_of(e.observed_at) == bucket)
            .collect()
    }

    fn prune(&mut self) {
        let Some(latest) = self.window.back().map(|e| e.observed_at) else {
            return;
        };
        let cutoff = latest - Duration::hours(self.config.window_hours);
        self.window.retain(|e| e.observed_at >= cutoff);
    }

    fn build_pattern(
        &self,
        kind: PatternKind,
        events: &[&ActivityEvent],
        bucket: i64,
    ) -> EmergencyPattern {
        let mut addresses: Vec<String> = events.iter().map(|e| e.address.clone()).collect();
        addresses.sort();
        addresses.dedup();
        let total_value: u64 = events.iter().map(|e| e.amount).sum();
        let avg_dormancy = mean(
            &events
                .iter()
                .map(|e| e.dormancy_days_at_event as f64)
                .collect::<Vec<_>>(),
        );
        let score = composite_score(addresses.len(), total_value, avg_dormancy, &self.config);
        let (window_start, window_end) = self.bucket_bounds(bucket);
        EmergencyPattern {
            kind,
            severity: Severity::from_score(score),
            wallet_addresses: addresses,
            total_value,
            window_start,
            window_end,
            score,
        }
    }

    /// Many long-dormant addresses moving inside one activity window.
    fn detect_dormant_surge(&self, bucket: i64) -> Option<EmergencyPattern> {
        let dormant: Vec<&ActivityEvent> = self
            .bucket_events(bucket)
            .into_iter()
            .filter(|e| e.dormancy_days_at_event > self.config.dormancy_threshold_days)
            .collect();
        if distinct_addresses(&dormant) < self.config.min_wallets_threshold {
            return None;
        }
        Some(self.build_pattern(PatternKind::DormantSurge, &dormant, bucket))
    }

    /// Tightly clustered amounts and timing across enough distinct wallets.
    fn detect_coordinated_movement(&self, bucket: i64) -> Option<EmergencyPattern> {
        let events = self.bucket_events(bucket);
        if distinct_addresses(&events) < self.config.min_wallets_threshold {
            return None;
        }

        let amounts: Vec<f64> = events.iter().map(|e| e.amount as f64).collect();
        let amount_mean = mean(&amounts);
        if amount_mean <= 0.0 {
            return None;
        }
        let amount_cv = std_dev(&amounts, amount_mean) / amount_mean;

        let (window_start, _) = self.bucket_bounds(bucket);
        let offsets: Vec<f64> = events
            .iter()
            .map(|e| (e.observed_at - window_start).num_seconds() as f64)
            .collect();
        let timing_dispersion = std_dev(&offsets, mean(&offsets)) / self.window_secs() as f64;

        if amount_cv >= self.config.similarity_threshold
            || timing_dispersion >= self.config.similarity_threshold
        {
            return None;
        }
        Some(self.build_pattern(PatternKind::CoordinatedMovement, &events, bucket))
    }

    /// Total moved value in one window exceeding the configured threshold.
    fn detect_value_concentration(&self, bucket: i64) -> Option<EmergencyPattern> {
        let events = self.bucket_events(bucket);
        let total: u64 = events.iter().map(|e| e.amount).sum();
        let total_btc = total as f64 / crate::core::SATS_PER_BTC;
        if total_btc <= self.config.value_threshold_btc {
            return None;
        }
        Some(self.build_pattern(PatternKind::ValueConcentration, &events, bucket))
    }

    /// Per-address z-score of the current volume against its rolling history.
    /// Severity is floored at Medium, High beyond the elevated threshold.
    fn detect_statistical_anomalies(&mut self, batch: &[ActivityEvent]) -> Vec<EmergencyPattern> {
        let mut patterns = Vec::new();
        for event in batch {
            let history = self
                .volume_history
                .entry(event.address.clone())
                .or_default();
            if history.len() >= self.config.stats_min_samples {
                let samples: Vec<f64> = history.iter().map(|&v| v as f64).collect();
                let sample_mean = mean(&samples);
                let sample_std = std_dev(&samples, sample_mean);
                let z = (event.amount as f64 - sample_mean) / (sample_std + Z_EPSILON);

                if z.abs() > self.config.zscore_threshold {
                    let score = composite_score(
                        1,
                        event.amount,
                        event.dormancy_days_at_event as f64,
                        &self.config,
                    );
                    let floor = if z.abs() > self.config.zscore_elevated {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                    patterns.push(EmergencyPattern {
                        kind: PatternKind::StatisticalAnomaly,
                        severity: Severity::from_score(score).max(floor),
                        wallet_addresses: vec![event.address.clone()],
                        total_value: event.amount,
                        window_start: event.observed_at,
                        window_end: event.observed_at,
                        score,
                    });
                }
            }

            history.push_back(event.amount);
            while history.len() > self.config.stats_window {
                history.pop_front();
            }
        }
        patterns
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.window.len()
    }
}

fn distinct_addresses(events: &[&ActivityEvent]) -> usize {
    let mut addresses: Vec<&str> = events.iter().map(|e| e.address.as_str()).collect();
    addresses.sort();
    addresses.dedup();
    addresses.len()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation.
fn std_dev(xs: &[f64], mean: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let variance = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SATS_PER_BTC;

    fn detector() -> PatternDetector {
        PatternDetector::new(DetectorConfig::default())
    }

    fn btc(amount: f64) -> u64 {
        (amount * SATS_PER_BTC) as u64
    }

    /// Aligned to a bucket boundary so a small offset stays inside one window.
    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn event(
        address: &str,
        tx: &str,
        amount: u64,
        dormancy: i64,
        offset_secs: i64,
    ) -> ActivityEvent {
        ActivityEvent {
            address: address.to_string(),
            tx_id: tx.to_string(),
            block_height: 850_000,
            amount,
            observed_at: base_time() + Duration::seconds(offset_secs),
            dormancy_days_at_event: dormancy,
        }
    }

    #[test]
    fn dormant_surge_five_wallets_is_critical() {
        let mut det = detector();
        // 5 distinct 400-day-dormant wallets, 25 BTC each, within 10 minutes
        let batch: Vec<ActivityEvent> = (0..5)
            .map(|i| {
                event(
                    &format!("1Dormant{i}"),
                    &format!("tx{i}"),
                    btc(25.0),
                    400,
                    i * 120,
                )
            })
            .collect();
        let patterns = det.ingest(&batch);

        let surges: Vec<&EmergencyPattern> = patterns
            .iter()
            .filter(|p| p.kind == PatternKind::DormantSurge)
            .collect();
        assert_eq!(surges.len(), 1);
        let surge = surges[0];
        assert!(surge.score >= 80.0, "score {}", surge.score);
        assert_eq!(surge.severity, Severity::Critical);
        assert_eq!(surge.wallet_addresses.len(), 5);
        assert_eq!(surge.total_value, btc(125.0));
    }

    #[test]
    fn four_dormant_wallets_stay_silent() {
        let mut det = detector();
        let batch: Vec<ActivityEvent> = (0..4)
            .map(|i| event(&format!("1D{i}"), &format!("tx{i}"), btc(1.0), 400, i * 60))
            .collect();
        let patterns = det.ingest(&batch);
        assert!(patterns.iter().all(|p| p.kind != PatternKind::DormantSurge));
    }

    #[test]
    fn fresh_wallets_are_not_a_surge() {
        let mut det = detector();
        let batch: Vec<ActivityEvent> = (0..6)
            .map(|i| event(&format!("1F{i}"), &format!("tx{i}"), btc(1.0), 30, i * 60))
            .collect();
        let patterns = det.ingest(&batch);
        assert!(patterns.iter().all(|p| p.kind != PatternKind::DormantSurge));
    }

    #[test]
    fn dormant_wallets_split_across_buckets_stay_silent() {
        let mut det = detector();
        // 3 in one 30-minute bucket, 3 in the next — neither reaches 5
        let mut batch = Vec::new();
        for i in 0..3 {
            batch.push(event(&format!("1A{i}"), &format!("txa{i}"), btc(1.0), 400, i * 60));
        }
        for i in 0..3 {
            batch.push(event(
                &format!("1B{i}"),
                &format!("txb{i}"),
                btc(1.0),
                400,
                1800 + i * 60,
            ));
        }
        let patterns = det.ingest(&batch);
        assert!(patterns.iter().all(|p| p.kind != PatternKind::DormantSurge));
    }

    #[test]
    fn coordinated_movement_on_similar_amounts() {
        let mut det = detector();
        // Identical amounts, tight timing, no dormancy
        let batch: Vec<ActivityEvent> = (0..5)
            .map(|i| event(&format!("1C{i}"), &format!("tx{i}"), btc(2.0), 0, i * 30))
            .collect();
        let patterns = det.ingest(&batch);
        let coordinated: Vec<_> = patterns
            .iter()
            .filter(|p| p.kind == PatternKind::CoordinatedMovement)
            .collect();
        assert_eq!(coordinated.len(), 1);
        assert_eq!(coordinated[0].wallet_addresses.len(), 5);
    }

    #[test]
    fn dispersed_amounts_are_not_coordinated() {
        let mut det = detector();
        let amounts = [1.0, 10.0, 50.0, 3.0, 25.0];
        let batch: Vec<ActivityEvent> = amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| event(&format!("1C{i}"), &format!("tx{i}"), btc(a), 0, i as i64 * 30))
            .collect();
        let patterns = det.ingest(&batch);
        assert!(patterns
            .iter()
            .all(|p| p.kind != PatternKind::CoordinatedMovement));
    }

    #[test]
    fn value_concentration_above_threshold() {
        let mut det = detector();
        let batch = vec![
            event("1Whale1", "tx1", btc(70.0), 0, 0),
            event("1Whale2", "tx2", btc(60.0), 0, 60),
        ];
        let patterns = det.ingest(&batch);
        let concentration: Vec<_> = patterns
            .iter()
            .filter(|p| p.kind == PatternKind::ValueConcentration)
            .collect();
        assert_eq!(concentration.len(), 1);
        assert_eq!(concentration[0].total_value, btc(130.0));
    }

    #[test]
    fn value_below_threshold_stays_silent() {
        let mut det = detector();
        let batch = vec![event("1Small", "tx1", btc(50.0), 0, 0)];
        let patterns = det.ingest(&batch);
        assert!(patterns
            .iter()
            .all(|p| p.kind != PatternKind::ValueConcentration));
    }

    #[test]
    fn zscore_five_triggers_high_anomaly() {
        let mut det = detector();
        // History alternating 8/12: mean 10, population std 2
        for i in 0..16u32 {
            let amount = if i % 2 == 0 { 8 } else { 12 };
            let batch = vec![event("1Stat", &format!("hist{i}"), amount, 0, i as i64)];
            let patterns = det.ingest(&batch);
            assert!(patterns
                .iter()
                .all(|p| p.kind != PatternKind::StatisticalAnomaly));
        }

        // Current volume 20 → z = (20 - 10) / 2 = 5.0 → elevated severity
        let patterns = det.ingest(&[event("1Stat", "spike", 20, 0, 999)]);
        let anomalies: Vec<_> = patterns
            .iter()
            .filter(|p| p.kind == PatternKind::StatisticalAnomaly)
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::High);
        assert_eq!(anomalies[0].wallet_addresses, vec!["1Stat".to_string()]);
    }

    #[test]
    fn mild_deviation_is_not_anomalous() {
        let mut det = detector();
        for i in 0..16u32 {
            let amount = if i % 2 == 0 { 8 } else { 12 };
            det.ingest(&[event("1Stat", &format!("hist{i}"), amount, 0, i as i64)]);
        }
        // z = (14 - 10) / 2 = 2.0, below the 3.0 threshold
        let patterns = det.ingest(&[event("1Stat", "mild", 14, 0, 999)]);
        assert!(patterns
            .iter()
            .all(|p| p.kind != PatternKind::StatisticalAnomaly));
    }

    #[test]
    fn too_little_history_is_ignored() {
        let mut det = detector();
        for i in 0..4u32 {
            det.ingest(&[event("1Stat", &format!("hist{i}"), 10, 0, i as i64)]);
        }
        let patterns = det.ingest(&[event("1Stat", "spike", 10_000, 0, 99)]);
        assert!(patterns
            .iter()
            .all(|p| p.kind != PatternKind::StatisticalAnomaly));
    }

    #[test]
    fn window_prunes_old_events() {
        let mut det = detector();
        det.ingest(&[event("1Old", "tx1", btc(1.0), 0, 0)]);
        assert_eq!(det.window_len(), 1);
        // 25 hours later the first event falls out of the 24h window
        det.ingest(&[event("1New", "tx2", btc(1.0), 0, 25 * 3600)]);
        assert_eq!(det.window_len(), 1);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut det = detector();
        assert!(det.ingest(&[]).is_empty());
    }

    #[test]
    fn preload_seeds_history_without_alerting() {
        let mut det = detector();
        let history: Vec<ActivityEvent> = (0..16)
            .map(|i| {
                let amount = if i % 2 == 0 { 8 } else { 12 };
                event("1Stat", &format!("hist{i}"), amount, 0, i)
            })
            .collect();
        det.preload(&history);
        assert_eq!(det.window_len(), 16);

        // The preloaded history immediately backs the statistical detector.
        let patterns = det.ingest(&[event("1Stat", "spike", 20, 0, 999)]);
        assert!(patterns
            .iter()
            .any(|p| p.kind == PatternKind::StatisticalAnomaly));
    }

    #[test]
    fn statistics_helpers() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[10.0]), 10.0);
        let xs = [8.0, 12.0, 8.0, 12.0];
        let m = mean(&xs);
        assert_eq!(m, 10.0);
        assert_eq!(std_dev(&xs, m), 2.0);
    }
}
