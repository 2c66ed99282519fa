use crate::config::DetectorConfig;
use crate::core::SATS_PER_BTC;

/// Composite pattern score (0-100): wallet count and total value weigh 40
/// points each, average dormancy the remaining 20. Pure function of the
/// constituent events' attributes.
pub fn composite_score(
    wallet_count: usize,
    total_value_sats: u64,
    avg_dormancy_days: f64,
    config: &DetectorConfig,
) -> f64 {
    let wallet_divisor = config.min_wallets_threshold.max(1) as f64;
    let wallets = (wallet_count as f64 / wallet_divisor).min(1.0);
    let value = (total_value_sats as f64 / SATS_PER_BTC / config.value_cap_btc).min(1.0);
    let dormancy = (avg_dormancy_days / config.dormancy_cap_days).min(1.0);

    (wallets * 40.0 + value * 40.0 + dormancy * 20.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig::default()
    }

    fn btc(amount: f64) -> u64 {
        (amount * SATS_PER_BTC) as u64
    }

    #[test]
    fn zero_inputs_zero_score() {
        assert_eq!(composite_score(0, 0, 0.0, &config()), 0.0);
    }

    #[test]
    fn all_factors_saturated() {
        // 5 wallets, 100 BTC, 10 years average dormancy — every term capped
        let score = composite_score(5, btc(100.0), 3650.0, &config());
        assert!((score - 100.0).abs() < 0.01);
    }

    #[test]
    fn wallet_term_caps_at_threshold() {
        let a = composite_score(5, 0, 0.0, &config());
        let b = composite_score(50, 0, 0.0, &config());
        assert!((a - 40.0).abs() < 0.01);
        assert_eq!(a, b);
    }

    #[test]
    fn value_term_scales_linearly() {
        let score = composite_score(0, btc(50.0), 0.0, &config());
        assert!((score - 20.0).abs() < 0.01);
    }

    #[test]
    fn dormancy_term_scales_linearly() {
        let score = composite_score(0, 0, 1825.0, &config());
        assert!((score - 10.0).abs() < 0.01);
    }

    #[test]
    fn surge_scenario_reaches_critical() {
        // 5 wallets, 125 BTC total, 400 days average dormancy
        let score = composite_score(5, btc(125.0), 400.0, &config());
        assert!(score >= 80.0, "score {score}");
    }
}
