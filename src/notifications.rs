use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::core::{EmergencyPattern, SATS_PER_BTC, short_addr};

/// Structured payload handed to the notification boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub kind: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub wallet_count: usize,
    /// First few affected addresses, abbreviated.
    pub sample_addresses: Vec<String>,
    pub total_btc: f64,
    pub score: f64,
    pub window_start: String,
    pub window_end: String,
}

impl AlertPayload {
    pub fn from_pattern(pattern: &EmergencyPattern) -> Self {
        let total_btc = pattern.total_value as f64 / SATS_PER_BTC;
        let description = format!(
            "{} {} pattern affecting {} wallets, {:.4} BTC total (score {:.0})",
            pattern.severity.emoji(),
            pattern.kind.title(),
            pattern.wallet_addresses.len(),
            total_btc,
            pattern.score,
        );
        Self {
            kind: pattern.kind.as_str().to_string(),
            severity: pattern.severity.label().to_string(),
            title: format!("🚨 {}", pattern.kind.title()),
            description,
            wallet_count: pattern.wallet_addresses.len(),
            sample_addresses: pattern
                .wallet_addresses
                .iter()
                .take(5)
                .map(|a| format!("{}...", short_addr(a)))
                .collect(),
            total_btc,
            score: pattern.score,
            window_start: pattern.window_start.to_rfc3339(),
            window_end: pattern.window_end.to_rfc3339(),
        }
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Http(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Http(e) => write!(f, "webhook error: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound notification boundary. Returns Ok(true) when a notification was
/// actually sent, Ok(false) when skipped (disabled, unconfigured, send cap).
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn send(&self, alert: &AlertPayload) -> Result<bool, NotifyError>;
}

/// Webhook sender with a per-minute send cap to avoid hammering the endpoint.
pub struct WebhookNotifier {
    enabled: bool,
    webhook_url: Option<String>,
    max_per_minute: usize,
    client: reqwest::Client,
    sent: Mutex<VecDeque<Instant>>,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            enabled: config.enabled,
            webhook_url: config.webhook_url.clone(),
            max_per_minute: config.max_per_minute,
            client: reqwest::Client::new(),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Check and record against the minute window. Returns false at the cap.
    fn within_send_cap(&self) -> bool {
        let mut sent = self.sent.lock().unwrap();
        let now = Instant::now();
        while let Some(&front) = sent.front() {
            if now.duration_since(front) > Duration::from_secs(60) {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() >= self.max_per_minute {
            return false;
        }
        sent.push_back(now);
        true
    }
}

impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &AlertPayload) -> Result<bool, NotifyError> {
        if !self.enabled {
            return Ok(false);
        }
        let Some(ref url) = self.webhook_url else {
            debug!("no webhook URL configured, alert not delivered");
            return Ok(false);
        };
        if !self.within_send_cap() {
            warn!(
                kind = %alert.kind,
                "webhook send cap reached, alert not delivered"
            );
            return Ok(false);
        }

        let resp = self
            .client
            .post(url)
            .json(alert)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        if resp.status().is_success() {
            info!(kind = %alert.kind, severity = %alert.severity, "alert delivered");
            Ok(true)
        } else {
            Err(NotifyError::Http(format!("http status {}", resp.status())))
        }
    }
}
