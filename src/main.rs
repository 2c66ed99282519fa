mod alerts;
mod config;
mod core;
mod db;
mod notifications;
mod providers;
mod signals;

use std::path::Path;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertManager;
use crate::config::Config;
use crate::core::monitor::BlockMonitor;
use crate::core::registry::WatchedAddressRegistry;
use crate::core::{ActivityEvent, short_addr};
use crate::db::SharedDatabase;
use crate::notifications::{Notifier, WebhookNotifier};
use crate::signals::PatternDetector;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("dormantwatch=info".parse().unwrap()),
        )
        .init();

    info!("👁 dormantwatch starting...");

    // Load configuration
    let config = Config::load("config.toml");

    // Open the database
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create database directory");
    }
    let db = SharedDatabase::open(db_path).expect("Failed to open database");
    info!("Database opened at {}", config.database.path);

    // Load the address registry; running without one is pointless.
    let registry =
        WatchedAddressRegistry::load_from_db(&db).expect("Failed to load watched addresses");
    if registry.is_empty() {
        error!("No watched addresses in the database; nothing to monitor");
    }
    if let Some(top) = registry.top_risk(1).first() {
        info!(
            address = short_addr(&top.address),
            risk_score = top.risk_score,
            "highest-risk watched address"
        );
    }
    info!(
        watched = registry.len(),
        committed_events = db.event_count().unwrap_or(0),
        "state loaded"
    );

    // Provider pool in configured priority order
    let pool = providers::pool_from_config(&config);
    if pool.provider_count() == 0 {
        panic!("No providers enabled in configuration");
    }

    // Monitor → detector channel
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Vec<ActivityEvent>>();

    // Baseline at the last committed height, or the current tip.
    let monitor = BlockMonitor::bootstrap(
        pool,
        registry,
        db.clone(),
        config.monitor.clone(),
        events_tx,
    )
    .await
    .expect("Failed to establish monitoring baseline");

    // Detection task: consumes committed events, raises alerts.
    // Warm the sliding window from the committed log so a restart doesn't
    // blind the statistical detector.
    let mut detector = PatternDetector::new(config.detector.clone());
    match db.recent_events(1000) {
        Ok(mut events) => {
            events.reverse(); // newest-first from the db, preload wants chronological
            detector.preload(&events);
            info!(preloaded = events.len(), "detector window warmed from event log");
        }
        Err(e) => error!("failed to preload recent events: {e}"),
    }
    let notifier = WebhookNotifier::new(&config.notifications);
    let alert_manager = AlertManager::new(config.alerts.clone(), db.clone(), notifier)
        .expect("Failed to load alert cooldowns");
    let detection_handle = tokio::spawn(run_detection(events_rx, detector, alert_manager));

    // Poll loop with graceful shutdown: an in-flight commit always completes.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Monitor exit drops the event sender, which drains the detection task.
    let _ = monitor_handle.await;
    let _ = detection_handle.await;
    info!("dormantwatch stopped");
}

/// Consume committed event batches, evaluate patterns, forward alerts.
async fn run_detection<N: Notifier>(
    mut events_rx: mpsc::UnboundedReceiver<Vec<ActivityEvent>>,
    mut detector: PatternDetector,
    mut alert_manager: AlertManager<N>,
) {
    let mut batches: u64 = 0;
    while let Some(batch) = events_rx.recv().await {
        batches += 1;
        let patterns = detector.ingest(&batch);
        for pattern in &patterns {
            alert_manager.handle(pattern).await;
        }
    }
    info!(batches, "detection task stopped");
}
