use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

mod config;
mod dispatcher;
mod error;
mod event_log;
mod model;
mod persist;
mod scheduler;
mod settings;
mod verification;

use dispatcher::{Dispatcher, RawUpdate};
use event_log::EventLog;
use model::UserId;
use scheduler::Scheduler;
use settings::SettingsStore;
use verification::{Processor, VerificationStore};

const INBOUND_CHANNEL_CAPACITY: usize = 256;

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = config::load_config(&config_path)
        .with_context(|| format!("load config: {}", config_path.display()))?;

    let filter = cfg.runtime.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("starting welcome-guard with config {}", config_path.display());

    let defaults = cfg.defaults.resolve()?;
    let data_dir = PathBuf::from(
        cfg.runtime
            .data_dir
            .clone()
            .unwrap_or_else(|| "./data".to_string()),
    );

    // The stores are the source of truth; failing to open any of them is
    // fatal.
    let settings = Arc::new(SettingsStore::open(
        data_dir.join("chat_settings.json"),
        defaults,
    )?);
    let event_log = Arc::new(EventLog::open(data_dir.join("event_log.json"))?);
    let scheduler = Arc::new(Scheduler::open(data_dir.join("scheduler.json"))?);
    let store = VerificationStore::open(data_dir.join("verifications.json"))?;

    // The network clients attach here: they feed raw updates into the
    // channel and register with the dispatcher for outbound removal. This
    // binary wires the boundary; the adapters themselves are
    // deployment-specific.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<RawUpdate>(INBOUND_CHANNEL_CAPACITY);
    let dispatcher = Arc::new(Dispatcher::new(Vec::new()));

    let admin_user_ids: Vec<UserId> = cfg
        .runtime
        .admin_user_ids
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(UserId)
        .collect();
    let processor = Arc::new(Mutex::new(Processor::new(
        settings.clone(),
        scheduler.clone(),
        event_log.clone(),
        dispatcher.clone(),
        store,
        admin_user_ids,
        cfg.runtime.command_prefix(),
    )));

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, shutting down");
        let _ = shutdown_ctrl.send(());
    });

    let processor_inbound = processor.clone();
    let mut shutdown_rx_inbound = shutdown_tx.subscribe();
    let h_inbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx_inbound.recv() => { break; }
                raw = inbound_rx.recv() => {
                    let Some(raw) = raw else { break };
                    for event in dispatcher::normalize(raw) {
                        if let Err(e) = processor_inbound.lock().await.handle_event(event).await {
                            error!("failed to process chat event: {e}");
                        }
                    }
                }
            }
        }
    });

    let processor_deadline = processor.clone();
    let scheduler_run = scheduler.clone();
    let shutdown_rx_scheduler = shutdown_tx.subscribe();
    let h_scheduler = tokio::spawn(async move {
        let handler = move |event: scheduler::ScheduledEvent| {
            let processor = processor_deadline.clone();
            async move { processor.lock().await.on_deadline(event).await }
        };
        if let Err(e) = scheduler_run.run(handler, shutdown_rx_scheduler).await {
            error!("scheduler loop failed: {e}");
        }
    });

    let processor_prune = processor.clone();
    let scheduler_prune = scheduler.clone();
    let prune_interval = cfg.runtime.prune_interval();
    let retention_days = cfg.runtime.prune_retention_days();
    let mut shutdown_rx_prune = shutdown_tx.subscribe();
    let h_prune = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx_prune.recv() => { break; }
                _ = ticker.tick() => {
                    let horizon = Utc::now() - chrono::Duration::days(retention_days);
                    if let Err(e) = scheduler_prune.prune_resolved(horizon) {
                        warn!("pruning resolved scheduler events failed: {e}");
                    }
                    if let Err(e) = processor_prune.lock().await.prune_archive(horizon) {
                        warn!("pruning archived verifications failed: {e}");
                    }
                }
            }
        }
    });

    // Keep the inbound sender alive for the adapters until shutdown.
    let _inbound_tx = inbound_tx;

    let mut shutdown_rx_main = shutdown_tx.subscribe();
    let _ = shutdown_rx_main.recv().await;

    let _ = ctrl_handle.await;
    let _ = h_inbound.await;
    let _ = h_scheduler.await;
    let _ = h_prune.await;

    info!("welcome-guard stopped");
    Ok(())
}
