mod config;
mod daemon_api;
mod engine;
mod manager;
mod monitor;
mod pow;
mod types;
mod ui;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::Config;
use crate::daemon_api::ApiClient;
use crate::manager::{Manager, MinerEvent};
use crate::pow::{Blake2PowHasher, BlockHasher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse();
    let mining_config = cfg.mining_config();

    ui::startup_summary(
        "starting cnminer",
        &[
            ("daemon", cfg.daemon_url()),
            ("address", cfg.address.clone()),
            ("threads", mining_config.threads.to_string()),
            ("scan period", format!("{}s", cfg.scan_period)),
            (
                "blocks limit",
                if cfg.blocks_limit == 0 {
                    "unlimited".to_string()
                } else {
                    cfg.blocks_limit.to_string()
                },
            ),
        ],
    );

    let daemon = Arc::new(
        ApiClient::new(cfg.daemon_url(), REQUEST_TIMEOUT)
            .context("failed to build daemon client")?,
    );
    let hasher: Arc<dyn BlockHasher> = Arc::new(Blake2PowHasher);

    let mut manager = Manager::new(mining_config, daemon, hasher);

    let shutdown = manager.shutdown_flag();
    let events = manager.event_sender();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
        let _ = events.send(MinerEvent::ShutdownRequested);
    })
    .context("failed to install shutdown handler")?;

    manager.start()?;
    ui::info("MINER", "cnminer stopped");
    Ok(())
}
