use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::MiningConfig;
use crate::daemon_api::Daemon;
use crate::engine::{MiningOutcome, SearchEngine};
use crate::monitor::{TipMonitor, TipWait};
use crate::pow::BlockHasher;
use crate::types::{
    append_merge_mining_tag, BlockTemplate, MergeMiningTag, MiningParameters,
    BLOCK_MAJOR_VERSION_2,
};
use crate::ui;

const HASH_RATE_INTERVAL: Duration = Duration::from_secs(60);

/// Events carry the attempt number they originate from, so an outcome of a
/// superseded attempt can never be mistaken for the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerEvent {
    BlockMined { attempt: u64, block: Box<BlockTemplate> },
    TipAdvanced { attempt: u64 },
    ShutdownRequested,
}

/// Drives the whole mining lifecycle: fetch a template, adjust it, run one
/// search attempt and one tip monitor, react to whichever finishes first,
/// repeat until the block limit is reached or a shutdown is requested.
pub struct Manager<D> {
    config: MiningConfig,
    daemon: Arc<D>,
    hasher: Arc<dyn BlockHasher>,
    engine: SearchEngine,
    monitor: Arc<TipMonitor<D>>,
    events_tx: Sender<MinerEvent>,
    events_rx: Receiver<MinerEvent>,
    shutdown: Arc<AtomicBool>,
    last_block_timestamp: u64,
    attempt: u64,
    search_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl<D: Daemon + 'static> Manager<D> {
    pub fn new(config: MiningConfig, daemon: Arc<D>, hasher: Arc<dyn BlockHasher>) -> Self {
        let (events_tx, events_rx) = unbounded();
        let engine = SearchEngine::new(Arc::clone(&hasher));
        let monitor = Arc::new(TipMonitor::new(
            Arc::clone(&daemon),
            config.mining_address.clone(),
            config.scan_period,
        ));

        Self {
            config,
            daemon,
            hasher,
            engine,
            monitor,
            events_tx,
            events_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_block_timestamp: 0,
            attempt: 0,
            search_task: None,
            monitor_task: None,
        }
    }

    /// Sender for injecting `ShutdownRequested` from a signal handler.
    pub fn event_sender(&self) -> Sender<MinerEvent> {
        self.events_tx.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Synchronous; returns once the block limit is reached or a shutdown is
    /// requested.
    pub fn start(&mut self) -> Result<()> {
        let Some(mut params) = self.request_mining_parameters() else {
            return Ok(());
        };
        self.adjust_block_template(&mut params.block_template)?;

        let (reporter_stop, reporter) = self.spawn_hash_rate_reporter();
        self.start_round(params);

        let result = self.event_loop();

        self.stop_round();
        let _ = reporter_stop.try_send(());
        let _ = reporter.join();
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut blocks_mined = 0u32;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let Ok(event) = self.events_rx.recv() else {
                return Ok(());
            };

            match event {
                MinerEvent::BlockMined { attempt, block } => {
                    if attempt != self.attempt {
                        continue;
                    }
                    self.stop_round();

                    if self.submit_block(&block) {
                        self.last_block_timestamp = block.timestamp;
                        blocks_mined += 1;
                        if self.config.blocks_limit != 0 && blocks_mined == self.config.blocks_limit
                        {
                            ui::info(
                                "MINER",
                                format!(
                                    "mined requested amount of blocks ({}), quitting",
                                    self.config.blocks_limit
                                ),
                            );
                            return Ok(());
                        }
                    }

                    let Some(mut params) = self.request_mining_parameters() else {
                        return Ok(());
                    };
                    self.adjust_block_template(&mut params.block_template)?;
                    self.start_round(params);
                }
                MinerEvent::TipAdvanced { attempt } => {
                    if attempt != self.attempt {
                        continue;
                    }
                    self.stop_round();

                    let Some(mut params) = self.request_mining_parameters() else {
                        return Ok(());
                    };
                    self.adjust_block_template(&mut params.block_template)?;
                    self.start_round(params);
                }
                MinerEvent::ShutdownRequested => return Ok(()),
            }
        }
    }

    fn start_round(&mut self, params: MiningParameters) {
        self.attempt += 1;
        self.start_monitoring();
        self.start_mining(params);
    }

    fn stop_round(&mut self) {
        self.stop_mining();
        self.stop_monitoring();
    }

    fn start_mining(&mut self, params: MiningParameters) {
        let engine = self.engine.clone();
        let events = self.events_tx.clone();
        let attempt = self.attempt;
        let thread_count = self.config.threads;

        let handle = thread::Builder::new()
            .name("miner-search".into())
            .spawn(move || match engine.mine(&params, thread_count) {
                Ok(MiningOutcome::Found(block)) => {
                    let _ = events.send(MinerEvent::BlockMined {
                        attempt,
                        block: Box::new(block),
                    });
                }
                Ok(MiningOutcome::Cancelled) => {}
                Err(err) => {
                    // A broken attempt must not stall the event loop; force a
                    // template refresh instead.
                    ui::warn("MINER", format!("search attempt failed: {err:#}"));
                    let _ = events.send(MinerEvent::TipAdvanced { attempt });
                }
            })
            .expect("search task should spawn");
        self.search_task = Some(handle);
    }

    fn stop_mining(&mut self) {
        self.engine.stop();
        if let Some(handle) = self.search_task.take() {
            let _ = handle.join();
        }
    }

    fn start_monitoring(&mut self) {
        let monitor = Arc::clone(&self.monitor);
        let events = self.events_tx.clone();
        let attempt = self.attempt;

        let handle = thread::Builder::new()
            .name("miner-tip".into())
            .spawn(move || {
                if monitor.wait_for_update() == TipWait::Updated {
                    let _ = events.send(MinerEvent::TipAdvanced { attempt });
                }
            })
            .expect("tip monitor task should spawn");
        self.monitor_task = Some(handle);
    }

    fn stop_monitoring(&mut self) {
        self.monitor.stop();
        if let Some(handle) = self.monitor_task.take() {
            let _ = handle.join();
        }
    }

    fn submit_block(&self, block: &BlockTemplate) -> bool {
        match self.daemon.submit_block(block) {
            Ok(()) => {
                let id = hex::encode(self.hasher.long_hash(&block.to_bytes()));
                ui::success("MINER", format!("Block found! Hash: {id}"));
                true
            }
            Err(err) => {
                ui::warn(
                    "MINER",
                    format!("failed to submit block, possibly daemon offline or syncing? ({err})"),
                );
                false
            }
        }
    }

    /// Retries until a template arrives or a shutdown is requested; returns
    /// `None` only in the latter case.
    fn request_mining_parameters(&self) -> Option<MiningParameters> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.daemon.fetch_block_template(&self.config.mining_address) {
                Ok(params) => return Some(params),
                Err(err) => {
                    ui::warn(
                        "MINER",
                        format!("failed to get block template, is your daemon open? ({err})"),
                    );
                    thread::sleep(self.config.fetch_retry_delay);
                }
            }
        }
    }

    fn adjust_block_template(&self, template: &mut BlockTemplate) -> Result<()> {
        if template.major_version >= BLOCK_MAJOR_VERSION_2 {
            let tag = MergeMiningTag {
                depth: 0,
                merkle_root: template.merkle_root(),
            };
            let extra = &mut template.parent_block.base_transaction.extra;
            extra.clear();
            append_merge_mining_tag(extra, &tag).context("couldn't append merge mining tag")?;
        }

        if self.config.first_block_timestamp == 0 {
            return Ok(());
        }

        if self.last_block_timestamp == 0 {
            template.timestamp = self.config.first_block_timestamp;
        } else if self.config.block_timestamp_interval != 0 {
            template.timestamp = self.last_block_timestamp + self.config.block_timestamp_interval;
        }

        Ok(())
    }

    fn spawn_hash_rate_reporter(&self) -> (Sender<()>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let engine = self.engine.clone();

        let handle = thread::Builder::new()
            .name("miner-reporter".into())
            .spawn(move || {
                let mut last_count = engine.hash_count();
                loop {
                    match stop_rx.recv_timeout(HASH_RATE_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let current = engine.hash_count();
                    let rate = current.saturating_sub(last_count) as f64
                        / HASH_RATE_INTERVAL.as_secs_f64();
                    last_count = current;
                    ui::success("STATS", format!("mining at {}", ui::format_hashrate(rate)));
                }
            })
            .expect("hash rate reporter should spawn");

        (stop_tx, handle)
    }
}
