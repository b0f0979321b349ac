use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::daemon_api::Daemon;
use crate::types::Hash;
use crate::ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipWait {
    /// The daemon reported a parent hash different from the baseline.
    Updated,
    /// `stop` was signalled before a change was observed.
    Interrupted,
}

/// Watches the daemon's chain tip by re-fetching the block template on a
/// cadence. The inter-poll sleep is a channel wait, so `stop` unblocks it
/// immediately instead of letting the poll period run out.
pub struct TipMonitor<D> {
    daemon: Arc<D>,
    mining_address: String,
    poll_interval: Duration,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl<D: Daemon> TipMonitor<D> {
    pub fn new(daemon: Arc<D>, mining_address: String, poll_interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            daemon,
            mining_address,
            poll_interval,
            stop_tx,
            stop_rx,
        }
    }

    /// Blocks until the tip moves away from the baseline captured on entry,
    /// or `stop` is signalled. Fetch failures count as "no change observed";
    /// a baseline that could not be captured is retried on the next tick.
    pub fn wait_for_update(&self) -> TipWait {
        // A stop aimed at a previous wait must not cancel this one.
        while self.stop_rx.try_recv().is_ok() {}

        let mut baseline = self.poll_tip();

        loop {
            match self.stop_rx.recv_timeout(self.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return TipWait::Interrupted,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let Some(current) = self.poll_tip() else {
                continue;
            };
            match baseline {
                Some(base) if current != base => return TipWait::Updated,
                Some(_) => {}
                None => baseline = Some(current),
            }
        }
    }

    /// Idempotent; unblocks an in-flight `wait_for_update` without waiting
    /// for the poll interval to elapse.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    fn poll_tip(&self) -> Option<Hash> {
        match self.daemon.fetch_block_template(&self.mining_address) {
            Ok(params) => Some(params.block_template.previous_hash),
            Err(err) => {
                ui::warn("TIP", format!("tip check failed: {err}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
    use std::thread;
    use std::time::Instant;

    use crate::daemon_api::ApiError;
    use crate::types::{BlockTemplate, MiningParameters};

    /// Returns templates whose parent hash is filled with `tip`; flipping
    /// `tip` models another miner winning a block.
    struct StubDaemon {
        tip: AtomicU8,
        failing: AtomicU64,
    }

    impl StubDaemon {
        fn with_tip(tip: u8) -> Arc<Self> {
            Arc::new(Self {
                tip: AtomicU8::new(tip),
                failing: AtomicU64::new(0),
            })
        }
    }

    impl Daemon for StubDaemon {
        fn fetch_block_template(&self, _address: &str) -> Result<MiningParameters, ApiError> {
            if self.failing.load(Ordering::SeqCst) > 0 {
                self.failing.fetch_sub(1, Ordering::SeqCst);
                return Err(ApiError::UnexpectedStatus {
                    endpoint: "/block/template",
                    status: 500,
                });
            }
            let mut template = BlockTemplate {
                major_version: 1,
                ..BlockTemplate::default()
            };
            template.previous_hash = [self.tip.load(Ordering::SeqCst); 32];
            Ok(MiningParameters {
                block_template: template,
                difficulty: 1,
            })
        }

        fn submit_block(&self, _block: &BlockTemplate) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn monitor(daemon: Arc<StubDaemon>, poll: Duration) -> TipMonitor<StubDaemon> {
        TipMonitor::new(daemon, "miner-address".to_string(), poll)
    }

    /// Runs `wait_for_update` in the background and keeps flipping the stub's
    /// tip until the change is reported, so the assertion cannot race the
    /// baseline capture.
    fn expect_update_after_flips(monitor: TipMonitor<StubDaemon>, daemon: Arc<StubDaemon>) {
        let (done_tx, done_rx) = bounded(1);
        let waiter = thread::spawn(move || {
            let _ = done_tx.send(monitor.wait_for_update());
        });

        let mut next_tip = 0xb0u8;
        let mut result = None;
        for _ in 0..200 {
            match done_rx.recv_timeout(Duration::from_millis(30)) {
                Ok(outcome) => {
                    result = Some(outcome);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    daemon.tip.store(next_tip, Ordering::SeqCst);
                    next_tip = next_tip.wrapping_add(1);
                }
                Err(RecvTimeoutError::Disconnected) => panic!("wait thread dropped its result"),
            }
        }

        waiter.join().expect("wait thread should not panic");
        assert_eq!(result, Some(TipWait::Updated));
    }

    #[test]
    fn detects_tip_change() {
        let daemon = StubDaemon::with_tip(0xaa);
        let monitor = monitor(daemon.clone(), Duration::from_millis(10));
        expect_update_after_flips(monitor, daemon);
    }

    #[test]
    fn stop_unblocks_long_poll_promptly() {
        let daemon = StubDaemon::with_tip(0xaa);
        let monitor = Arc::new(monitor(daemon, Duration::from_secs(60)));

        let stopper = Arc::clone(&monitor);
        let stop_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let started = Instant::now();
        assert_eq!(monitor.wait_for_update(), TipWait::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(1));

        stop_thread.join().expect("stop thread should not panic");
    }

    #[test]
    fn fetch_errors_count_as_no_change() {
        // Baseline capture and the first polls fail; the monitor must keep
        // going and report the change once fetches recover.
        let daemon = StubDaemon::with_tip(0xaa);
        daemon.failing.store(3, Ordering::SeqCst);
        let monitor = monitor(daemon.clone(), Duration::from_millis(5));
        expect_update_after_flips(monitor, daemon);
    }

    #[test]
    fn stale_stop_does_not_cancel_next_wait() {
        let daemon = StubDaemon::with_tip(0xaa);
        let monitor = monitor(daemon.clone(), Duration::from_millis(10));

        monitor.stop();
        expect_update_after_flips(monitor, daemon);
    }
}
