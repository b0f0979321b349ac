use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{bail, Result};

use crate::pow::{check_hash, BlockHasher};
use crate::types::{BlockTemplate, MiningParameters};
use crate::ui;

const STATE_STOPPED: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_FOUND: u8 = 2;

#[derive(Debug)]
pub enum MiningOutcome {
    Found(BlockTemplate),
    Cancelled,
}

/// Set once every worker of an attempt has returned; `stop` blocks on it so
/// callers never observe a half-torn-down attempt.
struct Latch {
    set: Mutex<bool>,
    signal: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            set: Mutex::new(true),
            signal: Condvar::new(),
        }
    }

    fn clear(&self) {
        *self.set.lock().expect("latch lock poisoned") = false;
    }

    fn set(&self) {
        *self.set.lock().expect("latch lock poisoned") = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut set = self.set.lock().expect("latch lock poisoned");
        while !*set {
            set = self.signal.wait(set).expect("latch lock poisoned");
        }
    }
}

struct EngineShared {
    state: AtomicU8,
    hash_count: AtomicU64,
    winner: Mutex<Option<BlockTemplate>>,
    workers_done: Latch,
}

/// Parallel nonce search with first-finder-wins termination. One attempt at a
/// time; clones share the attempt state so `stop` and `hash_count` work from
/// any thread.
#[derive(Clone)]
pub struct SearchEngine {
    hasher: Arc<dyn BlockHasher>,
    shared: Arc<EngineShared>,
}

impl SearchEngine {
    pub fn new(hasher: Arc<dyn BlockHasher>) -> Self {
        Self {
            hasher,
            shared: Arc::new(EngineShared {
                state: AtomicU8::new(STATE_STOPPED),
                hash_count: AtomicU64::new(0),
                winner: Mutex::new(None),
                workers_done: Latch::new(),
            }),
        }
    }

    /// Runs one attempt, blocking until every worker has returned. Workers
    /// partition the nonce space into residue classes mod `thread_count`,
    /// starting from a random seed.
    pub fn mine(&self, params: &MiningParameters, thread_count: usize) -> Result<MiningOutcome> {
        if thread_count == 0 {
            bail!("mining requires at least one worker thread");
        }
        if self.shared.state.load(Ordering::Acquire) == STATE_IN_PROGRESS {
            bail!("a mining attempt is already in progress");
        }

        *self.shared.winner.lock().expect("winner slot poisoned") = None;
        self.shared.workers_done.clear();
        self.shared.state.store(STATE_IN_PROGRESS, Ordering::Release);

        let seed: u32 = rand::random();
        let difficulty = params.difficulty;
        let stride = thread_count as u32;

        ui::info(
            "MINE",
            format!("searching at difficulty {difficulty} on {thread_count} threads"),
        );

        thread::scope(|scope| {
            for index in 0..thread_count {
                let mut block = params.block_template.clone();
                block.nonce = seed.wrapping_add(index as u32);
                let shared = &*self.shared;
                let hasher = &*self.hasher;
                scope.spawn(move || worker_loop(shared, hasher, block, difficulty, stride));
            }
        });

        self.shared.workers_done.set();

        if self.shared.state.load(Ordering::Acquire) == STATE_FOUND {
            let block = self.shared.winner.lock().expect("winner slot poisoned").take();
            if let Some(block) = block {
                return Ok(MiningOutcome::Found(block));
            }
        }

        Ok(MiningOutcome::Cancelled)
    }

    /// Idempotent. Cancels an in-flight attempt and waits for its workers;
    /// wake-up latency is bounded by one hash computation per worker.
    pub fn stop(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_IN_PROGRESS,
                STATE_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.shared.workers_done.wait();
        }
    }

    /// Cumulative hashes across all attempts; never reset.
    pub fn hash_count(&self) -> u64 {
        self.shared.hash_count.load(Ordering::Relaxed)
    }
}

fn worker_loop(
    shared: &EngineShared,
    hasher: &dyn BlockHasher,
    mut block: BlockTemplate,
    difficulty: u64,
    stride: u32,
) {
    while shared.state.load(Ordering::Acquire) == STATE_IN_PROGRESS {
        let digest = hasher.long_hash(&block.to_bytes());

        if check_hash(&digest, difficulty) {
            // Only the winning CAS publishes; a lost race means another
            // worker won or a stop beat us, either way this copy is dropped.
            if shared
                .state
                .compare_exchange(
                    STATE_IN_PROGRESS,
                    STATE_FOUND,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                *shared.winner.lock().expect("winner slot poisoned") = Some(block);
            }
            return;
        }

        shared.hash_count.fetch_add(1, Ordering::Relaxed);
        block.nonce = block.nonce.wrapping_add(stride);
    }
}
