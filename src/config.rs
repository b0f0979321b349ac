use std::thread;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cnminer",
    version,
    about = "Standalone CPU miner for CryptoNote-style daemons"
)]
pub struct Config {
    /// Daemon RPC host
    #[arg(long, env = "CNMINER_DAEMON_HOST", default_value = "127.0.0.1")]
    pub daemon_host: String,

    /// Daemon RPC port
    #[arg(long, env = "CNMINER_DAEMON_PORT", default_value_t = 11898)]
    pub daemon_port: u16,

    /// Wallet address that receives block rewards
    #[arg(long, env = "CNMINER_ADDRESS")]
    pub address: String,

    /// Number of hash worker threads (defaults to all logical CPUs)
    #[arg(long, env = "CNMINER_THREADS", default_value_t = default_thread_count())]
    pub threads: usize,

    /// Seconds between chain tip checks
    #[arg(long, env = "CNMINER_SCAN_PERIOD", default_value_t = 30)]
    pub scan_period: u64,

    /// Stop after mining this many blocks (0 = unlimited)
    #[arg(long, env = "CNMINER_BLOCKS_LIMIT", default_value_t = 0)]
    pub blocks_limit: u32,

    /// Timestamp forced onto the first mined block (0 = leave template
    /// timestamps alone)
    #[arg(long, env = "CNMINER_FIRST_BLOCK_TIMESTAMP", default_value_t = 0)]
    pub first_block_timestamp: u64,

    /// Seconds added to the previous block's timestamp for each following
    /// block when timestamp overrides are active
    #[arg(long, env = "CNMINER_BLOCK_TIMESTAMP_INTERVAL", default_value_t = 0)]
    pub block_timestamp_interval: u64,

    /// Seconds to wait between block template retries
    #[arg(long, env = "CNMINER_FETCH_RETRY", default_value_t = 1)]
    pub fetch_retry: u64,
}

fn default_thread_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Runtime view of the CLI surface, consumed by the manager.
#[derive(Debug, Clone)]
pub struct MiningConfig {
    pub mining_address: String,
    pub threads: usize,
    pub scan_period: Duration,
    pub blocks_limit: u32,
    pub first_block_timestamp: u64,
    pub block_timestamp_interval: u64,
    pub fetch_retry_delay: Duration,
}

impl Config {
    pub fn daemon_url(&self) -> String {
        format!("http://{}:{}", self.daemon_host, self.daemon_port)
    }

    pub fn mining_config(&self) -> MiningConfig {
        MiningConfig {
            mining_address: self.address.clone(),
            threads: self.threads,
            scan_period: Duration::from_secs(self.scan_period.max(1)),
            blocks_limit: self.blocks_limit,
            first_block_timestamp: self.first_block_timestamp,
            block_timestamp_interval: self.block_timestamp_interval,
            fetch_retry_delay: Duration::from_secs(self.fetch_retry.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = Config::try_parse_from(["cnminer", "--address", "miner-address"])
            .expect("minimal command line should parse");

        assert_eq!(cfg.daemon_url(), "http://127.0.0.1:11898");
        assert_eq!(cfg.scan_period, 30);
        assert_eq!(cfg.blocks_limit, 0);
        assert!(cfg.threads >= 1);
    }

    #[test]
    fn mining_config_clamps_periods() {
        let cfg = Config::try_parse_from([
            "cnminer",
            "--address",
            "miner-address",
            "--scan-period",
            "0",
            "--fetch-retry",
            "0",
        ])
        .expect("command line should parse");

        let mining = cfg.mining_config();
        assert_eq!(mining.scan_period, Duration::from_secs(1));
        assert_eq!(mining.fetch_retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn address_is_required() {
        assert!(Config::try_parse_from(["cnminer"]).is_err());
    }
}
