//! Environment configuration and the built-in chain registry.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Process configuration, read once from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database_url: String,
    pub ankr_api_key: String,
    pub port: u16,
    pub bind_addrs: String,
    pub pushover_app_token: String,
    pub pushover_user_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        let bind_addrs = env::var("BIND_ADDRS").unwrap_or_default();
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            ankr_api_key: env::var("ANKR_API_KEY").unwrap_or_default(),
            port,
            bind_addrs: if bind_addrs.is_empty() {
                "0.0.0.0".to_string()
            } else {
                bind_addrs
            },
            pushover_app_token: env::var("PUSHOVER_APP_TOKEN").unwrap_or_default(),
            pushover_user_key: env::var("PUSHOVER_USER_KEY").unwrap_or_default(),
        }
    }
}

/// One EVM chain the monitor watches.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: &'static str,
    pub chain_id: u64,
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
    pub enabled: bool,
    pub block_time: Duration,
}

impl ChainConfig {
    /// Dial URL with the provider API key substituted in. Every connect and
    /// reconnect must go through here so the key is never dropped.
    pub fn dial_url(&self, ankr_api_key: &str) -> String {
        build_rpc_url(self.rpc_url, ankr_api_key)
    }
}

pub fn build_rpc_url(base_url: &str, ankr_api_key: &str) -> String {
    if !ankr_api_key.is_empty() && base_url.contains("ankr.com") {
        format!("{}/{}", base_url, ankr_api_key)
    } else {
        base_url.to_string()
    }
}

pub fn default_chains() -> Vec<ChainConfig> {
    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }
    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }
    vec![
        ChainConfig { name: "Ethereum", chain_id: 1, rpc_url: "https://rpc.ankr.com/eth", explorer_url: "https://etherscan.io", enabled: true, block_time: secs(12) },
        ChainConfig { name: "BSC", chain_id: 56, rpc_url: "https://rpc.ankr.com/bsc", explorer_url: "https://bscscan.com", enabled: true, block_time: secs(3) },
        ChainConfig { name: "Polygon", chain_id: 137, rpc_url: "https://rpc.ankr.com/polygon", explorer_url: "https://polygonscan.com", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Arbitrum", chain_id: 42161, rpc_url: "https://rpc.ankr.com/arbitrum", explorer_url: "https://arbiscan.io", enabled: true, block_time: millis(250) },
        ChainConfig { name: "Avalanche", chain_id: 43114, rpc_url: "https://rpc.ankr.com/avalanche", explorer_url: "https://snowtrace.io", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Fantom", chain_id: 250, rpc_url: "https://rpc.ankr.com/fantom", explorer_url: "https://ftmscan.com", enabled: true, block_time: secs(1) },
        ChainConfig { name: "Optimism", chain_id: 10, rpc_url: "https://rpc.ankr.com/optimism", explorer_url: "https://optimistic.etherscan.io", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Base", chain_id: 8453, rpc_url: "https://rpc.ankr.com/base", explorer_url: "https://basescan.org", enabled: true, block_time: secs(2) },
        ChainConfig { name: "zkSync", chain_id: 324, rpc_url: "https://rpc.ankr.com/zksync_era", explorer_url: "https://explorer.zksync.io", enabled: true, block_time: secs(1) },
        ChainConfig { name: "Gnosis", chain_id: 100, rpc_url: "https://rpc.ankr.com/gnosis", explorer_url: "https://gnosisscan.io", enabled: true, block_time: secs(5) },
        ChainConfig { name: "Celo", chain_id: 42220, rpc_url: "https://rpc.ankr.com/celo", explorer_url: "https://celoscan.io", enabled: true, block_time: secs(5) },
        ChainConfig { name: "Linea", chain_id: 59144, rpc_url: "https://rpc.ankr.com/linea", explorer_url: "https://lineascan.build", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Scroll", chain_id: 534352, rpc_url: "https://rpc.ankr.com/scroll", explorer_url: "https://scrollscan.com", enabled: true, block_time: secs(3) },
        ChainConfig { name: "Mantle", chain_id: 5000, rpc_url: "https://rpc.ankr.com/mantle", explorer_url: "https://mantlescan.xyz", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Blast", chain_id: 81457, rpc_url: "https://rpc.ankr.com/blast", explorer_url: "https://blastscan.io", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Arbitrum Nova", chain_id: 42170, rpc_url: "https://rpc.ankr.com/arbitrumnova", explorer_url: "https://nova.arbiscan.io", enabled: true, block_time: millis(250) },
        ChainConfig { name: "Moonbeam", chain_id: 1284, rpc_url: "https://rpc.ankr.com/moonbeam", explorer_url: "https://moonscan.io", enabled: true, block_time: secs(12) },
        ChainConfig { name: "Metis", chain_id: 1088, rpc_url: "https://rpc.ankr.com/metis", explorer_url: "https://andromeda-explorer.metis.io", enabled: true, block_time: secs(2) },
        ChainConfig { name: "Kaia", chain_id: 8217, rpc_url: "https://rpc.ankr.com/kaia", explorer_url: "https://kaiascan.io", enabled: true, block_time: secs(1) },
        ChainConfig { name: "Harmony", chain_id: 1666600000, rpc_url: "https://rpc.ankr.com/harmony", explorer_url: "https://explorer.harmony.one", enabled: true, block_time: secs(2) },
        ChainConfig { name: "IoTeX", chain_id: 4689, rpc_url: "https://rpc.ankr.com/iotex", explorer_url: "https://iotexscan.io", enabled: true, block_time: secs(5) },
    ]
}

pub fn chain_by_id(chain_id: u64) -> Option<ChainConfig> {
    default_chains().into_iter().find(|c| c.chain_id == chain_id)
}

pub fn chain_by_name(name: &str) -> Option<ChainConfig> {
    default_chains()
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
}

pub fn chain_name(chain_id: u64) -> String {
    chain_by_id(chain_id)
        .map(|c| c.name.to_string())
        .unwrap_or_else(|| format!("chain-{chain_id}"))
}

/// Senders whose transactions carry no real user signature (L2 deposits,
/// sequencer bookkeeping). Matched lower-cased, dropped before indexing.
pub fn system_addresses() -> HashSet<String> {
    [
        // Optimism/Base L1 deposit sender
        "0xdeaddeaddeaddeaddeaddeaddeaddeaddead0001",
        // Arbitrum system
        "0x00000000000000000000000000000000000a4b05",
        // Celo system
        "0x977f82a600a1414e583f7f13623f1ac5d58b1c0b",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
