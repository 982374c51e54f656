//! Per-chain block scanners.
//!
//! One tokio task per chain walks blocks in order, extracts signature
//! fingerprints, pushes them through the R-value index and publishes every
//! collision onto a bounded channel. Pacing adapts to the chain: flat-out
//! while catching up, estimated block time while riding the tip.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{self, ChainConfig};
use crate::math;
use crate::retry::CircuitBreaker;
use crate::rpc::{ChainRpc, RpcBlock, RpcError};
use crate::storage::{Storage, StorageError, TxInput, TxRef};

#[derive(Debug, Error)]
enum ScanError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Capacity of the scanner -> orchestrator channel. Overflow is dropped
/// with a warning; the collision row is already persisted and can be
/// re-derived from storage.
pub const COLLISION_CHANNEL_CAPACITY: usize = 10_000;

const CONSECUTIVE_ERROR_LIMIT: u32 = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CATCH_UP_DELAY: Duration = Duration::from_millis(50);
const MIN_TIP_WAIT: Duration = Duration::from_millis(500);
const MAX_TIP_WAIT: Duration = Duration::from_secs(15);
const CURSOR_SAVE_INTERVAL: u64 = 100;
const INITIAL_LOOKBACK: u64 = 1000;

#[derive(Debug, Clone)]
pub struct CollisionEvent {
    pub r_value: String,
    pub new_tx_hash: String,
    pub new_chain_id: u64,
    pub new_address: String,
    pub first_tx: TxRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Disconnected,
    Connecting,
    CatchingUp,
    AtTip,
    Backoff,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub chain: String,
    pub chain_id: u64,
    pub current_block: u64,
    pub latest_block: u64,
    pub running: bool,
    pub state: ScanState,
    pub error_count: u64,
}

struct Pacing {
    last_new_block_at: Option<Instant>,
    est_block_time: Duration,
}

struct ChainRuntime {
    config: ChainConfig,
    running: AtomicBool,
    stats: Mutex<ChainStats>,
    pacing: Mutex<Pacing>,
}

impl ChainRuntime {
    fn new(config: ChainConfig) -> Self {
        let stats = ChainStats {
            chain: config.name.to_string(),
            chain_id: config.chain_id,
            current_block: 0,
            latest_block: 0,
            running: false,
            state: ScanState::Disconnected,
            error_count: 0,
        };
        let pacing = Pacing {
            last_new_block_at: None,
            est_block_time: config.block_time,
        };
        Self {
            config,
            running: AtomicBool::new(false),
            stats: Mutex::new(stats),
            pacing: Mutex::new(pacing),
        }
    }

    fn set_state(&self, state: ScanState) {
        self.stats.lock().state = state;
    }

    fn bump_errors(&self) {
        self.stats.lock().error_count += 1;
    }

    /// Exponential moving average of the observed block interval,
    /// weight 0.3 for the new observation.
    fn observe_tip(&self, prev_latest: u64, latest: u64) {
        if latest <= prev_latest || prev_latest == 0 {
            return;
        }
        let now = Instant::now();
        let mut pacing = self.pacing.lock();
        if let Some(last) = pacing.last_new_block_at {
            let observed = now.duration_since(last) / (latest - prev_latest) as u32;
            pacing.est_block_time = pacing.est_block_time.mul_f64(0.7) + observed.mul_f64(0.3);
        }
        pacing.last_new_block_at = Some(now);
    }

    fn tip_wait(&self) -> Duration {
        self.pacing
            .lock()
            .est_block_time
            .clamp(MIN_TIP_WAIT, MAX_TIP_WAIT)
    }
}

pub struct Scanner {
    storage: Arc<dyn Storage>,
    rpc: Arc<dyn ChainRpc>,
    chains: HashMap<u64, Arc<ChainRuntime>>,
    collision_tx: mpsc::Sender<CollisionEvent>,
    system_addresses: HashSet<String>,
}

impl Scanner {
    pub fn new(
        storage: Arc<dyn Storage>,
        rpc: Arc<dyn ChainRpc>,
        collision_tx: mpsc::Sender<CollisionEvent>,
    ) -> Self {
        let chains = config::default_chains()
            .into_iter()
            .filter(|c| c.enabled)
            .map(|c| (c.chain_id, Arc::new(ChainRuntime::new(c))))
            .collect();
        Self {
            storage,
            rpc,
            chains,
            collision_tx,
            system_addresses: config::system_addresses(),
        }
    }

    pub fn chain_stats(&self) -> Vec<ChainStats> {
        let mut stats: Vec<ChainStats> = self
            .chains
            .values()
            .map(|c| {
                let mut snapshot = c.stats.lock().clone();
                snapshot.running = c.running.load(Ordering::SeqCst);
                snapshot
            })
            .collect();
        stats.sort_by_key(|s| s.chain_id);
        stats
    }

    pub async fn start_all(self: &Arc<Self>) {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        for chain_id in ids {
            self.start_chain(chain_id);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub fn stop_all(&self) {
        for chain_id in self.chains.keys().copied().collect::<Vec<_>>() {
            self.stop_chain(chain_id);
        }
    }

    pub fn start_chain(self: &Arc<Self>, chain_id: u64) {
        let Some(runtime) = self.chains.get(&chain_id).cloned() else {
            return;
        };
        if runtime.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            scanner.scan_loop(runtime).await;
        });
    }

    pub fn stop_chain(&self, chain_id: u64) {
        if let Some(runtime) = self.chains.get(&chain_id) {
            runtime.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn start_chain_by_name(self: &Arc<Self>, name: &str) -> bool {
        match config::chain_by_name(name) {
            Some(chain) => {
                self.start_chain(chain.chain_id);
                true
            }
            None => false,
        }
    }

    pub fn stop_chain_by_name(&self, name: &str) -> bool {
        match config::chain_by_name(name) {
            Some(chain) => {
                self.stop_chain(chain.chain_id);
                true
            }
            None => false,
        }
    }

    async fn scan_loop(&self, runtime: Arc<ChainRuntime>) {
        let chain_name = runtime.config.name;
        let chain_id = runtime.config.chain_id;
        runtime.set_state(ScanState::Connecting);

        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        // Resume from the cursor, or start a little behind the tip.
        let mut last_block = match self.storage.get_last_block(chain_id).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => match self.initial_cursor(&runtime).await {
                Some(block) => block,
                None => {
                    runtime.running.store(false, Ordering::SeqCst);
                    runtime.set_state(ScanState::Disconnected);
                    return;
                }
            },
            Err(e) => {
                error!("[{chain_name}] failed to load scan cursor: {e}");
                runtime.running.store(false, Ordering::SeqCst);
                runtime.set_state(ScanState::Disconnected);
                return;
            }
        };

        info!("[{chain_name}] starting scan from block {}", last_block + 1);
        let mut err_streak: u32 = 0;

        while runtime.running.load(Ordering::SeqCst) {
            if !breaker.allow() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let latest = match self.rpc.latest_height(chain_id).await {
                Ok(latest) => {
                    breaker.record_success();
                    latest
                }
                Err(e) => {
                    runtime.bump_errors();
                    breaker.record_failure();
                    warn!("[{chain_name}] failed to fetch latest block: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let prev_latest = {
                let mut stats = runtime.stats.lock();
                let prev = stats.latest_block;
                stats.latest_block = latest;
                prev
            };
            runtime.observe_tip(prev_latest, latest);

            if last_block >= latest {
                runtime.set_state(ScanState::AtTip);
                tokio::time::sleep(runtime.tip_wait()).await;
                continue;
            }
            runtime.set_state(ScanState::CatchingUp);

            let next_block = last_block + 1;
            match self.scan_block(&runtime, next_block).await {
                Ok(_) => {
                    err_streak = 0;
                    breaker.record_success();
                }
                Err(e) => {
                    err_streak += 1;
                    runtime.bump_errors();
                    breaker.record_failure();
                    error!("[{chain_name}] failed to scan block {next_block}: {e}");
                    if err_streak >= CONSECUTIVE_ERROR_LIMIT {
                        // Drop the connection on the floor and come back
                        // through the dial path, API key included.
                        warn!("[{chain_name}] too many consecutive errors, reconnecting");
                        runtime.set_state(ScanState::Backoff);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        runtime.set_state(ScanState::Connecting);
                        err_streak = 0;
                    } else {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    continue;
                }
            }

            runtime.stats.lock().current_block = next_block;
            last_block = next_block;

            if next_block % CURSOR_SAVE_INTERVAL == 0 {
                if let Err(e) = self.storage.save_last_block(chain_id, next_block).await {
                    warn!("[{chain_name}] failed to save cursor: {e}");
                }
            }
            if next_block % 1000 == 0 {
                info!(
                    "[{chain_name}] block {next_block}, {} behind",
                    latest.saturating_sub(next_block)
                );
            }

            if latest.saturating_sub(next_block) < 2 {
                runtime.set_state(ScanState::AtTip);
                tokio::time::sleep(runtime.tip_wait()).await;
            } else {
                tokio::time::sleep(CATCH_UP_DELAY).await;
            }
        }

        info!("[{chain_name}] scanner stopped");
        runtime.set_state(ScanState::Disconnected);
    }

    async fn initial_cursor(&self, runtime: &ChainRuntime) -> Option<u64> {
        let chain_name = runtime.config.name;
        for _ in 0..3 {
            if !runtime.running.load(Ordering::SeqCst) {
                return None;
            }
            match self.rpc.latest_height(runtime.config.chain_id).await {
                Ok(latest) => return Some(latest.saturating_sub(INITIAL_LOOKBACK)),
                Err(e) => {
                    runtime.bump_errors();
                    warn!("[{chain_name}] failed to fetch initial height: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        error!("[{chain_name}] giving up on initial connect");
        None
    }

    async fn scan_block(&self, runtime: &ChainRuntime, height: u64) -> Result<usize, ScanError> {
        let block = self
            .rpc
            .block_with_transactions(runtime.config.chain_id, height)
            .await?;
        Ok(self.ingest_block(runtime.config.chain_id, &block).await?)
    }

    /// Filter a block's transactions into the R index and publish every
    /// resulting collision. Returns the number of collisions published.
    pub async fn ingest_block(
        &self,
        chain_id: u64,
        block: &RpcBlock,
    ) -> Result<usize, crate::storage::StorageError> {
        let inputs = self.collect_tx_inputs(chain_id, block);
        if inputs.is_empty() {
            return Ok(0);
        }

        let collisions = self.storage.batch_check_and_insert(&inputs).await?;
        let mut published = 0;
        for collision in collisions {
            let event = CollisionEvent {
                r_value: collision.r_value,
                new_tx_hash: collision.tx_hash,
                new_chain_id: collision.chain_id,
                new_address: collision.address,
                first_tx: collision.first_tx,
            };
            match self.collision_tx.try_send(event) {
                Ok(()) => published += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("collision queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("collision queue closed");
                }
            }
        }
        Ok(published)
    }

    fn collect_tx_inputs(&self, chain_id: u64, block: &RpcBlock) -> Vec<TxInput> {
        let mut inputs = Vec::new();
        for tx in &block.transactions {
            let Some(from) = tx.from.as_deref().filter(|f| !f.is_empty()) else {
                continue;
            };
            let from = from.to_lowercase();
            if self.system_addresses.contains(&from) {
                continue;
            }
            let Some(r_value) = tx.r.as_deref().and_then(math::canonical_r) else {
                continue;
            };
            inputs.push(TxInput {
                r_value,
                tx_hash: tx.hash.to_lowercase(),
                chain_id,
                address: from,
            });
        }
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcError, RpcTransaction, TxSigningData};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    struct NoRpc;

    #[async_trait]
    impl ChainRpc for NoRpc {
        async fn latest_height(&self, _chain_id: u64) -> Result<u64, RpcError> {
            Err(RpcError::Transport("offline".into()))
        }
        async fn block_with_transactions(
            &self,
            _chain_id: u64,
            height: u64,
        ) -> Result<RpcBlock, RpcError> {
            Err(RpcError::BlockNotFound(height))
        }
        async fn tx_signing_data(
            &self,
            _chain_id: u64,
            tx_hash: &str,
        ) -> Result<TxSigningData, RpcError> {
            Err(RpcError::TxNotFound(tx_hash.to_string()))
        }
        async fn get_balance(
            &self,
            _chain_id: u64,
            _address: &str,
        ) -> Result<alloy_primitives::U256, RpcError> {
            Err(RpcError::Transport("offline".into()))
        }
    }

    fn test_scanner() -> (Arc<Scanner>, mpsc::Receiver<CollisionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let scanner = Arc::new(Scanner::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(NoRpc),
            tx,
        ));
        (scanner, rx)
    }

    fn tx(hash: &str, from: &str, r: &str) -> RpcTransaction {
        RpcTransaction {
            hash: hash.to_string(),
            from: Some(from.to_string()),
            r: Some(r.to_string()),
            s: Some("0x2".to_string()),
            v: Some("0x25".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_filters_zero_r_and_system_addresses() {
        let (scanner, _rx) = test_scanner();
        let block = RpcBlock {
            number: Some("0x10".into()),
            transactions: vec![
                tx("0xt1", "0xa1", "0x0"),
                tx("0xt2", "0xdeaddeaddeaddeaddeaddeaddeaddeaddead0001", "0x5"),
                tx("0xt3", "0xa3", "0x5"),
                RpcTransaction {
                    hash: "0xt4".into(),
                    r: Some("0x6".into()),
                    ..Default::default()
                },
            ],
        };
        scanner.ingest_block(1, &block).await.unwrap();
        let stats = scanner.storage.get_stats().await.unwrap();
        // Only 0xt3 survives the filters.
        assert_eq!(stats.total_r_values, 1);
    }

    #[tokio::test]
    async fn test_ingest_publishes_collisions() {
        let (scanner, mut rx) = test_scanner();
        let block1 = RpcBlock {
            number: Some("0x1".into()),
            transactions: vec![tx("0xt1", "0xa1", "0xr1")],
        };
        let block2 = RpcBlock {
            number: Some("0x2".into()),
            transactions: vec![tx("0xt2", "0xa2", "0xr1")],
        };
        assert_eq!(scanner.ingest_block(1, &block1).await.unwrap(), 0);
        assert_eq!(scanner.ingest_block(1, &block2).await.unwrap(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_tx_hash, "0xt2");
        assert_eq!(event.first_tx.tx_hash, "0xt1");
        assert_eq!(event.new_address, "0xa2");
        // R was canonicalized to 32 bytes.
        assert_eq!(event.r_value.len(), 66);
    }

    #[tokio::test]
    async fn test_ingest_normalizes_case() {
        let (scanner, _rx) = test_scanner();
        let block = RpcBlock {
            number: Some("0x1".into()),
            transactions: vec![tx("0xABCD", "0xA1B2", "0xFF")],
        };
        scanner.ingest_block(1, &block).await.unwrap();
        let block2 = RpcBlock {
            number: Some("0x2".into()),
            transactions: vec![tx("0xabcd", "0xa1b2", "0xff")],
        };
        // Same tx replayed with different casing: no new rows.
        scanner.ingest_block(1, &block2).await.unwrap();
        let stats = scanner.storage.get_stats().await.unwrap();
        assert_eq!(stats.total_r_values, 1);
        assert_eq!(stats.total_collisions, 0);
    }

    #[tokio::test]
    async fn test_chain_stats_snapshot() {
        let (scanner, _rx) = test_scanner();
        let stats = scanner.chain_stats();
        assert!(stats.len() >= 20);
        assert!(stats.iter().all(|s| !s.running));
        assert!(stats.windows(2).all(|w| w[0].chain_id < w[1].chain_id));
    }

    #[tokio::test]
    async fn test_stop_unknown_chain_is_noop() {
        let (scanner, _rx) = test_scanner();
        scanner.stop_chain(999_999);
        assert!(!scanner.stop_chain_by_name("not-a-chain"));
    }
}
