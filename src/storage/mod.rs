//! Persistence capability: R-value index, collision log, recovered keys and
//! nonces, pending components, scan cursors.
//!
//! Two implementations share one contract: [`SqliteStorage`] for real runs
//! and [`MemoryStorage`] for demo mode and tests. Both must uphold the same
//! guarantees: exactly one witness per R value, append-only collisions
//! unique on (r, tx_hash), idempotent upserts, replay-safe batches.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::keccak256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{with_retries, RetryConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("storage operation timeout")]
    Timeout,
    #[error("storage busy")]
    Busy,
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            rusqlite::Error::SqliteFailure(e, msg) => match e.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StorageError::Busy
                }
                rusqlite::ErrorCode::ConstraintViolation => {
                    StorageError::Constraint(msg.unwrap_or_else(|| e.to_string()))
                }
                _ => StorageError::Backend(msg.unwrap_or_else(|| e.to_string())),
            },
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Minimal reference to a transaction: the witness side of an R collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub tx_hash: String,
    pub chain_id: u64,
}

/// One filtered transaction headed for the R index. All fields are already
/// canonical lowercase hex.
#[derive(Debug, Clone)]
pub struct TxInput {
    pub r_value: String,
    pub tx_hash: String,
    pub chain_id: u64,
    pub address: String,
}

/// A freshly detected collision: the new occurrence plus its witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionResult {
    pub r_value: String,
    pub tx_hash: String,
    pub chain_id: u64,
    pub address: String,
    pub first_tx: TxRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionGroup {
    pub r_value: String,
    pub tx_refs: Vec<TxRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveredKey {
    #[serde(default)]
    pub id: i64,
    pub address: String,
    pub private_key: String,
    pub chain_id: u64,
    pub r_values: Vec<String>,
    pub tx_hashes: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredNonce {
    pub r_value: String,
    pub k_value: String,
    pub derived_from_key_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingComponent {
    #[serde(default)]
    pub id: i64,
    pub r_values: Vec<String>,
    pub tx_hashes: Vec<String>,
    pub addresses: Vec<String>,
    pub chain_ids: Vec<u64>,
    pub equations: u32,
    pub unknowns: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_r_values: u64,
    pub total_collisions: u64,
    pub pending_components: u64,
    pub recovered_keys: u64,
    pub recovered_nonces: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub latency_ms: i64,
    pub open_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Deduplication key for a pending component: keccak over its sorted
/// distinct R values, so merged components collapse onto one row.
pub fn component_hash(r_values: &[String]) -> String {
    let mut sorted: Vec<&String> = r_values.iter().collect();
    sorted.sort();
    sorted.dedup();
    let joined = sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|");
    format!("0x{}", hex::encode(keccak256(joined.as_bytes())))
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically index a batch of transactions and report every collision.
    ///
    /// For each distinct R the first occurrence ever seen becomes the
    /// witness; later occurrences with a different tx hash are appended to
    /// the collision log and returned. Re-inserting an identical
    /// (r, tx_hash) pair is a no-op, which makes block replay safe.
    async fn batch_check_and_insert(
        &self,
        txs: &[TxInput],
    ) -> Result<Vec<CollisionResult>, StorageError>;

    /// Idempotent upsert keyed on (address, chain_id); returns the row id.
    async fn save_recovered_key(&self, key: &RecoveredKey) -> Result<i64, StorageError>;
    async fn get_recovered_keys(&self) -> Result<Vec<RecoveredKey>, StorageError>;
    async fn is_key_recovered(&self, address: &str, chain_id: u64) -> Result<bool, StorageError>;

    /// Idempotent upsert keyed on r.
    async fn save_recovered_nonce(&self, nonce: &RecoveredNonce) -> Result<(), StorageError>;
    async fn get_recovered_nonce(
        &self,
        r_value: &str,
    ) -> Result<Option<RecoveredNonce>, StorageError>;
    async fn get_recovered_nonces(&self) -> Result<Vec<RecoveredNonce>, StorageError>;

    /// True iff the collision log holds the same R under another address.
    async fn has_cross_key_potential(
        &self,
        r_value: &str,
        exclude_address: &str,
    ) -> Result<bool, StorageError>;

    async fn save_pending_component(&self, comp: &PendingComponent) -> Result<i64, StorageError>;
    async fn get_pending_components(&self) -> Result<Vec<PendingComponent>, StorageError>;
    async fn delete_pending_component(&self, id: i64) -> Result<(), StorageError>;

    async fn get_all_collisions(&self) -> Result<Vec<CollisionGroup>, StorageError>;

    async fn get_last_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError>;
    async fn save_last_block(&self, chain_id: u64, block: u64) -> Result<(), StorageError>;

    async fn get_stats(&self) -> Result<Stats, StorageError>;
    async fn health(&self) -> HealthStatus;
}

/// Decorates a [`Storage`] with the crate retry policy plus a per-operation
/// timeout. Transient failures (busy, timeout) are retried with backoff;
/// everything else surfaces unchanged.
pub struct RetryingStorage {
    inner: Arc<dyn Storage>,
    retry: RetryConfig,
    op_timeout: Duration,
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            retry: RetryConfig::default(),
            op_timeout: Duration::from_secs(10),
        }
    }

    async fn run<T, F, Fut>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        with_retries(&self.retry, || async {
            match tokio::time::timeout(self.op_timeout, f()).await {
                Ok(res) => res,
                Err(_) => Err(StorageError::Timeout),
            }
        })
        .await
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    async fn batch_check_and_insert(
        &self,
        txs: &[TxInput],
    ) -> Result<Vec<CollisionResult>, StorageError> {
        self.run(|| self.inner.batch_check_and_insert(txs)).await
    }

    async fn save_recovered_key(&self, key: &RecoveredKey) -> Result<i64, StorageError> {
        self.run(|| self.inner.save_recovered_key(key)).await
    }

    async fn get_recovered_keys(&self) -> Result<Vec<RecoveredKey>, StorageError> {
        self.run(|| self.inner.get_recovered_keys()).await
    }

    async fn is_key_recovered(&self, address: &str, chain_id: u64) -> Result<bool, StorageError> {
        self.run(|| self.inner.is_key_recovered(address, chain_id))
            .await
    }

    async fn save_recovered_nonce(&self, nonce: &RecoveredNonce) -> Result<(), StorageError> {
        self.run(|| self.inner.save_recovered_nonce(nonce)).await
    }

    async fn get_recovered_nonce(
        &self,
        r_value: &str,
    ) -> Result<Option<RecoveredNonce>, StorageError> {
        self.run(|| self.inner.get_recovered_nonce(r_value)).await
    }

    async fn get_recovered_nonces(&self) -> Result<Vec<RecoveredNonce>, StorageError> {
        self.run(|| self.inner.get_recovered_nonces()).await
    }

    async fn has_cross_key_potential(
        &self,
        r_value: &str,
        exclude_address: &str,
    ) -> Result<bool, StorageError> {
        self.run(|| self.inner.has_cross_key_potential(r_value, exclude_address))
            .await
    }

    async fn save_pending_component(&self, comp: &PendingComponent) -> Result<i64, StorageError> {
        self.run(|| self.inner.save_pending_component(comp)).await
    }

    async fn get_pending_components(&self) -> Result<Vec<PendingComponent>, StorageError> {
        self.run(|| self.inner.get_pending_components()).await
    }

    async fn delete_pending_component(&self, id: i64) -> Result<(), StorageError> {
        self.run(|| self.inner.delete_pending_component(id)).await
    }

    async fn get_all_collisions(&self) -> Result<Vec<CollisionGroup>, StorageError> {
        self.run(|| self.inner.get_all_collisions()).await
    }

    async fn get_last_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
        self.run(|| self.inner.get_last_block(chain_id)).await
    }

    async fn save_last_block(&self, chain_id: u64, block: u64) -> Result<(), StorageError> {
        self.run(|| self.inner.save_last_block(chain_id, block))
            .await
    }

    async fn get_stats(&self) -> Result<Stats, StorageError> {
        self.run(|| self.inner.get_stats()).await
    }

    async fn health(&self) -> HealthStatus {
        self.inner.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_hash_order_independent() {
        let a = component_hash(&["0xaa".to_string(), "0xbb".to_string()]);
        let b = component_hash(&["0xbb".to_string(), "0xaa".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_component_hash_dedups() {
        let a = component_hash(&["0xaa".to_string(), "0xaa".to_string()]);
        let b = component_hash(&["0xaa".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_component_hash_distinguishes_sets() {
        let a = component_hash(&["0xaa".to_string()]);
        let b = component_hash(&["0xab".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_error_classification_for_retry() {
        use crate::retry::is_retryable;
        assert!(is_retryable(&StorageError::Timeout));
        assert!(is_retryable(&StorageError::Busy));
        assert!(!is_retryable(&StorageError::Constraint("unique".into())));
        assert!(!is_retryable(&StorageError::Invalid("bad hex".into())));
    }
}
