//! In-memory storage: demo mode and tests.
//!
//! Follows the exact same contract as the SQLite adapter so the pipeline
//! behaves identically under replay in either mode.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    component_hash, CollisionGroup, CollisionResult, HealthStatus, PendingComponent, RecoveredKey,
    RecoveredNonce, Stats, Storage, StorageError, TxInput, TxRef,
};

#[derive(Debug, Clone)]
struct CollisionRow {
    r_value: String,
    tx_hash: String,
    chain_id: u64,
    address: String,
}

#[derive(Default)]
struct Inner {
    r_index: HashMap<String, TxRef>,
    collision_rows: Vec<CollisionRow>,
    collision_pairs: HashSet<(String, String)>,
    keys: Vec<RecoveredKey>,
    nonces: HashMap<String, RecoveredNonce>,
    components: HashMap<String, PendingComponent>,
    blocks: HashMap<u64, u64>,
    next_key_id: i64,
    next_component_id: i64,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demo-mode fixture matching what the dashboard expects to render.
    pub fn with_sample_data() -> Self {
        let storage = Self::new();
        {
            let mut inner = storage.inner.write();
            inner.next_key_id = 2;
            inner.keys = vec![
                RecoveredKey {
                    id: 1,
                    address: "0x742d35cc6634c0532925a3b844bc9e7595f8b2d1".into(),
                    private_key:
                        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".into(),
                    chain_id: 1,
                    r_values: vec![
                        "0x8a2d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d".into(),
                    ],
                    tx_hashes: vec![
                        "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef".into(),
                        "0xfedcba0987654321fedcba0987654321fedcba0987654321fedcba0987654321".into(),
                    ],
                    created_at: "2024-12-25T10:30:00Z".into(),
                },
                RecoveredKey {
                    id: 2,
                    address: "0x8ba1f109551bd432803012645ac136ddd64dba72".into(),
                    private_key:
                        "0x2a871d0798f97d79848a013d4936a73bf4cc922c825d33c1cf7073dff6d409c6".into(),
                    chain_id: 137,
                    r_values: vec![
                        "0x1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b".into(),
                    ],
                    tx_hashes: vec![
                        "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
                        "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
                    ],
                    created_at: "2024-12-24T15:45:00Z".into(),
                },
            ];
            inner.nonces.insert(
                "0x8a2d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d".into(),
                RecoveredNonce {
                    r_value: "0x8a2d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d"
                        .into(),
                    k_value: "0x7f6e5d4c3b2a19087f6e5d4c3b2a19087f6e5d4c3b2a19087f6e5d4c3b2a1908"
                        .into(),
                    derived_from_key_id: 1,
                },
            );
            inner.r_index.insert(
                "0x8a2d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d".into(),
                TxRef {
                    tx_hash: "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef"
                        .into(),
                    chain_id: 1,
                },
            );
            let comp = PendingComponent {
                id: 1,
                r_values: vec![
                    "0x9f8e7d6c5b4a3928171605f4e3d2c1b0a9f8e7d6c5b4a3928171605f4e3d2c1b".into(),
                ],
                tx_hashes: vec![
                    "0xcccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc".into(),
                    "0xdddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd".into(),
                ],
                addresses: vec![
                    "0x1111111111111111111111111111111111111111".into(),
                    "0x2222222222222222222222222222222222222222".into(),
                ],
                chain_ids: vec![1, 1],
                equations: 2,
                unknowns: 3,
            };
            inner.next_component_id = 1;
            inner.components.insert(component_hash(&comp.r_values), comp);
        }
        storage
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn batch_check_and_insert(
        &self,
        txs: &[TxInput],
    ) -> Result<Vec<CollisionResult>, StorageError> {
        let mut inner = self.inner.write();
        let mut collisions = Vec::new();

        for input in txs {
            match inner.r_index.get(&input.r_value).cloned() {
                None => {
                    inner.r_index.insert(
                        input.r_value.clone(),
                        TxRef {
                            tx_hash: input.tx_hash.clone(),
                            chain_id: input.chain_id,
                        },
                    );
                }
                Some(witness) => {
                    if witness.tx_hash.eq_ignore_ascii_case(&input.tx_hash) {
                        continue;
                    }
                    let pair = (input.r_value.clone(), input.tx_hash.clone());
                    if !inner.collision_pairs.insert(pair) {
                        continue;
                    }
                    inner.collision_rows.push(CollisionRow {
                        r_value: input.r_value.clone(),
                        tx_hash: input.tx_hash.clone(),
                        chain_id: input.chain_id,
                        address: input.address.clone(),
                    });
                    collisions.push(CollisionResult {
                        r_value: input.r_value.clone(),
                        tx_hash: input.tx_hash.clone(),
                        chain_id: input.chain_id,
                        address: input.address.clone(),
                        first_tx: witness,
                    });
                }
            }
        }

        Ok(collisions)
    }

    async fn save_recovered_key(&self, key: &RecoveredKey) -> Result<i64, StorageError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner
            .keys
            .iter_mut()
            .find(|k| k.address == key.address && k.chain_id == key.chain_id)
        {
            existing.private_key = key.private_key.clone();
            existing.r_values = key.r_values.clone();
            existing.tx_hashes = key.tx_hashes.clone();
            return Ok(existing.id);
        }
        inner.next_key_id += 1;
        let id = inner.next_key_id;
        let mut stored = key.clone();
        stored.id = id;
        stored.created_at = chrono::Utc::now().to_rfc3339();
        inner.keys.push(stored);
        Ok(id)
    }

    async fn get_recovered_keys(&self) -> Result<Vec<RecoveredKey>, StorageError> {
        Ok(self.inner.read().keys.clone())
    }

    async fn is_key_recovered(&self, address: &str, chain_id: u64) -> Result<bool, StorageError> {
        let address = address.to_lowercase();
        Ok(self
            .inner
            .read()
            .keys
            .iter()
            .any(|k| k.address == address && k.chain_id == chain_id))
    }

    async fn save_recovered_nonce(&self, nonce: &RecoveredNonce) -> Result<(), StorageError> {
        self.inner
            .write()
            .nonces
            .insert(nonce.r_value.clone(), nonce.clone());
        Ok(())
    }

    async fn get_recovered_nonce(
        &self,
        r_value: &str,
    ) -> Result<Option<RecoveredNonce>, StorageError> {
        Ok(self.inner.read().nonces.get(r_value).cloned())
    }

    async fn get_recovered_nonces(&self) -> Result<Vec<RecoveredNonce>, StorageError> {
        Ok(self.inner.read().nonces.values().cloned().collect())
    }

    async fn has_cross_key_potential(
        &self,
        r_value: &str,
        exclude_address: &str,
    ) -> Result<bool, StorageError> {
        let exclude = exclude_address.to_lowercase();
        Ok(self
            .inner
            .read()
            .collision_rows
            .iter()
            .any(|c| c.r_value == r_value && !c.address.is_empty() && c.address != exclude))
    }

    async fn save_pending_component(&self, comp: &PendingComponent) -> Result<i64, StorageError> {
        let mut inner = self.inner.write();
        let hash = component_hash(&comp.r_values);
        if let Some(existing) = inner.components.get_mut(&hash) {
            let id = existing.id;
            let mut updated = comp.clone();
            updated.id = id;
            *existing = updated;
            return Ok(id);
        }
        inner.next_component_id += 1;
        let id = inner.next_component_id;
        let mut stored = comp.clone();
        stored.id = id;
        inner.components.insert(hash, stored);
        Ok(id)
    }

    async fn get_pending_components(&self) -> Result<Vec<PendingComponent>, StorageError> {
        let mut comps: Vec<PendingComponent> =
            self.inner.read().components.values().cloned().collect();
        comps.sort_by_key(|c| std::cmp::Reverse(c.equations as i64 - c.unknowns as i64));
        Ok(comps)
    }

    async fn delete_pending_component(&self, id: i64) -> Result<(), StorageError> {
        self.inner.write().components.retain(|_, c| c.id != id);
        Ok(())
    }

    async fn get_all_collisions(&self) -> Result<Vec<CollisionGroup>, StorageError> {
        let inner = self.inner.read();
        let mut r_values: Vec<String> = inner
            .collision_rows
            .iter()
            .map(|c| c.r_value.clone())
            .collect();
        r_values.sort();
        r_values.dedup();

        Ok(r_values
            .into_iter()
            .map(|r_value| {
                let mut tx_refs = Vec::new();
                if let Some(witness) = inner.r_index.get(&r_value) {
                    tx_refs.push(witness.clone());
                }
                tx_refs.extend(
                    inner
                        .collision_rows
                        .iter()
                        .filter(|c| c.r_value == r_value)
                        .map(|c| TxRef {
                            tx_hash: c.tx_hash.clone(),
                            chain_id: c.chain_id,
                        }),
                );
                CollisionGroup { r_value, tx_refs }
            })
            .collect())
    }

    async fn get_last_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
        Ok(self.inner.read().blocks.get(&chain_id).copied())
    }

    async fn save_last_block(&self, chain_id: u64, block: u64) -> Result<(), StorageError> {
        self.inner.write().blocks.insert(chain_id, block);
        Ok(())
    }

    async fn get_stats(&self) -> Result<Stats, StorageError> {
        let inner = self.inner.read();
        let mut collision_rs: Vec<&str> = inner
            .collision_rows
            .iter()
            .map(|c| c.r_value.as_str())
            .collect();
        collision_rs.sort_unstable();
        collision_rs.dedup();
        Ok(Stats {
            total_r_values: inner.r_index.len() as u64,
            total_collisions: collision_rs.len() as u64,
            pending_components: inner.components.len() as u64,
            recovered_keys: inner.keys.len() as u64,
            recovered_nonces: inner.nonces.len() as u64,
            healthy: true,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            connected: true,
            latency_ms: 0,
            open_connections: 1,
            error: None,
        }
    }
}
