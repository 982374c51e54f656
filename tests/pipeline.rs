//! End-to-end pipeline scenarios: blocks go in through the scanner's
//! ingestion path, collision events are handled by the orchestrator, and
//! the assertions read persisted state back out of storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k256::elliptic_curve::Field;
use k256::Scalar;
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use ecdsa_scanner::collision::Orchestrator;
use ecdsa_scanner::math;
use ecdsa_scanner::notify::Notifier;
use ecdsa_scanner::recovery;
use ecdsa_scanner::rpc::{ChainRpc, RpcBlock, RpcError, RpcTransaction, TxSigningData};
use ecdsa_scanner::scanner::{CollisionEvent, Scanner};
use ecdsa_scanner::storage::{MemoryStorage, Storage};

/// RPC double serving signing data for a fixed set of transactions.
struct FakeRpc {
    txs: HashMap<(u64, String), TxSigningData>,
}

#[async_trait]
impl ChainRpc for FakeRpc {
    async fn latest_height(&self, _chain_id: u64) -> Result<u64, RpcError> {
        Ok(0)
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
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TxSigningData, RpcError> {
        self.txs
            .get(&(chain_id, tx_hash.to_string()))
            .cloned()
            .ok_or_else(|| RpcError::TxNotFound(tx_hash.to_string()))
    }
    async fn get_balance(
        &self,
        _chain_id: u64,
        _address: &str,
    ) -> Result<alloy_primitives::U256, RpcError> {
        Ok(alloy_primitives::U256::ZERO)
    }
}

/// One signed transaction fixture: the block-level view plus the signing
/// data the orchestrator will fetch for it.
struct SignedTx {
    chain_id: u64,
    rpc_tx: RpcTransaction,
    signing: TxSigningData,
}

fn hash_scalar(msg: &str) -> Scalar {
    math::scalar_reduce_bytes(&alloy_primitives::keccak256(msg.as_bytes()).0)
}

fn address_of(d: &Scalar) -> String {
    format!(
        "0x{}",
        hex::encode(recovery::address_from_private_key(d).unwrap().as_slice())
    )
}

/// Sign `msg` under key `d` with nonce `k` and package it as a transaction.
fn signed_tx(tx_hash: &str, chain_id: u64, d: &Scalar, k: &Scalar, msg: &str) -> SignedTx {
    let z = hash_scalar(msg);
    let r = recovery::nonce_commitment(k).unwrap();
    let k_inv = math::inv(k).unwrap();
    let s = (z + r * *d) * k_inv;
    let from = address_of(d);

    let rpc_tx = RpcTransaction {
        hash: tx_hash.to_string(),
        from: Some(from.clone()),
        r: Some(math::scalar_to_hex(&r)),
        s: Some(math::scalar_to_hex(&s)),
        v: Some("0x25".to_string()),
        ..Default::default()
    };
    let signing = TxSigningData { from, z, r, s };
    SignedTx {
        chain_id,
        rpc_tx,
        signing,
    }
}

struct Harness {
    scanner: Arc<Scanner>,
    orchestrator: Arc<Orchestrator>,
    storage: Arc<MemoryStorage>,
    rx: mpsc::Receiver<CollisionEvent>,
}

impl Harness {
    fn new(txs: &[&SignedTx]) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let rpc = Arc::new(FakeRpc {
            txs: txs
                .iter()
                .map(|t| ((t.chain_id, t.rpc_tx.hash.clone()), t.signing.clone()))
                .collect(),
        });
        let (tx, rx) = mpsc::channel(64);
        let scanner = Arc::new(Scanner::new(
            storage.clone() as Arc<dyn Storage>,
            rpc.clone() as Arc<dyn ChainRpc>,
            tx,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone() as Arc<dyn Storage>,
            rpc as Arc<dyn ChainRpc>,
            Notifier::new(String::new(), String::new()),
        ));
        Self {
            scanner,
            orchestrator,
            storage,
            rx,
        }
    }

    /// Feed one block through ingestion, then process every collision it
    /// produced, in order.
    async fn ingest_block(&mut self, chain_id: u64, txs: &[&SignedTx]) {
        let block = RpcBlock {
            number: None,
            transactions: txs.iter().map(|t| t.rpc_tx.clone()).collect(),
        };
        self.scanner.ingest_block(chain_id, &block).await.unwrap();
        while let Ok(event) = self.rx.try_recv() {
            self.orchestrator.handle_collision(&event).await;
        }
    }

    async fn recovered_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .storage
            .get_recovered_keys()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.address)
            .collect();
        addrs.sort();
        addrs
    }
}

#[tokio::test]
async fn s1_same_key_reuse_recovers_the_key() {
    let d = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let tx1 = signed_tx("0xt1", 1, &d, &k, "message 1");
    let tx2 = signed_tx("0xt2", 1, &d, &k, "message 2");

    let mut harness = Harness::new(&[&tx1, &tx2]);
    harness.ingest_block(1, &[&tx1]).await;
    harness.ingest_block(1, &[&tx2]).await;

    let stats = harness.storage.get_stats().await.unwrap();
    assert_eq!(stats.total_r_values, 1);
    assert_eq!(stats.total_collisions, 1);

    let keys = harness.storage.get_recovered_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].address, address_of(&d));
    let recovered = math::scalar_from_hex(&keys[0].private_key).unwrap();
    assert!(recovery::verify_private_key(&recovered, &keys[0].address));
    assert_eq!(keys[0].tx_hashes, vec!["0xt1", "0xt2"]);
}

#[tokio::test]
async fn s2_cross_key_with_same_key_first() {
    let d_a = Scalar::random(&mut OsRng);
    let d_b = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let a1 = signed_tx("0xa1", 1, &d_a, &k, "key A message 1");
    let a2 = signed_tx("0xa2", 1, &d_a, &k, "key A message 2");
    let b1 = signed_tx("0xb1", 1, &d_b, &k, "key B message");

    let mut harness = Harness::new(&[&a1, &a2, &b1]);
    harness.ingest_block(1, &[&a1]).await;
    harness.ingest_block(1, &[&a2]).await;
    harness.ingest_block(1, &[&b1]).await;

    assert_eq!(
        harness.recovered_addresses().await,
        {
            let mut expected = vec![address_of(&d_a), address_of(&d_b)];
            expected.sort();
            expected
        }
    );

    // The nonce row exists and references a recovered key.
    let r_hex = math::scalar_to_hex(&recovery::nonce_commitment(&k).unwrap());
    let nonce = harness
        .storage
        .get_recovered_nonce(&r_hex)
        .await
        .unwrap()
        .expect("nonce should be recorded");
    let keys = harness.storage.get_recovered_keys().await.unwrap();
    assert!(keys.iter().any(|key| key.id == nonce.derived_from_key_id));
    assert!(harness
        .storage
        .get_pending_components()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s2_cross_key_with_cross_key_first() {
    // Same three signatures, B's arrives before A's reuse pair completes.
    let d_a = Scalar::random(&mut OsRng);
    let d_b = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let a1 = signed_tx("0xa1", 1, &d_a, &k, "key A message 1");
    let a2 = signed_tx("0xa2", 1, &d_a, &k, "key A message 2");
    let b1 = signed_tx("0xb1", 1, &d_b, &k, "key B message");

    let mut harness = Harness::new(&[&a1, &a2, &b1]);
    harness.ingest_block(1, &[&b1]).await;
    harness.ingest_block(1, &[&a1]).await;
    harness.ingest_block(1, &[&a2]).await;

    assert_eq!(
        harness.recovered_addresses().await,
        {
            let mut expected = vec![address_of(&d_a), address_of(&d_b)];
            expected.sort();
            expected
        }
    );
    assert!(harness
        .storage
        .get_pending_components()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s3_cross_key_without_nonce_stays_pending() {
    let d_a = Scalar::random(&mut OsRng);
    let d_b = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let a1 = signed_tx("0xa1", 1, &d_a, &k, "only message of A");
    let b1 = signed_tx("0xb1", 1, &d_b, &k, "only message of B");

    let mut harness = Harness::new(&[&a1, &b1]);
    harness.ingest_block(1, &[&a1]).await;
    harness.ingest_block(1, &[&b1]).await;

    let comps = harness.storage.get_pending_components().await.unwrap();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].equations, 2);
    assert_eq!(comps[0].unknowns, 3);
    assert!(harness.recovered_addresses().await.is_empty());
}

#[tokio::test]
async fn s4_cyclic_cross_key_graph_solves() {
    let d_a = Scalar::random(&mut OsRng);
    let d_b = Scalar::random(&mut OsRng);
    let d_c = Scalar::random(&mut OsRng);
    let k1 = Scalar::random(&mut OsRng);
    let k2 = Scalar::random(&mut OsRng);
    let k3 = Scalar::random(&mut OsRng);

    let a1 = signed_tx("0xa1", 1, &d_a, &k1, "A with k1");
    let b1 = signed_tx("0xb1", 1, &d_b, &k1, "B with k1");
    let b2 = signed_tx("0xb2", 1, &d_b, &k2, "B with k2");
    let c2 = signed_tx("0xc2", 1, &d_c, &k2, "C with k2");
    let c3 = signed_tx("0xc3", 1, &d_c, &k3, "C with k3");
    let a3 = signed_tx("0xa3", 1, &d_a, &k3, "A with k3");

    let all = [&a1, &b1, &b2, &c2, &c3, &a3];
    let mut harness = Harness::new(&all);
    for tx in &all {
        harness.ingest_block(1, &[tx]).await;
    }

    let recovered = harness.recovered_addresses().await;
    let mut expected = vec![address_of(&d_a), address_of(&d_b), address_of(&d_c)];
    expected.sort();
    assert_eq!(recovered, expected);

    // All three nonces landed too, and nothing is left pending.
    for k in [&k1, &k2, &k3] {
        let r_hex = math::scalar_to_hex(&recovery::nonce_commitment(k).unwrap());
        let nonce = harness
            .storage
            .get_recovered_nonce(&r_hex)
            .await
            .unwrap()
            .expect("nonce should be recovered");
        assert_eq!(math::scalar_from_hex(&nonce.k_value).unwrap(), *k);
    }
    assert!(harness
        .storage
        .get_pending_components()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s5_system_address_transactions_are_filtered() {
    let d = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let mut deposit = signed_tx("0xd1", 10, &d, &k, "deposit");
    deposit.rpc_tx.from = Some("0xDeadDeadDeadDeadDeadDeadDeadDeadDead0001".to_string());

    let mut harness = Harness::new(&[&deposit]);
    harness.ingest_block(10, &[&deposit]).await;

    let stats = harness.storage.get_stats().await.unwrap();
    assert_eq!(stats.total_r_values, 0);
    assert_eq!(stats.total_collisions, 0);
}

#[tokio::test]
async fn s6_replay_leaves_state_unchanged() {
    let d = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let tx1 = signed_tx("0xt1", 1, &d, &k, "message 1");
    let tx2 = signed_tx("0xt2", 1, &d, &k, "message 2");

    let mut harness = Harness::new(&[&tx1, &tx2]);
    harness.ingest_block(1, &[&tx1]).await;
    harness.ingest_block(1, &[&tx2]).await;

    let stats_before = harness.storage.get_stats().await.unwrap();
    let keys_before = harness.storage.get_recovered_keys().await.unwrap();

    harness.ingest_block(1, &[&tx1]).await;
    harness.ingest_block(1, &[&tx2]).await;

    let stats_after = harness.storage.get_stats().await.unwrap();
    assert_eq!(stats_before.total_r_values, stats_after.total_r_values);
    assert_eq!(stats_before.total_collisions, stats_after.total_collisions);
    assert_eq!(stats_before.recovered_keys, stats_after.recovered_keys);

    let keys_after = harness.storage.get_recovered_keys().await.unwrap();
    assert_eq!(keys_before.len(), keys_after.len());
    assert_eq!(keys_before[0].private_key, keys_after[0].private_key);
    assert_eq!(keys_before[0].id, keys_after[0].id);
}

#[tokio::test]
async fn s7_known_key_maps_to_known_address() {
    let d = math::scalar_from_hex(
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
    )
    .unwrap();
    assert_eq!(
        address_of(&d),
        "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
    );
}

#[test]
fn address_derivation_matches_alloy_signer() {
    use alloy_signer_local::PrivateKeySigner;

    let d = Scalar::random(&mut OsRng);
    let key_bytes = d.to_bytes();
    let signer = PrivateKeySigner::from_slice(key_bytes.as_slice()).unwrap();
    assert_eq!(
        format!("0x{}", hex::encode(signer.address().as_slice())),
        address_of(&d)
    );
}

/// Full consistency check against a third-party signer: the rebuilt signing
/// hash, the parsed signature and the nonce-derivation math must all agree
/// on a transaction signed outside this crate.
#[test]
fn signing_pipeline_matches_alloy_signer() {
    use alloy_consensus::{SignableTransaction, TxEip1559};
    use alloy_primitives::{address, TxKind, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    let key_bytes = [7u8; 32];
    let signer = PrivateKeySigner::from_slice(&key_bytes).unwrap();
    let tx = TxEip1559 {
        chain_id: 1,
        nonce: 3,
        gas_limit: 50_000,
        max_fee_per_gas: 10_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        to: TxKind::Call(address!("2222222222222222222222222222222222222222")),
        value: U256::from(500),
        input: Default::default(),
        access_list: Default::default(),
    };
    let sighash = tx.signature_hash();
    let signature = signer.sign_hash_sync(&sighash).unwrap();

    let rpc_tx = RpcTransaction {
        hash: "0xfeed".to_string(),
        from: Some(format!("0x{}", hex::encode(signer.address().as_slice()))),
        to: Some("0x2222222222222222222222222222222222222222".to_string()),
        r: Some(format!("0x{}", hex::encode(signature.r().to_be_bytes::<32>()))),
        s: Some(format!("0x{}", hex::encode(signature.s().to_be_bytes::<32>()))),
        v: Some("0x0".to_string()),
        tx_type: Some("0x2".to_string()),
        nonce: Some("0x3".to_string()),
        gas: Some("0xc350".to_string()),
        max_fee_per_gas: Some("0x2540be400".to_string()),
        max_priority_fee_per_gas: Some("0x3b9aca00".to_string()),
        value: Some("0x1f4".to_string()),
        input: Some("0x".to_string()),
        chain_id: Some("0x1".to_string()),
        ..Default::default()
    };

    let data = ecdsa_scanner::rpc::signing_data(&rpc_tx).unwrap();
    assert_eq!(data.z, math::scalar_reduce_bytes(&sighash.0));

    // Deriving the nonce out of the signature with the known key must land
    // back on the signature's R value (x-coordinates agree for +-k, so
    // low-S normalization does not matter).
    let d = math::scalar_from_hex(&format!("0x{}", hex::encode(key_bytes))).unwrap();
    let k = recovery::derive_nonce(&data.z, &data.r, &data.s, &d).unwrap();
    assert_eq!(recovery::nonce_commitment(&k).unwrap(), data.r);
}

#[tokio::test]
async fn recovery_toggle_drops_events_without_touching_storage() {
    let d_a = Scalar::random(&mut OsRng);
    let d_b = Scalar::random(&mut OsRng);
    let k = Scalar::random(&mut OsRng);
    let a1 = signed_tx("0xa1", 1, &d_a, &k, "A message");
    let b1 = signed_tx("0xb1", 1, &d_b, &k, "B message");

    let mut harness = Harness::new(&[&a1, &b1]);
    harness.orchestrator.set_recovery_enabled(false);

    harness.ingest_block(1, &[&a1]).await;
    let block = RpcBlock {
        number: None,
        transactions: vec![b1.rpc_tx.clone()],
    };
    harness.scanner.ingest_block(1, &block).await.unwrap();
    // Collision row exists but, with recovery off, workers would skip the
    // event; nothing downstream was written.
    while let Ok(_event) = harness.rx.try_recv() {
        // mirror the worker-side gate
        assert!(!harness.orchestrator.recovery_enabled());
    }
    let stats = harness.storage.get_stats().await.unwrap();
    assert_eq!(stats.total_collisions, 1);
    assert_eq!(stats.recovered_keys, 0);
    assert_eq!(stats.pending_components, 0);
}
