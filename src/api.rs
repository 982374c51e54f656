//! HTTP facade: read-only views over storage plus scanner controls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use alloy_primitives::U256;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::collision::Orchestrator;
use crate::config;
use crate::logbuf::LogBuffer;
use crate::notify::Notifier;
use crate::rpc::ChainRpc;
use crate::scanner::{ChainStats, Scanner};
use crate::storage::{HealthStatus, RecoveredKey, Storage, StorageError, TxRef};

pub struct AppState {
    pub scanner: Arc<Scanner>,
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<dyn Storage>,
    pub rpc: Arc<dyn ChainRpc>,
    pub notifier: Notifier,
    pub logs: Arc<LogBuffer>,
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> std::io::Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("http server listening on {addr}");
    axum::serve(listener, app).await
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stats", get(handle_stats))
        .route("/api/health", get(handle_health))
        .route("/api/collisions", get(handle_collisions))
        .route("/api/recovered-keys", get(handle_recovered_keys))
        .route("/api/recovered-nonces", get(handle_recovered_nonces))
        .route("/api/pending-components", get(handle_pending_components))
        .route("/api/logs", get(handle_logs))
        .route("/api/start", post(handle_start))
        .route("/api/stop", post(handle_stop))
        .route("/api/recovery/toggle", post(handle_recovery_toggle))
        .route("/api/notifications/test", post(handle_test_notification))
        .with_state(state)
}

fn storage_error(err: StorageError) -> Response {
    error!("api storage error: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

#[derive(Serialize)]
struct GlobalStats {
    chains: Vec<ChainStats>,
    total_r_values: u64,
    total_collisions: u64,
    recovered_keys: u64,
    recovered_nonces: u64,
    pending_components: u64,
    auto_recovery: bool,
    database_healthy: bool,
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    let mut stats = GlobalStats {
        chains: state.scanner.chain_stats(),
        total_r_values: 0,
        total_collisions: 0,
        recovered_keys: 0,
        recovered_nonces: 0,
        pending_components: 0,
        auto_recovery: state.orchestrator.recovery_enabled(),
        database_healthy: true,
    };
    match state.storage.get_stats().await {
        Ok(db_stats) => {
            stats.total_r_values = db_stats.total_r_values;
            stats.total_collisions = db_stats.total_collisions;
            stats.recovered_keys = db_stats.recovered_keys;
            stats.recovered_nonces = db_stats.recovered_nonces;
            stats.pending_components = db_stats.pending_components;
            stats.database_healthy = db_stats.healthy;
        }
        Err(e) => {
            error!("failed to read storage stats: {e}");
            stats.database_healthy = false;
        }
    }
    Json(stats).into_response()
}

#[derive(Serialize)]
struct ChainHealth {
    name: String,
    chain_id: u64,
    running: bool,
    error_count: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: HealthStatus,
    chains: Vec<ChainHealth>,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let database = state.storage.health().await;
    let chains = state
        .scanner
        .chain_stats()
        .into_iter()
        .map(|c| ChainHealth {
            name: c.chain,
            chain_id: c.chain_id,
            running: c.running,
            error_count: c.error_count,
        })
        .collect();

    let (status, code) = if database.connected {
        ("healthy", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };
    (
        code,
        Json(HealthResponse {
            status,
            database,
            chains,
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct EnrichedTxRef {
    tx_hash: String,
    chain_id: u64,
    chain_name: String,
}

#[derive(Serialize)]
struct EnrichedCollision {
    r_value: String,
    tx_refs: Vec<EnrichedTxRef>,
}

fn enrich(tx_ref: TxRef) -> EnrichedTxRef {
    EnrichedTxRef {
        chain_name: config::chain_name(tx_ref.chain_id),
        tx_hash: tx_ref.tx_hash,
        chain_id: tx_ref.chain_id,
    }
}

async fn handle_collisions(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.get_all_collisions().await {
        Ok(groups) => {
            let enriched: Vec<EnrichedCollision> = groups
                .into_iter()
                .map(|g| EnrichedCollision {
                    r_value: g.r_value,
                    tx_refs: g.tx_refs.into_iter().map(enrich).collect(),
                })
                .collect();
            Json(enriched).into_response()
        }
        Err(e) => storage_error(e),
    }
}

#[derive(Serialize)]
struct RecoveredKeyView {
    #[serde(flatten)]
    key: RecoveredKey,
    chain_name: String,
    balance_wei: String,
    balance_eth: String,
}

async fn handle_recovered_keys(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.get_recovered_keys().await {
        Ok(keys) => {
            let mut views = Vec::with_capacity(keys.len());
            for key in keys {
                // Balance lookup is best-effort; a dead RPC must not take
                // the endpoint down with it.
                let balance = state
                    .rpc
                    .get_balance(key.chain_id, &key.address)
                    .await
                    .unwrap_or(U256::ZERO);
                views.push(RecoveredKeyView {
                    chain_name: config::chain_name(key.chain_id),
                    balance_wei: balance.to_string(),
                    balance_eth: wei_to_eth(balance),
                    key,
                });
            }
            Json(views).into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// Render wei as an ETH decimal string with up to six fractional digits,
/// trailing zeros trimmed.
fn wei_to_eth(wei: U256) -> String {
    let wei_per_eth = U256::from(1_000_000_000_000_000_000u64);
    let whole = wei / wei_per_eth;
    let micro_eth = (wei % wei_per_eth) / U256::from(1_000_000_000_000u64);
    let mut out = format!("{whole}.{micro_eth:0>6}");
    while out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

async fn handle_recovered_nonces(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.get_recovered_nonces().await {
        Ok(nonces) => Json(nonces).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn handle_pending_components(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.get_pending_components().await {
        Ok(comps) => Json(comps).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn handle_logs(State(state): State<Arc<AppState>>) -> Response {
    Json(state.logs.entries()).into_response()
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("chain").filter(|c| !c.is_empty()) {
        Some(chain) => {
            if !state.scanner.start_chain_by_name(chain) {
                return (StatusCode::NOT_FOUND, format!("unknown chain {chain}"))
                    .into_response();
            }
            info!("started scanner: {chain}");
        }
        None => {
            state.scanner.start_all().await;
            info!("started all scanners");
        }
    }
    Json(serde_json::json!({"status": "started"})).into_response()
}

async fn handle_stop(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("chain").filter(|c| !c.is_empty()) {
        Some(chain) => {
            if !state.scanner.stop_chain_by_name(chain) {
                return (StatusCode::NOT_FOUND, format!("unknown chain {chain}"))
                    .into_response();
            }
            info!("stopped scanner: {chain}");
        }
        None => {
            state.scanner.stop_all();
            info!("stopped all scanners");
        }
    }
    Json(serde_json::json!({"status": "stopped"})).into_response()
}

async fn handle_recovery_toggle(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("enabled").map(String::as_str) {
        None | Some("") => {
            let current = state.orchestrator.recovery_enabled();
            state.orchestrator.set_recovery_enabled(!current);
        }
        Some("true") | Some("1") => state.orchestrator.set_recovery_enabled(true),
        Some(_) => state.orchestrator.set_recovery_enabled(false),
    }
    Json(serde_json::json!({
        "auto_recovery": state.orchestrator.recovery_enabled()
    }))
    .into_response()
}

async fn handle_test_notification(State(state): State<Arc<AppState>>) -> Response {
    if !state.notifier.is_enabled() {
        return Json(serde_json::json!({
            "success": false,
            "error": "push notifications not configured"
        }))
        .into_response();
    }
    match state.notifier.send_test().await {
        Ok(()) => {
            info!("test notification sent");
            Json(serde_json::json!({"success": true})).into_response()
        }
        Err(e) => {
            error!("test notification failed: {e}");
            Json(serde_json::json!({"success": false, "error": e})).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000_000_000_000u64)
    }

    #[test]
    fn test_wei_to_eth_whole_amounts() {
        assert_eq!(wei_to_eth(U256::ZERO), "0");
        assert_eq!(wei_to_eth(eth(1)), "1");
        assert_eq!(wei_to_eth(eth(1000)), "1000");
    }

    #[test]
    fn test_wei_to_eth_trims_fraction() {
        assert_eq!(wei_to_eth(eth(1) + eth(1) / U256::from(2)), "1.5");
        assert_eq!(
            wei_to_eth(U256::from(123_456_789_012_345_678u64)),
            "0.123456"
        );
    }

    #[test]
    fn test_wei_to_eth_dust_rounds_to_zero() {
        // Below the six-decimal display resolution.
        assert_eq!(wei_to_eth(U256::from(1u64)), "0");
        assert_eq!(wei_to_eth(U256::from(999_999_999_999u64)), "0");
    }
}
